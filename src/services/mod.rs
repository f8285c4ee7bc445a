pub mod archive;
pub mod fetch;
pub mod ledger;
pub mod manifest;
pub mod pipeline;
pub mod sensor;
pub mod storage;
pub mod upload;
pub mod worker;
