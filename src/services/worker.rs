use crate::models::{RunReport, RunRequest};
use crate::services::ledger::RunLedger;
use crate::services::pipeline::Pipeline;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub runs: usize,
    pub failed: usize,
}

/// Executes queued run requests one at a time
pub struct RunExecutor {
    pipeline: Arc<Pipeline>,
    requests: mpsc::Receiver<RunRequest>,
    shutdown: watch::Receiver<bool>,
    reports: Option<mpsc::UnboundedSender<RunReport>>,
    ledger: Option<Arc<dyn RunLedger>>,
}

impl RunExecutor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        requests: mpsc::Receiver<RunRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipeline,
            requests,
            shutdown,
            reports: None,
            ledger: None,
        }
    }

    /// Forward every finished report to `sink`
    pub fn with_report_sink(mut self, sink: mpsc::UnboundedSender<RunReport>) -> Self {
        self.reports = Some(sink);
        self
    }

    /// Mark each executed run complete in `ledger`
    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Runs until shutdown or until every sender is dropped.
    /// A run in progress is finished before shutdown takes effect; queued
    /// runs stay pending in the ledger.
    pub async fn run(mut self) -> ExecutorStats {
        tracing::info!("🚀 Run executor started");
        let mut stats = ExecutorStats::default();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Run executor shutting down");
                    break;
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        tracing::info!("Run queue closed");
                        break;
                    };
                    let report = self.pipeline.run(&request).await;
                    if let Some(ledger) = &self.ledger {
                        if let Err(e) = ledger.complete_run(&request.run_key) {
                            tracing::error!(
                                "Failed to mark {} complete, it will run again on restart: {}",
                                request.run_key,
                                e
                            );
                        }
                    }
                    stats.runs += 1;
                    if !report.is_success() {
                        stats.failed += 1;
                    }
                    if let Some(sink) = &self.reports {
                        let _ = sink.send(report);
                    }
                }
            }
        }

        self.requests.close();
        let mut left = 0;
        while self.requests.try_recv().is_ok() {
            left += 1;
        }
        if left > 0 {
            if self.ledger.is_some() {
                tracing::warn!("⏸️  {} queued runs left pending for the next start", left);
            } else {
                tracing::warn!("{} queued runs were not executed", left);
            }
        }

        tracing::info!(
            "✅ Run executor finished: {} runs, {} failed",
            stats.runs,
            stats.failed
        );
        stats
    }
}
