use crate::error::{PipelineError, Result};
use crate::models::{Manifest, ManifestEntry};
use crate::services::storage::ObjectStorage;
use crate::utils::validation::parse_url_path_prefix;

/// Parse a tab-separated NeMO manifest.
///
/// The header must name `file_id`, `urls` and `md5`; `size` and
/// `sample_id` are optional. Any data row with an empty required field
/// fails the whole manifest.
pub fn parse_manifest(key: &str, text: &str) -> Result<Manifest> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| PipelineError::manifest(key, "manifest is empty"))?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| columns.iter().position(|c| *c == name);
    let required_column = |name: &str| {
        column(name)
            .ok_or_else(|| PipelineError::manifest(key, format!("missing column '{}'", name)))
    };

    let file_id_col = required_column("file_id")?;
    let url_col = required_column("urls")?;
    let md5_col = required_column("md5")?;
    let size_col = column("size");
    let sample_col = column("sample_id");

    let mut entries = Vec::new();
    for (line_no, line) in lines {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let field = |idx: usize| fields.get(idx).copied().unwrap_or("");
        let required = |idx: usize, name: &str| {
            let value = field(idx);
            if value.is_empty() {
                Err(PipelineError::manifest(
                    key,
                    format!("line {}: missing required field '{}'", line_no, name),
                ))
            } else {
                Ok(value.to_string())
            }
        };

        let file_id = required(file_id_col, "file_id")?;
        let url = required(url_col, "urls")?;
        let md5 = required(md5_col, "md5")?;
        let size = size_col.and_then(|idx| field(idx).parse::<u64>().ok());
        let sample_id = sample_col.map(|idx| field(idx).to_string()).unwrap_or_default();

        entries.push(ManifestEntry {
            path_prefix: parse_url_path_prefix(&url),
            file_id,
            url,
            md5,
            size,
            sample_id,
        });
    }

    Ok(Manifest {
        key: key.to_string(),
        e_tag: None,
        entries,
    })
}

/// Fetch a manifest object from storage and parse it
pub async fn load_manifest(storage: &dyn ObjectStorage, key: &str) -> Result<Manifest> {
    let object = storage.get_object(key).await?;
    let text = String::from_utf8(object.data)
        .map_err(|_| PipelineError::manifest(key, "manifest is not valid UTF-8"))?;
    let mut manifest = parse_manifest(key, &text)?;
    manifest.e_tag = object.e_tag;
    Ok(manifest)
}
