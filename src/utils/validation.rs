use std::path::{Component, Path, PathBuf};
use url::Url;

/// Directory portion of a URL path, without the leading slash.
///
/// `https://host/a/b/file.bam.tar` becomes `a/b`; a URL with no directory
/// component yields an empty string.
pub fn parse_url_path_prefix(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };

    match path.rfind('/') {
        Some(pos) => path[..pos].trim_start_matches('/').to_string(),
        None => String::new(),
    }
}

/// True for a bare file name that is safe to join onto a scratch directory
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Relative path of an archive member, or `None` if it would escape the
/// extraction directory or is not valid UTF-8
pub fn sanitize_member_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            // Keys are UTF-8
            Component::Normal(part) if part.to_str().is_some() => clean.push(part),
            Component::Normal(_) => return None,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Object key for a file under a destination prefix
pub fn destination_key(prefix: &str, relative: &Path) -> String {
    let name = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

pub fn human_readable_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} PB", size)
}
