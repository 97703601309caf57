// Request path handling shared by the signature, navigation and file routes

use std::path::{Path, PathBuf};

/// Turn a browser pathname into a root-relative path.
///
/// Drops any query string, percent-decodes and strips leading slashes.
/// Malformed escapes are kept as-is rather than rejected.
pub fn decode_request_path(raw: &str) -> String {
    let path = raw.split_once('?').map_or(raw, |(path, _)| path);
    let decoded = urlencoding::decode(path)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| path.to_string());
    decoded.trim_start_matches('/').to_string()
}

/// Resolve `relative` under `root` (already canonical).
///
/// Returns `None` when the target does not exist or resolves outside the
/// root, whether through `..` segments, an absolute path or a symlink.
pub fn resolve_within_root(root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };
    let canonical = candidate.canonicalize().ok()?;
    canonical.starts_with(root).then_some(canonical)
}

/// `path` relative to `root` with forward slashes, empty for the root itself
pub fn relative_url_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
