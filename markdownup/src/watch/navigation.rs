// Parent / previous / next links for the page header

use super::resolve::{decode_request_path, relative_url_path, resolve_within_root};
use super::{list_eligible, ListingRules};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigation {
    pub parent: Option<String>,
    pub prev_page: Option<String>,
    pub next_page: Option<String>,
}

/// Links around `request_path`. The root, and anything that does not
/// resolve inside `root`, gets no links at all.
pub fn navigation(root: &Path, rules: &ListingRules, request_path: &str) -> Navigation {
    let relative = decode_request_path(request_path);
    let mut nav = Navigation::default();

    let Some(target) = resolve_within_root(root, &relative) else {
        return nav;
    };
    let Some(url_path) = relative_url_path(root, &target) else {
        return nav;
    };
    if url_path.is_empty() {
        return nav;
    }

    let parent_url = match url_path.rsplit_once('/') {
        Some((parent, _)) => format!("/{parent}/"),
        None => "/".to_string(),
    };
    nav.parent = Some(parent_url.clone());

    if target.is_dir() || !rules.is_eligible_file(&target) {
        return nav;
    }
    let Some(parent_dir) = target.parent() else {
        return nav;
    };
    let Some(current) = target.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return nav;
    };

    let siblings: Vec<String> = match list_eligible(parent_dir, rules) {
        Ok(listing) => listing
            .files
            .into_iter()
            .map(|entry| entry.name)
            .filter(|name| !name.starts_with('.'))
            .collect(),
        Err(e) => {
            tracing::debug!(dir = %parent_dir.display(), "sibling listing failed: {e}");
            return nav;
        }
    };

    if let Some(index) = siblings.iter().position(|name| *name == current) {
        let link = |name: &String| format!("{parent_url}{name}");
        nav.prev_page = index.checked_sub(1).and_then(|i| siblings.get(i)).map(link);
        nav.next_page = siblings.get(index + 1).map(link);
    }
    nav
}
