//! Change detection for browser polling
//!
//! The browser polls `/__sig__` with its current pathname and reloads when the
//! returned signature differs from the previous one. Everything here is
//! computed fresh per request; nothing is cached or persisted.
//!
//! - [`resolve`]: request path decoding and root containment
//! - [`signature`]: file / directory fingerprints
//! - [`navigation`]: previous/next/parent links between documents

pub mod navigation;
pub mod resolve;
pub mod signature;

pub use navigation::{navigation, Navigation};
pub use signature::{EntryKind, Signature, SignatureAlgorithm, SignatureEngine};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Which directory entries count as part of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRules {
    /// Lowercase extensions without the dot
    pub extensions: Vec<String>,
}

impl Default for ListingRules {
    fn default() -> Self {
        Self {
            extensions: vec!["md".to_string()],
        }
    }
}

impl ListingRules {
    /// Extension match, case-insensitive
    pub fn is_eligible_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    /// Hidden directories (leading dot) never take part in a listing
    pub fn is_eligible_dir(&self, name: &str) -> bool {
        !name.starts_with('.')
    }
}

/// One child of a listed directory
#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub name: String,
    pub path: PathBuf,
    /// Modification time in nanoseconds, `None` when it could not be read
    pub mtime_ns: Option<u128>,
}

/// Immediate children of a directory, split and sorted by case-insensitive name
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub dirs: Vec<ListedEntry>,
    pub files: Vec<ListedEntry>,
}

/// List `dir`'s eligible sub-directories and files.
///
/// Symlinks are classified by their target. Entries that cannot be stat'ed
/// at all are neither directories nor files and are left out.
pub fn list_eligible(dir: &Path, rules: &ListingRules) -> io::Result<Listing> {
    let mut listing = Listing::default();

    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };

        let listed = ListedEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            mtime_ns: mtime_ns(&metadata),
            path,
        };
        if metadata.is_dir() {
            if rules.is_eligible_dir(&listed.name) {
                listing.dirs.push(listed);
            }
        } else if metadata.is_file() && rules.is_eligible_file(&listed.path) {
            listing.files.push(listed);
        }
    }

    sort_by_name(&mut listing.dirs);
    sort_by_name(&mut listing.files);
    Ok(listing)
}

/// Case-insensitive order with the exact name as tie-break, so the result
/// never depends on the order `read_dir` produced
fn sort_by_name(entries: &mut [ListedEntry]) {
    entries.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
}

pub(crate) fn mtime_ns(metadata: &fs::Metadata) -> Option<u128> {
    metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
}
