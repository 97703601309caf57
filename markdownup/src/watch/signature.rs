// Signatures for browser change polling
// A file's signature is its mtime; a directory's is a digest over its own mtime
// and the (kind, name, mtime) of every eligible child, in a fixed order.

use super::resolve::{decode_request_path, resolve_within_root};
use super::{list_eligible, mtime_ns, ListedEntry, ListingRules};
use serde::Serialize;
use sha2::Digest;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Digest used for directory signatures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureAlgorithm::Sha1 => "sha1",
            SignatureAlgorithm::Sha256 => "sha256",
        })
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(SignatureAlgorithm::Sha1),
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            other => Err(format!(
                "unknown signature algorithm '{other}' (expected sha1 or sha256)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Wire form: `{"exists": true, "kind": "dir", "sig": "..."}` or `{"exists": false}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryKind>,
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Signature {
    pub fn missing() -> Self {
        Self {
            exists: false,
            kind: None,
            value: None,
        }
    }

    fn found(kind: EntryKind, value: String) -> Self {
        Self {
            exists: true,
            kind: Some(kind),
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureEngine {
    root: PathBuf,
    algorithm: SignatureAlgorithm,
    rules: ListingRules,
}

impl SignatureEngine {
    /// Fails only if `root` cannot be canonicalized
    pub fn new(root: &Path, algorithm: SignatureAlgorithm, rules: ListingRules) -> io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
            algorithm,
            rules,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &ListingRules {
        &self.rules
    }

    /// Signature for a browser pathname such as `/notes/` or `/notes/a.md`.
    ///
    /// Anything that does not resolve to an existing file or directory inside
    /// the root, including traversal attempts, reports `exists: false`.
    pub fn signature(&self, request_path: &str) -> Signature {
        let relative = decode_request_path(request_path);
        match resolve_within_root(&self.root, &relative) {
            Some(target) => self.signature_of(&target),
            None => Signature::missing(),
        }
    }

    fn signature_of(&self, target: &Path) -> Signature {
        let Ok(metadata) = fs::metadata(target) else {
            return Signature::missing();
        };

        if metadata.is_dir() {
            let listing = list_eligible(target, &self.rules).unwrap_or_else(|e| {
                tracing::debug!(path = %target.display(), "directory not listable: {e}");
                Default::default()
            });
            let own_mtime = mtime_ns(&metadata).unwrap_or(0);
            let digest = match self.algorithm {
                SignatureAlgorithm::Sha1 => {
                    directory_digest::<sha1::Sha1>(own_mtime, &listing.dirs, &listing.files)
                }
                SignatureAlgorithm::Sha256 => {
                    directory_digest::<sha2::Sha256>(own_mtime, &listing.dirs, &listing.files)
                }
            };
            Signature::found(EntryKind::Dir, digest)
        } else if metadata.is_file() {
            let mtime = mtime_ns(&metadata).unwrap_or(0);
            Signature::found(EntryKind::File, mtime.to_string())
        } else {
            Signature::missing()
        }
    }
}

fn directory_digest<D: Digest>(own_mtime: u128, dirs: &[ListedEntry], files: &[ListedEntry]) -> String {
    let mut hasher = D::new();
    hasher.update(b"DIR\0");
    hasher.update(own_mtime.to_string().as_bytes());
    hasher.update(b"\n");

    let tagged = dirs
        .iter()
        .map(|entry| (b"d", entry))
        .chain(files.iter().map(|entry| (b"f", entry)));
    for (tag, entry) in tagged {
        hasher.update(tag);
        hasher.update(b"\0");
        hasher.update(entry.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.mtime_ns.unwrap_or(0).to_string().as_bytes());
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn engine(root: &Path) -> SignatureEngine {
        SignatureEngine::new(root, SignatureAlgorithm::Sha1, ListingRules::default()).unwrap()
    }

    fn set_mtime(path: &Path, secs: i64) {
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn sig_value(engine: &SignatureEngine, request: &str) -> String {
        engine.signature(request).value.unwrap()
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("sha1".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Sha1);
        assert_eq!(" SHA256 ".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Sha256);
        assert!("md5".parse::<SignatureAlgorithm>().is_err());
        assert_eq!(SignatureAlgorithm::default().to_string(), "sha1");
    }

    #[test]
    fn test_file_signature_is_mtime_ns() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.md");
        fs::write(&file, "# hi").unwrap();
        set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 123)).unwrap();

        let sig = engine(temp_dir.path()).signature("/a.md");
        assert_eq!(
            sig,
            Signature {
                exists: true,
                kind: Some(EntryKind::File),
                value: Some("1700000000000000123".to_string()),
            }
        );
    }

    #[test]
    fn test_directory_signature_digest_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("b.md"), "").unwrap();
        set_mtime(&root.join("sub"), 10);
        set_mtime(&root.join("b.md"), 20);
        set_mtime(root, 30);

        let mut expected = sha1::Sha1::new();
        expected.update(b"DIR\x0030000000000\n");
        expected.update(b"d\x00sub\x0010000000000\n");
        expected.update(b"f\x00b.md\x0020000000000\n");
        let expected = hex::encode(expected.finalize());

        let sig = engine(root).signature("/");
        assert_eq!(sig.kind, Some(EntryKind::Dir));
        assert_eq!(sig.value.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_directory_signature_same_for_same_state() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        // Creation order differs from sort order
        for name in ["z.md", "A.md", "m.md"] {
            fs::write(root.join(name), "").unwrap();
            set_mtime(&root.join(name), 100);
        }
        let engine = engine(root);
        assert_eq!(sig_value(&engine, "/"), sig_value(&engine, ""));
        assert_eq!(sig_value(&engine, "/"), sig_value(&engine, "/?t=1"));
    }

    fn listed(names: &[&str]) -> Vec<ListedEntry> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ListedEntry {
                name: name.to_string(),
                path: PathBuf::from(name),
                mtime_ns: Some(1_000 + i as u128),
            })
            .collect()
    }

    #[test]
    fn test_directory_digest_ignores_listing_order() {
        let names = ["b.md", "A.md", "a.md", "c.md"];
        let mut forward = listed(&names);
        let mut backward = forward.clone();
        backward.reverse();
        let mut rotated = forward.clone();
        rotated.rotate_left(1);

        for entries in [&mut forward, &mut backward, &mut rotated] {
            super::super::sort_by_name(entries);
        }
        let order: Vec<&str> = forward.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(order, ["A.md", "a.md", "b.md", "c.md"]);

        let dirs = listed(&["Sub", "other"]);
        let digest = directory_digest::<sha1::Sha1>(7, &dirs, &forward);
        assert_eq!(directory_digest::<sha1::Sha1>(7, &dirs, &backward), digest);
        assert_eq!(directory_digest::<sha1::Sha1>(7, &dirs, &rotated), digest);
    }

    #[test]
    fn test_directory_signature_independent_of_creation_order() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first");
        let second = temp_dir.path().join("second");
        fs::create_dir(&first).unwrap();
        fs::create_dir(&second).unwrap();

        let names = ["z.md", "A.md", "m.md", "a.md"];
        for (root, order) in [(&first, names.to_vec()), (&second, names.iter().rev().copied().collect())] {
            for name in order {
                fs::write(root.join(name), "").unwrap();
                set_mtime(&root.join(name), 100);
            }
            set_mtime(root, 200);
        }

        assert_eq!(sig_value(&engine(&first), "/"), sig_value(&engine(&second), "/"));
    }

    #[test]
    fn test_directory_signature_tracks_eligible_changes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("doc.md"), "").unwrap();
        fs::write(root.join("data.csv"), "").unwrap();
        set_mtime(&root.join("doc.md"), 100);
        set_mtime(&root.join("data.csv"), 100);
        set_mtime(root, 100);
        let engine = engine(root);
        let before = sig_value(&engine, "/");

        // Ineligible file edits do not touch the directory signature.
        set_mtime(&root.join("data.csv"), 200);
        assert_eq!(sig_value(&engine, "/"), before);

        set_mtime(&root.join("doc.md"), 200);
        assert_ne!(sig_value(&engine, "/"), before);
    }

    #[test]
    fn test_directory_signature_tracks_added_document() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("docs")).unwrap();
        set_mtime(&root.join("docs"), 100);
        let engine = engine(root);
        let before = sig_value(&engine, "/docs/");

        fs::write(root.join("docs").join("new.md"), "").unwrap();
        // Pin the directory mtime so only the new entry can change the digest
        set_mtime(&root.join("docs"), 100);
        assert_ne!(sig_value(&engine, "/docs/"), before);
    }

    #[test]
    fn test_hidden_directories_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join(".cache")).unwrap();
        set_mtime(&root.join(".cache"), 100);
        set_mtime(root, 100);
        let engine = engine(root);
        let before = sig_value(&engine, "/");

        set_mtime(&root.join(".cache"), 500);
        set_mtime(root, 100);
        assert_eq!(sig_value(&engine, "/"), before);
    }

    #[test]
    fn test_traversal_reports_missing() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("secret.md"), "").unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let engine = engine(&root);

        assert_eq!(engine.signature("/../secret.md"), Signature::missing());
        assert_eq!(engine.signature("/%2E%2E/secret.md"), Signature::missing());
        assert_eq!(engine.signature("/nope.md"), Signature::missing());
    }

    #[test]
    fn test_sha256_differs_from_sha1() {
        let temp_dir = TempDir::new().unwrap();
        let sha1 = engine(temp_dir.path());
        let sha256 =
            SignatureEngine::new(temp_dir.path(), SignatureAlgorithm::Sha256, ListingRules::default())
                .unwrap();

        assert_eq!(sig_value(&sha1, "/").len(), 40);
        assert_eq!(sig_value(&sha256, "/").len(), 64);
    }

    #[test]
    fn test_wire_format() {
        let missing = serde_json::to_value(Signature::missing()).unwrap();
        assert_eq!(missing, serde_json::json!({"exists": false}));

        let found = Signature::found(EntryKind::Dir, "abc".to_string());
        assert_eq!(
            serde_json::to_value(found).unwrap(),
            serde_json::json!({"exists": true, "kind": "dir", "sig": "abc"})
        );
    }
}
