// Instance registry persisted under <base>/instances
// One `port_<P>.pid` file per running instance plus a `latest_port` pointer.
// Every operation is best-effort: callers get an Outcome, never a panic.

use crate::instance::config::Config;
use serde::Serialize;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// One running (or recently running) server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub port: u16,
    pub pid: u32,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unparseable content in {}: {content:?}", path.display())]
    Corrupt { path: PathBuf, content: String },
}

/// Result of a registry operation.
///
/// `NotFound` is the benign case (record or pointer absent, stale state).
/// `Fatal` carries an I/O or parse failure the caller may log and move past.
#[derive(Debug)]
pub enum Outcome<T> {
    Done(T),
    NotFound,
    Fatal(RegistryError),
}

impl<T> Outcome<T> {
    /// Swallow a fatal outcome with a warning, keeping only the value
    pub fn log(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::NotFound => None,
            Outcome::Fatal(e) => {
                tracing::warn!("instance registry: {e}");
                None
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    config: Config,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Write the record for `port` and point `latest_port` at it
    pub fn record(&self, port: u16, pid: u32) -> Outcome<()> {
        if let Err(source) = fs::create_dir_all(&self.config.instances_dir) {
            return Outcome::Fatal(RegistryError::Io {
                action: "create",
                path: self.config.instances_dir.clone(),
                source,
            });
        }

        if let Err(e) = atomic_write(&self.config.instance_file(port), &pid.to_string()) {
            return Outcome::Fatal(e);
        }
        if let Err(e) = atomic_write(&self.config.latest_port_file, &port.to_string()) {
            return Outcome::Fatal(e);
        }

        tracing::debug!(port, pid, "recorded instance");
        Outcome::Done(())
    }

    /// Delete the record for `port`. Absent records are `NotFound`, not errors.
    ///
    /// When no records remain the latest-pointer is deleted as well.
    pub fn remove(&self, port: u16) -> Outcome<()> {
        let path = self.config.instance_file(port);
        let outcome = match fs::remove_file(&path) {
            Ok(()) => Outcome::Done(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Outcome::NotFound,
            Err(source) => {
                return Outcome::Fatal(RegistryError::Io {
                    action: "remove",
                    path,
                    source,
                })
            }
        };

        if let Outcome::Fatal(e) = self.clear_latest_if_empty() {
            tracing::warn!("instance registry: {e}");
        }
        outcome
    }

    /// Remove the record for `port` only while it still names `pid`.
    ///
    /// A server shutting down uses this so it never deletes the record of a
    /// newer instance that took over the same port.
    pub fn remove_if_owned(&self, port: u16, pid: u32) -> Outcome<()> {
        match self.read_record(port) {
            Outcome::Done(recorded) if recorded == pid => self.remove(port),
            Outcome::Done(other) => {
                tracing::debug!(port, pid, other, "record owned by another process, leaving it");
                Outcome::NotFound
            }
            Outcome::NotFound => Outcome::NotFound,
            Outcome::Fatal(e) => Outcome::Fatal(e),
        }
    }

    /// Resolve an instance by port, or "the" instance when `port` is None.
    ///
    /// Without a port the latest-pointer decides; if it is missing and exactly
    /// one record exists, that record is used.
    pub fn lookup(&self, port: Option<u16>) -> Outcome<Instance> {
        let port = match port {
            Some(port) => port,
            None => match self.read_latest_port() {
                Outcome::Done(port) => port,
                Outcome::NotFound => {
                    let all = self.list_all();
                    match all.as_slice() {
                        [only] => return Outcome::Done(*only),
                        _ => return Outcome::NotFound,
                    }
                }
                Outcome::Fatal(e) => return Outcome::Fatal(e),
            },
        };

        match self.read_record(port) {
            Outcome::Done(pid) => Outcome::Done(Instance { port, pid }),
            Outcome::NotFound => Outcome::NotFound,
            Outcome::Fatal(e) => Outcome::Fatal(e),
        }
    }

    /// Every record currently on disk, sorted by port
    pub fn list_all(&self) -> Vec<Instance> {
        self.ports()
            .into_iter()
            .filter_map(|port| {
                self.read_record(port)
                    .log()
                    .map(|pid| Instance { port, pid })
            })
            .collect()
    }

    /// Ports that have a record file, readable or not, sorted
    pub fn ports(&self) -> Vec<u16> {
        let entries = match fs::read_dir(&self.config.instances_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(
                    "instance registry: failed to list {}: {e}",
                    self.config.instances_dir.display()
                );
                return Vec::new();
            }
        };

        let mut ports: Vec<u16> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_record_name(&entry.file_name().to_string_lossy()))
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Port named by the latest-pointer
    pub fn read_latest_port(&self) -> Outcome<u16> {
        read_number(&self.config.latest_port_file)
    }

    /// Modification time of the latest-pointer, used to detect a fresh start
    pub fn latest_pointer_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.config.latest_port_file)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Delete the latest-pointer when no record files remain
    pub fn clear_latest_if_empty(&self) -> Outcome<()> {
        if self.has_records() {
            return Outcome::NotFound;
        }
        match fs::remove_file(&self.config.latest_port_file) {
            Ok(()) => Outcome::Done(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Outcome::NotFound,
            Err(source) => Outcome::Fatal(RegistryError::Io {
                action: "remove",
                path: self.config.latest_port_file.clone(),
                source,
            }),
        }
    }

    fn has_records(&self) -> bool {
        !self.ports().is_empty()
    }

    fn read_record(&self, port: u16) -> Outcome<u32> {
        read_number(&self.config.instance_file(port))
    }
}

/// `port_8000.pid` -> 8000
fn parse_record_name(name: &str) -> Option<u16> {
    name.strip_prefix("port_")?
        .strip_suffix(".pid")?
        .parse()
        .ok()
}

fn read_number<N: std::str::FromStr>(path: &Path) -> Outcome<N> {
    match fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<N>() {
            Ok(value) => Outcome::Done(value),
            Err(_) => Outcome::Fatal(RegistryError::Corrupt {
                path: path.to_path_buf(),
                content,
            }),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Outcome::NotFound,
        Err(source) => Outcome::Fatal(RegistryError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write via temp file + rename so concurrent readers never see a partial value
fn atomic_write(path: &Path, contents: &str) -> Result<(), RegistryError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents).map_err(|source| RegistryError::Io {
        action: "write",
        path: temp_path.clone(),
        source,
    })?;
    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(RegistryError::Io {
            action: "replace",
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
