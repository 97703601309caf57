// Background launcher for server instances
// Re-invokes our own executable in child mode, detached, with output in a log file,
// then waits briefly for the child to publish the port it actually bound.

use super::config::{Config, HOME_ENV};
use super::process::ProcessControl;
use super::registry::{Outcome, Registry};
use crate::paths::{self, DirectoryError};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use thiserror::Error;

/// Hidden flag marking a detached child so it never launches another one
pub const CHILD_FLAG: &str = "--child";

const MAX_LOG_SUFFIX: u32 = 100;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to locate the markdownup executable: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("failed to open log file {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What `start` could observe about the new instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    pub pid: u32,
    pub log_path: PathBuf,
    pub requested_port: u16,
    /// Port the child published, `None` if it did not within the timeout
    pub detected_port: Option<u16>,
}

impl LaunchResult {
    /// Detected port, or the requested one as a best guess
    pub fn reported_port(&self) -> u16 {
        self.detected_port.unwrap_or(self.requested_port)
    }
}

pub struct Launcher {
    config: Config,
    registry: Registry,
    control: Arc<dyn ProcessControl>,
    /// Program plus the arguments placed before the child flags
    program: Option<(PathBuf, Vec<OsString>)>,
}

impl Launcher {
    pub fn new(config: Config, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            registry: Registry::new(&config),
            config,
            control,
            program: None,
        }
    }

    /// Launch `program` instead of re-invoking the current executable
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = Some((
            program.into(),
            leading_args.into_iter().map(Into::into).collect(),
        ));
        self
    }

    fn resolve_program(&self) -> Result<(PathBuf, Vec<OsString>), LaunchError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => {
                let exe = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
                Ok((exe, vec![OsString::from("serve")]))
            }
        }
    }

    /// Start a detached server for `target_directory` on (preferably) `port`
    pub fn start(
        &self,
        target_directory: &Path,
        port: u16,
        extra_flags: &[String],
    ) -> Result<LaunchResult, LaunchError> {
        let directory = paths::validate_root(target_directory)?;
        let (program, leading_args) = self.resolve_program()?;

        let (log_path, log) = self.create_log()?;
        let log_err = log.try_clone().map_err(|source| LaunchError::Log {
            path: log_path.clone(),
            source,
        })?;

        let mut command = Command::new(&program);
        command
            .args(&leading_args)
            .arg(CHILD_FLAG)
            .arg("--port")
            .arg(port.to_string())
            .arg("--directory")
            .arg(&directory)
            .args(extra_flags)
            // The child must publish into the same registry we are polling.
            .env(HOME_ENV, &self.config.base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if std::env::var_os("RUST_LOG").is_none() {
            command.env("RUST_LOG", "info");
        }
        self.control.detach(&mut command);

        tracing::debug!(?command, "spawning detached instance");

        let pointer_before = self.registry.latest_pointer_modified();
        let launched_at = SystemTime::now();
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        // Dropping the handle neither waits for nor kills the child.
        drop(child);

        tracing::info!(pid, log = %log_path.display(), "instance launched");

        let detected_port = self.wait_for_port(launched_at, pointer_before);
        if detected_port.is_none() {
            tracing::debug!(
                timeout = ?self.config.launch_timeout,
                "instance did not publish a port in time"
            );
        }

        Ok(LaunchResult {
            pid,
            log_path,
            requested_port: port,
            detected_port,
        })
    }

    /// Create a fresh log file for one launch. Names carry milliseconds and
    /// get a numeric suffix if a concurrent start claimed the same name.
    fn create_log(&self) -> Result<(PathBuf, File), LaunchError> {
        let logs_dir = &self.config.logs_dir;
        fs::create_dir_all(logs_dir).map_err(|source| LaunchError::Log {
            path: logs_dir.clone(),
            source,
        })?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("markdownup_{stamp}.log")
            } else {
                format!("markdownup_{stamp}-{attempt}.log")
            };
            let path = logs_dir.join(name);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < MAX_LOG_SUFFIX => {
                    attempt += 1;
                }
                Err(source) => return Err(LaunchError::Log { path, source }),
            }
        }
    }

    /// Poll the latest-pointer until it is rewritten after `launched_at`.
    ///
    /// Filesystem timestamps can lag the wall clock by a tick, so a pointer
    /// whose mtime merely differs from the pre-launch one also counts.
    fn wait_for_port(
        &self,
        launched_at: SystemTime,
        pointer_before: Option<SystemTime>,
    ) -> Option<u16> {
        let deadline = Instant::now() + self.config.launch_timeout;

        loop {
            if let Some(modified) = self.registry.latest_pointer_modified() {
                let fresh = modified >= launched_at || Some(modified) != pointer_before;
                if fresh {
                    if let Outcome::Done(port) = self.registry.read_latest_port() {
                        return Some(port);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(self.config.launch_poll_interval.min(deadline - now));
        }
    }
}
