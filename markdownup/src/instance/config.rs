// Environment configuration for server instances
// Handles the per-user registry/log layout and the tunables shared by CLI and server

use crate::watch::{ListingRules, SignatureAlgorithm};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port tried first when none is given on the command line
pub const DEFAULT_PORT: u16 = 8000;

/// Ports tried, in order, when the preferred one cannot be bound
pub const FALLBACK_PORTS: [u16; 5] = [8001, 8080, 8888, 9000, 3000];

/// Environment variable that relocates the whole per-user state directory
pub const HOME_ENV: &str = "MARKDOWNUP_HOME";

const PORT_ENV: &str = "MARKDOWNUP_PORT";
const FALLBACK_PORTS_ENV: &str = "MARKDOWNUP_FALLBACK_PORTS";
const POLL_INTERVAL_ENV: &str = "MARKDOWNUP_POLL_INTERVAL_MS";
const SIGNATURE_ENV: &str = "MARKDOWNUP_SIGNATURE";
const SCAN_PORTS_ENV: &str = "MARKDOWNUP_SCAN_PORTS";

/// Configuration for registry paths and lifecycle settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-user base directory (~/.markdownup)
    pub base_dir: PathBuf,
    /// One `port_<P>.pid` file per running instance
    pub instances_dir: PathBuf,
    /// Most recently started port
    pub latest_port_file: PathBuf,
    /// Output of detached instances
    pub logs_dir: PathBuf,
    pub default_port: u16,
    pub fallback_ports: Vec<u16>,
    /// Extra ports the stop command scans besides default + fallbacks
    pub extra_scan_ports: Vec<u16>,
    /// How long `start` waits for the child to publish its port
    pub launch_timeout: Duration,
    pub launch_poll_interval: Duration,
    /// Browser-side polling cadence for change detection
    pub poll_interval: Duration,
    pub signature_algorithm: SignatureAlgorithm,
    pub listing: ListingRules,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self::with_base_dir(Self::default_base_dir())
    }

    /// Create configuration rooted at an explicit base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            instances_dir: base_dir.join("instances"),
            latest_port_file: base_dir.join("latest_port"),
            logs_dir: base_dir.join("logs"),
            base_dir,
            default_port: DEFAULT_PORT,
            fallback_ports: FALLBACK_PORTS.to_vec(),
            extra_scan_ports: Vec::new(),
            launch_timeout: Duration::from_secs(3),
            launch_poll_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(2000),
            signature_algorithm: SignatureAlgorithm::default(),
            listing: ListingRules::default(),
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(HOME_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => Self::with_base_dir(dir),
            None => Self::default_paths(),
        };

        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %raw, "ignoring invalid {POLL_INTERVAL_ENV}"),
            }
        }

        if let Some(raw) = lookup(SIGNATURE_ENV) {
            match raw.parse::<SignatureAlgorithm>() {
                Ok(algorithm) => config.signature_algorithm = algorithm,
                Err(e) => tracing::warn!("ignoring {SIGNATURE_ENV}: {e}"),
            }
        }

        if let Some(raw) = lookup(PORT_ENV) {
            match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => config.default_port = port,
                _ => tracing::warn!(value = %raw, "ignoring invalid {PORT_ENV}"),
            }
        }

        // An empty value is meaningful here: no fallbacks at all.
        if let Some(raw) = lookup(FALLBACK_PORTS_ENV) {
            config.fallback_ports = parse_port_list(&raw, FALLBACK_PORTS_ENV);
        }

        if let Some(raw) = lookup(SCAN_PORTS_ENV) {
            config.extra_scan_ports = parse_port_list(&raw, SCAN_PORTS_ENV);
        }

        config
    }

    /// ~/.markdownup, or a temp-dir location if home is unavailable
    fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".markdownup"))
            .unwrap_or_else(|| std::env::temp_dir().join("markdownup"))
    }

    /// Path of the record file for `port`
    pub fn instance_file(&self, port: u16) -> PathBuf {
        self.instances_dir.join(format!("port_{port}.pid"))
    }

    /// Optional credits page shown when header mode is on
    pub fn credits_file(&self) -> PathBuf {
        self.base_dir.join("credits.md")
    }

    /// Optional logo shown when header mode is on
    pub fn logo_file(&self) -> PathBuf {
        self.base_dir.join("images").join("logo.png")
    }

    /// Default + fallback + extra ports, de-duplicated, in that order.
    /// These are the only ports the terminator can discover without a record.
    pub fn well_known_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        let all = std::iter::once(self.default_port)
            .chain(self.fallback_ports.iter().copied())
            .chain(self.extra_scan_ports.iter().copied());
        for port in all {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Comma-separated ports; invalid entries are logged and skipped
fn parse_port_list(raw: &str, variable: &str) -> Vec<u16> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse::<u16>() {
            Ok(port) if port != 0 => Some(port),
            _ => {
                tracing::warn!(value = %part, "ignoring invalid port in {variable}");
                None
            }
        })
        .collect()
}
