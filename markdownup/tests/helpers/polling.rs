use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY_MS: u64 = 25;
const MAX_DELAY_MS: u64 = 500;

/// Error returned when a polled condition never held.
#[derive(Debug)]
pub struct WaitError {
    what: String,
    attempts: u32,
    waited: Duration,
    last_observation: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {} attempts over {:?} waiting for {}. Last observation: {}",
            self.attempts,
            self.waited,
            self.what,
            self.last_observation
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("<none>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `probe` with exponential backoff until it yields a value.
///
/// `probe` returns `Ok(value)` when done, `Err(observation)` otherwise; the last
/// observation ends up in the timeout error.
pub fn wait_until<T, F>(what: &str, timeout: Duration, mut probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Result<T, Option<String>>,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempts = 0;
    let mut last_observation = None;

    loop {
        attempts += 1;
        match probe() {
            Ok(value) => return Ok(value),
            Err(observation) => {
                if observation.is_some() {
                    last_observation = observation;
                }
            }
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }

    Err(WaitError {
        what: what.to_string(),
        attempts,
        waited: start.elapsed(),
        last_observation,
    })
}

/// Poll a file until its content satisfies `predicate`.
pub fn wait_for_file_content<P, F>(path: P, predicate: F, timeout: Duration) -> Result<String, WaitError>
where
    P: AsRef<Path>,
    F: Fn(&str) -> bool,
{
    let path = path.as_ref();
    wait_until(&path.display().to_string(), timeout, || match fs::read_to_string(path) {
        Ok(content) if predicate(&content) => Ok(content),
        Ok(content) => Err(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(None),
        Err(err) => Err(Some(err.to_string())),
    })
}

/// Poll until `path` no longer exists.
pub fn wait_for_removal(path: &Path, timeout: Duration) -> Result<(), WaitError> {
    wait_until(
        &format!("removal of {}", path.display()),
        timeout,
        || if path.exists() { Err(None) } else { Ok(()) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wait_for_file_content_returns_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("latest_port");
        fs::write(&file, "8000").unwrap();

        let content = wait_for_file_content(&file, |text| text.parse::<u16>().is_ok(), Duration::from_secs(1))
            .expect("should read file immediately");
        assert_eq!(content, "8000");
    }

    #[test]
    fn wait_for_file_content_times_out_with_context() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("missing.pid");

        let err = wait_for_file_content(&file, |_| true, Duration::from_millis(1))
            .expect_err("should time out");
        assert!(err.to_string().contains("missing.pid"));
    }

    #[test]
    fn wait_until_reports_last_observation() {
        let mut calls = 0;
        let err = wait_until::<(), _>("never", Duration::from_millis(60), || {
            calls += 1;
            Err(Some(format!("call {calls}")))
        })
        .unwrap_err();
        assert!(err.to_string().contains("call"));
    }
}
