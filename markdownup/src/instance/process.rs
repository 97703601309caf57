// Platform process control
// Detachment, termination and "who listens on this port" behind one trait.
// POSIX uses setsid/SIGTERM and the kernel socket tables; Windows uses
// creation flags, taskkill and netstat.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

/// What happened when a termination was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Signal delivered / process killed
    Terminated,
    /// No such process: the record was stale
    NotRunning,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("refusing to signal pid {0}")]
    InvalidPid(u32),
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("{tool} could not stop pid {pid}: {detail}")]
    Tool {
        tool: &'static str,
        pid: u32,
        detail: String,
    },
}

/// Everything the launcher and terminator need from the operating system
pub trait ProcessControl: Send + Sync {
    /// Make `command` survive the parent's exit (own session / no console)
    fn detach(&self, command: &mut Command);

    /// Stop `pid` immediately; graceful shutdown is not awaited
    fn terminate(&self, pid: u32) -> Result<Termination, ProcessError>;

    /// Process currently listening on TCP `port`, if it can be determined.
    /// Query failures (tool missing, unparseable output) are `None`.
    fn listening_pid(&self, port: u16) -> Option<u32>;

    fn is_running(&self, pid: u32) -> bool;
}

/// Process control for the platform this binary was built for
pub fn platform() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessControl)
    }

    #[cfg(windows)]
    {
        Arc::new(WindowsProcessControl)
    }
}

// ============================================================================
// POSIX
// ============================================================================

#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessControl;

#[cfg(unix)]
impl ProcessControl for UnixProcessControl {
    fn detach(&self, command: &mut Command) {
        use std::os::unix::process::CommandExt;

        // SAFETY: setsid is async-signal-safe and runs between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    fn terminate(&self, pid: u32) -> Result<Termination, ProcessError> {
        // 0 and negative values address process groups, never a single instance.
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return Err(ProcessError::InvalidPid(pid)),
        };

        if unsafe { libc::kill(raw, libc::SIGTERM) } == 0 {
            return Ok(Termination::Terminated);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(Termination::NotRunning)
        } else {
            Err(ProcessError::Signal { pid, source: err })
        }
    }

    fn listening_pid(&self, port: u16) -> Option<u32> {
        #[cfg(target_os = "linux")]
        {
            if let Some(pid) = procfs_listening_pid(port) {
                return Some(pid);
            }
        }

        lsof_listening_pid(port)
    }

    fn is_running(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        if unsafe { libc::kill(raw, 0) } == 0 {
            return true;
        }
        // EPERM: exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(unix)]
fn lsof_listening_pid(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()
        .map_err(|e| tracing::debug!("lsof unavailable: {e}"))
        .ok()?;
    parse_lsof_pids(&String::from_utf8_lossy(&output.stdout))
}

/// Walk /proc/net/tcp{,6} for a listening socket on `port`, then find the
/// process holding that socket inode.
#[cfg(target_os = "linux")]
fn procfs_listening_pid(port: u16) -> Option<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(parse_proc_net_listeners(&content, port));
        }
    }
    if inodes.is_empty() {
        return None;
    }

    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
    let procs = std::fs::read_dir("/proc").ok()?;
    for entry in procs.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Unreadable fd tables belong to other users; skip them.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.filter_map(|e| e.ok()) {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if targets.iter().any(|t| link.as_os_str() == t.as_str()) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProcessControl;

#[cfg(windows)]
impl ProcessControl for WindowsProcessControl {
    fn detach(&self, command: &mut Command) {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const DETACHED_PROCESS: u32 = 0x0000_0008;

        command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS | CREATE_NO_WINDOW);
    }

    fn terminate(&self, pid: u32) -> Result<Termination, ProcessError> {
        use std::os::windows::process::CommandExt;
        // taskkill reports "process not found" with exit code 128
        const TASKKILL_NOT_FOUND: i32 = 128;

        if pid == 0 {
            return Err(ProcessError::InvalidPid(pid));
        }

        let output = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|source| ProcessError::Signal { pid, source })?;

        match output.status.code() {
            Some(0) => Ok(Termination::Terminated),
            Some(TASKKILL_NOT_FOUND) => Ok(Termination::NotRunning),
            _ => Err(ProcessError::Tool {
                tool: "taskkill",
                pid,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn listening_pid(&self, port: u16) -> Option<u32> {
        use std::os::windows::process::CommandExt;

        let output = Command::new("netstat")
            .arg("-ano")
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| tracing::debug!("netstat unavailable: {e}"))
            .ok()?;
        // Console code page output; the columns we need are ASCII.
        parse_netstat_listening(&String::from_utf8_lossy(&output.stdout), port)
    }

    fn is_running(&self, pid: u32) -> bool {
        use std::os::windows::process::CommandExt;

        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }
}

// ============================================================================
// Output parsers (platform independent so they can be tested everywhere)
// ============================================================================

/// First pid printed by `lsof -t`
pub fn parse_lsof_pids(output: &str) -> Option<u32> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

static NETSTAT_LISTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*TCP\s+(?P<local>\S+):(?P<port>\d+)\s+\S+\s+LISTENING\s+(?P<pid>\d+)\s*$")
        .expect("netstat pattern is valid")
});

/// Pid of the socket LISTENING on exactly `port` in `netstat -ano` output
pub fn parse_netstat_listening(output: &str, port: u16) -> Option<u32> {
    output.lines().find_map(|line| {
        let caps = NETSTAT_LISTEN.captures(line)?;
        if caps["port"].parse::<u16>().ok()? != port {
            return None;
        }
        caps["pid"].parse().ok()
    })
}

/// Socket inodes in LISTEN state (st = 0A) bound to `port` in a /proc/net/tcp table
pub fn parse_proc_net_listeners(content: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, hex_port) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(hex_port, 16).ok()? != port {
                return None;
            }
            fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}
