use super::polling::{wait_for_file_content, wait_until, WaitError};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;

pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Isolated state directory plus a document root and the ports the binary
/// is allowed to use. No fallback ports, so `stop` only ever scans `port`.
pub struct TestHome {
    pub temp: TempDir,
    pub home: PathBuf,
    pub docs: PathBuf,
    pub port: u16,
}

impl TestHome {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let home = temp.path().join("home");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).expect("docs dir");
        std::fs::write(docs.join("README.md"), "# readme\n").expect("readme");
        Self {
            temp,
            home,
            docs,
            port: free_port(),
        }
    }

    /// `markdownup` with this home and port policy
    pub fn command(&self) -> Command {
        self.command_with_fallbacks(&[])
    }

    pub fn command_with_fallbacks(&self, fallbacks: &[u16]) -> Command {
        let fallbacks: Vec<String> = fallbacks.iter().map(u16::to_string).collect();
        let mut command = Command::new(env!("CARGO_BIN_EXE_markdownup"));
        command
            .env("MARKDOWNUP_HOME", &self.home)
            .env("MARKDOWNUP_PORT", self.port.to_string())
            .env("MARKDOWNUP_FALLBACK_PORTS", fallbacks.join(","))
            .env_remove("MARKDOWNUP_SCAN_PORTS")
            .env_remove("RUST_LOG");
        command
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run markdownup")
    }

    pub fn record_file(&self, port: u16) -> PathBuf {
        self.home.join("instances").join(format!("port_{port}.pid"))
    }

    pub fn latest_port_file(&self) -> PathBuf {
        self.home.join("latest_port")
    }

    /// Wait for the record of `port` and return the pid it names
    pub fn wait_for_record(&self, port: u16) -> Result<u32, WaitError> {
        let content = wait_for_file_content(
            self.record_file(port),
            |content| content.trim().parse::<u32>().is_ok(),
            READY_TIMEOUT,
        )?;
        Ok(content.trim().parse().expect("checked by predicate"))
    }
}

/// Foreground `markdownup serve` owned by the test, killed on drop
pub struct ServeGuard {
    child: Child,
}

impl ServeGuard {
    pub fn start(home: &TestHome, fallbacks: &[u16]) -> Self {
        let child = home
            .command_with_fallbacks(fallbacks)
            .args(["serve", "--directory"])
            .arg(&home.docs)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn markdownup serve");
        Self { child }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Our own child stays a zombie until reaped, so liveness goes through `try_wait`.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let child = &mut self.child;
        wait_until("serve process exit", timeout, || match child.try_wait() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(None),
            Err(e) => Err(Some(e.to_string())),
        })
        .is_ok()
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(err) = self.child.kill() {
            eprintln!("Failed to kill markdownup pid {}: {}", self.child.id(), err);
            return;
        }
        let _ = self.child.wait();
    }
}

/// Kills a detached (not our child) process on drop if a test bails early
pub struct PidGuard(pub u32);

impl Drop for PidGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if is_process_running(self.0) {
                unsafe {
                    libc::kill(self.0 as i32, libc::SIGKILL);
                }
            }
        }
    }
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// For processes that are not our children (reaped by init once they exit)
#[cfg(unix)]
pub fn wait_for_process_exit(pid: u32, timeout: Duration) -> bool {
    wait_until("process exit", timeout, || {
        if is_process_running(pid) {
            Err(None)
        } else {
            Ok(())
        }
    })
    .is_ok()
}

pub fn free_port() -> u16 {
    markdownup_lib::instance::ports::bind_listener(0)
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral port")
}

/// Minimal HTTP/1.1 GET returning the full response text
pub fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .expect("send request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    response
}

/// Body of an HTTP response
pub fn body(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
