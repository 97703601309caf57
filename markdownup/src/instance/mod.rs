// Instance lifecycle for markdownup servers
// Shared by the CLI (start/stop/status) and the server loop (record/remove)

pub mod config;
pub mod launcher;
pub mod ports;
pub mod process;
pub mod registry;
pub mod terminator;

pub use config::Config;
pub use launcher::{LaunchError, LaunchResult, Launcher};
pub use ports::allocate_port;
pub use process::{platform, ProcessControl, Termination};
pub use registry::{Instance, Outcome, Registry};
pub use terminator::{StopReport, Terminator};
