// markdownup library
// Instance lifecycle (ports, registry, launch, stop) and change detection for the server

pub mod instance;
pub mod paths;
pub mod server;
pub mod watch;
