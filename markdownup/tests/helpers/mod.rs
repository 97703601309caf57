// Shared by the integration test binaries; each uses a different subset.
#![allow(dead_code)]

pub mod instance_guard;
pub mod polling;
