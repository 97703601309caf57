// Stop every running instance
// Phase 1 walks the registry; phase 2 scans well-known ports for instances whose
// record was lost. Stale state is expected and never treated as a failure.

use super::process::{ProcessControl, Termination};
use super::registry::{Instance, Outcome, Registry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopSource {
    Registry,
    PortScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoppedInstance {
    pub port: u16,
    pub pid: u32,
    pub source: StopSource,
    /// The recorded process had already exited
    pub already_exited: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct StopReport {
    pub stopped: Vec<StoppedInstance>,
    /// Instances whose termination failed (record removed regardless)
    pub failed: Vec<Instance>,
}

impl StopReport {
    pub fn count(&self) -> usize {
        self.stopped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
    }
}

pub struct Terminator {
    registry: Registry,
    control: Arc<dyn ProcessControl>,
    scan_ports: Vec<u16>,
}

impl Terminator {
    pub fn new(registry: Registry, control: Arc<dyn ProcessControl>, scan_ports: Vec<u16>) -> Self {
        Self {
            registry,
            control,
            scan_ports,
        }
    }

    pub fn stop_all(&self) -> StopReport {
        let mut report = StopReport::default();
        let handled = self.stop_recorded(&mut report);

        if let Outcome::Fatal(e) = self.registry.clear_latest_if_empty() {
            tracing::warn!("instance registry: {e}");
        }

        self.stop_unrecorded(&handled, &mut report);
        report
    }

    /// Phase 1: every on-disk record, deleted whatever the termination result
    fn stop_recorded(&self, report: &mut StopReport) -> HashSet<u16> {
        let mut handled = HashSet::new();

        for port in self.registry.ports() {
            match self.registry.lookup(Some(port)) {
                Outcome::Done(instance) => match self.control.terminate(instance.pid) {
                    Ok(termination) => {
                        let already_exited = termination == Termination::NotRunning;
                        if already_exited {
                            tracing::info!(port, pid = instance.pid, "instance had already exited");
                        } else {
                            tracing::info!(port, pid = instance.pid, "stopped instance");
                        }
                        report.stopped.push(StoppedInstance {
                            port,
                            pid: instance.pid,
                            source: StopSource::Registry,
                            already_exited,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(port, "failed to stop instance: {e}");
                        report.failed.push(instance);
                    }
                },
                // Removed by a concurrent stop between listing and reading
                Outcome::NotFound => {}
                Outcome::Fatal(e) => {
                    tracing::warn!(port, "discarding unreadable record: {e}");
                }
            }

            if let Outcome::Fatal(e) = self.registry.remove(port) {
                tracing::warn!("instance registry: {e}");
            }
            handled.insert(port);
        }

        handled
    }

    /// Phase 2: listeners on well-known ports that had no record
    fn stop_unrecorded(&self, handled: &HashSet<u16>, report: &mut StopReport) {
        let own_pid = std::process::id();

        for &port in &self.scan_ports {
            if handled.contains(&port) {
                continue;
            }
            let Some(pid) = self.control.listening_pid(port) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            match self.control.terminate(pid) {
                Ok(Termination::Terminated) => {
                    tracing::info!(port, pid, "stopped unrecorded listener");
                    report.stopped.push(StoppedInstance {
                        port,
                        pid,
                        source: StopSource::PortScan,
                        already_exited: false,
                    });
                }
                Ok(Termination::NotRunning) => {}
                Err(e) => {
                    tracing::warn!(port, pid, "failed to stop listener: {e}");
                    report.failed.push(Instance { port, pid });
                }
            }
        }

        tracing::debug!(
            ports = ?self.scan_ports,
            "port scan finished; instances on other ports need a registry record to be found"
        );
    }
}
