//! HTTP health probe and end-to-end probe.

pub mod e2e;
pub mod health;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("group `{0}` reported unhealthy")]
    Unhealthy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Abstracts "is the gateway process running" so tests can fake process
/// lifecycles instead of scanning the real `/proc`.
pub trait ProcessWatcher: Send + Sync {
    fn is_running(&self, binary_name: &str) -> bool;
}

/// Production implementation: scans `/proc/<pid>/comm` for a matching
/// binary name. Linux-only, matching the host target.
#[derive(Default)]
pub struct ProcProcessWatcher;

impl ProcessWatcher for ProcProcessWatcher {
    fn is_running(&self, binary_name: &str) -> bool {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let comm_path = format!("/proc/{pid}/comm");
            if let Ok(comm) = std::fs::read_to_string(&comm_path) {
                if comm.trim() == binary_name {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
pub(crate) struct FakeProcessWatcher {
    pub running: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl ProcessWatcher for FakeProcessWatcher {
    fn is_running(&self, _binary_name: &str) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}
