use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Registry name of the parent `ocis server` process.
pub const PARENT: &str = "";

/// Human readable name for log lines; the parent is tracked under the empty name.
pub fn display_name(service: &str) -> &str {
    if service.is_empty() {
        "ocis"
    } else {
        service
    }
}

/// A process the supervisor believes to be alive.
#[derive(Debug)]
pub struct TrackedProcess {
    pub pid: u32,
    /// Flips to `true` once the exit watcher has reaped the process
    exited: watch::Receiver<bool>,
}

impl TrackedProcess {
    pub fn new(pid: u32, exited: watch::Receiver<bool>) -> Self {
        Self { pid, exited }
    }

    pub fn exit_watch(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }
}

/// Wait until the exit watcher reports the process gone, or `timeout` elapses.
///
/// Returns `true` if the exit was observed. A dropped watcher counts as exited.
pub async fn wait_for_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Service name to PID for every process currently believed alive.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, TrackedProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: &str, process: TrackedProcess) -> Option<TrackedProcess> {
        self.processes.insert(service.to_string(), process)
    }

    pub fn get(&self, service: &str) -> Option<&TrackedProcess> {
        self.processes.get(service)
    }

    pub fn pid(&self, service: &str) -> Option<u32> {
        self.processes.get(service).map(|p| p.pid)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.processes.contains_key(service)
    }

    /// Remove `service` only if it still maps to `pid`.
    ///
    /// A relaunch may already have replaced the entry with a newer process.
    pub fn remove_if_pid(&mut self, service: &str, pid: u32) -> bool {
        if self.pid(service) == Some(pid) {
            self.processes.remove(service);
            true
        } else {
            false
        }
    }

    /// Name, PID and exit watch of every entry, ordered by name.
    pub fn watches(&self) -> Vec<(String, u32, watch::Receiver<bool>)> {
        let mut entries: Vec<_> = self
            .processes
            .iter()
            .map(|(name, p)| (name.clone(), p.pid, p.exit_watch()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Name and PID of every entry, ordered by name.
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        self.watches()
            .into_iter()
            .map(|(name, pid, _)| (name, pid))
            .collect()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
