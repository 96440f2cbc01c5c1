use crate::error::{Result, WrapperError};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::{debug, trace, warn};

/// Command-line shape of a supervised server process: the binary path
/// followed by the `server` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSignature {
    program: String,
    subcommand: String,
    /// Only `<bin> server`, not `<bin> <service> server`
    parent_only: bool,
}

impl InvocationSignature {
    /// The parent and every individually started service.
    pub fn server(bin: &Path) -> Self {
        Self {
            program: bin.to_string_lossy().into_owned(),
            subcommand: "server".to_string(),
            parent_only: false,
        }
    }

    /// The parent alone.
    pub fn parent(bin: &Path) -> Self {
        Self {
            parent_only: true,
            ..Self::server(bin)
        }
    }

    /// Scripts show up as `<interpreter> <path> ...`, so the program may
    /// appear at any position, not only as argv[0].
    pub fn matches(&self, cmd: &[String]) -> bool {
        let Some(pos) = cmd.iter().position(|arg| *arg == self.program) else {
            return false;
        };
        let rest = &cmd[pos + 1..];
        if self.parent_only {
            rest.first().is_some_and(|arg| *arg == self.subcommand)
        } else {
            rest.iter().any(|arg| *arg == self.subcommand)
        }
    }
}

/// Source of live process identifiers matching a signature.
pub trait ProcessTable: Send + Sync {
    fn matching(&self, signature: &InvocationSignature) -> Vec<u32>;
}

/// The operating system's process table, read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn matching(&self, signature: &InvocationSignature) -> Vec<u32> {
        let mut system = System::new();
        // The default refresh leaves command lines empty.
        system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );
        let own = sysinfo::get_current_pid().ok();

        system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own)
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| signature.matches(process.cmd()))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }
}

/// Confirms that no supervised process is left after termination signals.
pub struct ShutdownPoller {
    table: Arc<dyn ProcessTable>,
    signature: InvocationSignature,
    timeout: Duration,
}

impl ShutdownPoller {
    pub fn new(table: Arc<dyn ProcessTable>, signature: InvocationSignature, timeout: Duration) -> Self {
        Self {
            table,
            signature,
            timeout,
        }
    }

    async fn remaining(&self, signature: &InvocationSignature) -> Result<Vec<u32>> {
        let table = Arc::clone(&self.table);
        let signature = signature.clone();
        tokio::task::spawn_blocking(move || table.matching(&signature))
            .await
            .map_err(|e| WrapperError::Io(std::io::Error::other(e)))
    }

    /// Poll until the table holds no matching process or the timeout elapses.
    pub async fn wait(&self) -> Result<String> {
        self.wait_for(&self.signature).await
    }

    /// Like [`wait`](Self::wait), for a narrower signature.
    pub async fn wait_for(&self, signature: &InvocationSignature) -> Result<String> {
        let started = Instant::now();
        let mut polls: u64 = 0;

        loop {
            let remaining = self.remaining(signature).await?;
            polls += 1;

            if remaining.is_empty() {
                debug!(polls, elapsed = ?started.elapsed(), "No supervised process left");
                return Ok("oCIS server stopped successfully".to_string());
            }

            trace!(pids = ?remaining, "Process found. Waiting...");

            if started.elapsed() >= self.timeout {
                warn!(
                    pids = ?remaining,
                    "Unable to kill oCIS server after {} seconds",
                    self.timeout.as_secs()
                );
                return Err(WrapperError::ShutdownTimeout(
                    "Timeout waiting for oCIS server to stop".to_string(),
                ));
            }

            tokio::task::yield_now().await;
        }
    }
}
