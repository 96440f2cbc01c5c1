//! One-shot invocations of the supervised binary's command-line interface.
//!
//! Commands run attached to a pseudo-terminal so interactive prompts behave
//! as if a user were typing. Scripted input lines are written up front and
//! everything the command prints is captured until it exits or the deadline
//! passes.

use crate::error::{Result, WrapperError};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, OutputFlags, SetArg};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Prefix of the captured output when the deadline killed the command.
pub const TIMEOUT_MARKER: &str = "Command timed out:\n";

/// How long to keep reading the terminal after the command exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the command, -1 if it was terminated by a signal
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

pub struct CommandRunner {
    bin: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// Run `<bin> <command...>` feeding `inputs` line by line.
    pub async fn run(&self, command: &str, inputs: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = command.split_whitespace().collect();
        info!(bin = %self.bin.display(), ?args, inputs = inputs.len(), "Running command");

        let OpenptyResult { master, slave } = open_pty()?;

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .stdin(slave.try_clone()?)
            .stdout(slave.try_clone()?)
            .stderr(slave.try_clone()?)
            .kill_on_drop(true);

        // Make the terminal the controlling terminal of a fresh session.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // The child holds its own copies; ours must close so reads end at exit.
        drop(cmd);
        drop(slave);
        let mut child = spawned.map_err(|e| {
            WrapperError::Pty(format!("Failed to start '{}': {}", self.bin.display(), e))
        })?;
        let pid = child.id();

        let terminal = std::fs::File::from(master);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let drained = spawn_reader(terminal.try_clone()?, Arc::clone(&captured));
        spawn_writer(terminal, inputs.to_vec());

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (status?, false),
            Err(_) => {
                warn!(?pid, timeout = ?self.timeout, "Command timed out, killing it");
                if let Some(pid) = pid {
                    // The command leads its own session, so this also reaches its children.
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.start_kill();
                (child.wait().await?, true)
            }
        };

        if tokio::time::timeout(DRAIN_GRACE, drained).await.is_err() {
            debug!("Terminal still open after command exit, using output captured so far");
        }

        let bytes = match captured.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut output = strip_echo(&text, inputs).to_string();
        if timed_out {
            output.insert_str(0, TIMEOUT_MARKER);
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, timed_out, "Command finished");

        Ok(CommandOutput {
            exit_code,
            output,
            timed_out,
        })
    }
}

/// Open a terminal pair with output newline translation disabled, so the
/// captured text carries the command's own line endings.
///
/// Both ends are close-on-exec: supervised servers spawned meanwhile must
/// not inherit them, or the reader never sees the terminal close.
fn open_pty() -> Result<OpenptyResult> {
    let pty = openpty(None, None)?;
    for fd in [pty.master.as_raw_fd(), pty.slave.as_raw_fd()] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    let mut termios = tcgetattr(&pty.slave)?;
    termios.output_flags.remove(OutputFlags::ONLCR);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;
    Ok(pty)
}

fn spawn_reader(mut terminal: std::fs::File, captured: Arc<Mutex<Vec<u8>>>) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match terminal.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => match captured.lock() {
                    Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once every slave descriptor is closed
                Err(_) => break,
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

fn spawn_writer(mut terminal: std::fs::File, inputs: Vec<String>) {
    if inputs.is_empty() {
        return;
    }
    std::thread::spawn(move || {
        for input in inputs {
            if let Err(e) = writeln!(terminal, "{}", input) {
                debug!("Failed to write command input: {}", e);
                return;
            }
        }
    });
}

/// Drop terminal echo of the scripted inputs from the head of the output.
///
/// Best effort: every leading character that occurs anywhere in the inputs
/// joined by `\r\n` is trimmed, so output that starts with one of those
/// characters loses it too.
pub fn strip_echo<'a>(output: &'a str, inputs: &[String]) -> &'a str {
    let cutset = inputs.join("\r\n");
    if cutset.is_empty() {
        return output;
    }
    output.trim_start_matches(|c: char| cutset.contains(c))
}
