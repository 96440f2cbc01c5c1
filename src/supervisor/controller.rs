use super::command::{CommandOutput, CommandRunner};
use super::log_pump::{ConsoleSink, LogPump, LogSink};
use super::readiness::ReadinessProber;
use super::registry::{display_name, wait_for_exit, ProcessRegistry, TrackedProcess, PARENT};
use super::shutdown::{InvocationSignature, ProcessTable, ShutdownPoller, SystemProcessTable};
use crate::config::WrapperConfig;
use crate::error::{Result, WrapperError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Environment override that keeps a service out of the parent process.
pub const EXCLUDE_SERVICES_ENV: &str = "OCIS_EXCLUDE_RUN_SERVICES";

/// State owned by the supervisor; only mutated through [`Supervisor`] methods.
#[derive(Debug, Default)]
struct SupervisorState {
    registry: ProcessRegistry,
    /// Accumulated `KEY=VALUE` overrides from configuration requests
    env_overrides: Vec<String>,
    /// Consecutive automatic relaunches of the parent
    retry_count: u32,
    /// Set while a deliberate shutdown is in progress
    stop_signal: bool,
}

struct Inner {
    config: WrapperConfig,
    state: Mutex<SupervisorState>,
    sink: Arc<dyn LogSink>,
    shutdown: ShutdownPoller,
    prober: ReadinessProber,
    runner: CommandRunner,
    fatal: watch::Sender<Option<String>>,
}

/// Whether a start may replace a tracked process of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Replace,
    /// Refuse with `AlreadyRunning`; checked under the state lock
    Exclusive,
}

/// A freshly spawned process that still needs an exit watcher.
struct Spawned {
    pid: u32,
    child: Child,
    pump: LogPump,
    exited: watch::Sender<bool>,
}

/// Starts, stops and restarts the supervised binary and its services.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: WrapperConfig) -> Result<Self> {
        Self::with_log_sink(config, Arc::new(ConsoleSink))
    }

    pub fn with_log_sink(config: WrapperConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        Self::with_parts(config, sink, Arc::new(SystemProcessTable))
    }

    pub fn with_parts(
        config: WrapperConfig,
        sink: Arc<dyn LogSink>,
        table: Arc<dyn ProcessTable>,
    ) -> Result<Self> {
        let shutdown = ShutdownPoller::new(
            table,
            InvocationSignature::server(&config.bin),
            config.timings.shutdown_timeout,
        );
        let prober = ReadinessProber::new(&config)?;
        let runner = CommandRunner::new(&config.bin, config.timings.command_timeout);
        let (fatal, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SupervisorState::default()),
                sink,
                shutdown,
                prober,
                runner,
                fatal,
            }),
        })
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.inner.config
    }

    /// Carries the reason once the supervisor can no longer launch its binary.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }

    /// Whether the parent process is tracked.
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.registry.contains(PARENT)
    }

    /// Name and PID of every tracked process.
    pub async fn tracked(&self) -> Vec<(String, u32)> {
        self.inner.state.lock().await.registry.snapshot()
    }

    pub async fn env_overrides(&self) -> Vec<String> {
        self.inner.state.lock().await.env_overrides.clone()
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.state.lock().await.retry_count
    }

    /// Spawn `<bin> [service] server` and keep supervising it in the background.
    ///
    /// An empty `env` falls back to the accumulated overrides. Returns the PID
    /// once the spawn succeeded; readiness is not awaited.
    pub async fn start(&self, service: &str, env: Vec<String>) -> Result<u32> {
        self.start_with(service, env, StartMode::Replace).await
    }

    async fn start_with(&self, service: &str, env: Vec<String>, mode: StartMode) -> Result<u32> {
        let spawned = self.spawn(service, &env, mode).await?;
        let pid = spawned.pid;

        let supervisor = self.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            supervisor.supervise(service, env, spawned).await;
        });

        Ok(pid)
    }

    async fn spawn(&self, service: &str, env: &[String], mode: StartMode) -> Result<Spawned> {
        let mut state = self.inner.state.lock().await;
        if mode == StartMode::Exclusive {
            if state.registry.contains(service) {
                return Err(WrapperError::AlreadyRunning);
            }
            state.retry_count = 0;
        }
        state.stop_signal = false;
        self.spawn_locked(&mut state, service, env)
    }

    /// Relaunch after a crash unless a stop or another start got there first.
    async fn respawn(&self, service: &str, env: &[String]) -> Result<Option<Spawned>> {
        let mut state = self.inner.state.lock().await;
        if state.stop_signal {
            info!("Stop requested, not retrying oCIS server");
            return Ok(None);
        }
        if state.registry.contains(service) {
            debug!(service = display_name(service), "Already relaunched elsewhere");
            return Ok(None);
        }
        self.spawn_locked(&mut state, service, env).map(Some)
    }

    fn spawn_locked(
        &self,
        state: &mut SupervisorState,
        service: &str,
        env: &[String],
    ) -> Result<Spawned> {
        let effective_env = if env.is_empty() {
            state.env_overrides.clone()
        } else {
            env.to_vec()
        };
        debug!(
            service = display_name(service),
            env = ?effective_env,
            "Environment overrides for process"
        );

        let bin = &self.inner.config.bin;
        let mut cmd = Command::new(bin);
        cmd.args(server_args(service))
            .envs(parse_env(&effective_env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = WrapperError::Spawn {
                    command: format!("{} {}", bin.display(), server_args(service).join(" ")),
                    source,
                };
                error!("{}", err);
                self.inner.fatal.send_replace(Some(err.to_string()));
                return Err(err);
            }
        };

        let Some(pid) = child.id() else {
            return Err(WrapperError::Io(std::io::Error::other(
                "process exited before its PID was known",
            )));
        };

        let (exited, exit_watch) = watch::channel(false);
        state
            .registry
            .insert(service, TrackedProcess::new(pid, exit_watch));
        info!(
            service = display_name(service),
            pid,
            tracked = ?state.registry.snapshot(),
            "Started oCIS process"
        );

        let pump = LogPump::start(
            service,
            child.stdout.take(),
            child.stderr.take(),
            Arc::clone(&self.inner.sink),
        );

        Ok(Spawned {
            pid,
            child,
            pump,
            exited,
        })
    }

    /// Wait for the process to exit and relaunch a crashed parent while the
    /// retry budget allows it.
    async fn supervise(self, service: String, env: Vec<String>, mut current: Spawned) {
        loop {
            let status = current.child.wait().await;
            // Scanners must drain before the process counts as torn down.
            let _ = current.pump.finish().await;

            let relaunch = {
                let mut state = self.inner.state.lock().await;
                state.registry.remove_if_pid(&service, current.pid);
                self.should_relaunch(&mut state, &service, &status)
            };
            current.exited.send_replace(true);

            let Some(attempt) = relaunch else {
                return;
            };

            // Separately started services keep running through a parent crash.
            let parent = InvocationSignature::parent(&self.inner.config.bin);
            if let Err(e) = self.inner.shutdown.wait_for(&parent).await {
                warn!("Previous oCIS server still present before retry: {}", e);
            }
            info!("Retry starting oCIS server... (retry {})", attempt);
            tokio::time::sleep(self.inner.config.timings.retry_backoff).await;

            current = match self.respawn(&service, &env).await {
                Ok(Some(spawned)) => spawned,
                Ok(None) => return,
                Err(e) => {
                    error!("Giving up on oCIS server: {}", e);
                    return;
                }
            };
        }
    }

    fn should_relaunch(
        &self,
        state: &mut SupervisorState,
        service: &str,
        status: &std::io::Result<ExitStatus>,
    ) -> Option<u32> {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(service = display_name(service), "Failed to wait for process: {}", e);
                return None;
            }
        };

        // No exit code means the process was killed by a signal.
        let Some(code) = status.code() else {
            info!(service = display_name(service), %status, "Process terminated by signal");
            return None;
        };

        if code <= 0 || state.stop_signal || service != PARENT {
            info!(service = display_name(service), code, "Process exited");
            return None;
        }

        warn!("oCIS server exited with code {}", code);
        state.retry_count += 1;
        let max_retry = self.inner.config.retry;
        if state.retry_count <= max_retry {
            Some(state.retry_count)
        } else {
            error!(
                retries = max_retry,
                "oCIS server keeps crashing, not retrying anymore"
            );
            None
        }
    }

    /// Interrupt every tracked process and confirm none is left.
    pub async fn stop(&self) -> Result<String> {
        info!("Stopping oCIS server...");
        let tracked = {
            let mut state = self.inner.state.lock().await;
            state.stop_signal = true;
            state.registry.watches()
        };

        for (service, pid, mut exited) in tracked {
            info!(service = display_name(&service), pid, "Terminating process");
            match interrupt(pid) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    debug!(service = display_name(&service), pid, "Process already finished");
                    continue;
                }
                Err(e) => {
                    warn!(service = display_name(&service), pid, "Failed to send signal: {}", e);
                    continue;
                }
            }
            if !wait_for_exit(&mut exited, self.inner.config.timings.shutdown_timeout).await {
                warn!(service = display_name(&service), pid, "Process did not exit in time");
            }
        }

        let message = self.inner.shutdown.wait().await?;
        self.inner.state.lock().await.registry.clear();
        info!("{}", message);
        Ok(message)
    }

    /// Interrupt a single tracked service.
    pub async fn stop_service(&self, service: &str) -> Result<String> {
        let tracked = {
            let state = self.inner.state.lock().await;
            debug!(tracked = ?state.registry.snapshot(), "Services running before terminating");
            state.registry.get(service).map(|p| (p.pid, p.exit_watch()))
        };
        let Some((pid, mut exited)) = tracked else {
            return Err(WrapperError::NotFound(service.to_string()));
        };

        info!(service = display_name(service), pid, "Terminating service");
        if let Err(e) = interrupt(pid) {
            warn!(service = display_name(service), pid, "Failed to send signal: {}", e);
            if e == Errno::ESRCH {
                self.inner
                    .state
                    .lock()
                    .await
                    .registry
                    .remove_if_pid(service, pid);
            }
            return Err(WrapperError::Signal {
                pid,
                reason: e.to_string(),
            });
        }

        if !wait_for_exit(&mut exited, self.inner.config.timings.service_stop_grace).await {
            warn!(service = display_name(service), pid, "Service did not exit within grace period");
        }

        let mut state = self.inner.state.lock().await;
        state.registry.remove_if_pid(service, pid);
        debug!(tracked = ?state.registry.snapshot(), "Services running after terminating");
        Ok(format!("oCIS service {} stopped successfully", service))
    }

    /// Stop everything, start the parent with `env` and wait for readiness.
    pub async fn restart(&self, env: Vec<String>) -> Result<String> {
        info!(env = ?env, "Restarting oCIS server...");
        if let Err(e) = self.stop().await {
            warn!("Stop before restart did not complete: {}", e);
        }
        self.reset_retries().await;
        self.start(PARENT, env).await?;
        self.inner.prober.wait_for_connection().await
    }

    /// Start the parent unless it already runs, then wait for readiness.
    pub async fn launch(&self) -> Result<String> {
        self.start_with(PARENT, Vec::new(), StartMode::Exclusive)
            .await?;
        self.inner.prober.wait_for_connection().await
    }

    /// Append overrides and restart so the parent picks them up.
    pub async fn configure(&self, pairs: Vec<String>) -> Result<String> {
        let env = {
            let mut state = self.inner.state.lock().await;
            state.env_overrides.extend(pairs);
            state.env_overrides.clone()
        };
        self.restart(env).await
    }

    /// Drop every accumulated override and restart with the plain environment.
    pub async fn rollback(&self) -> Result<String> {
        self.inner.state.lock().await.env_overrides.clear();
        self.restart(Vec::new()).await
    }

    /// Restart the parent without `service`, then run `service` on its own.
    pub async fn run_service(&self, service: &str, env: Vec<String>) -> Result<String> {
        self.restart(vec![format!("{}={}", EXCLUDE_SERVICES_ENV, service)])
            .await?;

        info!(service, env = ?env, "Starting service separately");
        self.start(service, env).await?;
        self.inner.prober.wait_for_connection().await?;
        Ok(format!("oCIS service {} started successfully", service))
    }

    /// Run an interactive one-shot command against the binary.
    pub async fn run_command(&self, command: &str, inputs: &[String]) -> Result<CommandOutput> {
        self.inner.runner.run(command, inputs).await
    }

    async fn reset_retries(&self) {
        self.inner.state.lock().await.retry_count = 0;
    }
}

/// Arguments for the parent (`server`) or a single service (`<name> server`).
pub fn server_args(service: &str) -> Vec<String> {
    if service.is_empty() {
        vec!["server".to_string()]
    } else {
        vec![service.to_string(), "server".to_string()]
    }
}

/// Split `KEY=VALUE` entries; entries without `=` are skipped.
pub fn parse_env(pairs: &[String]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
            _ => {
                warn!(entry = %pair, "Ignoring malformed environment override");
                None
            }
        })
        .collect()
}

fn interrupt(pid: u32) -> nix::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    if raw <= 0 {
        return Err(Errno::ESRCH);
    }
    kill(Pid::from_raw(raw), Signal::SIGINT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_runs_plain_server() {
        assert_eq!(server_args(PARENT), vec!["server"]);
        assert_eq!(server_args("proxy"), vec!["proxy", "server"]);
    }

    #[test]
    fn env_pairs_split_on_first_equals() {
        let pairs = vec![
            "PROXY_ENABLE_BASIC_AUTH=true".to_string(),
            "OCIS_URL=https://host:9200/?a=b".to_string(),
            "BROKEN".to_string(),
            "=nokey".to_string(),
        ];
        assert_eq!(
            parse_env(&pairs),
            vec![
                ("PROXY_ENABLE_BASIC_AUTH".to_string(), "true".to_string()),
                ("OCIS_URL".to_string(), "https://host:9200/?a=b".to_string()),
            ]
        );
    }

    #[test]
    fn interrupt_refuses_process_groups() {
        assert_eq!(interrupt(0), Err(Errno::ESRCH));
        assert_eq!(interrupt(u32::MAX), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn stop_service_unknown_is_not_found() {
        let supervisor = Supervisor::new(WrapperConfig::for_bin("/nonexistent/ocis")).unwrap();
        let err = supervisor.stop_service("proxy").await.unwrap_err();
        assert!(matches!(err, WrapperError::NotFound(name) if name == "proxy"));
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let supervisor = Supervisor::new(WrapperConfig::for_bin("/nonexistent/ocis")).unwrap();
        let fatal = supervisor.fatal();

        let err = supervisor.start(PARENT, Vec::new()).await.unwrap_err();
        assert!(matches!(err, WrapperError::Spawn { .. }));
        assert!(fatal.borrow().is_some());
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn rollback_clears_overrides_even_if_restart_fails() {
        let supervisor = Supervisor::new(WrapperConfig::for_bin("/nonexistent/ocis")).unwrap();
        assert!(supervisor.configure(vec!["A=1".into()]).await.is_err());
        assert_eq!(supervisor.env_overrides().await, vec!["A=1"]);

        assert!(supervisor.rollback().await.is_err());
        assert!(supervisor.env_overrides().await.is_empty());
    }
}
