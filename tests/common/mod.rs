#![allow(dead_code)]

use axum::{routing::get, Router};
use ociswrapper::config::{ConfigLayer, WrapperConfig};
use ociswrapper::supervisor::{LogLine, LogSink, Stream, Supervisor};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Stand-in for the oCIS binary.
///
/// `list` prints two lines, `ask` prompts for one input line, and every
/// `... server` invocation appends its arguments and environment to the
/// `launches` file next to the script before idling until interrupted.
const FAKE_OCIS: &str = r#"#!/bin/sh
DIR="$(dirname "$0")"
case "$*" in
  list)
    printf 'a\nb\n'
    exit 0 ;;
  ask)
    printf 'Continue? '
    read answer
    echo "answer=$answer"
    exit 0 ;;
  *server)
    echo "$* X=${X:-} EXCLUDE=${OCIS_EXCLUDE_RUN_SERVICES:-}" >> "$DIR/launches"
    echo "starting $*"
    __BEHAVIOR__
    trap 'exit 0' INT TERM
    while true; do sleep 0.05; done ;;
  *)
    echo "unknown command $*"
    exit 1 ;;
esac
"#;

pub struct FakeOcis {
    pub dir: TempDir,
    pub bin: PathBuf,
}

impl FakeOcis {
    /// A server that keeps running until interrupted.
    pub fn healthy() -> Self {
        Self::write("")
    }

    /// A parent that exits with code 3 right after starting; services keep running.
    pub fn crashing() -> Self {
        Self::write(r#"[ "$*" = "server" ] && exit 3"#)
    }

    /// A server that ignores interrupts.
    pub fn stubborn() -> Self {
        Self::write("trap '' INT TERM; while true; do sleep 0.05; done")
    }

    fn write(behavior: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ocis");
        std::fs::write(&bin, FAKE_OCIS.replace("__BEHAVIOR__", behavior)).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, bin }
    }

    /// Recorded `server` invocations, oldest first.
    pub fn launches(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("launches"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Local endpoint answering the anonymous readiness probe.
pub async fn readiness_stub() -> String {
    let app = Router::new().route(
        "/ocs/v1.php/cloud/capabilities",
        get(|| async { r#"{"ocs":{}}"# }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn test_config(bin: &Path, url: &str, retry: u32) -> WrapperConfig {
    let mut config = WrapperConfig::from_layers([ConfigLayer {
        bin: Some(bin.to_path_buf()),
        url: Some(url.to_string()),
        retry: Some(retry),
        ..Default::default()
    }]);
    config.timings.shutdown_timeout = Duration::from_secs(5);
    config.timings.readiness_timeout = Duration::from_secs(5);
    config.timings.services_list_timeout = Duration::from_secs(2);
    config.timings.poll_interval = Duration::from_millis(20);
    config.timings.retry_backoff = Duration::from_millis(10);
    config.timings.service_stop_grace = Duration::from_secs(2);
    config.timings.command_timeout = Duration::from_secs(2);
    config
}

/// Collects forwarded process output.
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<LogLine>>,
}

impl LogSink for RecordingSink {
    fn emit(&self, line: LogLine) {
        self.lines.lock().unwrap().push(line);
    }
}

impl RecordingSink {
    /// Text of every line `service` wrote to `stream`, in arrival order.
    pub fn lines(&self, service: &str, stream: Stream) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.service == service && l.stream == stream)
            .map(|l| l.text.clone())
            .collect()
    }
}

pub fn supervisor(config: WrapperConfig) -> (Supervisor, Arc<RecordingSink>) {
    let logs = Arc::new(RecordingSink::default());
    let supervisor = Supervisor::with_log_sink(config, logs.clone()).unwrap();
    (supervisor, logs)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
