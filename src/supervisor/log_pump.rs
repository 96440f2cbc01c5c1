//! Forwarding of supervised process output.
//!
//! Every spawned process gets two scanners (stdout, stderr) feeding one
//! unbounded channel, and one consumer task that hands lines to a
//! [`LogSink`] in arrival order. Lines of one stream keep their order;
//! the two streams interleave on a best-effort basis.

use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Registry name of the producing process
    pub service: String,
    pub stream: Stream,
    pub text: String,
}

/// Destination for forwarded process output.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: LogLine);
}

/// Writes every line verbatim to the wrapper's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn emit(&self, line: LogLine) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line.text);
    }
}

/// Running scanners and consumer for one process.
pub struct LogPump {
    scanners: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
}

impl LogPump {
    pub fn start<O, E>(
        service: &str,
        stdout: Option<O>,
        stderr: Option<E>,
        sink: Arc<dyn LogSink>,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
        let mut scanners = Vec::with_capacity(2);

        if let Some(stdout) = stdout {
            scanners.push(spawn_scanner(service, Stream::Stdout, stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            scanners.push(spawn_scanner(service, Stream::Stderr, stderr, tx.clone()));
        }
        // The channel closes once every scanner has dropped its sender.
        drop(tx);

        let consumer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                sink.emit(line);
            }
        });

        Self { scanners, consumer }
    }

    /// Wait for both scanners to reach end of stream.
    ///
    /// Returns the consumer handle, which completes once the remaining
    /// buffered lines have been handed to the sink.
    pub async fn finish(self) -> JoinHandle<()> {
        for scanner in self.scanners {
            if let Err(e) = scanner.await {
                debug!("Log scanner ended abnormally: {}", e);
            }
        }
        self.consumer
    }
}

fn spawn_scanner<R>(
    service: &str,
    stream: Stream,
    reader: R,
    tx: mpsc::UnboundedSender<LogLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let service = service.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    let line = LogLine {
                        service: service.clone(),
                        stream,
                        text,
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(service = %service, ?stream, "Log scanner read error: {}", e);
                    break;
                }
            }
        }
        trace!(service = %service, ?stream, "Log scanner reached end of stream");
    })
}
