//! Drain loop between a running worker and the fit stream.
//!
//! The bridge binds a socket in a scratch directory, hands its path to the
//! worker and then alternates between reading the socket and checking
//! whether the worker has returned. Each wait is bounded by the poll
//! interval, so the runtime is never blocked and trailing output written
//! just before the worker exits is still collected. The worker's result is
//! only surfaced once the channel has been drained.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::protocol::{FrameDecoder, SOCKET_FILE};
use super::{WorkerError, WorkerPool};
use crate::protocol::framing::FrameWriter;
use crate::protocol::message::Topic;
use crate::protocol::parser::WriterParser;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Logger lines kept to explain a failure.
const CONTEXT_LINES: usize = 8;

const READ_CHUNK: usize = 64 * 1024;

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Iteration:\s+\d+\s*/\s*\d+\s*\[\s*\d+%\]\s*\(\w+\)").expect("valid progress regex")
});

/// Last iteration-progress fragment in `line`, if any.
///
/// Fast runs can pack several progress reports into one line; the last one
/// wins.
pub fn progress_of(line: &str) -> Option<&str> {
    PROGRESS_RE.find_iter(line).last().map(|m| m.as_str())
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Upper bound on each wait for socket data.
    pub poll_interval: Duration,
    /// How long to keep reading after the worker has returned.
    pub drain_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Everything collected from one run.
#[derive(Debug)]
pub struct DrainOutcome {
    /// Framed messages, also populated when the worker failed.
    pub stream: Vec<u8>,
    pub messages: usize,
    pub result: Result<(), WorkerError>,
}

impl DrainOutcome {
    fn channel_failure(err: impl std::fmt::Display) -> Self {
        Self {
            stream: Vec::new(),
            messages: 0,
            result: Err(WorkerError::Channel(err.to_string())),
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>, WorkerError> {
        self.result.map(|()| self.stream)
    }
}

/// Parser and encoder state for one run.
struct Drain {
    decoder: FrameDecoder,
    parser: WriterParser,
    writer: FrameWriter<Vec<u8>>,
    recent_log: VecDeque<String>,
    next_sequence: u64,
}

impl Drain {
    fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            parser: WriterParser::new(),
            writer: FrameWriter::new(Vec::new()),
            recent_log: VecDeque::with_capacity(CONTEXT_LINES),
            next_sequence: 0,
        }
    }

    fn feed<P: FnMut(&str)>(&mut self, bytes: &[u8], on_progress: &mut P) -> Result<(), WorkerError> {
        self.decoder.push(bytes);
        while let Some(frame) = self
            .decoder
            .next_frame()
            .map_err(|e| WorkerError::Channel(e.to_string()))?
        {
            if frame.sequence != self.next_sequence {
                warn!(
                    expected = self.next_sequence,
                    got = frame.sequence,
                    "Worker frame out of sequence"
                );
            }
            self.next_sequence = frame.sequence + 1;

            let Some(message) = self.parser.parse(frame.record) else {
                continue;
            };
            if message.topic == Topic::Logger {
                for line in message.texts() {
                    if let Some(progress) = progress_of(line) {
                        on_progress(progress);
                    }
                    if self.recent_log.len() == CONTEXT_LINES {
                        self.recent_log.pop_front();
                    }
                    self.recent_log.push_back(line.to_string());
                }
            }
            self.writer
                .write(&message)
                .map_err(|e| WorkerError::Channel(e.to_string()))?;
        }
        Ok(())
    }

    fn context(&self) -> Vec<String> {
        self.recent_log.iter().cloned().collect()
    }
}

/// Run `job` on `pool` and collect what it writes to the channel.
///
/// `job` receives the socket path and must return only after it has
/// finished writing. `on_progress` is called on the runtime thread, in
/// order, for every logger line that reports iteration progress; all calls
/// happen before this function returns.
pub async fn run_service<F, P>(
    pool: &WorkerPool,
    config: &BridgeConfig,
    job: F,
    mut on_progress: P,
) -> DrainOutcome
where
    F: FnOnce(&Path) -> Result<(), WorkerError> + Send + 'static,
    P: FnMut(&str) + Send,
{
    let started = Instant::now();
    let scratch = match tempfile::Builder::new().prefix("fitserve-").tempdir() {
        Ok(dir) => dir,
        Err(e) => return DrainOutcome::channel_failure(e),
    };
    let socket_path = scratch.path().join(SOCKET_FILE);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => return DrainOutcome::channel_failure(e),
    };
    debug!(socket = %socket_path.display(), "Worker channel listening");

    let worker_path = socket_path.clone();
    let handle = pool.spawn(move || job(&worker_path));

    let mut drain = Drain::new();
    let mut connection: Option<UnixStream> = None;
    let mut closed = false;
    let mut finished_at: Option<Instant> = None;
    let mut channel_error: Option<WorkerError> = None;
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        if finished_at.is_none() && handle.is_finished() {
            finished_at = Some(Instant::now());
        }
        if let Some(at) = finished_at {
            if closed {
                break;
            }
            if at.elapsed() >= config.drain_grace {
                let grace_ms = config.drain_grace.as_millis() as u64;
                warn!(grace_ms, "Worker exited but channel stayed open; stopping drain");
                // Whatever was drained so far is a prefix, not a result.
                channel_error.get_or_insert_with(|| {
                    WorkerError::Channel(format!(
                        "output stream was not closed within {grace_ms} ms of the worker returning"
                    ))
                });
                break;
            }
        }

        if connection.is_none() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, _addr)) => {
                        debug!("Worker connected");
                        connection = Some(conn);
                    }
                    Err(e) => {
                        channel_error = Some(WorkerError::Channel(e.to_string()));
                        closed = true;
                    }
                },
                _ = sleep(config.poll_interval) => {
                    // The worker returned and one more accept window passed
                    // without a connection: it never wrote anything.
                    if finished_at.is_some() {
                        closed = true;
                    }
                }
            }
            continue;
        }

        if closed {
            // Peer hung up before its future resolved.
            sleep(config.poll_interval).await;
            continue;
        }
        let Some(conn) = connection.as_mut() else {
            continue;
        };

        tokio::select! {
            read = conn.read(&mut buf) => match read {
                Ok(0) => closed = true,
                Ok(n) => {
                    if let Err(e) = drain.feed(&buf[..n], &mut on_progress) {
                        channel_error = Some(e);
                        closed = true;
                    }
                }
                Err(e) => {
                    channel_error = Some(WorkerError::Channel(e.to_string()));
                    closed = true;
                }
            },
            _ = sleep(config.poll_interval) => {}
        }
    }

    if channel_error.is_none() && drain.decoder.pending() > 0 {
        channel_error = Some(WorkerError::Channel(format!(
            "{} trailing bytes do not form a frame",
            drain.decoder.pending()
        )));
    }

    let result = match (handle.join().await, channel_error) {
        (Err(e), _) => Err(e.with_context(drain.context())),
        (Ok(()), Some(e)) => Err(e),
        (Ok(()), None) => Ok(()),
    };
    let messages = drain.writer.messages_written();
    let stream = drain.writer.into_inner();
    info!(
        messages,
        bytes = stream.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "Drain finished"
    );
    DrainOutcome {
        stream,
        messages,
        result,
    }
}
