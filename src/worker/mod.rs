//! Running service functions off the runtime and collecting their output.
//!
//! ```text
//!  runtime                         worker (blocking thread / child process)
//! ┌────────────────────────┐      ┌─────────────────────────────┐
//! │ bridge::run_service    │      │ ModelModule::call           │
//! │  bind worker.sock ─────┼──────┼─▶ SocketWriter::connect     │
//! │  select! {             │      │   log / header / values ... │
//! │    read + parse        │◀─────┼── frames                    │
//! │    sleep(poll)         │      │                             │
//! │  } until done + EOF    │      └─────────────────────────────┘
//! └────────────────────────┘
//! ```

pub mod bridge;
pub mod pool;
pub mod protocol;
pub mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub use bridge::{
    BridgeConfig, DEFAULT_DRAIN_GRACE, DEFAULT_POLL_INTERVAL, DrainOutcome, progress_of, run_service,
};
pub use pool::{WorkerHandle, WorkerPool};
pub use writer::SocketWriter;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The service function reported an error.
    #[error("{message}")]
    Failed { message: String, context: Vec<String> },
    #[error("cancelled")]
    Cancelled,
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("worker channel error: {0}")]
    Channel(String),
    #[error("failed to load model module: {0}")]
    ModuleLoad(String),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerError::Failed {
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Attach log lines that preceded the failure.
    pub fn with_context(self, lines: Vec<String>) -> Self {
        match self {
            WorkerError::Failed { message, context } if context.is_empty() => {
                WorkerError::Failed {
                    message,
                    context: lines,
                }
            }
            other => other,
        }
    }

    /// Message plus context, one line each, as reported to clients.
    pub fn report(&self) -> String {
        match self {
            WorkerError::Failed { message, context } if !context.is_empty() => {
                let mut out = context.join("\n");
                out.push('\n');
                out.push_str(message);
                out
            }
            other => other.to_string(),
        }
    }
}

/// Shared cancellation signal between an operation and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
