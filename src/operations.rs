//! Long-running fit operations.
//!
//! An operation is created when a fit request misses the cache and is
//! finished exactly once, by the task that drives the worker. Running
//! operations live in an in-memory index until their final record is
//! persisted; polling reads the index first and the cache after that.
//! Persisted records also let a restart report what a previous process
//! left behind.
//!
//! ```text
//! start_fit ──► pending run? ──yes──► join
//!                  │no
//!                  ▼
//!               cache hit? ──yes──► done(fit)
//!                  │no
//!                  ▼
//!               pending ──► run_service ──► done(fit) | done(status)
//!                  │
//!                cancel ──► cancelling ──► done(499)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::naming::{EnvFingerprint, FitId, FitName, ModelId, compute_fit_id};
use crate::services::{ArgumentError, ServiceFunction, merge_defaults, validate_arguments};
use crate::storage::{self, Cache, CacheError};
use crate::toolchain::{ServiceCall, Toolchain};
use crate::worker::{BridgeConfig, CancelFlag, WorkerError, WorkerPool, run_service};

/// Prefix of the message of a fit whose service call raised.
pub const SERVICE_EXCEPTION: &str = "Exception during call to services function";

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error("`{0}` must be a JSON object")]
    NotAnObject(&'static str),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("serializing fit arguments: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Error body shared by HTTP responses and failed operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub status: String,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "Bad Request", message)
    }

    pub fn cancelled() -> Self {
        Self::new(499, "Cancelled", "Operation was cancelled")
    }

    pub fn interrupted() -> Self {
        Self::new(
            500,
            "Internal Server Error",
            "Operation was interrupted before it finished",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "Internal Server Error", message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub fit: FitRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationResult {
    Status(Status),
    Fit(FitRef),
}

/// Client-visible operation record. `result` is set iff `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub metadata: OperationMetadata,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

impl Operation {
    fn pending(fit: &FitName) -> Self {
        Self {
            name: fit.operation_name(),
            metadata: OperationMetadata {
                fit: FitRef {
                    name: fit.to_string(),
                },
                progress: None,
            },
            done: false,
            result: None,
        }
    }

    fn completed(fit: &FitName) -> Self {
        let mut op = Self::pending(fit);
        op.finish(OperationResult::Fit(FitRef {
            name: fit.to_string(),
        }));
        op
    }

    fn finish(&mut self, result: OperationResult) {
        self.done = true;
        self.result = Some(result);
    }

    pub fn fit_name(&self) -> &str {
        &self.metadata.fit.name
    }

    pub fn status(&self) -> Option<&Status> {
        match &self.result {
            Some(OperationResult::Status(status)) => Some(status),
            _ => None,
        }
    }
}

/// Body of a fit request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitRequest {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Value>,
    #[serde(flatten)]
    pub arguments: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Cancelling,
    Done,
}

struct Entry {
    fit: FitName,
    record: Operation,
    state: State,
    cancel: CancelFlag,
    /// Distinguishes a run from a later run of the same fit.
    run: u64,
}

impl Entry {
    fn in_flight(&self) -> bool {
        self.state != State::Done
    }

    fn joinable(&self) -> bool {
        self.state == State::Pending
    }
}

type OpenIndex = Arc<Mutex<HashMap<FitId, Entry>>>;

pub struct OperationManager {
    cache: Arc<Cache>,
    toolchain: Arc<dyn Toolchain>,
    pool: WorkerPool,
    bridge: BridgeConfig,
    env: EnvFingerprint,
    open: OpenIndex,
    next_run: AtomicU64,
}

impl OperationManager {
    pub fn new(
        cache: Arc<Cache>,
        toolchain: Arc<dyn Toolchain>,
        pool: WorkerPool,
        bridge: BridgeConfig,
        env: EnvFingerprint,
    ) -> Self {
        Self {
            cache,
            toolchain,
            pool,
            bridge,
            env,
            open: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(0),
        }
    }

    /// Start (or find) the fit `request` describes on `model`.
    ///
    /// Never waits for the worker: the returned operation is either already
    /// done (cache hit) or pending.
    pub async fn start_fit(
        self: &Arc<Self>,
        model: &ModelId,
        request: FitRequest,
    ) -> Result<Operation, OperationError> {
        let function = ServiceFunction::parse(&request.function)?;
        validate_arguments(function, &request.arguments)?;
        let data = object_or_empty(request.data, "data")?;
        let init = object_or_empty(request.init, "init")?;

        let cache = self.cache.clone();
        let model_id = model.clone();
        storage::blocking(move || cache.describe_model(&model_id)).await?;

        let mut fingerprint = request.arguments.clone();
        fingerprint.insert("data".to_string(), data.clone());
        fingerprint.insert("init".to_string(), init.clone());
        let fit_id = compute_fit_id(function.full_name(), model, &fingerprint, &self.env)?;
        let fit = FitName::new(model.clone(), fit_id.clone());

        if let Some(record) = self.joinable(&fit_id) {
            info!(operation = %record.name, "Joining in-flight operation");
            return Ok(record);
        }

        let cache = self.cache.clone();
        let lookup = fit.clone();
        if storage::blocking(move || cache.has_fit(&lookup)).await? {
            debug!(fit = %fit, "Fit cache hit");
            let record = Operation::completed(&fit);
            self.persist(&fit, &record).await?;
            return Ok(record);
        }
        debug!(fit = %fit, "Fit cache miss");

        let argument_fingerprint = serde_json::to_string(&fingerprint)?;
        let record = Operation::pending(&fit);
        let cancel = CancelFlag::new();
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        {
            let mut open = self.open.lock();
            if let Some(entry) = open.get(&fit_id)
                && entry.joinable()
            {
                info!(operation = %entry.record.name, "Joining in-flight operation");
                return Ok(entry.record.clone());
            }
            // A run still cancelling is superseded; its worker already has
            // the stop signal.
            open.insert(
                fit_id.clone(),
                Entry {
                    fit: fit.clone(),
                    record: record.clone(),
                    state: State::Pending,
                    cancel: cancel.clone(),
                    run,
                },
            );
        }
        if let Err(e) = self.persist(&fit, &record).await {
            self.release(&fit_id, run);
            return Err(e.into());
        }
        info!(operation = %record.name, function = function.basename(), "Operation created");

        let call = ServiceCall {
            function,
            model: model.clone(),
            data,
            init,
            arguments: merge_defaults(function, &request.arguments),
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_fit(fit, call, argument_fingerprint, cancel, run).await;
        });

        Ok(record)
    }

    fn joinable(&self, id: &FitId) -> Option<Operation> {
        self.open
            .lock()
            .get(id)
            .filter(|entry| entry.joinable())
            .map(|entry| entry.record.clone())
    }

    /// Drop the index entry of `run`, unless a newer run replaced it.
    fn release(&self, id: &FitId, run: u64) {
        let mut open = self.open.lock();
        if open.get(id).is_some_and(|entry| entry.run == run) {
            open.remove(id);
        }
    }

    async fn run_fit(
        self: Arc<Self>,
        fit: FitName,
        call: ServiceCall,
        argument_fingerprint: String,
        cancel: CancelFlag,
        run: u64,
    ) {
        let started = Instant::now();
        let function = call.function;

        let cache = self.cache.clone();
        let toolchain = self.toolchain.clone();
        let worker_cancel = cancel.clone();
        let job = move |socket: &std::path::Path| {
            if worker_cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            let stored = cache
                .get_model(&call.model)
                .map_err(|e| WorkerError::ModuleLoad(e.to_string()))?;
            toolchain
                .import_module(&stored)?
                .call(&call, socket, &worker_cancel)
        };

        let open = self.open.clone();
        let progress_id = fit.fit.clone();
        let on_progress = move |progress: &str| {
            if let Some(entry) = open.lock().get_mut(&progress_id)
                && entry.run == run
            {
                entry.record.metadata.progress = Some(progress.to_string());
            }
        };

        let outcome = run_service(&self.pool, &self.bridge, job, on_progress).await;
        let messages = outcome.messages;

        let result = match outcome.into_result() {
            Ok(_) if cancel.is_cancelled() => OperationResult::Status(Status::cancelled()),
            Ok(stream) => {
                let cache = self.cache.clone();
                let name = fit.clone();
                let function = function.full_name();
                match storage::blocking(move || {
                    cache.put_fit(&name, function, &argument_fingerprint, &stream)
                })
                .await
                {
                    Ok(()) => OperationResult::Fit(FitRef {
                        name: fit.to_string(),
                    }),
                    Err(e) => {
                        error!(fit = %fit, error = %e, "Failed to store fit");
                        OperationResult::Status(Status::internal(format!(
                            "Failed to store fit: {e}"
                        )))
                    }
                }
            }
            Err(WorkerError::Cancelled) => OperationResult::Status(Status::cancelled()),
            Err(_) if cancel.is_cancelled() => OperationResult::Status(Status::cancelled()),
            Err(e) => OperationResult::Status(Status::bad_request(format!(
                "{SERVICE_EXCEPTION}: {}",
                e.report()
            ))),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            OperationResult::Fit(_) => {
                info!(fit = %fit, messages, elapsed_ms, "Operation finished")
            }
            OperationResult::Status(status) if status.code == 499 => {
                info!(fit = %fit, elapsed_ms, "Operation cancelled")
            }
            OperationResult::Status(status) => {
                warn!(fit = %fit, code = status.code, message = %status.message, "Operation failed")
            }
        }

        let record = {
            let open = self.open.lock();
            match open.get(&fit.fit) {
                Some(entry) if entry.run == run => {
                    let mut record = entry.record.clone();
                    record.finish(result);
                    record
                }
                // Shutdown already recorded this run as interrupted, or a
                // newer run of the same fit owns the operation name.
                _ => return,
            }
        };
        // Persist first: once the entry is gone, polling reads the record
        // back from the cache.
        let persisted = self.persist(&fit, &record).await;
        match persisted {
            Ok(()) => self.release(&fit.fit, run),
            Err(e) => {
                error!(operation = %record.name, error = %e, "Failed to persist operation");
                if let Some(entry) = self.open.lock().get_mut(&fit.fit)
                    && entry.run == run
                {
                    entry.record = record;
                    entry.state = State::Done;
                }
            }
        }
    }

    async fn persist(&self, fit: &FitName, record: &Operation) -> Result<(), CacheError> {
        let cache = self.cache.clone();
        let fit = fit.clone();
        let record = record.clone();
        storage::blocking(move || cache.put_operation(&fit, &record, record.done)).await
    }

    /// The operation for fit `id`, open or persisted.
    pub async fn get_operation(&self, id: &FitId) -> Result<Operation, OperationError> {
        if let Some(entry) = self.open.lock().get(id) {
            return Ok(entry.record.clone());
        }
        let cache = self.cache.clone();
        let name = format!("operations/{id}");
        Ok(storage::blocking(move || cache.get_operation::<Operation>(&name)).await?)
    }

    /// Ask the worker behind `id` to stop. Done operations are returned
    /// unchanged.
    pub async fn cancel(&self, id: &FitId) -> Result<Operation, OperationError> {
        {
            let mut open = self.open.lock();
            if let Some(entry) = open.get_mut(id) {
                if entry.state == State::Pending {
                    info!(operation = %entry.record.name, "Cancelling operation");
                    entry.state = State::Cancelling;
                    entry.cancel.cancel();
                }
                return Ok(entry.record.clone());
            }
        }
        self.get_operation(id).await
    }

    /// Mark operations a previous process left pending as interrupted.
    pub async fn recover_interrupted(&self) -> Result<usize, CacheError> {
        let cache = self.cache.clone();
        storage::blocking(move || {
            let pending: Vec<Operation> = cache.pending_operations()?;
            let mut recovered = 0;
            for mut record in pending {
                let fit = match FitName::parse(record.fit_name()) {
                    Ok(fit) => fit,
                    Err(e) => {
                        warn!(operation = %record.name, error = %e, "Skipping unreadable operation");
                        continue;
                    }
                };
                warn!(
                    operation = %record.name,
                    "Operation was left pending by a previous run"
                );
                record.finish(OperationResult::Status(Status::interrupted()));
                cache.put_operation(&fit, &record, true)?;
                recovered += 1;
            }
            Ok(recovered)
        })
        .await
    }

    /// Operations not yet done.
    pub fn pending_count(&self) -> usize {
        self.open.lock().values().filter(|e| e.in_flight()).count()
    }

    /// Record every unfinished operation as interrupted and signal its
    /// worker. Returns how many there were.
    pub async fn shutdown(&self) -> usize {
        let interrupted: Vec<(FitName, Operation)> = {
            let mut open = self.open.lock();
            let ids: Vec<FitId> = open
                .iter()
                .filter(|(_, entry)| entry.in_flight())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| open.remove(id))
                .map(|mut entry| {
                    entry.cancel.cancel();
                    entry
                        .record
                        .finish(OperationResult::Status(Status::interrupted()));
                    (entry.fit, entry.record)
                })
                .collect()
        };

        for (fit, record) in &interrupted {
            warn!(operation = %record.name, "Operation still pending at shutdown");
            if let Err(e) = self.persist(fit, record).await {
                error!(operation = %record.name, error = %e, "Failed to persist operation");
            }
        }
        interrupted.len()
    }
}

fn object_or_empty(value: Option<Value>, field: &'static str) -> Result<Value, OperationError> {
    match value {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(OperationError::NotAnObject(field)),
    }
}
