//! Seams to the external compiler and to compiled model modules.
//!
//! The service never interprets program source or object code itself. A
//! [`Compiler`] turns source into an opaque artifact; a [`Toolchain`] turns
//! a cached artifact back into something callable. Both are traits so the
//! HTTP layer and the operation machinery can be exercised with in-process
//! fakes.

pub mod command;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::naming::ModelId;
use crate::services::ServiceFunction;
use crate::storage::StoredModel;
use crate::worker::{CancelFlag, WorkerError};

pub use command::{CommandCompiler, ProcessToolchain};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The program was rejected; carries the compiler's diagnostic verbatim.
    #[error("{0}")]
    Rejected(String),
    /// The compiler could not be run at all.
    #[error("compiler unavailable: {0}")]
    Unavailable(String),
}

/// Output of a successful compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub object_code: Vec<u8>,
    pub compiler_output: String,
    pub warnings: String,
}

pub trait Compiler: Send + Sync {
    /// Identifies the compiler build; part of every model id.
    fn version(&self) -> String;

    /// Blocking.
    fn compile(&self, source_text: &str, artifact_name: &str)
    -> Result<CompiledArtifact, CompileError>;
}

/// Plain-data description of one service call.
///
/// Crosses the worker boundary by value; the module handle is resolved on
/// the worker side from `model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub function: ServiceFunction,
    pub model: ModelId,
    /// Data block values keyed by variable name.
    pub data: Value,
    /// Initial values keyed by parameter name.
    pub init: Value,
    /// Complete argument set, defaults already merged.
    pub arguments: BTreeMap<String, Value>,
}

impl ServiceCall {
    pub fn argument_u64(&self, name: &str) -> Option<u64> {
        self.arguments.get(name).and_then(Value::as_u64)
    }

    pub fn argument_f64(&self, name: &str) -> Option<f64> {
        self.arguments.get(name).and_then(Value::as_f64)
    }
}

/// One model parameter as reported by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub constrained_names: Vec<String>,
}

/// A loaded model. Every method blocks and must only run on a worker.
pub trait ModelModule: Send + Sync {
    /// Run `call`, writing output to the channel at `socket`.
    fn call(&self, call: &ServiceCall, socket: &Path, cancel: &CancelFlag) -> Result<(), WorkerError>;

    /// Parameter names and shapes given `data`.
    fn params(&self, data: &Value) -> Result<Vec<ParamInfo>, WorkerError>;
}

pub trait Toolchain: Send + Sync {
    /// Make a cached artifact callable. Blocking.
    fn import_module(&self, model: &StoredModel) -> Result<Arc<dyn ModelModule>, WorkerError>;

    /// Forget anything loaded for `id`.
    fn evict(&self, id: &ModelId);
}
