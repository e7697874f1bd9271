//! Compiling programs into cached models.
//!
//! Compilation is keyed by model id, so it naturally happens at most once
//! per program per toolchain. Concurrent requests for the same program
//! serialize on a per-id lock and the loser finds the artifact in the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::naming::{EnvFingerprint, ModelId, compute_model_id};
use crate::storage::{self, Cache, CacheError, ModelInfo};
use crate::toolchain::{CompileError, Compiler, ParamInfo, Toolchain};
use crate::worker::{WorkerError, WorkerPool};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// What clients see of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub compiler_output: String,
    pub warnings: String,
}

impl From<ModelInfo> for ModelSummary {
    fn from(info: ModelInfo) -> Self {
        Self {
            name: info.id.name(),
            compiler_output: info.compiler_output,
            warnings: info.warnings,
        }
    }
}

pub struct ModelRegistry {
    cache: Arc<Cache>,
    compiler: Arc<dyn Compiler>,
    toolchain: Arc<dyn Toolchain>,
    pool: WorkerPool,
    env: EnvFingerprint,
    compiling: Mutex<HashMap<ModelId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new(
        cache: Arc<Cache>,
        compiler: Arc<dyn Compiler>,
        toolchain: Arc<dyn Toolchain>,
        pool: WorkerPool,
        env: EnvFingerprint,
    ) -> Self {
        Self {
            cache,
            compiler,
            toolchain,
            pool,
            env,
            compiling: Mutex::new(HashMap::new()),
        }
    }

    fn compile_lock(&self, id: &ModelId) -> Arc<tokio::sync::Mutex<()>> {
        self.compiling.lock().entry(id.clone()).or_default().clone()
    }

    /// Compile `source_text`, or return the cached model compiled from it.
    pub async fn compile(&self, source_text: &str) -> Result<ModelSummary, ModelError> {
        let id = compute_model_id(source_text, &self.env);

        if let Some(summary) = self.cached(&id).await? {
            debug!(model = %id, "Model cache hit");
            return Ok(summary);
        }

        let lock = self.compile_lock(&id);
        let _guard = lock.lock().await;
        if let Some(summary) = self.cached(&id).await? {
            debug!(model = %id, "Model compiled by concurrent request");
            return Ok(summary);
        }

        info!(model = %id, "Compiling model");
        let started = Instant::now();
        let compiler = self.compiler.clone();
        let source = source_text.to_string();
        let artifact_name = format!("model_{id}");
        let artifact = tokio::task::spawn_blocking(move || compiler.compile(&source, &artifact_name))
            .await
            .map_err(|e| CompileError::Unavailable(e.to_string()))?;
        let artifact = match artifact {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(model = %id, error = %e, "Compilation failed");
                return Err(e.into());
            }
        };

        let cache = self.cache.clone();
        let model = id.clone();
        let source = source_text.to_string();
        let (compiler_output, warnings) = (artifact.compiler_output.clone(), artifact.warnings.clone());
        storage::blocking(move || {
            cache.put_model(
                &model,
                &source,
                &artifact.object_code,
                &artifact.compiler_output,
                &artifact.warnings,
            )
        })
        .await?;
        info!(
            model = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model compiled"
        );

        Ok(ModelSummary {
            name: id.name(),
            compiler_output,
            warnings,
        })
    }

    async fn cached(&self, id: &ModelId) -> Result<Option<ModelSummary>, CacheError> {
        let cache = self.cache.clone();
        let id = id.clone();
        match storage::blocking(move || cache.describe_model(&id)).await {
            Ok(info) => Ok(Some(info.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn describe(&self, id: &ModelId) -> Result<ModelSummary, ModelError> {
        let cache = self.cache.clone();
        let id = id.clone();
        Ok(storage::blocking(move || cache.describe_model(&id)).await?.into())
    }

    pub async fn list(&self) -> Result<Vec<ModelSummary>, ModelError> {
        let cache = self.cache.clone();
        let models = storage::blocking(move || {
            let mut out = Vec::new();
            for id in cache.list_model_ids()? {
                match cache.describe_model(&id) {
                    Ok(info) => out.push(ModelSummary::from(info)),
                    // Deleted between the scan and the lookup.
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
        .await?;
        Ok(models)
    }

    /// Delete a model and its fits. `NotFound` if it does not exist.
    pub async fn delete(&self, id: &ModelId) -> Result<(), ModelError> {
        let cache = self.cache.clone();
        let model = id.clone();
        storage::blocking(move || {
            cache.describe_model(&model)?;
            cache.delete_model(&model)
        })
        .await?;
        self.toolchain.evict(id);
        self.compiling.lock().remove(id);
        Ok(())
    }

    /// Parameter names and shapes of a model given `data`, computed on a
    /// worker.
    pub async fn params(&self, id: &ModelId, data: Value) -> Result<Vec<ParamInfo>, ModelError> {
        self.describe(id).await?;
        let cache = self.cache.clone();
        let toolchain = self.toolchain.clone();
        let model = id.clone();
        let params = self
            .pool
            .spawn(move || {
                let stored = cache
                    .get_model(&model)
                    .map_err(|e| WorkerError::ModuleLoad(e.to_string()))?;
                toolchain.import_module(&stored)?.params(&data)
            })
            .join()
            .await?;
        Ok(params)
    }
}
