//! HTTP façade.
//!
//! Handlers are thin: they parse names out of the path, call into
//! [`ModelRegistry`] / [`OperationManager`] and map errors through
//! [`ApiError`]. All process state lives in one [`AppState`] built at
//! startup.

mod error;
pub mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use error::ApiError;

use crate::models::ModelRegistry;
use crate::naming::EnvFingerprint;
use crate::operations::OperationManager;
use crate::storage::Cache;
use crate::toolchain::{Compiler, Toolchain};
use crate::worker::{BridgeConfig, WorkerPool};

pub struct AppState {
    pub cache: Arc<Cache>,
    pub models: ModelRegistry,
    pub operations: Arc<OperationManager>,
}

impl AppState {
    pub fn new(
        cache: Arc<Cache>,
        compiler: Arc<dyn Compiler>,
        toolchain: Arc<dyn Toolchain>,
        pool: WorkerPool,
        bridge: BridgeConfig,
        env: EnvFingerprint,
    ) -> Self {
        let models = ModelRegistry::new(
            cache.clone(),
            compiler,
            toolchain.clone(),
            pool.clone(),
            env.clone(),
        );
        let operations = Arc::new(OperationManager::new(
            cache.clone(),
            toolchain,
            pool,
            bridge,
            env,
        ));
        Self {
            cache,
            models,
            operations,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(handlers::health))
        .route(
            "/v1/models",
            post(handlers::create_model).get(handlers::list_models),
        )
        .route("/v1/models/:model_id", axum::routing::delete(handlers::delete_model))
        .route("/v1/models/:model_id/params", post(handlers::model_params))
        .route("/v1/models/:model_id/fits", post(handlers::create_fit))
        .route(
            "/v1/models/:model_id/fits/:fit_id",
            get(handlers::get_fit).delete(handlers::delete_fit),
        )
        .route("/v1/operations/:operation_id", get(handlers::get_operation))
        .route(
            "/v1/operations/:operation_id/cancel",
            post(handlers::cancel_operation),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves, then record unfinished operations.
pub async fn serve<S>(listener: TcpListener, state: Arc<AppState>, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    let operations = state.operations.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    let interrupted = operations.shutdown().await;
    if interrupted > 0 {
        warn!(interrupted, "Stopped with operations still pending");
    } else {
        info!("Stopped");
    }
    Ok(())
}
