mod util;

use std::sync::Arc;
use std::time::Duration;

use fitserve::naming::{FitId, FitName, compute_model_id, operation_id};
use fitserve::operations::{FitRequest, Operation, OperationError, OperationManager, OperationResult};
use fitserve::storage::Cache;
use fitserve::storage::cache::DB_FILE;
use fitserve::storage::sqlite::SqliteStorage;
use fitserve::worker::{BridgeConfig, WorkerPool};
use serde_json::json;
use tempfile::TempDir;
use util::{FakeToolchain, NORMAL_PROGRAM, TestTracing, test_env};

fn manager(cache: Arc<Cache>, toolchain: Arc<FakeToolchain>) -> Arc<OperationManager> {
    Arc::new(OperationManager::new(
        cache,
        toolchain,
        WorkerPool::new(2),
        BridgeConfig::default(),
        test_env(),
    ))
}

fn stored_model(cache: &Cache) -> fitserve::naming::ModelId {
    let id = compute_model_id(NORMAL_PROGRAM, &test_env());
    cache
        .put_model(&id, NORMAL_PROGRAM, NORMAL_PROGRAM.as_bytes(), "", "")
        .unwrap();
    id
}

fn request(seed: Option<u64>) -> FitRequest {
    let mut value = json!({"function": "hmc_nuts_diag_e_adapt", "num_samples": 10, "num_warmup": 10});
    if let Some(seed) = seed {
        value["random_seed"] = json!(seed);
    }
    serde_json::from_value(value).unwrap()
}

async fn wait(manager: &OperationManager, op: &Operation) -> Operation {
    let id = operation_id(&op.name).unwrap();
    for _ in 0..1000 {
        let current = manager.get_operation(&id).await.unwrap();
        assert_eq!(current.done, current.result.is_some());
        if current.done {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never finished", op.name);
}

/// Wait until lookups of `id` report the operation as gone.
async fn wait_forgotten(manager: &OperationManager, id: &FitId) {
    for _ in 0..200 {
        match manager.get_operation(id).await {
            Err(OperationError::Cache(e)) if e.is_not_found() => return,
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    panic!("operations/{id} is still visible");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_operations_outlive_the_process() {
    let dir = TempDir::new().unwrap();
    let name = {
        let cache = Arc::new(Cache::open(dir.path()).unwrap());
        let model = stored_model(&cache);
        let ops = manager(cache, Arc::new(FakeToolchain::new()));
        let op = ops.start_fit(&model, request(Some(10))).await.unwrap();
        let done = wait(&ops, &op).await;
        assert!(matches!(done.result, Some(OperationResult::Fit(_))));
        done.name
    };

    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let ops = manager(cache.clone(), Arc::new(FakeToolchain::new()));
    let record = ops.get_operation(&operation_id(&name).unwrap()).await.unwrap();
    assert!(record.done);
    let fit = FitName::parse(record.fit_name()).unwrap();
    assert!(!cache.get_fit(&fit).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operations_left_pending_are_reported_on_restart() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let fit = FitName::new(model, FitId::parse("abcdefgh").unwrap());
    let stale = json!({
        "name": fit.operation_name(),
        "metadata": {"fit": {"name": fit.to_string()}, "progress": "Iteration: 10 / 2000 [  0%]  (Warmup)"},
        "done": false
    });
    cache.put_operation(&fit, &stale, false).unwrap();
    drop(cache);

    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let ops = manager(cache.clone(), Arc::new(FakeToolchain::new()));
    assert_eq!(ops.recover_interrupted().await.unwrap(), 1);
    assert_eq!(ops.recover_interrupted().await.unwrap(), 0);

    let record = ops.get_operation(&fit.fit).await.unwrap();
    assert!(record.done);
    assert_eq!(record.status().map(|s| s.code), Some(500));
    assert!(record.status().unwrap().message.contains("interrupted"));
}

#[tokio::test]
async fn lifecycle_is_logged() {
    let tracing = TestTracing::new();
    let _guard = tracing.install();

    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache, Arc::new(FakeToolchain::with_draw_delay(Duration::from_millis(1))));

    let op = ops.start_fit(&model, request(Some(8))).await.unwrap();
    let joined = ops.start_fit(&model, request(Some(8))).await.unwrap();
    assert_eq!(op.name, joined.name);
    wait(&ops, &op).await;

    tracing.assert_contains("Operation created");
    tracing.assert_contains("Joining in-flight operation");
    tracing.assert_contains("Operation finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fit_ids_depend_on_data_and_seed() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache, Arc::new(FakeToolchain::new()));

    let a = ops.start_fit(&model, request(Some(1))).await.unwrap();
    let mut with_data = request(Some(1));
    with_data.data = Some(json!({"unused": 1}));
    let b = ops.start_fit(&model, with_data).await.unwrap();
    let c = ops.start_fit(&model, request(Some(2))).await.unwrap();
    assert_ne!(a.name, b.name);
    assert_ne!(a.name, c.name);

    // Aliases of one function are the same request.
    let mut aliased = request(Some(1));
    aliased.function = "stan::services::sample::hmc_nuts_diag_e_adapt".into();
    let d = ops.start_fit(&model, aliased).await.unwrap();
    assert_eq!(a.name, d.name);

    for op in [&a, &b, &c] {
        wait(&ops, op).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_done_operation_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache, Arc::new(FakeToolchain::new()));

    let op = ops.start_fit(&model, request(Some(3))).await.unwrap();
    let done = wait(&ops, &op).await;
    let id = operation_id(&op.name).unwrap();
    assert_eq!(ops.cancel(&id).await.unwrap(), done);
    assert_eq!(ops.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_record_write_leaves_nothing_to_join() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache, Arc::new(FakeToolchain::new()));
    let side = SqliteStorage::open(&dir.path().join(DB_FILE)).unwrap();

    side.raw()
        .execute_batch("ALTER TABLE operations RENAME TO operations_offline")
        .unwrap();
    let err = ops.start_fit(&model, request(Some(5))).await.unwrap_err();
    assert!(matches!(err, OperationError::Cache(_)), "{err}");
    assert_eq!(ops.pending_count(), 0);

    side.raw()
        .execute_batch("ALTER TABLE operations_offline RENAME TO operations")
        .unwrap();
    let op = ops.start_fit(&model, request(Some(5))).await.unwrap();
    let done = wait(&ops, &op).await;
    assert!(matches!(done.result, Some(OperationResult::Fit(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_operations_are_not_kept_in_memory() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache.clone(), Arc::new(FakeToolchain::new()));

    let op = ops.start_fit(&model, request(Some(11))).await.unwrap();
    let done = wait(&ops, &op).await;
    let hit = ops.start_fit(&model, request(Some(11))).await.unwrap();
    assert!(hit.done);
    assert_eq!(hit.name, op.name);

    // Removing the fit removes its operation record; nothing in memory
    // keeps answering for it.
    let fit = FitName::parse(done.fit_name()).unwrap();
    cache.delete_fit(&fit).unwrap();
    wait_forgotten(&ops, &fit.fit).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_model_forgets_its_operations() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::open(dir.path()).unwrap());
    let model = stored_model(&cache);
    let ops = manager(cache.clone(), Arc::new(FakeToolchain::new()));

    let mut ids = Vec::new();
    for seed in [21, 22] {
        let op = ops.start_fit(&model, request(Some(seed))).await.unwrap();
        wait(&ops, &op).await;
        ids.push(operation_id(&op.name).unwrap());
    }

    cache.delete_model(&model).unwrap();
    for id in &ids {
        wait_forgotten(&ops, id).await;
    }
    assert_eq!(ops.recover_interrupted().await.unwrap(), 0);
}
