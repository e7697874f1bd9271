use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fitserve::naming::{EnvFingerprint, ModelId};
use fitserve::operations::Operation;
use fitserve::protocol::Topic;
use fitserve::server::{self, AppState};
use fitserve::storage::{Cache, StoredModel};
use fitserve::toolchain::{
    CompileError, CompiledArtifact, Compiler, ModelModule, ParamInfo, ServiceCall, Toolchain,
};
use fitserve::worker::{BridgeConfig, CancelFlag, SocketWriter, WorkerError, WorkerPool};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use serde_json::Value;
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub const NORMAL_PROGRAM: &str = "parameters {real y;} model {y ~ normal(0,1);}";

#[allow(dead_code)]
pub const DATA_PROGRAM: &str =
    "data {int N;} parameters {real y;} model {y ~ normal(0,1);}";

#[allow(dead_code)]
pub fn test_env() -> EnvFingerprint {
    EnvFingerprint::new("test-toolchain 1.0", "test-platform", "fitserve-tests")
}

// -----------------------------------------------------------------------------
// Fake compiler
// -----------------------------------------------------------------------------

/// Accepts any program with balanced braces. The "object code" is the
/// source itself.
#[derive(Default)]
pub struct FakeCompiler {
    calls: AtomicUsize,
    delay: Duration,
}

#[allow(dead_code)]
impl FakeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for FakeCompiler {
    fn version(&self) -> String {
        "fake-compiler 1.0".to_string()
    }

    fn compile(
        &self,
        source_text: &str,
        artifact_name: &str,
    ) -> Result<CompiledArtifact, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if source_text.matches('{').count() != source_text.matches('}').count() {
            return Err(CompileError::Rejected(
                "Syntax error in 'string', line 1: unbalanced braces".to_string(),
            ));
        }
        let warnings = if source_text.contains("increment_log_prob") {
            "Warning: increment_log_prob is deprecated".to_string()
        } else {
            String::new()
        };
        Ok(CompiledArtifact {
            object_code: source_text.as_bytes().to_vec(),
            compiler_output: format!("Model {artifact_name} translated"),
            warnings,
        })
    }
}

// -----------------------------------------------------------------------------
// Fake toolchain
// -----------------------------------------------------------------------------

static DATA_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"data\s*\{([^}]*)\}").unwrap());
static PARAMETERS_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"parameters\s*\{([^}]*)\}").unwrap());
static DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(int|real)\s+(\w+)\s*;").unwrap());

fn declarations(re: &Regex, source: &str) -> Vec<(String, String)> {
    re.captures(source)
        .map(|block| {
            DECLARATION
                .captures_iter(&block[1])
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Loads fake modules straight from the stored source text.
#[derive(Default)]
pub struct FakeToolchain {
    imports: AtomicUsize,
    evictions: AtomicUsize,
    draw_delay: Duration,
}

#[allow(dead_code)]
impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between draws, for tests that need a run to still be going.
    pub fn with_draw_delay(delay: Duration) -> Self {
        Self {
            draw_delay: delay,
            ..Self::default()
        }
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }
}

impl Toolchain for FakeToolchain {
    fn import_module(&self, model: &StoredModel) -> Result<Arc<dyn ModelModule>, WorkerError> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        let source = String::from_utf8(model.object_code.clone())
            .map_err(|e| WorkerError::ModuleLoad(e.to_string()))?;
        let data = declarations(&DATA_BLOCK, &source);
        let parameters = declarations(&PARAMETERS_BLOCK, &source)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        Ok(Arc::new(FakeModule {
            data,
            parameters,
            draw_delay: self.draw_delay,
        }))
    }

    fn evict(&self, _id: &ModelId) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeModule {
    data: Vec<(String, String)>,
    parameters: Vec<String>,
    draw_delay: Duration,
}

const SAMPLER_COLUMNS: [&str; 7] = [
    "lp__",
    "accept_stat__",
    "stepsize__",
    "treedepth__",
    "n_leapfrog__",
    "divergent__",
    "energy__",
];

impl FakeModule {
    fn check_data(&self, data: &Value) -> Result<(), WorkerError> {
        for (base_type, name) in &self.data {
            if data.get(name).is_none() {
                return Err(WorkerError::failed(format!(
                    "variable does not exist; processing stage=data initialization; variable name={name}; base type={base_type}"
                )));
            }
        }
        Ok(())
    }
}

fn channel(e: std::io::Error) -> WorkerError {
    WorkerError::Channel(e.to_string())
}

/// Standard normal draw via Box-Muller.
fn standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl ModelModule for FakeModule {
    fn call(&self, call: &ServiceCall, socket: &Path, cancel: &CancelFlag) -> Result<(), WorkerError> {
        let mut writer = SocketWriter::connect(socket).map_err(channel)?;
        if let Err(e) = self.check_data(&call.data) {
            writer.log("Rejecting initial value:").map_err(channel)?;
            writer
                .log("  Error evaluating the log probability at the initial value.")
                .map_err(channel)?;
            writer.log("Initialization failed.").map_err(channel)?;
            return Err(e);
        }

        let seed = call.argument_u64("random_seed").unwrap_or(0);
        let num_samples = call.argument_u64("num_samples").unwrap_or(1000);
        let num_warmup = if call.function.adapts() {
            call.argument_u64("num_warmup").unwrap_or(1000)
        } else {
            0
        };
        let refresh = call.argument_u64("refresh").unwrap_or(100).max(1);
        let stepsize = call.argument_f64("stepsize").unwrap_or(1.0);
        let total = num_warmup + num_samples;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        writer
            .header(
                Topic::Sample,
                SAMPLER_COLUMNS
                    .iter()
                    .map(|s| s.to_string())
                    .chain(self.parameters.iter().cloned()),
            )
            .map_err(channel)?;

        for iteration in 1..=total {
            if cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            if iteration == 1 || iteration % refresh == 0 || iteration == total {
                let phase = if iteration <= num_warmup { "Warmup" } else { "Sampling" };
                let percent = iteration * 100 / total;
                writer
                    .log(format!("Iteration: {iteration:>4} / {total} [{percent:>3}%]  ({phase})"))
                    .map_err(channel)?;
            }
            if iteration == num_warmup + 1 && num_warmup > 0 {
                writer.text(Topic::Sample, "Adaptation terminated").map_err(channel)?;
                writer
                    .text(Topic::Sample, format!("Step size = {:.6}", stepsize * 0.81))
                    .map_err(channel)?;
                writer
                    .text(Topic::Sample, "Diagonal elements of inverse mass matrix:")
                    .map_err(channel)?;
                writer
                    .values(Topic::Sample, self.parameters.iter().map(|_| 0.96))
                    .map_err(channel)?;
            }
            if iteration > num_warmup {
                let draws: Vec<f64> = self.parameters.iter().map(|_| standard_normal(&mut rng)).collect();
                let lp = -0.5 * draws.iter().map(|d| d * d).sum::<f64>();
                let sampler = [lp, rng.gen_range(0.5..1.0), stepsize, 2.0, 3.0, 0.0, -lp + 0.5];
                writer
                    .values(Topic::Sample, sampler.into_iter().chain(draws))
                    .map_err(channel)?;
            }
            if !self.draw_delay.is_zero() {
                std::thread::sleep(self.draw_delay);
            }
        }
        writer.finish().map_err(channel)
    }

    fn params(&self, data: &Value) -> Result<Vec<ParamInfo>, WorkerError> {
        self.check_data(data)?;
        Ok(self
            .parameters
            .iter()
            .map(|name| ParamInfo {
                name: name.clone(),
                dims: Vec::new(),
                constrained_names: vec![name.clone()],
            })
            .collect())
    }
}

// -----------------------------------------------------------------------------
// HTTP harness
// -----------------------------------------------------------------------------

/// A service on an ephemeral port backed by a temporary cache.
#[allow(dead_code)]
pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: Arc<AppState>,
    pub compiler: Arc<FakeCompiler>,
    pub toolchain: Arc<FakeToolchain>,
    pub cache_dir: TempDir,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(FakeCompiler::new(), FakeToolchain::new()).await
    }

    pub async fn start_with(compiler: FakeCompiler, toolchain: FakeToolchain) -> Self {
        let cache_dir = TempDir::new().unwrap();
        let cache = Arc::new(Cache::open(cache_dir.path()).unwrap());
        let compiler = Arc::new(compiler);
        let toolchain = Arc::new(toolchain);
        let state = Arc::new(AppState::new(
            cache,
            compiler.clone(),
            toolchain.clone(),
            WorkerPool::new(4),
            BridgeConfig::default(),
            test_env(),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(listener, state.clone(), async move {
            let _ = rx.await;
        }));

        Self {
            base_url,
            client: reqwest::Client::new(),
            state,
            compiler,
            toolchain,
            cache_dir,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    pub async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    pub async fn get_bytes(&self, path: &str) -> (u16, Vec<u8>) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.bytes().await.unwrap().to_vec())
    }

    pub async fn delete(&self, path: &str) -> u16 {
        let resp = self.client.delete(self.url(path)).send().await.unwrap();
        resp.status().as_u16()
    }

    /// Compile `program` and return the model name (`models/{id}`).
    pub async fn compile(&self, program: &str) -> String {
        let (status, body) = self
            .post("models", serde_json::json!({ "program_code": program }))
            .await;
        assert_eq!(status, 201, "compile failed: {body}");
        body["name"].as_str().unwrap().to_string()
    }

    pub async fn start_fit(&self, model_name: &str, request: Value) -> Operation {
        let (status, body) = self.post(&format!("{model_name}/fits"), request).await;
        assert_eq!(status, 201, "fit request failed: {body}");
        serde_json::from_value(body).unwrap()
    }

    /// Poll `operation_name` until it is done.
    pub async fn wait_done(&self, operation_name: &str) -> Operation {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let (status, body) = self.get_json(operation_name).await;
            assert_eq!(status, 200, "operation lookup failed: {body}");
            let op: Operation = serde_json::from_value(body).unwrap();
            assert_eq!(op.done, op.result.is_some(), "result must be set iff done");
            if op.done {
                return op;
            }
            assert!(Instant::now() < deadline, "operation {operation_name} never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

#[allow(dead_code)]
pub fn fit_request(function: &str, arguments: &[(&str, Value)]) -> Value {
    let mut body: BTreeMap<String, Value> = arguments
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    body.insert("function".to_string(), Value::from(function));
    serde_json::to_value(body).unwrap()
}
