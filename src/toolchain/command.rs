//! External-process implementations of the toolchain traits.
//!
//! The compiler is a command-line program:
//!
//! ```text
//! <compiler> --version
//! <compiler> build --name <artifact> --source <file> --output <file>
//! ```
//!
//! `build` prints diagnostics on stdout and warnings on stderr, and exits
//! non-zero when the program is rejected. The artifact it writes is a
//! standalone executable speaking the worker channel protocol:
//!
//! ```text
//! <artifact> run --function <name> --socket <path>   (stdin: {"data", "init", "arguments"})
//! <artifact> params                                  (stdin: {"data"}, stdout: JSON params)
//! ```
//!
//! A failing run exits non-zero with the reason as the last stderr line.

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{CompileError, CompiledArtifact, Compiler, ModelModule, ParamInfo, ServiceCall, Toolchain};
use crate::naming::ModelId;
use crate::storage::StoredModel;
use crate::worker::{CancelFlag, WorkerError};

/// Name looked up on `PATH` when no compiler is configured.
pub const DEFAULT_COMPILER: &str = "stanc-build";

const CHILD_POLL: Duration = Duration::from_millis(10);

const MODULE_FILE: &str = "model";
const DIGEST_FILE: &str = "model.sha256";

/// Stderr lines kept as failure context.
const STDERR_CONTEXT: usize = 8;

/// `ETXTBSY`: another thread forked while a freshly written executable was
/// still open for writing. Transient.
const TEXT_FILE_BUSY: i32 = 26;

fn spawn_retrying(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < 5 => {
                attempt += 1;
                std::thread::sleep(CHILD_POLL * attempt);
            }
            other => return other,
        }
    }
}

pub struct CommandCompiler {
    program: PathBuf,
    version: OnceCell<String>,
}

impl CommandCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            version: OnceCell::new(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Compiler for CommandCompiler {
    fn version(&self) -> String {
        self.version
            .get_or_init(|| match Command::new(&self.program).arg("--version").output() {
                Ok(out) if out.status.success() => {
                    String::from_utf8_lossy(&out.stdout).trim().to_string()
                }
                Ok(out) => {
                    warn!(program = %self.program.display(), status = %out.status, "Compiler --version failed");
                    "unknown".to_string()
                }
                Err(e) => {
                    warn!(program = %self.program.display(), error = %e, "Compiler not runnable");
                    "unknown".to_string()
                }
            })
            .clone()
    }

    fn compile(
        &self,
        source_text: &str,
        artifact_name: &str,
    ) -> Result<CompiledArtifact, CompileError> {
        let scratch = tempfile::Builder::new()
            .prefix("fitserve-build-")
            .tempdir()
            .map_err(|e| CompileError::Unavailable(e.to_string()))?;
        let source_path = scratch.path().join(format!("{artifact_name}.stan"));
        let output_path = scratch.path().join(artifact_name);
        std::fs::write(&source_path, source_text)
            .map_err(|e| CompileError::Unavailable(e.to_string()))?;

        let unavailable =
            |e: std::io::Error| CompileError::Unavailable(format!("{}: {e}", self.program.display()));
        let child = spawn_retrying(
            Command::new(&self.program)
                .arg("build")
                .arg("--name")
                .arg(artifact_name)
                .arg("--source")
                .arg(&source_path)
                .arg("--output")
                .arg(&output_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped()),
        )
        .map_err(unavailable)?;
        let out = child.wait_with_output().map_err(unavailable)?;

        let compiler_output = String::from_utf8_lossy(&out.stdout).into_owned();
        let warnings = String::from_utf8_lossy(&out.stderr).into_owned();
        if !out.status.success() {
            let diagnostic = if warnings.trim().is_empty() {
                compiler_output
            } else {
                warnings
            };
            return Err(CompileError::Rejected(diagnostic));
        }

        let object_code = std::fs::read(&output_path).map_err(|e| {
            CompileError::Unavailable(format!("compiler produced no artifact: {e}"))
        })?;
        Ok(CompiledArtifact {
            object_code,
            compiler_output,
            warnings,
        })
    }
}

/// Runs compiled artifacts as child processes.
pub struct ProcessToolchain {
    work_dir: PathBuf,
    loaded: Mutex<LruCache<ModelId, Arc<ProcessModule>>>,
}

impl ProcessToolchain {
    pub fn new(work_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            work_dir: work_dir.into(),
            loaded: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Write the module executable unless the installed copy already has
    /// the stored digest. The digest file is written after the module, so a
    /// crash in between means a reinstall.
    fn install(&self, model: &StoredModel) -> std::io::Result<PathBuf> {
        let dir = self.work_dir.join(model.id.as_str());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(MODULE_FILE);
        let digest_path = dir.join(DIGEST_FILE);
        let up_to_date = path.is_file()
            && std::fs::read_to_string(&digest_path)
                .is_ok_and(|installed| installed.trim() == model.sha256);
        if !up_to_date {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(&model.object_code)?;
            temp.as_file().sync_all()?;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o755))?;
            temp.persist(&path).map_err(|e| e.error)?;

            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(model.sha256.as_bytes())?;
            temp.persist(&digest_path).map_err(|e| e.error)?;
            info!(model = %model.id, path = %path.display(), "Installed model module");
        }
        Ok(path)
    }
}

impl Toolchain for ProcessToolchain {
    fn import_module(&self, model: &StoredModel) -> Result<Arc<dyn ModelModule>, WorkerError> {
        if let Some(module) = self.loaded.lock().get(&model.id) {
            return Ok(module.clone());
        }
        let path = self
            .install(model)
            .map_err(|e| WorkerError::ModuleLoad(format!("{}: {e}", model.id.name())))?;
        let module = Arc::new(ProcessModule { path });
        self.loaded.lock().put(model.id.clone(), module.clone());
        Ok(module)
    }

    fn evict(&self, id: &ModelId) {
        self.loaded.lock().pop(id);
        let dir = self.work_dir.join(id.as_str());
        if let Err(e) = std::fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(model = %id, error = %e, "Failed to remove installed module");
        }
    }
}

pub struct ProcessModule {
    path: PathBuf,
}

impl ProcessModule {
    /// Start the module with `input` on stdin. Stderr is drained and stdin
    /// fed on their own threads, so the caller may read stdout right away.
    fn spawn(
        &self,
        args: &[&OsStr],
        input: &Value,
        stdout: Stdio,
    ) -> Result<(Child, JoinHandle<String>), WorkerError> {
        let body = serde_json::to_vec(input).map_err(|e| WorkerError::Channel(e.to_string()))?;
        let mut child = spawn_retrying(
            Command::new(&self.path)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(stdout)
                .stderr(Stdio::piped()),
        )
        .map_err(|e| WorkerError::ModuleLoad(format!("{}: {e}", self.path.display())))?;
        let stderr = drain_stderr(&mut child);
        if let Some(stdin) = child.stdin.take() {
            feed_stdin(stdin, body);
        }
        Ok((child, stderr))
    }
}

impl ModelModule for ProcessModule {
    fn call(&self, call: &ServiceCall, socket: &Path, cancel: &CancelFlag) -> Result<(), WorkerError> {
        let input = json!({
            "data": call.data,
            "init": call.init,
            "arguments": call.arguments,
        });
        let (mut child, stderr) = self.spawn(
            &[
                OsStr::new("run"),
                OsStr::new("--function"),
                OsStr::new(call.function.full_name()),
                OsStr::new("--socket"),
                socket.as_os_str(),
            ],
            &input,
            Stdio::null(),
        )?;

        let status = loop {
            if cancel.is_cancelled() {
                // Grandchildren may keep stderr open; the reader thread is
                // left to finish on its own.
                let _ = child.kill();
                let _ = child.wait();
                debug!(model = %call.model, "Killed cancelled module process");
                return Err(WorkerError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(CHILD_POLL),
                Err(e) => return Err(WorkerError::Channel(e.to_string())),
            }
        };
        let stderr = stderr.join().unwrap_or_default();
        check_status(status, &stderr)
    }

    fn params(&self, data: &Value) -> Result<Vec<ParamInfo>, WorkerError> {
        let (mut child, stderr) =
            self.spawn(&[OsStr::new("params")], &json!({ "data": data }), Stdio::piped())?;
        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)
                .map_err(|e| WorkerError::Channel(e.to_string()))?;
        }
        let status = child.wait().map_err(|e| WorkerError::Channel(e.to_string()))?;
        let stderr = stderr.join().unwrap_or_default();
        check_status(status, &stderr)?;
        serde_json::from_str(&stdout).map_err(|e| WorkerError::Channel(format!("bad params output: {e}")))
    }
}

fn feed_stdin(mut stdin: ChildStdin, body: Vec<u8>) {
    std::thread::spawn(move || {
        // A child that exits before reading its input reports why on stderr.
        if let Err(e) = stdin.write_all(&body) {
            debug!(error = %e, "Module closed stdin early");
        }
    });
}

fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let pipe = child.stderr.take();
    std::thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

/// Last stderr line is the error; the lines before it are context.
fn check_status(status: ExitStatus, stderr: &str) -> Result<(), WorkerError> {
    if status.success() {
        return Ok(());
    }
    let mut lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let message = lines
        .pop()
        .map(str::to_string)
        .unwrap_or_else(|| format!("module exited with {status}"));
    let skip = lines.len().saturating_sub(STDERR_CONTEXT);
    let context = lines[skip..].iter().map(|l| (*l).to_string()).collect();
    Err(WorkerError::Failed { message, context })
}
