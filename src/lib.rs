pub mod config;
pub mod models;
pub mod naming;
pub mod operations;
pub mod protocol;
pub mod server;
pub mod services;
pub mod storage;
pub mod toolchain;
pub mod worker;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use tracing::{info, warn};

use config::ServiceConfig;
use naming::EnvFingerprint;
use server::AppState;
use storage::Cache;
use toolchain::{CommandCompiler, Compiler, ProcessToolchain};
use worker::WorkerPool;

/// Directory under the cache root where model executables are installed.
const INSTALL_DIR: &str = "installed";

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "fitserve",
    version,
    about = "HTTP service that compiles probabilistic programs and runs cached fits"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        /// Bind host (env: FITSERVE_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (env: FITSERVE_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Cache root (env: FITSERVE_CACHE_DIR)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Concurrent workers (env: FITSERVE_WORKERS)
        #[arg(long)]
        workers: Option<usize>,

        /// Compiler command (env: FITSERVE_COMPILER)
        #[arg(long)]
        compiler: Option<String>,
    },
    /// Print a stored fit stream as JSON Lines
    Decode {
        /// Fit file, gzip-compressed or raw
        file: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            cache_dir,
            workers,
            compiler,
        } => {
            let mut config = ServiceConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(compiler) = compiler {
                config.compiler = compiler;
            }
            config.validate()?;
            run_serve(config).await
        }
        Commands::Decode { file } => run_decode(file),
    }
}

async fn run_serve(config: ServiceConfig) -> Result<()> {
    let cache = Arc::new(
        Cache::open(&config.cache_dir)
            .with_context(|| format!("opening cache at {}", config.cache_dir.display()))?,
    );
    let compiler: Arc<dyn Compiler> = Arc::new(CommandCompiler::new(&config.compiler));
    let toolchain = Arc::new(ProcessToolchain::new(
        config.cache_dir.join(INSTALL_DIR),
        config.workers * 2,
    ));

    let version_probe = compiler.clone();
    let compiler_version = tokio::task::spawn_blocking(move || version_probe.version())
        .await
        .context("probing compiler version")?;
    let env = EnvFingerprint::detect(&compiler_version);
    info!(
        compiler = %config.compiler,
        version = %compiler_version,
        workers = config.workers,
        "Toolchain ready"
    );

    let state = Arc::new(AppState::new(
        cache,
        compiler,
        toolchain,
        WorkerPool::new(config.workers),
        config.bridge(),
        env,
    ));
    let recovered = state
        .operations
        .recover_interrupted()
        .await
        .context("checking for interrupted operations")?;
    if recovered > 0 {
        warn!(recovered, "Marked operations from a previous run as interrupted");
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    server::serve(listener, state, shutdown_signal())
        .await
        .context("serving HTTP")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

fn run_decode(file: PathBuf) -> Result<()> {
    let raw = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let stream = maybe_gunzip(raw).with_context(|| format!("decompressing {}", file.display()))?;
    let messages = protocol::decode_messages(&stream)
        .with_context(|| format!("decoding {}", file.display()))?;
    print!("{}", protocol::framing::to_json_lines(&messages)?);
    Ok(())
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Fit files are stored gzip-compressed; accept both forms.
fn maybe_gunzip(bytes: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(bytes);
    }
    let mut out = Vec::new();
    GzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}
