//! Environment-driven service configuration.
//!
//! Every value has a default and can be overridden by a `FITSERVE_*`
//! variable (a `.env` file is honoured) and then by CLI flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::toolchain::command::DEFAULT_COMPILER;
use crate::worker::{BridgeConfig, DEFAULT_DRAIN_GRACE, DEFAULT_POLL_INTERVAL};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Poll intervals at or above this would make the drain loop sluggish.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub cache_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub compiler: String,
    pub poll_interval: Duration,
    pub drain_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: available_workers(),
            compiler: DEFAULT_COMPILER.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = dotenvy::var("FITSERVE_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(host) = dotenvy::var("FITSERVE_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var("FITSERVE_PORT")? {
            config.port = port;
        }
        if let Some(workers) = parse_var::<usize>("FITSERVE_WORKERS")? {
            config.workers = workers.max(1);
        }
        if let Ok(compiler) = dotenvy::var("FITSERVE_COMPILER") {
            config.compiler = compiler;
        }
        if let Some(ms) = parse_var::<u64>("FITSERVE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("FITSERVE_DRAIN_GRACE_MS")? {
            config.drain_grace = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.poll_interval.is_zero() && self.poll_interval < MAX_POLL_INTERVAL,
            "poll interval must be between 1 and {} ms",
            MAX_POLL_INTERVAL.as_millis() - 1
        );
        anyhow::ensure!(self.workers > 0, "at least one worker is required");
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            poll_interval: self.poll_interval,
            drain_grace: self.drain_grace,
        }
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenvy::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}

pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "fitserve", "fitserve").map_or_else(
        || PathBuf::from(".fitserve-cache"),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

fn available_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
