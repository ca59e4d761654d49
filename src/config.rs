//! Service configuration sourced from environment variables, optionally
//! overridden by a YAML file named in `STREAMPOLL_CONFIG`.

use crate::http::DEFAULT_POLL_TIMEOUT;
use crate::mux::DEFAULT_READ_TIMEOUT;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where entries are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    /// Journaled to `data_dir`.
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    /// Deadline of one long-poll request.
    pub poll_timeout: Duration,
    /// Bound on one blocking read of the multiplexer.
    pub read_timeout: Duration,
    pub storage: StorageBackend,
    pub data_dir: PathBuf,
    /// Appends between journal fsyncs.
    pub sync_interval: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            storage: StorageBackend::Memory,
            data_dir: PathBuf::from("./streampoll-data"),
            sync_interval: 100,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceConfigOverride {
    bind_addr: Option<String>,
    poll_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    storage: Option<String>,
    data_dir: Option<PathBuf>,
    sync_interval: Option<u64>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("STREAMPOLL_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read STREAMPOLL_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Build from an arbitrary variable source, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("STREAMPOLL_BIND") {
            config.bind_addr = value.parse().with_context(|| "parse STREAMPOLL_BIND")?;
        }
        if let Some(value) = lookup("STREAMPOLL_POLL_TIMEOUT_MS") {
            let ms = value
                .parse()
                .with_context(|| "parse STREAMPOLL_POLL_TIMEOUT_MS")?;
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = lookup("STREAMPOLL_READ_TIMEOUT_MS") {
            let ms = value
                .parse()
                .with_context(|| "parse STREAMPOLL_READ_TIMEOUT_MS")?;
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = lookup("STREAMPOLL_STORAGE") {
            config.storage = value.parse().with_context(|| "parse STREAMPOLL_STORAGE")?;
        }
        if let Some(value) = lookup("STREAMPOLL_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("STREAMPOLL_SYNC_INTERVAL") {
            config.sync_interval = value
                .parse()
                .with_context(|| "parse STREAMPOLL_SYNC_INTERVAL")?;
        }
        Ok(config)
    }

    /// Override fields present in a YAML document.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ServiceConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse service config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(ms) = override_cfg.poll_timeout_ms {
            self.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = override_cfg.read_timeout_ms {
            self.read_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value.parse().with_context(|| "parse storage")?;
        }
        if let Some(value) = override_cfg.data_dir {
            self.data_dir = value;
        }
        if let Some(value) = override_cfg.sync_interval {
            self.sync_interval = value;
        }
        Ok(())
    }
}
