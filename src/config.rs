use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, io, path::PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{DEFAULT_FETCH_TIMEOUT, DEFAULT_REFRESH_INTERVAL};
use crate::pipeline::DEFAULT_MAX_REDIRECT_DEPTH;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Key/value source for runtime settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync + Debug {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
}

#[derive(Debug)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

/// Process environment first, then the values of a `.env` file. The file is
/// read into memory; the process environment is never modified.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    file_values: Arc<DashMap<String, String>>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let file_values = Arc::new(DashMap::new());
        match dotenvy::from_path_iter(&env_file) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((key, value)) => {
                            file_values.insert(key, value);
                        }
                        Err(e) => warn!(path = %env_file.display(), error = %e, "skipping .env entry"),
                    }
                }
                info!(path = %env_file.display(), entries = file_values.len(), "loaded .env");
            }
            Err(_) => info!(path = %env_file.display(), "no .env, using the process environment"),
        }
        Box::new(Self {
            env_file,
            file_values,
        })
    }

    fn persist(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = content
            .lines()
            .map(|line| match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    format!("{key}={value}")
                }
                _ => line.to_string(),
            })
            .collect();
        if !found {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n") + "\n").map_err(|source| ConfigStoreError::Write {
            path: self.env_file.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    /// Only keys from the `.env` file and `STREAMROUTE_*` variables.
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.file_values.iter().map(|e| e.key().clone()).collect();
        keys.extend(env::vars().map(|(k, _)| k).filter(|k| k.starts_with(PREFIX)));
        keys.sort();
        keys.dedup();
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key)
            .ok()
            .or_else(|| self.file_values.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        self.persist(key, value)?;
        self.file_values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
}

const PREFIX: &str = "STREAMROUTE_";

pub const RULES_DIR: &str = "STREAMROUTE_RULES_DIR";
pub const REFRESH_SECS: &str = "STREAMROUTE_REFRESH_SECS";
pub const FETCH_TIMEOUT_SECS: &str = "STREAMROUTE_FETCH_TIMEOUT_SECS";
pub const FLUSH_SECS: &str = "STREAMROUTE_FLUSH_SECS";
pub const MAX_BUFFERED_SAMPLES: &str = "STREAMROUTE_MAX_BUFFERED_SAMPLES";
pub const MAX_REDIRECT_DEPTH: &str = "STREAMROUTE_MAX_REDIRECT_DEPTH";
pub const HTTP_TIMEOUT_MS: &str = "STREAMROUTE_HTTP_TIMEOUT_MS";

/// Runtime knobs of the pipeline, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub rules_dir: PathBuf,
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub flush_interval: Duration,
    pub max_buffered_samples: usize,
    pub max_redirect_depth: usize,
    pub http_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            flush_interval: Duration::from_secs(15),
            max_buffered_samples: 100_000,
            max_redirect_depth: DEFAULT_MAX_REDIRECT_DEPTH,
            http_timeout: Duration::from_millis(2000),
        }
    }
}

async fn number<T: FromStr + Copy + std::fmt::Display>(config: &ConfigManager, key: &str, default: T) -> T {
    match config.0.get(key).await {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, %default, "not a number, using default");
            default
        }),
    }
}

impl PipelineSettings {
    pub async fn from_config(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            rules_dir: config
                .0
                .get(RULES_DIR)
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_dir),
            refresh_interval: Duration::from_secs(
                number(config, REFRESH_SECS, defaults.refresh_interval.as_secs()).await,
            ),
            fetch_timeout: Duration::from_secs(
                number(config, FETCH_TIMEOUT_SECS, defaults.fetch_timeout.as_secs()).await,
            ),
            flush_interval: Duration::from_secs(
                number(config, FLUSH_SECS, defaults.flush_interval.as_secs()).await,
            ),
            max_buffered_samples: number(config, MAX_BUFFERED_SAMPLES, defaults.max_buffered_samples).await,
            max_redirect_depth: number(config, MAX_REDIRECT_DEPTH, defaults.max_redirect_depth).await,
            http_timeout: Duration::from_millis(
                number(config, HTTP_TIMEOUT_MS, defaults.http_timeout.as_millis() as u64).await,
            ),
        }
    }
}
