//! Where rules and write configs come from.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pattern::pattern_hash;
use crate::rule::{ChannelRule, ConfigError, RuleFile, WriteConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
}

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    async fn list_channel_rules(&self, org_id: i64) -> Result<Vec<ChannelRule>, StorageError>;
    async fn list_write_configs(&self, org_id: i64) -> Result<Vec<WriteConfig>, StorageError>;
}

/// Org 0 entries are defaults for org 1 only.
pub fn applies_to(entry_org: i64, org_id: i64) -> bool {
    entry_org == org_id || (entry_org == 0 && org_id == 1)
}

fn effective_org(org_id: i64) -> i64 {
    if org_id == 0 { 1 } else { org_id }
}

/// Rejects rule sets that could never be installed: bad pattern syntax or
/// two patterns in one org that normalize to the same shape.
pub fn validate_rule_set(rules: &[ChannelRule]) -> Result<(), ConfigError> {
    let mut seen: HashMap<(i64, String), &str> = HashMap::new();
    for rule in rules {
        let hash = pattern_hash(&rule.pattern)?;
        let org_id = effective_org(rule.org_id);
        if let Some(existing) = seen.insert((org_id, hash), &rule.pattern) {
            return Err(ConfigError::Conflict {
                org_id,
                pattern: rule.pattern.clone(),
                existing: existing.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    file: RuleFile,
}

impl InMemoryStorage {
    pub fn new(rules: Vec<ChannelRule>, write_configs: Vec<WriteConfig>) -> Self {
        Self {
            file: RuleFile {
                rules,
                write_configs,
            },
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list_channel_rules(&self, org_id: i64) -> Result<Vec<ChannelRule>, StorageError> {
        Ok(self
            .file
            .rules
            .iter()
            .filter(|r| applies_to(r.org_id, org_id))
            .cloned()
            .collect())
    }

    async fn list_write_configs(&self, org_id: i64) -> Result<Vec<WriteConfig>, StorageError> {
        Ok(self
            .file
            .write_configs
            .iter()
            .filter(|w| applies_to(w.org_id, org_id))
            .cloned()
            .collect())
    }
}

/// Reads one rule file, YAML or JSON by extension.
pub fn load_rule_file(path: &Path) -> Result<RuleFile, StorageError> {
    let text = std::fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_rule_file(path, &text)
}

fn parse_rule_file(path: &Path, text: &str) -> Result<RuleFile, StorageError> {
    let parse_err = |reason: String| StorageError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    let doc: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(text).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_yaml_bw::from_str(text).map_err(|e| parse_err(e.to_string()))?,
    };
    if doc.is_null() {
        return Ok(RuleFile::default());
    }

    let invalid = |source: ConfigError| StorageError::Invalid {
        path: path.to_path_buf(),
        source,
    };
    let rules = match doc.get("rules") {
        Some(Value::Array(items)) => items
            .iter()
            .cloned()
            .map(ChannelRule::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(parse_err("`rules` must be a list".to_string())),
    };
    let write_configs = match doc.get("writeConfigs") {
        Some(v) if !v.is_null() => {
            serde_json::from_value(v.clone()).map_err(|e| parse_err(e.to_string()))?
        }
        _ => Vec::new(),
    };
    Ok(RuleFile {
        rules,
        write_configs,
    })
}

/// Every `*.yaml`, `*.yml` and `*.json` file under `dir`, re-read on each
/// call so edits are picked up by the next cache refresh.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load(&self) -> Result<RuleFile, StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_rule_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml" | "json")
            );
            if is_rule_file && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = RuleFile::default();
        for path in paths {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?;
            let file = parse_rule_file(&path, &text)?;
            debug!(path = %path.display(), rules = file.rules.len(), "loaded rule file");
            merged.rules.extend(file.rules);
            merged.write_configs.extend(file.write_configs);
        }
        if merged.rules.is_empty() {
            warn!(dir = %self.dir.display(), "no channel rules found");
        }
        Ok(merged)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn list_channel_rules(&self, org_id: i64) -> Result<Vec<ChannelRule>, StorageError> {
        let file = self.load().await?;
        Ok(file
            .rules
            .into_iter()
            .filter(|r| applies_to(r.org_id, org_id))
            .collect())
    }

    async fn list_write_configs(&self, org_id: i64) -> Result<Vec<WriteConfig>, StorageError> {
        let file = self.load().await?;
        Ok(file
            .write_configs
            .into_iter()
            .filter(|w| applies_to(w.org_id, org_id))
            .collect())
    }
}
