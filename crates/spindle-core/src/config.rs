//! Scheduler configuration, loaded from TOML and validated before anything
//! is built.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FeatureError, FeatureSet, QueueKind, QueueName};
use crate::restore::DEFAULT_BATCH_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no [[division]] configured")]
    NoDivisions,

    #[error("division name must not be empty")]
    EmptyDivisionName,

    #[error("division {0} is configured twice")]
    DuplicateDivision(String),

    #[error("division {division}: unknown queue {queue} in default_queue_features")]
    UnknownQueue { division: String, queue: String },

    #[error("{context}: {source}")]
    Feature {
        context: String,
        source: FeatureError,
    },

    #[error("scheduler.prep_batch_size must be positive")]
    ZeroBatchSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub heartbeat_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub prep_batch_size: usize,
    pub prep_stale_secs: u64,
    pub pull_stale_secs: u64,
    pub band_schedule: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 600,
            reaper_interval_secs: 300,
            prep_batch_size: DEFAULT_BATCH_SIZE,
            prep_stale_secs: 600,
            pull_stale_secs: 3 * 60 * 60,
            band_schedule: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSource {
    pub path_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionConfig {
    pub name: String,
    pub default_backup_service: i64,
    #[serde(default)]
    pub default_queue_features: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub max_resources: BTreeMap<String, u64>,
}

impl DivisionConfig {
    /// Default features of queue `queue`; empty when unset.
    pub fn features_for(&self, queue: &str) -> Result<FeatureSet, FeatureError> {
        match self.default_queue_features.get(queue) {
            Some(tags) => FeatureSet::new(tags.iter().cloned()),
            None => Ok(FeatureSet::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Remote source feature name → where its files live.
    #[serde(default)]
    pub remote_sources: BTreeMap<String, RemoteSource>,
    #[serde(default, rename = "division")]
    pub divisions: Vec<DivisionConfig>,
}

impl Config {
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast checks; nothing downstream re-validates these.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.divisions.is_empty() {
            return Err(ConfigError::NoDivisions);
        }
        if self.scheduler.prep_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        FeatureSet::new(self.remote_sources.keys().cloned()).map_err(|source| {
            ConfigError::Feature {
                context: "remote_sources".into(),
                source,
            }
        })?;

        let mut seen = BTreeSet::new();
        for division in &self.divisions {
            if division.name.is_empty() {
                return Err(ConfigError::EmptyDivisionName);
            }
            if !seen.insert(division.name.as_str()) {
                return Err(ConfigError::DuplicateDivision(division.name.clone()));
            }
            for queue in division.default_queue_features.keys() {
                let known = QueueKind::from_name(queue).is_some()
                    || queue == QueueName::PREP
                    || queue == QueueName::PULL;
                if !known {
                    return Err(ConfigError::UnknownQueue {
                        division: division.name.clone(),
                        queue: queue.clone(),
                    });
                }
                division
                    .features_for(queue)
                    .map_err(|source| ConfigError::Feature {
                        context: format!("division {} queue {queue}", division.name),
                        source,
                    })?;
            }
            FeatureSet::new(division.max_resources.keys().cloned()).map_err(|source| {
                ConfigError::Feature {
                    context: format!("division {} max_resources", division.name),
                    source,
                }
            })?;
        }
        Ok(())
    }
}
