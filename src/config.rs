//! Operator configuration.
//!
//! `OperatorConfig` carries every default the normalizer, the resource
//! builders and the clients rely on. It is loaded once from the YAML file
//! named by `CHOP_CONFIG` and may be replaced at runtime by a
//! `ClickHouseOperatorConfiguration` resource.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::crd::ChiTemplates;
use crate::model::templates;

/// Environment variable holding the path of the operator config file.
pub const CONFIG_PATH_ENV: &str = "CHOP_CONFIG";

/// Environment variable with a comma-separated namespace list, overriding the file.
pub const WATCH_NAMESPACES_ENV: &str = "WATCH_NAMESPACES";

/// Errors raised while loading the operator configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Operator-wide settings and defaults.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Namespaces to watch. Empty means all namespaces.
    pub watch_namespaces: Vec<String>,

    /// ClickHouse user the operator connects as.
    pub ch_username: String,
    pub ch_password: String,
    /// ClickHouse HTTP interface port used by the operator.
    pub ch_port: u16,

    /// Timeout for a single SQL statement.
    pub sql_timeout_seconds: u64,
    /// Timeout for a single Kubernetes API call.
    pub kube_timeout_seconds: u64,
    /// How long to wait for a host StatefulSet to become ready.
    pub statefulset_ready_timeout_seconds: u64,
    pub statefulset_poll_interval_seconds: u64,

    /// Number of concurrent reconcile workers.
    pub reconcile_workers: usize,

    pub clickhouse_image: String,
    /// Image for the log sidecar container.
    pub log_container_image: String,

    pub http_port: i32,
    pub tcp_port: i32,
    pub interserver_http_port: i32,

    pub readiness_path: String,
    pub readiness_initial_delay_seconds: i32,
    pub readiness_period_seconds: i32,

    /// Applied to users that do not set their own profile.
    pub default_profile: String,
    pub default_quota: String,
    pub default_networks: Vec<String>,
    pub default_password: String,

    /// Extra server settings written into the common configuration.
    pub settings: BTreeMap<String, String>,

    /// Operator-level templates merged under every installation's templates.
    pub templates: ChiTemplates,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespaces: Vec::new(),
            ch_username: "clickhouse_operator".to_string(),
            ch_password: "clickhouse_operator_password".to_string(),
            ch_port: 8123,
            sql_timeout_seconds: 10,
            kube_timeout_seconds: 30,
            statefulset_ready_timeout_seconds: 300,
            statefulset_poll_interval_seconds: 15,
            reconcile_workers: 10,
            clickhouse_image: "yandex/clickhouse-server:latest".to_string(),
            log_container_image: "busybox".to_string(),
            http_port: 8123,
            tcp_port: 9000,
            interserver_http_port: 9009,
            readiness_path: "/ping".to_string(),
            readiness_initial_delay_seconds: 10,
            readiness_period_seconds: 10,
            default_profile: "default".to_string(),
            default_quota: "default".to_string(),
            default_networks: vec!["::1".to_string(), "127.0.0.1".to_string()],
            default_password: "default".to_string(),
            settings: BTreeMap::new(),
            templates: ChiTemplates::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the file named by `CHOP_CONFIG`, or defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => {
                debug!("{} not set, using default operator config", CONFIG_PATH_ENV);
                Self::default()
            }
        };

        if let Ok(namespaces) = std::env::var(WATCH_NAMESPACES_ENV) {
            config.watch_namespaces = namespaces
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        info!(path = %shown, "Loaded operator config");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Reject values that would stall the operator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_workers == 0 {
            return Err(ConfigError::Invalid(
                "reconcileWorkers must be at least 1".to_string(),
            ));
        }
        if self.statefulset_poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "statefulsetPollIntervalSeconds must be at least 1".to_string(),
            ));
        }
        if self.clickhouse_image.is_empty() {
            return Err(ConfigError::Invalid("clickhouseImage is empty".to_string()));
        }
        Ok(())
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_seconds)
    }

    pub fn kube_timeout(&self) -> Duration {
        Duration::from_secs(self.kube_timeout_seconds)
    }

    pub fn statefulset_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.statefulset_ready_timeout_seconds)
    }

    pub fn statefulset_poll_interval(&self) -> Duration {
        Duration::from_secs(self.statefulset_poll_interval_seconds)
    }
}

/// Holds the file config plus an optional override from the cluster.
#[derive(Debug)]
pub struct ConfigManager {
    base: Arc<OperatorConfig>,
    runtime: RwLock<Option<Arc<OperatorConfig>>>,
}

impl ConfigManager {
    pub fn new(base: OperatorConfig) -> Self {
        Self {
            base: Arc::new(base),
            runtime: RwLock::new(None),
        }
    }

    /// The config in effect right now.
    pub fn current(&self) -> Arc<OperatorConfig> {
        let guard = self.runtime.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().unwrap_or_else(|| self.base.clone())
    }

    /// Replace the effective config with one taken from a CHOpConf resource.
    pub fn set_override(&self, config: OperatorConfig) {
        let mut guard = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(config));
    }

    /// Go back to the file config.
    pub fn clear_override(&self) {
        let mut guard = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Templates contributed by ClickHouseInstallationTemplate resources.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    entries: RwLock<BTreeMap<String, ChiTemplates>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, key: &str, templates: ChiTemplates) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), templates);
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operator-level template set: config templates, then each CHIT in key order.
    pub fn effective(&self, config: &OperatorConfig) -> ChiTemplates {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        guard
            .values()
            .fold(config.templates.clone(), |acc, chit| {
                templates::merge(&acc, chit)
            })
    }
}
