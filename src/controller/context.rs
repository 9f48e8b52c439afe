//! Shared context for the workers.
//!
//! Holds the two external clients, the live operator config, installation
//! templates and the host watch list.

use std::sync::Arc;

use crate::client::clickhouse::SqlClient;
use crate::client::kube::ResourceClient;
use crate::config::{ConfigManager, OperatorConfig, TemplateRegistry};
use crate::controller::watch::WatchRegistry;
use crate::health::HealthState;
use crate::model::normalizer::Normalizer;
use crate::model::schemer::Schemer;

/// Shared context for the workers
#[derive(Clone)]
pub struct Context {
    pub kube: Arc<dyn ResourceClient>,
    pub sql: Arc<dyn SqlClient>,
    pub config: Arc<ConfigManager>,
    pub templates: Arc<TemplateRegistry>,
    pub watch: Arc<WatchRegistry>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        kube: Arc<dyn ResourceClient>,
        sql: Arc<dyn SqlClient>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            kube,
            sql,
            config: Arc::new(ConfigManager::new(config)),
            templates: Arc::new(TemplateRegistry::new()),
            watch: Arc::new(WatchRegistry::new()),
            health_state: None,
        }
    }

    /// Report metrics and serve the watch list through `health_state`.
    pub fn with_health(mut self, health_state: Arc<HealthState>) -> Self {
        self.watch = health_state.watch_registry();
        self.health_state = Some(health_state);
        self
    }

    /// Normalizer for the current config and template set.
    pub fn normalizer(&self) -> Normalizer {
        let config = self.config.current();
        let templates = self.templates.effective(&config);
        Normalizer::new(config, templates)
    }

    pub fn schemer(&self) -> Schemer {
        Schemer::new(self.sql.clone(), self.config.current().sql_timeout())
    }
}
