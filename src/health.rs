//! Probe, metrics and watch-list endpoints.
//!
//! | Path       | Answers                                               |
//! |------------|-------------------------------------------------------|
//! | `/healthz` | 200 while the process serves HTTP                     |
//! | `/readyz`  | 200 once the controller runs, 503 before and on drain |
//! | `/metrics` | Prometheus text exposition                            |
//! | `/chi`     | JSON list of reconciled installations and host FQDNs  |

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::controller::watch::WatchRegistry;

pub const HEALTH_PORT: u16 = 8080;

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChiLabels {
    pub namespace: String,
    pub chi: String,
}

impl ChiLabels {
    fn new(namespace: &str, chi: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            chi: chi.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ItemLabels {
    pub kind: String,
    pub op: String,
}

/// Operator metrics, all prefixed `chop_`.
pub struct Metrics {
    pub reconciliations_total: Family<ChiLabels, Counter>,
    pub reconciliation_errors_total: Family<ChiLabels, Counter>,
    pub reconcile_duration_seconds: Family<ChiLabels, Histogram>,
    pub hosts: Family<ChiLabels, Gauge>,
    pub work_items_total: Family<ItemLabels, Counter>,
    pub dropped_items_total: Counter,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("chop");

        let reconciliations_total = Family::<ChiLabels, Counter>::default();
        let reconciliation_errors_total = Family::<ChiLabels, Counter>::default();
        let reconcile_duration_seconds =
            Family::<ChiLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.05, 2.0, 14))
            });
        let hosts = Family::<ChiLabels, Gauge>::default();
        let work_items_total = Family::<ItemLabels, Counter>::default();
        let dropped_items_total = Counter::default();

        registry.register(
            "reconciliations",
            "Completed installation reconciles",
            reconciliations_total.clone(),
        );
        registry.register(
            "reconciliation_errors",
            "Failed installation reconciles",
            reconciliation_errors_total.clone(),
        );
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of completed installation reconciles",
            reconcile_duration_seconds.clone(),
        );
        registry.register(
            "hosts",
            "ClickHouse hosts of an installation after its last reconcile",
            hosts.clone(),
        );
        registry.register(
            "work_items",
            "Work items taken off the queue",
            work_items_total.clone(),
        );
        registry.register(
            "dropped_items",
            "Malformed changes dropped before queueing",
            dropped_items_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            hosts,
            work_items_total,
            dropped_items_total,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, chi: &str, duration_secs: f64) {
        let labels = ChiLabels::new(namespace, chi);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, chi: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ChiLabels::new(namespace, chi))
            .inc();
    }

    pub fn set_hosts(&self, namespace: &str, chi: &str, hosts: i64) {
        self.hosts
            .get_or_create(&ChiLabels::new(namespace, chi))
            .set(hosts);
    }

    /// Drop the gauge series of a deleted installation.
    pub fn remove_hosts(&self, namespace: &str, chi: &str) {
        self.hosts.remove(&ChiLabels::new(namespace, chi));
    }

    pub fn record_item(&self, kind: &str, op: &str) {
        let labels = ItemLabels {
            kind: kind.to_string(),
            op: op.to_string(),
        };
        self.work_items_total.get_or_create(&labels).inc();
    }

    pub fn record_dropped(&self) {
        self.dropped_items_total.inc();
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> String {
        let mut body = String::new();
        match encode(&mut body, &self.registry) {
            Ok(()) => body,
            Err(e) => {
                error!(error = %e, "Metrics encoding failed");
                String::new()
            }
        }
    }
}

/// State shared by the HTTP handlers and the controller.
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Metrics,
    watch: Arc<WatchRegistry>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            watch: Arc::new(WatchRegistry::new()),
        }
    }

    /// Registry the workers publish host addresses to.
    pub fn watch_registry(&self) -> Arc<WatchRegistry> {
        self.watch.clone()
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.metrics.encode(),
    )
}

async fn watched_installations(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.watch.list())
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/chi", get(watched_installations))
        .with_state(state)
}

/// Serve [`create_router`] on all interfaces at [`HEALTH_PORT`].
pub async fn run_health_server(state: Arc<HealthState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", HEALTH_PORT)).await?;
    info!(port = HEALTH_PORT, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
