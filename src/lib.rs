//! clickhouse-operator library crate
//!
//! This module exports the controller, CRD definitions, the installation
//! model and the resource generators.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod leader;
pub mod model;
pub mod resources;

pub use health::HealthState;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, pin_mut};
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use client::clickhouse::ClickHouseHttpClient;
use client::kube::{FINALIZER, KubeResourceClient, selector_string};
use config::OperatorConfig;
use controller::informer::{LastSeen, RawChange};
use controller::queue::{Change, ChangeItem, ChangeOp, WorkQueue};
use controller::{Context, Worker};
use crd::{ClickHouseInstallation, ClickHouseInstallationTemplate, ClickHouseOperatorConfiguration};
use model::topology::{ChiRef, ChiSnapshot};
use resources::common::{LABEL_APP, LABEL_APP_VALUE};

/// `Api` for one namespace, or for all namespaces when `namespace` is `None`.
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration shared by every kind. Lists may be served from
/// the API server cache.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Run the operator until `queue` is shut down.
///
/// Starts one watcher per kind and namespace scope (installations,
/// installation templates, operator configurations and operator-labelled
/// Endpoints) plus `reconcile_workers` workers draining `queue`.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    queue: Arc<WorkQueue>,
) {
    let kube = Arc::new(KubeResourceClient::new(client.clone(), &config));
    let sql = Arc::new(ClickHouseHttpClient::new(
        config.ch_username.clone(),
        config.ch_password.clone(),
        config.ch_port,
    ));
    let mut ctx = Context::new(kube, sql, config.clone());
    if let Some(state) = &health_state {
        ctx = ctx.with_health(state.clone());
    }
    let ctx = Arc::new(ctx);

    let scopes: Vec<Option<String>> = if config.watch_namespaces.is_empty() {
        vec![None]
    } else {
        config.watch_namespaces.iter().cloned().map(Some).collect()
    };

    let mut watchers: Vec<JoinHandle<()>> = Vec::new();
    for scope in &scopes {
        let namespace = scope.as_deref();
        info!(scope = namespace.unwrap_or("cluster-wide"), "Starting watchers");
        watchers.push(tokio::spawn(watch_installations(
            scoped_api(client.clone(), namespace),
            ctx.clone(),
            queue.clone(),
        )));
        watchers.push(tokio::spawn(watch_templates(
            scoped_api(client.clone(), namespace),
            queue.clone(),
            health_state.clone(),
        )));
        watchers.push(tokio::spawn(watch_operator_configs(
            scoped_api(client.clone(), namespace),
            queue.clone(),
            health_state.clone(),
        )));
        watchers.push(tokio::spawn(watch_endpoints(
            scoped_api(client.clone(), namespace),
            queue.clone(),
        )));
    }

    let workers: Vec<JoinHandle<()>> = (0..config.reconcile_workers)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                Worker::new(ctx.clone()),
                queue.clone(),
                health_state.clone(),
            ))
        })
        .collect();
    info!(workers = workers.len(), "Controller running");

    if let Some(state) = &health_state {
        state.set_ready(true).await;
    }

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task panicked");
        }
    }
    for watcher in watchers {
        watcher.abort();
    }
    info!("Controller stopped");
}

/// Drain the queue until it shuts down.
pub async fn run_worker(
    id: usize,
    worker: Worker,
    queue: Arc<WorkQueue>,
    health_state: Option<Arc<HealthState>>,
) {
    debug!(worker = id, "Worker started");
    while let Some((key, item)) = queue.next().await {
        if let Some(state) = &health_state {
            let (kind, op) = item_labels(&item);
            state.metrics.record_item(kind, &op.to_string());
        }
        debug!(worker = id, item = %key, "Processing item");
        let retry = item.clone();
        match worker.process_item(item).await {
            Ok(()) => queue.done(&key),
            Err(e) if e.is_not_found() => {
                debug!(item = %key, error = %e, "Object gone");
                queue.done(&key);
            }
            Err(e) => {
                let delay = queue.failed(&key, retry);
                error!(
                    worker = id,
                    item = %key,
                    error = %e,
                    retry_delay_ms = delay.as_millis() as u64,
                    "Work item failed, retrying"
                );
            }
        }
    }
    debug!(worker = id, "Worker stopped");
}

fn item_labels(item: &ChangeItem) -> (&'static str, ChangeOp) {
    match item {
        ChangeItem::Installation(c) => ("chi", c.op()),
        ChangeItem::Template(c) => ("chit", c.op()),
        ChangeItem::OperatorConfig(c) => ("chopconf", c.op()),
        ChangeItem::CacheInvalidation(_) => ("endpoints", ChangeOp::Update),
    }
}

/// Validate a raw change and enqueue it. Returns false once the queue is closed.
fn enqueue<K, T>(
    queue: &WorkQueue,
    raw: RawChange<K>,
    wrap: impl Fn(Arc<K>) -> T,
    item: impl FnOnce(Change<T>) -> ChangeItem,
    health_state: Option<&Arc<HealthState>>,
) -> bool {
    match Change::from_parts(raw.op, raw.old.map(&wrap), raw.new.map(&wrap)) {
        Ok(change) => queue.add(item(change)),
        Err(e) => {
            warn!(error = %e, "Dropping malformed change");
            if let Some(state) = health_state {
                state.metrics.record_dropped();
            }
            true
        }
    }
}

async fn watch_installations(
    api: Api<ClickHouseInstallation>,
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
) {
    let mut seen = LastSeen::new();
    let stream = watcher::watcher(api, default_watcher_config()).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Installation watch error");
                continue;
            }
        };
        for raw in seen.observe(event) {
            if let Some(chi) = &raw.new {
                ensure_finalizer(&ctx, chi).await;
            }
            let open = enqueue(
                &queue,
                raw,
                ChiSnapshot::Declared,
                ChangeItem::Installation,
                ctx.health_state.as_ref(),
            );
            if !open {
                return;
            }
        }
    }
}

async fn ensure_finalizer(ctx: &Context, chi: &ClickHouseInstallation) {
    if chi.meta().deletion_timestamp.is_some() || chi.finalizers().iter().any(|f| f == FINALIZER) {
        return;
    }
    let chi_ref = ChiRef::new(chi.namespace().unwrap_or_default(), chi.name_any());
    if let Err(e) = ctx.kube.add_finalizer(&chi_ref).await {
        warn!(chi = %chi_ref, error = %e, "Failed to add finalizer");
    }
}

async fn watch_templates(
    api: Api<ClickHouseInstallationTemplate>,
    queue: Arc<WorkQueue>,
    health_state: Option<Arc<HealthState>>,
) {
    let mut seen = LastSeen::new();
    let stream = watcher::watcher(api, default_watcher_config()).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Template watch error");
                continue;
            }
        };
        for raw in seen.observe(event) {
            if !enqueue(&queue, raw, |t| t, ChangeItem::Template, health_state.as_ref()) {
                return;
            }
        }
    }
}

async fn watch_operator_configs(
    api: Api<ClickHouseOperatorConfiguration>,
    queue: Arc<WorkQueue>,
    health_state: Option<Arc<HealthState>>,
) {
    let mut seen = LastSeen::new();
    let stream = watcher::watcher(api, default_watcher_config()).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Operator configuration watch error");
                continue;
            }
        };
        for raw in seen.observe(event) {
            let open = enqueue(
                &queue,
                raw,
                |c| c,
                ChangeItem::OperatorConfig,
                health_state.as_ref(),
            );
            if !open {
                return;
            }
        }
    }
}

/// Endpoints of operator-managed Services whose addresses changed.
async fn watch_endpoints(api: Api<Endpoints>, queue: Arc<WorkQueue>) {
    let selector = selector_string(&BTreeMap::from([(
        LABEL_APP.to_string(),
        LABEL_APP_VALUE.to_string(),
    )]));
    let mut seen = LastSeen::new();
    let stream =
        watcher::watcher(api, default_watcher_config().labels(&selector)).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Endpoints watch error");
                continue;
            }
        };
        for raw in seen.observe(event) {
            let (Some(old), Some(new)) = (raw.old, raw.new) else {
                continue;
            };
            if old.subsets == new.subsets {
                continue;
            }
            debug!(endpoints = %new.name_any(), "Endpoints addresses changed");
            if !queue.add(ChangeItem::CacheInvalidation(new)) {
                return;
            }
        }
    }
}
