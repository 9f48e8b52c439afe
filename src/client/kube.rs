//! Kubernetes access used by the worker.
//!
//! `ResourceClient` is the seam between the reconcile logic and the API
//! server. `KubeResourceClient` is the real implementation; every call is
//! bounded by the configured per-call timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, PersistentVolumeClaim, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::controller::common;
use crate::controller::error::{Error, Result};
use crate::crd::{ChiStatus, ClickHouseInstallation};
use crate::model::topology::ChiRef;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "clickhouse-operator";

/// Finalizer placed on every installation the operator has seen.
pub const FINALIZER: &str = "finalizer.clickhouseinstallation.altinity.com";

/// Kinds of objects the operator creates or cleans up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    ConfigMap,
    StatefulSet,
    PersistentVolumeClaim,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Service => write!(f, "Service"),
            ResourceKind::ConfigMap => write!(f, "ConfigMap"),
            ResourceKind::StatefulSet => write!(f, "StatefulSet"),
            ResourceKind::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
        }
    }
}

/// Reference to a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A desired object, ready to be applied.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceSpec {
    Service(Service),
    ConfigMap(ConfigMap),
    StatefulSet(StatefulSet),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Service(_) => ResourceKind::Service,
            ResourceSpec::ConfigMap(_) => ResourceKind::ConfigMap,
            ResourceSpec::StatefulSet(_) => ResourceKind::StatefulSet,
        }
    }

    fn meta(&self) -> &kube::api::ObjectMeta {
        match self {
            ResourceSpec::Service(o) => o.meta(),
            ResourceSpec::ConfigMap(o) => o.meta(),
            ResourceSpec::StatefulSet(o) => o.meta(),
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        let meta = self.meta();
        ResourceRef::new(
            self.kind(),
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }
}

/// A Kubernetes event about an installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChiEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl ChiEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, action, note)
        }
    }
}

/// Operations the worker performs against the API server.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create or update an object.
    async fn apply(&self, spec: &ResourceSpec) -> Result<()>;

    /// Delete an object. A missing object is not an error.
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;

    async fn list_by_labels(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceRef>>;

    /// Block until a StatefulSet reports all replicas ready.
    async fn wait_ready(&self, statefulset: &ResourceRef) -> Result<()>;

    async fn persist_status(&self, chi: &ChiRef, status: &ChiStatus) -> Result<()>;

    async fn get_installation(&self, chi: &ChiRef) -> Result<ClickHouseInstallation>;

    async fn add_finalizer(&self, chi: &ChiRef) -> Result<()>;

    async fn remove_finalizer(&self, chi: &ChiRef) -> Result<()>;

    /// Publish an event. Failures are logged, never returned.
    async fn publish_event(&self, regarding: &ObjectReference, event: ChiEvent);
}

/// `ResourceClient` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    reporter: Reporter,
    call_timeout: Duration,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl KubeResourceClient {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            call_timeout: config.kube_timeout(),
            ready_timeout: config.statefulset_ready_timeout(),
            poll_interval: config.statefulset_poll_interval(),
        }
    }

    /// Bound a single API call by the per-call timeout.
    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(format!(
                "{what} did not complete within {:?}",
                self.call_timeout
            ))),
        }
    }

    async fn apply_object<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::Validation("object has no name".to_string()))?;
        let namespace = object.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(
            &format!("apply {namespace}/{name}"),
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match self
            .bounded(
                &format!("delete {namespace}/{name}"),
                api.delete(name, &DeleteParams::background()),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, name = %name, "Already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_names<K>(&self, namespace: &str, selector: &str) -> Result<Vec<String>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded(
                &format!("list {namespace} {selector}"),
                api.list(&ListParams::default().labels(selector)),
            )
            .await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }

    fn chi_api(&self, chi: &ChiRef) -> Api<ClickHouseInstallation> {
        Api::namespaced(self.client.clone(), &chi.namespace)
    }
}

/// Render a label map as a label selector string.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True once every desired replica of the current generation is ready.
pub fn statefulset_is_ready(statefulset: &StatefulSet) -> bool {
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = statefulset.metadata.generation.unwrap_or(0);
    statefulset.status.as_ref().is_some_and(|status| {
        status.observed_generation.unwrap_or(0) >= generation
            && status.ready_replicas.unwrap_or(0) >= desired
            && status.updated_replicas.unwrap_or(0) >= desired
    })
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn apply(&self, spec: &ResourceSpec) -> Result<()> {
        debug!(resource = %spec.resource_ref(), "Applying");
        match spec {
            ResourceSpec::Service(o) => self.apply_object(o).await,
            ResourceSpec::ConfigMap(o) => self.apply_object(o).await,
            ResourceSpec::StatefulSet(o) => self.apply_object(o).await,
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        debug!(resource = %resource, "Deleting");
        let (namespace, name) = (resource.namespace.as_str(), resource.name.as_str());
        match resource.kind {
            ResourceKind::Service => self.delete_object::<Service>(namespace, name).await,
            ResourceKind::ConfigMap => self.delete_object::<ConfigMap>(namespace, name).await,
            ResourceKind::StatefulSet => self.delete_object::<StatefulSet>(namespace, name).await,
            ResourceKind::PersistentVolumeClaim => {
                self.delete_object::<PersistentVolumeClaim>(namespace, name)
                    .await
            }
        }
    }

    async fn list_by_labels(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceRef>> {
        let selector = selector_string(selector);
        let names = match kind {
            ResourceKind::Service => self.list_names::<Service>(namespace, &selector).await?,
            ResourceKind::ConfigMap => self.list_names::<ConfigMap>(namespace, &selector).await?,
            ResourceKind::StatefulSet => {
                self.list_names::<StatefulSet>(namespace, &selector).await?
            }
            ResourceKind::PersistentVolumeClaim => {
                self.list_names::<PersistentVolumeClaim>(namespace, &selector)
                    .await?
            }
        };
        Ok(names
            .into_iter()
            .map(|name| ResourceRef::new(kind, namespace, name))
            .collect())
    }

    async fn wait_ready(&self, statefulset: &ResourceRef) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &statefulset.namespace);
        let deadline = tokio::time::Instant::now() + self.ready_timeout;

        loop {
            let current = self
                .bounded(&format!("get {statefulset}"), api.get(&statefulset.name))
                .await?;
            if statefulset_is_ready(&current) {
                debug!(resource = %statefulset, "Ready");
                return Ok(());
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(Error::Timeout(format!(
                    "{statefulset} not ready within {:?}",
                    self.ready_timeout
                )));
            }
            debug!(resource = %statefulset, "Waiting for readiness");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn persist_status(&self, chi: &ChiRef, status: &ChiStatus) -> Result<()> {
        let patch = serde_json::json!({
            "status": status
        });
        self.bounded(
            &format!("update status of {chi}"),
            self.chi_api(chi).patch_status(
                &chi.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            ),
        )
        .await?;
        Ok(())
    }

    async fn get_installation(&self, chi: &ChiRef) -> Result<ClickHouseInstallation> {
        match self
            .bounded(&format!("get {chi}"), self.chi_api(chi).get(&chi.name))
            .await
        {
            Ok(installation) => Ok(installation),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("installation {chi}"))),
            Err(e) => Err(e),
        }
    }

    async fn add_finalizer(&self, chi: &ChiRef) -> Result<()> {
        let api = self.chi_api(chi);
        match tokio::time::timeout(
            self.call_timeout,
            common::add_finalizer(&api, &chi.name, FINALIZER),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("add finalizer to {chi}"))),
        }
    }

    async fn remove_finalizer(&self, chi: &ChiRef) -> Result<()> {
        let api = self.chi_api(chi);
        match tokio::time::timeout(
            self.call_timeout,
            common::remove_finalizer(&api, &chi.name, FINALIZER),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("remove finalizer from {chi}"))),
        }
    }

    async fn publish_event(&self, regarding: &ObjectReference, event: ChiEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: Some(event.note),
                    action: event.action,
                    secondary: None,
                },
                regarding,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
