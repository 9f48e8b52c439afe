//! ClickHouseInstallation Custom Resource Definition.
//!
//! Declares a ClickHouse deployment as a hierarchy of clusters, shards and
//! replicas. Anything left unset here is filled in by the normalizer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodSpec, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ClickHouseInstallation describes one clustered ClickHouse deployment.
///
/// Example:
/// ```yaml
/// apiVersion: clickhouse.altinity.com/v1
/// kind: ClickHouseInstallation
/// metadata:
///   name: analytics
/// spec:
///   configuration:
///     zookeeper:
///       nodes:
///         - host: zookeeper.zoo
///     clusters:
///       - name: events
///         layout:
///           shardsCount: 2
///           replicasCount: 2
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clickhouse.altinity.com",
    version = "v1",
    kind = "ClickHouseInstallation",
    plural = "clickhouseinstallations",
    shortname = "chi",
    status = "ChiStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Clusters", "type":"integer", "jsonPath":".status.clustersCount"}"#,
    printcolumn = r#"{"name":"Hosts", "type":"integer", "jsonPath":".status.hostsCount"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChiSpec {
    /// Defaults inherited by every cluster, shard and replica.
    #[serde(default)]
    pub defaults: ChiDefaults,

    /// ClickHouse configuration and topology.
    #[serde(default)]
    pub configuration: ChiConfiguration,

    /// Named templates declared by this installation.
    #[serde(default)]
    pub templates: ChiTemplates,
}

/// Installation-wide defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiDefaults {
    /// Template names used where a lower level does not name its own.
    #[serde(default)]
    pub templates: TemplateNames,
}

/// References to named templates.
///
/// Empty strings mean "not set" and are inherited from the enclosing level.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateNames {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_volume_claim_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_volume_claim_template: String,

    /// Service template for the installation-wide endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_service_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shard_service_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replica_service_template: String,
}

impl TemplateNames {
    /// Fill every unset reference from `parent`.
    pub fn inherit(&self, parent: &TemplateNames) -> TemplateNames {
        fn pick(own: &str, parent: &str) -> String {
            if own.is_empty() { parent } else { own }.to_string()
        }

        TemplateNames {
            pod_template: pick(&self.pod_template, &parent.pod_template),
            data_volume_claim_template: pick(
                &self.data_volume_claim_template,
                &parent.data_volume_claim_template,
            ),
            log_volume_claim_template: pick(
                &self.log_volume_claim_template,
                &parent.log_volume_claim_template,
            ),
            service_template: pick(&self.service_template, &parent.service_template),
            cluster_service_template: pick(
                &self.cluster_service_template,
                &parent.cluster_service_template,
            ),
            shard_service_template: pick(
                &self.shard_service_template,
                &parent.shard_service_template,
            ),
            replica_service_template: pick(
                &self.replica_service_template,
                &parent.replica_service_template,
            ),
        }
    }
}

/// ClickHouse server configuration plus the cluster topology.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiConfiguration {
    /// Coordination service used by replicated tables.
    #[serde(default)]
    pub zookeeper: ZookeeperConfig,

    /// Users in flat path form, e.g. `reader/password: secret`.
    #[serde(default)]
    pub users: BTreeMap<String, String>,

    /// Settings profiles in flat path form.
    #[serde(default)]
    pub profiles: BTreeMap<String, String>,

    /// Quotas in flat path form.
    #[serde(default)]
    pub quotas: BTreeMap<String, String>,

    /// Server settings in flat path form, e.g. `max_concurrent_queries: "150"`.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,

    /// Clusters, in declaration order.
    #[serde(default)]
    pub clusters: Vec<ChiCluster>,
}

/// ZooKeeper ensemble definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperConfig {
    #[serde(default)]
    pub nodes: Vec<ZookeeperNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// A single ZooKeeper endpoint.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperNode {
    pub host: String,

    #[serde(default = "default_zookeeper_port")]
    pub port: i32,
}

fn default_zookeeper_port() -> i32 {
    2181
}

/// A declared cluster. Identified by name within the installation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiCluster {
    pub name: String,

    #[serde(default)]
    pub templates: TemplateNames,

    #[serde(default)]
    pub layout: ChiLayout,
}

/// Shape of a cluster.
///
/// Explicit `shards` take precedence; `shardsCount` pads the list with
/// default shards when it is larger.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiLayout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_count: Option<i32>,

    #[serde(default)]
    pub shards: Vec<ChiShard>,
}

/// A declared shard. Identified by its position in the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiShard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_replication: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_count: Option<i32>,

    #[serde(default)]
    pub templates: TemplateNames,

    #[serde(default)]
    pub replicas: Vec<ChiReplica>,
}

/// A declared replica (host). Identified by its position in the shard.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiReplica {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Native protocol port override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default)]
    pub templates: TemplateNames,
}

/// The three named template collections.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiTemplates {
    #[serde(default)]
    pub pod_templates: Vec<PodTemplate>,

    #[serde(default)]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    #[serde(default)]
    pub service_templates: Vec<ServiceTemplate>,
}

impl ChiTemplates {
    pub fn is_empty(&self) -> bool {
        self.pod_templates.is_empty()
            && self.volume_claim_templates.is_empty()
            && self.service_templates.is_empty()
    }

    pub fn pod_template(&self, name: &str) -> Option<&PodTemplate> {
        self.pod_templates.iter().find(|t| t.name == name)
    }

    pub fn volume_claim_template(&self, name: &str) -> Option<&VolumeClaimTemplate> {
        self.volume_claim_templates.iter().find(|t| t.name == name)
    }

    pub fn service_template(&self, name: &str) -> Option<&ServiceTemplate> {
        self.service_templates.iter().find(|t| t.name == name)
    }
}

/// Pod shape used for a host's StatefulSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub name: String,

    #[serde(default)]
    pub spec: PodSpec,
}

/// Persistent volume claim shape, mounted as data or log storage.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,

    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// Service shape for an installation, cluster, shard or replica endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ServiceSpec,
}

/// Status of a ClickHouseInstallation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiStatus {
    /// Current reconcile phase.
    #[serde(default)]
    pub status: ChiPhase,

    /// Hosts reconciled in place during the current pass.
    #[serde(default)]
    pub updated_hosts_count: i32,

    /// Hosts added by the current pass.
    #[serde(default)]
    pub added_hosts_count: i32,

    /// Hosts already deleted by the current pass.
    #[serde(default)]
    pub deleted_hosts_count: i32,

    /// Hosts planned for deletion by the current pass.
    #[serde(default)]
    pub delete_hosts_count: i32,

    #[serde(default)]
    pub clusters_count: i32,

    #[serde(default)]
    pub shards_count: i32,

    #[serde(default)]
    pub hosts_count: i32,

    /// Installation-wide service endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Reconcile phase of an installation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ChiPhase {
    /// Never reconciled.
    #[default]
    New,
    /// A reconcile pass is running.
    InProgress,
    /// The last reconcile pass finished.
    Completed,
    /// The last reconcile pass aborted on an error.
    Failed,
}

impl std::fmt::Display for ChiPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChiPhase::New => write!(f, "New"),
            ChiPhase::InProgress => write!(f, "InProgress"),
            ChiPhase::Completed => write!(f, "Completed"),
            ChiPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition describes the state of an installation at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }
}
