//! Test fixtures and builder patterns for ClickHouseInstallation.

use std::collections::BTreeMap;

use clickhouse_operator::crd::{
    ChiCluster, ChiConfiguration, ChiLayout, ChiSpec, ChiTemplates, ClickHouseInstallation,
    ServiceTemplate, TemplateNames, ZookeeperConfig, ZookeeperNode,
};
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Builder for ClickHouseInstallation test fixtures.
///
/// # Example
/// ```ignore
/// let chi = ChiBuilder::new("events")
///     .namespace("analytics")
///     .cluster("main", 2, 2)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct ChiBuilder {
    name: String,
    namespace: String,
    clusters: Vec<ChiCluster>,
    zookeeper: Vec<ZookeeperNode>,
    users: BTreeMap<String, String>,
    settings: BTreeMap<String, String>,
    templates: ChiTemplates,
    resource_version: Option<String>,
    generation: Option<i64>,
    uid: Option<String>,
}

impl ChiBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            clusters: Vec::new(),
            zookeeper: Vec::new(),
            users: BTreeMap::new(),
            settings: BTreeMap::new(),
            templates: ChiTemplates::default(),
            resource_version: None,
            generation: Some(1),
            uid: Some("chi-uid".to_string()),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add a cluster with a uniform layout.
    pub fn cluster(mut self, name: impl Into<String>, shards: i32, replicas: i32) -> Self {
        self.clusters.push(ChiCluster {
            name: name.into(),
            templates: TemplateNames::default(),
            layout: ChiLayout {
                shards_count: Some(shards),
                replicas_count: Some(replicas),
                shards: Vec::new(),
            },
        });
        self
    }

    /// Add a cluster whose Service comes from the named template.
    pub fn cluster_with_service(
        mut self,
        name: impl Into<String>,
        shards: i32,
        replicas: i32,
        service_template: impl Into<String>,
    ) -> Self {
        self = self.cluster(name, shards, replicas);
        if let Some(cluster) = self.clusters.last_mut() {
            cluster.templates.cluster_service_template = service_template.into();
        }
        self
    }

    /// Declare a service template usable by clusters and shards.
    pub fn service_template(mut self, name: impl Into<String>) -> Self {
        self.templates.service_templates.push(ServiceTemplate {
            name: name.into(),
            generate_name: None,
            metadata: ObjectMeta::default(),
            spec: ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            },
        });
        self
    }

    pub fn zookeeper(mut self, host: impl Into<String>) -> Self {
        self.zookeeper.push(ZookeeperNode {
            host: host.into(),
            port: 2181,
        });
        self
    }

    pub fn user(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.users.insert(key.into(), value.into());
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn build(self) -> ClickHouseInstallation {
        ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                resource_version: self.resource_version,
                generation: self.generation,
                uid: self.uid,
                ..Default::default()
            },
            spec: ChiSpec {
                configuration: ChiConfiguration {
                    zookeeper: ZookeeperConfig {
                        nodes: self.zookeeper,
                        ..Default::default()
                    },
                    users: self.users,
                    settings: self.settings,
                    clusters: self.clusters,
                    ..Default::default()
                },
                templates: self.templates,
                ..Default::default()
            },
            status: None,
        }
    }
}
