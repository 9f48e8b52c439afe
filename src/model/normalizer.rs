//! Expands a declared installation into a fully resolved tree.
//!
//! Missing counts default to one, template names are inherited from the
//! enclosing level, and every template reference is resolved against the
//! merged operator + installation template set. An unresolvable reference
//! is logged and replaced by the default; normalization never fails.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, ContainerPort, HTTPGetAction, PodSpec, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    ChiCluster, ChiShard, ChiTemplates, ClickHouseInstallation, PodTemplate, ServiceTemplate,
    TemplateNames, VolumeClaimTemplate,
};
use crate::model::namer;
use crate::model::templates;
use crate::model::topology::{
    ChiSnapshot, Cluster, ClusterAddress, Host, HostAddress, NormalizedChi, Shard, ShardAddress,
};

/// Name of the cluster created when an installation declares none.
pub const DEFAULT_CLUSTER_NAME: &str = "cluster";

/// Name of the ClickHouse server container.
pub const CLICKHOUSE_CONTAINER_NAME: &str = "clickhouse";

pub const HTTP_PORT_NAME: &str = "http";
pub const TCP_PORT_NAME: &str = "client";
pub const INTERSERVER_PORT_NAME: &str = "interserver";

/// Turns declared installations into normalized trees.
#[derive(Clone, Debug)]
pub struct Normalizer {
    config: Arc<OperatorConfig>,
    operator_templates: ChiTemplates,
}

impl Normalizer {
    /// `operator_templates` lose to installation templates of the same name.
    pub fn new(config: Arc<OperatorConfig>, operator_templates: ChiTemplates) -> Self {
        Self {
            config,
            operator_templates,
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Normalize a snapshot unless it already is.
    pub fn normalize_snapshot(&self, snapshot: &ChiSnapshot) -> Arc<NormalizedChi> {
        match snapshot {
            ChiSnapshot::Normalized(chi) if chi.is_normalized() => chi.clone(),
            ChiSnapshot::Normalized(chi) => {
                debug!(chi = %chi.name, "Snapshot failed the normalized check, rebuilding addresses");
                Arc::new(self.renormalize(chi))
            }
            ChiSnapshot::Declared(chi) => Arc::new(self.normalize(chi)),
        }
    }

    pub fn normalize(&self, chi: &ClickHouseInstallation) -> NormalizedChi {
        let namespace = chi.namespace().unwrap_or_default();
        let name = chi.name_any();
        let templates = templates::merge(&self.operator_templates, &chi.spec.templates);
        let defaults = &chi.spec.defaults.templates;

        let declared: Vec<ChiCluster> = if chi.spec.configuration.clusters.is_empty() {
            vec![ChiCluster {
                name: DEFAULT_CLUSTER_NAME.to_string(),
                ..Default::default()
            }]
        } else {
            unique_clusters(&name, &chi.spec.configuration.clusters)
        };

        let clusters = declared
            .iter()
            .enumerate()
            .map(|(index, cluster)| {
                self.normalize_cluster(&namespace, &name, index, cluster, defaults, &templates)
            })
            .collect();

        let service_template = resolve_service(&templates, &defaults.service_template, &name);

        NormalizedChi {
            namespace,
            name,
            uid: chi.uid(),
            generation: chi.metadata.generation,
            resource_version: chi.resource_version(),
            labels: chi.labels().clone(),
            zookeeper: chi.spec.configuration.zookeeper.clone(),
            users: chi.spec.configuration.users.clone(),
            profiles: chi.spec.configuration.profiles.clone(),
            quotas: chi.spec.configuration.quotas.clone(),
            settings: chi.spec.configuration.settings.clone(),
            templates,
            service_template,
            status: chi.status.clone().unwrap_or_default(),
            clusters,
        }
    }

    /// Rebuild addresses of a tree that fails the normalized check.
    fn renormalize(&self, chi: &NormalizedChi) -> NormalizedChi {
        let mut chi = chi.clone();
        let default_pod = self.default_pod_template(DEFAULT_CLUSTER_NAME);
        for (ci, cluster) in chi.clusters.iter_mut().enumerate() {
            cluster.address.namespace = chi.namespace.clone();
            cluster.address.chi_name = chi.name.clone();
            cluster.address.cluster_index = ci;
            let cluster_address = cluster.address.clone();
            for (si, shard) in cluster.shards.iter_mut().enumerate() {
                shard.address = shard_address(&cluster_address, si, &shard.address.shard_name);
                let owner = shard.address.clone();
                for (ri, host) in shard.hosts.iter_mut().enumerate() {
                    host.address = host_address(&owner, ri, &host.address.host_name);
                    if host.pod_template.spec.containers.is_empty() {
                        host.pod_template = PodTemplate {
                            name: namer::statefulset_name(&host.address),
                            ..default_pod.clone()
                        };
                    }
                }
            }
        }
        chi
    }

    fn normalize_cluster(
        &self,
        namespace: &str,
        chi_name: &str,
        index: usize,
        cluster: &ChiCluster,
        defaults: &TemplateNames,
        templates: &ChiTemplates,
    ) -> Cluster {
        let address = ClusterAddress {
            namespace: namespace.to_string(),
            chi_name: chi_name.to_string(),
            cluster_name: cluster.name.clone(),
            cluster_index: index,
        };
        let cluster_templates = cluster.templates.inherit(defaults);
        let layout = &cluster.layout;

        let shards_count = count(layout.shards_count, layout.shards.len());
        let shards = (0..shards_count)
            .map(|si| {
                let declared = layout.shards.get(si).cloned().unwrap_or_default();
                let replicas_count = count(
                    declared.replicas_count.or(layout.replicas_count),
                    declared.replicas.len(),
                );
                self.normalize_shard(
                    &address,
                    si,
                    &declared,
                    replicas_count,
                    &cluster_templates,
                    templates,
                )
            })
            .collect();

        Cluster {
            service_template: resolve_service(
                templates,
                &cluster_templates.cluster_service_template,
                &cluster.name,
            ),
            address,
            shards,
        }
    }

    fn normalize_shard(
        &self,
        cluster: &ClusterAddress,
        index: usize,
        shard: &ChiShard,
        replicas_count: usize,
        parent: &TemplateNames,
        templates: &ChiTemplates,
    ) -> Shard {
        let name = shard.name.clone().unwrap_or_else(|| index.to_string());
        let address = shard_address(cluster, index, &name);
        let shard_templates = shard.templates.inherit(parent);

        let hosts = (0..replicas_count)
            .map(|ri| {
                let replica = shard.replicas.get(ri).cloned().unwrap_or_default();
                let host_name = replica
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{index}-{ri}"));
                let host_address = host_address(&address, ri, &host_name);
                let host_templates = replica.templates.inherit(&shard_templates);
                self.normalize_host(
                    host_address,
                    replica.port,
                    host_templates,
                    replicas_count,
                    templates,
                )
            })
            .collect();

        Shard {
            weight: shard.weight.unwrap_or(1),
            internal_replication: shard.internal_replication.unwrap_or(replicas_count > 1),
            service_template: resolve_service(
                templates,
                &shard_templates.shard_service_template,
                &name,
            ),
            address,
            hosts,
        }
    }

    fn normalize_host(
        &self,
        address: HostAddress,
        port: Option<i32>,
        names: TemplateNames,
        replicas_count: usize,
        templates: &ChiTemplates,
    ) -> Host {
        let statefulset = namer::statefulset_name(&address);

        let pod_template = if names.pod_template.is_empty() {
            debug!(host = %statefulset, "No pod template referenced, using default");
            self.default_pod_template(&statefulset)
        } else if let Some(template) = templates.pod_template(&names.pod_template) {
            template.clone()
        } else {
            warn!(
                host = %statefulset,
                template = %names.pod_template,
                "Pod template not found, using default"
            );
            self.default_pod_template(&statefulset)
        };

        Host {
            port: port.unwrap_or(self.config.tcp_port),
            pod_template,
            data_volume_claim_template: resolve_volume(
                templates,
                &names.data_volume_claim_template,
                &statefulset,
            ),
            log_volume_claim_template: resolve_volume(
                templates,
                &names.log_volume_claim_template,
                &statefulset,
            ),
            service_template: resolve_service(
                templates,
                &names.replica_service_template,
                &statefulset,
            ),
            templates: names,
            replicas_count,
            address,
        }
    }

    /// Single ClickHouse container with the configured ports and readiness probe.
    pub fn default_pod_template(&self, name: &str) -> PodTemplate {
        let config = &self.config;
        PodTemplate {
            name: name.to_string(),
            spec: PodSpec {
                containers: vec![Container {
                    name: CLICKHOUSE_CONTAINER_NAME.to_string(),
                    image: Some(config.clickhouse_image.clone()),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some(HTTP_PORT_NAME.to_string()),
                            container_port: config.http_port,
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some(TCP_PORT_NAME.to_string()),
                            container_port: config.tcp_port,
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some(INTERSERVER_PORT_NAME.to_string()),
                            container_port: config.interserver_http_port,
                            ..Default::default()
                        },
                    ]),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some(config.readiness_path.clone()),
                            port: IntOrString::String(HTTP_PORT_NAME.to_string()),
                            ..Default::default()
                        }),
                        initial_delay_seconds: Some(config.readiness_initial_delay_seconds),
                        period_seconds: Some(config.readiness_period_seconds),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }
}

/// Declared count, padded up to the explicit list length, at least one.
fn count(declared: Option<i32>, explicit: usize) -> usize {
    let declared = declared.and_then(|n| usize::try_from(n).ok()).unwrap_or(1);
    declared.max(explicit).max(1)
}

fn shard_address(cluster: &ClusterAddress, index: usize, name: &str) -> ShardAddress {
    ShardAddress {
        namespace: cluster.namespace.clone(),
        chi_name: cluster.chi_name.clone(),
        cluster_name: cluster.cluster_name.clone(),
        cluster_index: cluster.cluster_index,
        shard_name: name.to_string(),
        shard_index: index,
    }
}

fn host_address(shard: &ShardAddress, index: usize, name: &str) -> HostAddress {
    HostAddress {
        namespace: shard.namespace.clone(),
        chi_name: shard.chi_name.clone(),
        cluster_name: shard.cluster_name.clone(),
        cluster_index: shard.cluster_index,
        shard_name: shard.shard_name.clone(),
        shard_index: shard.shard_index,
        host_name: name.to_string(),
        replica_index: index,
    }
}

fn resolve_volume(
    templates: &ChiTemplates,
    name: &str,
    owner: &str,
) -> Option<VolumeClaimTemplate> {
    if name.is_empty() {
        return None;
    }
    let found = templates.volume_claim_template(name).cloned();
    if found.is_none() {
        warn!(owner = %owner, template = %name, "Volume claim template not found, skipping");
    }
    found
}

fn resolve_service(templates: &ChiTemplates, name: &str, owner: &str) -> Option<ServiceTemplate> {
    if name.is_empty() {
        return None;
    }
    let found = templates.service_template(name).cloned();
    if found.is_none() {
        warn!(owner = %owner, template = %name, "Service template not found, using default");
    }
    found
}

/// Clusters keyed by name; a later cluster reusing a name is dropped.
fn unique_clusters(chi: &str, declared: &[ChiCluster]) -> Vec<ChiCluster> {
    let mut seen = std::collections::HashSet::new();
    declared
        .iter()
        .filter(|cluster| {
            let first = seen.insert(cluster.name.as_str());
            if !first {
                warn!(
                    chi = %chi,
                    cluster = %cluster.name,
                    "Duplicate cluster name, ignoring later declaration"
                );
            }
            first
        })
        .cloned()
        .collect()
}
