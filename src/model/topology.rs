//! Normalized installation tree.
//!
//! Every node carries its address. Cluster identity is the cluster name,
//! shard identity is (cluster name, shard index) and host identity is
//! (cluster name, shard index, replica index).

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::{
    ChiStatus, ChiTemplates, ClickHouseInstallation, PodTemplate, ServiceTemplate,
    TemplateNames, VolumeClaimTemplate, ZookeeperConfig,
};
use crate::model::namer;

/// Namespaced name of an installation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChiRef {
    pub namespace: String,
    pub name: String,
}

impl ChiRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ChiRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
    pub shard_name: String,
    pub shard_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
    pub shard_name: String,
    pub shard_index: usize,
    pub host_name: String,
    pub replica_index: usize,
}

impl ShardAddress {
    /// Identity key used when diffing trees.
    pub fn key(&self) -> (String, usize) {
        (self.cluster_name.clone(), self.shard_index)
    }
}

impl HostAddress {
    /// Identity key used when diffing trees.
    pub fn key(&self) -> (String, usize, usize) {
        (self.cluster_name.clone(), self.shard_index, self.replica_index)
    }
}

/// A fully resolved replica.
#[derive(Clone, Debug, PartialEq)]
pub struct Host {
    pub address: HostAddress,
    /// Native protocol port.
    pub port: i32,
    /// Template names after inheritance.
    pub templates: TemplateNames,
    /// Always present: the referenced template or the built-in default.
    pub pod_template: PodTemplate,
    pub data_volume_claim_template: Option<VolumeClaimTemplate>,
    pub log_volume_claim_template: Option<VolumeClaimTemplate>,
    pub service_template: Option<ServiceTemplate>,
    /// Replica count of the owning shard.
    pub replicas_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Shard {
    pub address: ShardAddress,
    pub weight: i32,
    pub internal_replication: bool,
    pub service_template: Option<ServiceTemplate>,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub address: ClusterAddress,
    pub service_template: Option<ServiceTemplate>,
    pub shards: Vec<Shard>,
}

impl Cluster {
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.shards.iter().flat_map(|s| s.hosts.iter())
    }

    /// Hosts of this cluster other than `host`, followed by `host` itself.
    pub fn hosts_peer_first<'a>(&'a self, host: &'a Host) -> Vec<&'a Host> {
        let mut hosts: Vec<&Host> = self.hosts().filter(|h| h.address != host.address).collect();
        hosts.push(host);
        hosts
    }

    /// Fully qualified pod names of every host of this cluster.
    pub fn pod_fqdns(&self) -> Vec<String> {
        self.hosts().map(|h| namer::host_fqdn(&h.address)).collect()
    }
}

/// Fully resolved installation.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedChi {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub generation: Option<i64>,
    /// Watch-source version token.
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,

    pub zookeeper: ZookeeperConfig,
    pub users: BTreeMap<String, String>,
    pub profiles: BTreeMap<String, String>,
    pub quotas: BTreeMap<String, String>,
    pub settings: BTreeMap<String, String>,

    /// Effective templates: operator-level merged with the installation's.
    pub templates: ChiTemplates,
    /// Template for the installation-wide Service.
    pub service_template: Option<ServiceTemplate>,

    pub status: ChiStatus,
    pub clusters: Vec<Cluster>,
}

impl NormalizedChi {
    /// The tree an absent "old" installation is represented by.
    pub fn empty(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: None,
            generation: None,
            resource_version: None,
            labels: BTreeMap::new(),
            zookeeper: ZookeeperConfig::default(),
            users: BTreeMap::new(),
            profiles: BTreeMap::new(),
            quotas: BTreeMap::new(),
            settings: BTreeMap::new(),
            templates: ChiTemplates::default(),
            service_template: None,
            status: ChiStatus::default(),
            clusters: Vec::new(),
        }
    }

    pub fn chi_ref(&self) -> ChiRef {
        ChiRef::new(&self.namespace, &self.name)
    }

    /// Every node addressed consistently with its position and owner.
    pub fn is_normalized(&self) -> bool {
        self.clusters.iter().enumerate().all(|(ci, cluster)| {
            let ca = &cluster.address;
            ca.namespace == self.namespace
                && ca.chi_name == self.name
                && !ca.cluster_name.is_empty()
                && ca.cluster_index == ci
                && cluster.shards.iter().enumerate().all(|(si, shard)| {
                    let sa = &shard.address;
                    sa.cluster_name == ca.cluster_name
                        && sa.shard_index == si
                        && shard.hosts.iter().enumerate().all(|(ri, host)| {
                            let ha = &host.address;
                            ha.cluster_name == ca.cluster_name
                                && ha.shard_index == si
                                && ha.replica_index == ri
                                && !host.pod_template.spec.containers.is_empty()
                        })
                })
        })
    }

    pub fn find_cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.address.cluster_name == name)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.clusters.iter().flat_map(|c| c.shards.iter())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.clusters.iter().flat_map(|c| c.hosts())
    }

    pub fn shards_count(&self) -> usize {
        self.shards().count()
    }

    pub fn hosts_count(&self) -> usize {
        self.hosts().count()
    }

    /// Fully qualified pod names of every host.
    pub fn pod_fqdns(&self) -> Vec<String> {
        self.hosts()
            .map(|h| namer::host_fqdn(&h.address))
            .collect()
    }
}

/// An installation as it travels through the work queue.
#[derive(Clone, Debug, PartialEq)]
pub enum ChiSnapshot {
    /// As declared by the user.
    Declared(Arc<ClickHouseInstallation>),
    /// Already normalized.
    Normalized(Arc<NormalizedChi>),
}

impl ChiSnapshot {
    pub fn is_normalized(&self) -> bool {
        match self {
            ChiSnapshot::Declared(_) => false,
            ChiSnapshot::Normalized(chi) => chi.is_normalized(),
        }
    }

    pub fn chi_ref(&self) -> ChiRef {
        match self {
            ChiSnapshot::Declared(chi) => {
                ChiRef::new(chi.namespace().unwrap_or_default(), chi.name_any())
            }
            ChiSnapshot::Normalized(chi) => chi.chi_ref(),
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            ChiSnapshot::Declared(chi) => chi.resource_version(),
            ChiSnapshot::Normalized(chi) => chi.resource_version.clone(),
        }
    }
}

impl From<ClickHouseInstallation> for ChiSnapshot {
    fn from(chi: ClickHouseInstallation) -> Self {
        ChiSnapshot::Declared(Arc::new(chi))
    }
}

impl From<NormalizedChi> for ChiSnapshot {
    fn from(chi: NormalizedChi) -> Self {
        ChiSnapshot::Normalized(Arc::new(chi))
    }
}
