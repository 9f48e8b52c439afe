//! Names of every object generated for an installation.

use crate::model::topology::{ClusterAddress, HostAddress, ShardAddress};

/// Installation-wide Service.
pub fn chi_service_name(chi_name: &str) -> String {
    format!("clickhouse-{chi_name}")
}

pub fn cluster_service_name(address: &ClusterAddress) -> String {
    format!("cluster-{}-{}", address.chi_name, address.cluster_name)
}

pub fn shard_service_name(address: &ShardAddress) -> String {
    format!(
        "shard-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_index
    )
}

/// StatefulSet name. The host Service shares it.
pub fn statefulset_name(address: &HostAddress) -> String {
    format!(
        "chi-{}-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_index, address.replica_index
    )
}

pub fn host_service_name(address: &HostAddress) -> String {
    statefulset_name(address)
}

/// Hostname of the single pod of a host StatefulSet.
pub fn pod_hostname(address: &HostAddress) -> String {
    format!("{}-0", statefulset_name(address))
}

/// Stable DNS name of a host, resolved through its headless Service.
pub fn host_fqdn(address: &HostAddress) -> String {
    format!(
        "{}.{}.svc.cluster.local",
        host_service_name(address),
        address.namespace
    )
}

pub fn chi_service_fqdn(namespace: &str, chi_name: &str) -> String {
    format!("{}.{}.svc.cluster.local", chi_service_name(chi_name), namespace)
}

/// ConfigMap shared by every host: remote servers, zookeeper, settings.
pub fn common_config_map_name(chi_name: &str) -> String {
    format!("chi-{chi_name}-common-configd")
}

/// ConfigMap shared by every host: users, profiles, quotas.
pub fn users_config_map_name(chi_name: &str) -> String {
    format!("chi-{chi_name}-common-usersd")
}

/// Per-host ConfigMap carrying macros.
pub fn host_config_map_name(address: &HostAddress) -> String {
    format!(
        "chi-{}-deploy-confd-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_index, address.replica_index
    )
}
