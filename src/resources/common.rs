//! Labels and owner references shared by every generated object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::model::topology::{ClusterAddress, HostAddress, NormalizedChi, ShardAddress};

pub const LABEL_APP: &str = "clickhouse.altinity.com/app";
pub const LABEL_APP_VALUE: &str = "chop";
pub const LABEL_CHOP: &str = "clickhouse.altinity.com/chop";
pub const LABEL_CHI: &str = "clickhouse.altinity.com/chi";
pub const LABEL_CLUSTER: &str = "clickhouse.altinity.com/cluster";
pub const LABEL_SHARD: &str = "clickhouse.altinity.com/shard";
pub const LABEL_REPLICA: &str = "clickhouse.altinity.com/replica";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "clickhouse-operator";

/// Operator version stamped on every object.
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Selector matching every object of an installation.
pub fn chi_selector(chi_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_CHI.to_string(), chi_name.to_string()),
    ])
}

/// Labels of installation-wide objects.
pub fn chi_labels(chi_name: &str) -> BTreeMap<String, String> {
    let mut labels = chi_selector(chi_name);
    labels.insert(LABEL_CHOP.to_string(), OPERATOR_VERSION.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

pub fn cluster_selector(address: &ClusterAddress) -> BTreeMap<String, String> {
    let mut labels = chi_selector(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels
}

pub fn cluster_labels(address: &ClusterAddress) -> BTreeMap<String, String> {
    let mut labels = chi_labels(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels
}

pub fn shard_selector(address: &ShardAddress) -> BTreeMap<String, String> {
    let mut labels = chi_selector(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels.insert(LABEL_SHARD.to_string(), address.shard_index.to_string());
    labels
}

pub fn shard_labels(address: &ShardAddress) -> BTreeMap<String, String> {
    let mut labels = chi_labels(&address.chi_name);
    labels.extend(shard_selector(address));
    labels
}

/// Selector matching exactly one host's pod and volume claims.
pub fn host_selector(address: &HostAddress) -> BTreeMap<String, String> {
    let mut labels = chi_selector(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels.insert(LABEL_SHARD.to_string(), address.shard_index.to_string());
    labels.insert(LABEL_REPLICA.to_string(), address.replica_index.to_string());
    labels
}

pub fn host_labels(address: &HostAddress) -> BTreeMap<String, String> {
    let mut labels = chi_labels(&address.chi_name);
    labels.extend(host_selector(address));
    labels
}

/// Owner reference to the installation, once it has a UID.
pub fn owner_reference(chi: &NormalizedChi) -> Option<OwnerReference> {
    chi.uid.as_ref().map(|uid| OwnerReference {
        api_version: "clickhouse.altinity.com/v1".to_string(),
        kind: "ClickHouseInstallation".to_string(),
        name: chi.name.clone(),
        uid: uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

pub fn owner_references(chi: &NormalizedChi) -> Option<Vec<OwnerReference>> {
    owner_reference(chi).map(|r| vec![r])
}

fn operator_label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    let labels = meta.labels.as_ref()?;
    if labels.get(LABEL_APP).map(String::as_str) != Some(LABEL_APP_VALUE) {
        return None;
    }
    labels.get(key).map(String::as_str)
}

/// Installation name of an object generated by the operator.
pub fn chi_name_from_meta(meta: &ObjectMeta) -> Option<&str> {
    operator_label(meta, LABEL_CHI)
}

/// Cluster name of an object generated by the operator.
pub fn cluster_name_from_meta(meta: &ObjectMeta) -> Option<&str> {
    operator_label(meta, LABEL_CLUSTER)
}
