//! Service generation.
//!
//! One Service per scope:
//! - **Installation**: `clickhouse-<chi>`, a LoadBalancer unless templated
//! - **Cluster / Shard**: only when a service template resolves
//! - **Host**: headless, one per StatefulSet, publishes not-ready addresses

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OperatorConfig;
use crate::crd::ServiceTemplate;
use crate::model::namer;
use crate::model::normalizer::{HTTP_PORT_NAME, INTERSERVER_PORT_NAME, TCP_PORT_NAME};
use crate::model::topology::{Cluster, Host, NormalizedChi, Shard};
use crate::resources::common::{
    chi_labels, chi_selector, cluster_labels, cluster_selector, host_labels, host_selector,
    owner_references, shard_labels, shard_selector,
};

/// Installation-wide Service.
pub fn chi_service(chi: &NormalizedChi, config: &OperatorConfig) -> Service {
    let name = namer::chi_service_name(&chi.name);
    let labels = chi_labels(&chi.name);
    let selector = chi_selector(&chi.name);

    if let Some(template) = &chi.service_template {
        let name = expand_name(template, &name, &[("{chi}", &chi.name)]);
        return service_from_template(template, name, chi, labels, selector);
    }

    Service {
        metadata: metadata(name, chi, labels),
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(selector),
            ports: Some(vec![
                port(HTTP_PORT_NAME, config.http_port),
                port(TCP_PORT_NAME, config.tcp_port),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster Service, absent without a cluster service template.
pub fn cluster_service(chi: &NormalizedChi, cluster: &Cluster) -> Option<Service> {
    let template = cluster.service_template.as_ref()?;
    let address = &cluster.address;
    let name = expand_name(
        template,
        &namer::cluster_service_name(address),
        &[("{chi}", &chi.name), ("{cluster}", &address.cluster_name)],
    );
    Some(service_from_template(
        template,
        name,
        chi,
        cluster_labels(address),
        cluster_selector(address),
    ))
}

/// Shard Service, absent without a shard service template.
pub fn shard_service(chi: &NormalizedChi, shard: &Shard) -> Option<Service> {
    let template = shard.service_template.as_ref()?;
    let address = &shard.address;
    let shard_index = address.shard_index.to_string();
    let name = expand_name(
        template,
        &namer::shard_service_name(address),
        &[
            ("{chi}", &chi.name),
            ("{cluster}", &address.cluster_name),
            ("{shard}", &shard_index),
        ],
    );
    Some(service_from_template(
        template,
        name,
        chi,
        shard_labels(address),
        shard_selector(address),
    ))
}

/// Headless Service giving a host's pod a stable DNS name.
pub fn host_service(chi: &NormalizedChi, host: &Host, config: &OperatorConfig) -> Service {
    let address = &host.address;
    let name = namer::host_service_name(address);
    let labels = host_labels(address);
    let selector = host_selector(address);

    if let Some(template) = &host.service_template {
        let shard_index = address.shard_index.to_string();
        let replica_index = address.replica_index.to_string();
        let name = expand_name(
            template,
            &name,
            &[
                ("{chi}", &chi.name),
                ("{cluster}", &address.cluster_name),
                ("{shard}", &shard_index),
                ("{replica}", &replica_index),
            ],
        );
        return service_from_template(template, name, chi, labels, selector);
    }

    Service {
        metadata: metadata(name, chi, labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector),
            ports: Some(vec![
                port(HTTP_PORT_NAME, config.http_port),
                port(TCP_PORT_NAME, host.port),
                port(INTERSERVER_PORT_NAME, config.interserver_http_port),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn metadata(name: String, chi: &NormalizedChi, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(chi.namespace.clone()),
        labels: Some(labels),
        owner_references: owner_references(chi),
        ..Default::default()
    }
}

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Template metadata and spec with the operator's name, labels and selector on top.
fn service_from_template(
    template: &ServiceTemplate,
    name: String,
    chi: &NormalizedChi,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
) -> Service {
    let mut merged_labels = template.metadata.labels.clone().unwrap_or_default();
    merged_labels.extend(labels);
    let owners: Option<Vec<OwnerReference>> = owner_references(chi);

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(chi.namespace.clone()),
            labels: Some(merged_labels),
            annotations: template.metadata.annotations.clone(),
            owner_references: owners,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ..template.spec.clone()
        }),
        ..Default::default()
    }
}

/// Name from the template's `generateName` pattern, or the default.
fn expand_name(template: &ServiceTemplate, default: &str, macros: &[(&str, &str)]) -> String {
    match template.generate_name.as_deref() {
        Some(pattern) if !pattern.is_empty() => macros
            .iter()
            .fold(pattern.to_string(), |name, (key, value)| {
                name.replace(key, value)
            }),
        _ => default.to_string(),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{ChiCluster, ChiSpec, ChiTemplates, ClickHouseInstallation};
    use crate::model::normalizer::Normalizer;
    use crate::resources::common::LABEL_REPLICA;
    use std::sync::Arc;

    fn normalize(spec: ChiSpec) -> NormalizedChi {
        let chi = ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some("events".to_string()),
                namespace: Some("analytics".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        };
        Normalizer::new(Arc::new(OperatorConfig::default()), ChiTemplates::default())
            .normalize(&chi)
    }

    fn lb_template() -> ServiceTemplate {
        ServiceTemplate {
            name: "lb".to_string(),
            generate_name: Some("service-{chi}-{cluster}".to_string()),
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    "cloud.example.com/internal".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![port("http", 8123)]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_default_chi_service() {
        let chi = normalize(ChiSpec::default());
        let svc = chi_service(&chi, &OperatorConfig::default());

        assert_eq!(svc.metadata.name.as_deref(), Some("clickhouse-events"));
        assert_eq!(svc.metadata.namespace.as_deref(), Some("analytics"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 8123);
        assert_eq!(ports[1].port, 9000);
        assert_eq!(svc.metadata.owner_references.unwrap()[0].uid, "uid-1");
    }

    #[test]
    fn test_cluster_service_absent_without_template() {
        let chi = normalize(ChiSpec::default());
        assert!(cluster_service(&chi, &chi.clusters[0]).is_none());
        assert!(shard_service(&chi, &chi.clusters[0].shards[0]).is_none());
    }

    #[test]
    fn test_cluster_service_from_template() {
        let mut spec = ChiSpec::default();
        spec.templates.service_templates.push(lb_template());
        spec.configuration.clusters.push(ChiCluster {
            name: "main".to_string(),
            templates: crate::crd::TemplateNames {
                cluster_service_template: "lb".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        let chi = normalize(spec);

        let svc = cluster_service(&chi, &chi.clusters[0]).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("service-events-main"));
        assert_eq!(
            svc.metadata
                .annotations
                .unwrap()
                .get("cloud.example.com/internal")
                .unwrap(),
            "true"
        );
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.unwrap().get("clickhouse.altinity.com/cluster").unwrap(),
            "main"
        );
    }

    #[test]
    fn test_host_service_is_headless() {
        let chi = normalize(ChiSpec::default());
        let host = chi.hosts().next().unwrap();
        let svc = host_service(&chi, host, &OperatorConfig::default());

        assert_eq!(svc.metadata.name.as_deref(), Some("chi-events-cluster-0-0"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.as_ref().unwrap().len(), 3);
        assert_eq!(spec.selector.unwrap().get(LABEL_REPLICA).unwrap(), "0");
    }
}
