//! StatefulSet generation for ClickHouse hosts.
//!
//! Every host runs as a single-replica StatefulSet:
//! - Stable identity via the host's headless Service
//! - Common, users and host ConfigMaps mounted into every container
//! - Data and log volume claim templates when the host references them
//! - A log sidecar whenever a log volume is present

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, HostAlias, PersistentVolumeClaim, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::config::OperatorConfig;
use crate::crd::VolumeClaimTemplate;
use crate::model::namer;
use crate::model::topology::{Host, NormalizedChi};
use crate::resources::common::{host_labels, host_selector, owner_references};
use crate::resources::config_maps::{CONFD_PATH, CONFIGD_PATH, USERSD_PATH};

pub const DATA_PATH: &str = "/var/lib/clickhouse";
pub const LOG_PATH: &str = "/var/log/clickhouse-server";
pub const LOG_CONTAINER_NAME: &str = "clickhouse-log";

const COMMON_VOLUME: &str = "chi-common-configd";
const USERS_VOLUME: &str = "chi-common-usersd";
const HOST_VOLUME: &str = "chi-deploy-confd";

/// StatefulSet for one host.
pub fn host_statefulset(chi: &NormalizedChi, host: &Host, config: &OperatorConfig) -> StatefulSet {
    let address = &host.address;
    let name = namer::statefulset_name(address);
    let labels = host_labels(address);

    let mut pod_spec = host.pod_template.spec.clone();
    pod_spec.host_aliases = Some(vec![HostAlias {
        ip: "127.0.0.1".to_string(),
        hostnames: Some(vec![namer::pod_hostname(address)]),
    }]);

    // Containers are complete before any mount is added; mounts go to all of them.
    let needs_sidecar = host.log_volume_claim_template.is_some();
    if needs_sidecar && !has_container(&pod_spec, LOG_CONTAINER_NAME) {
        pod_spec.containers.push(log_container(config));
    }

    add_config_map_volumes(&mut pod_spec, chi, host);

    let mut claims = Vec::new();
    if let Some(template) = &host.data_volume_claim_template {
        if mount_claim(&mut pod_spec, template, DATA_PATH) {
            claims.push(claim(template, &labels));
        }
    }
    if let Some(template) = &host.log_volume_claim_template {
        if mount_claim(&mut pod_spec, template, LOG_PATH) {
            claims.push(claim(template, &labels));
        }
    }

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(chi.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: owner_references(chi),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(namer::host_service_name(address)),
            selector: LabelSelector {
                match_labels: Some(host_selector(address)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates: if claims.is_empty() {
                None
            } else {
                Some(claims)
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn add_config_map_volumes(pod_spec: &mut PodSpec, chi: &NormalizedChi, host: &Host) {
    let sources = [
        (COMMON_VOLUME, namer::common_config_map_name(&chi.name), CONFIGD_PATH),
        (USERS_VOLUME, namer::users_config_map_name(&chi.name), USERSD_PATH),
        (HOST_VOLUME, namer::host_config_map_name(&host.address), CONFD_PATH),
    ];

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    for (volume, config_map, _) in &sources {
        volumes.push(Volume {
            name: (*volume).to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    for container in &mut pod_spec.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        for (volume, _, path) in &sources {
            mounts.push(VolumeMount {
                name: (*volume).to_string(),
                mount_path: (*path).to_string(),
                ..Default::default()
            });
        }
    }
}

/// Mount a claim template into every container that does not already use
/// its name or the path. Returns whether any container mounted it.
fn mount_claim(pod_spec: &mut PodSpec, template: &VolumeClaimTemplate, path: &str) -> bool {
    let mut mounted = false;
    for container in &mut pod_spec.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        let taken = mounts
            .iter()
            .any(|m| m.name == template.name || m.mount_path == path);
        if taken {
            mounted |= mounts.iter().any(|m| m.name == template.name);
            continue;
        }
        mounts.push(VolumeMount {
            name: template.name.clone(),
            mount_path: path.to_string(),
            ..Default::default()
        });
        mounted = true;
    }
    mounted
}

fn claim(template: &VolumeClaimTemplate, labels: &BTreeMap<String, String>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(template.name.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(template.spec.clone()),
        ..Default::default()
    }
}

fn has_container(pod_spec: &PodSpec, name: &str) -> bool {
    pod_spec.containers.iter().any(|c| c.name == name)
}

fn log_container(config: &OperatorConfig) -> Container {
    Container {
        name: LOG_CONTAINER_NAME.to_string(),
        image: Some(config.log_container_image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "--".to_string(),
        ]),
        args: Some(vec!["while true; do sleep 30; done;".to_string()]),
        ..Default::default()
    }
}
