// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for clickhouse-operator.
//!
//! These tests run without a Kubernetes cluster and exercise the public
//! model and resource-generation API in isolation.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use clickhouse_operator::config::OperatorConfig;
use clickhouse_operator::crd::{ChiTemplates, ClickHouseInstallation};
use clickhouse_operator::model::{NormalizedChi, Normalizer};

fn normalize(chi: &ClickHouseInstallation) -> NormalizedChi {
    Normalizer::new(Arc::new(OperatorConfig::default()), ChiTemplates::default()).normalize(chi)
}

mod crd_tests {
    use clickhouse_operator::crd::{ChiPhase, ClickHouseInstallation};

    #[test]
    fn test_phase_display() {
        assert_eq!(ChiPhase::New.to_string(), "New");
        assert_eq!(ChiPhase::InProgress.to_string(), "InProgress");
        assert_eq!(ChiPhase::Completed.to_string(), "Completed");
        assert_eq!(ChiPhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ChiPhase::default(), ChiPhase::New);
    }

    #[test]
    fn test_installation_from_yaml() {
        let chi: ClickHouseInstallation = serde_yaml::from_str(
            r#"
apiVersion: clickhouse.altinity.com/v1
kind: ClickHouseInstallation
metadata:
  name: analytics
  namespace: data
spec:
  configuration:
    zookeeper:
      nodes:
        - host: zookeeper.zoo
    users:
      reader/password: secret
    clusters:
      - name: events
        layout:
          shardsCount: 2
          replicasCount: 3
"#,
        )
        .unwrap();

        let configuration = &chi.spec.configuration;
        assert_eq!(configuration.zookeeper.nodes[0].host, "zookeeper.zoo");
        assert_eq!(configuration.zookeeper.nodes[0].port, 2181);
        assert_eq!(configuration.users["reader/password"], "secret");
        assert_eq!(configuration.clusters[0].layout.shards_count, Some(2));
        assert_eq!(configuration.clusters[0].layout.replicas_count, Some(3));
    }
}

mod normalizer_tests {
    use super::{common::fixtures::ChiBuilder, normalize};
    use clickhouse_operator::model::normalizer::{CLICKHOUSE_CONTAINER_NAME, DEFAULT_CLUSTER_NAME};

    #[test]
    fn test_layout_expands_to_hosts() {
        let chi = normalize(&ChiBuilder::new("events").cluster("main", 2, 3).build());

        assert_eq!(chi.clusters.len(), 1);
        assert_eq!(chi.shards_count(), 2);
        assert_eq!(chi.hosts_count(), 6);
        assert!(chi.is_normalized());

        let host = &chi.clusters[0].shards[1].hosts[2];
        assert_eq!(host.address.cluster_name, "main");
        assert_eq!(host.address.shard_index, 1);
        assert_eq!(host.address.replica_index, 2);
        assert_eq!(host.port, 9000);
    }

    #[test]
    fn test_installation_without_clusters_gets_default_cluster() {
        let chi = normalize(&ChiBuilder::new("events").build());

        assert_eq!(chi.clusters.len(), 1);
        assert_eq!(chi.clusters[0].address.cluster_name, DEFAULT_CLUSTER_NAME);
        assert_eq!(chi.hosts_count(), 1);
    }

    #[test]
    fn test_hosts_get_default_pod_template() {
        let chi = normalize(&ChiBuilder::new("events").cluster("main", 1, 1).build());
        let host = chi.hosts().next().unwrap();

        let container = &host.pod_template.spec.containers[0];
        assert_eq!(container.name, CLICKHOUSE_CONTAINER_NAME);
        assert!(container.image.is_some());
    }

    #[test]
    fn test_normalize_is_stable() {
        let declared = ChiBuilder::new("events").cluster("main", 2, 2).build();
        assert_eq!(normalize(&declared), normalize(&declared));
    }
}

mod namer_tests {
    use super::{common::fixtures::ChiBuilder, normalize};
    use clickhouse_operator::model::namer;

    #[test]
    fn test_host_object_names() {
        let chi = normalize(
            &ChiBuilder::new("events")
                .namespace("analytics")
                .cluster("main", 2, 2)
                .build(),
        );
        let address = &chi.clusters[0].shards[1].hosts[0].address;

        assert_eq!(namer::statefulset_name(address), "chi-events-main-1-0");
        assert_eq!(namer::host_service_name(address), "chi-events-main-1-0");
        assert_eq!(namer::pod_hostname(address), "chi-events-main-1-0-0");
        assert_eq!(
            namer::host_fqdn(address),
            "chi-events-main-1-0.analytics.svc.cluster.local"
        );
        assert_eq!(
            namer::host_config_map_name(address),
            "chi-events-deploy-confd-main-1-0"
        );
    }

    #[test]
    fn test_installation_object_names() {
        assert_eq!(namer::chi_service_name("events"), "clickhouse-events");
        assert_eq!(
            namer::chi_service_fqdn("analytics", "events"),
            "clickhouse-events.analytics.svc.cluster.local"
        );
        assert_eq!(
            namer::common_config_map_name("events"),
            "chi-events-common-configd"
        );
        assert_eq!(
            namer::users_config_map_name("events"),
            "chi-events-common-usersd"
        );
    }
}

mod action_plan_tests {
    use super::{common::fixtures::ChiBuilder, normalize};
    use clickhouse_operator::model::{ActionPlan, NormalizedChi, PlanNode};

    fn chi(clusters: &[(&str, i32, i32)]) -> NormalizedChi {
        let builder = clusters
            .iter()
            .fold(ChiBuilder::new("events"), |b, (name, shards, replicas)| {
                b.cluster(*name, *shards, *replicas)
            });
        normalize(&builder.build())
    }

    fn describe(nodes: Vec<PlanNode<'_>>) -> Vec<String> {
        nodes
            .into_iter()
            .map(|node| match node {
                PlanNode::Cluster(c) => format!("cluster {}", c.address.cluster_name),
                PlanNode::Shard(s) => {
                    format!("shard {}/{}", s.address.cluster_name, s.address.shard_index)
                }
                PlanNode::Host(h) => format!(
                    "host {}/{}/{}",
                    h.address.cluster_name, h.address.shard_index, h.address.replica_index
                ),
            })
            .collect()
    }

    #[test]
    fn test_identical_trees_have_no_changes() {
        let plan = ActionPlan::new(&chi(&[("main", 2, 2)]), &chi(&[("main", 2, 2)]));
        assert!(plan.is_no_changes());
        assert!(!plan.has_content_changes());
    }

    #[test]
    fn test_creation_adds_everything_parents_first() {
        let empty = NormalizedChi::empty("default", "events");
        let plan = ActionPlan::new(&empty, &chi(&[("main", 2, 2)]));

        assert_eq!(plan.added_hosts_num(), 4);
        assert_eq!(
            describe(plan.added_nodes()),
            vec![
                "cluster main",
                "shard main/0",
                "host main/0/0",
                "host main/0/1",
                "shard main/1",
                "host main/1/0",
                "host main/1/1",
            ]
        );
    }

    #[test]
    fn test_removal_mirrors_creation() {
        let empty = NormalizedChi::empty("default", "events");
        let plan = ActionPlan::new(&chi(&[("main", 2, 2)]), &empty);

        assert_eq!(plan.removed_hosts_num(), 4);
        assert_eq!(
            describe(plan.removed_nodes()),
            vec![
                "host main/0/0",
                "host main/0/1",
                "host main/1/0",
                "host main/1/1",
                "shard main/0",
                "shard main/1",
                "cluster main",
            ]
        );
    }

    #[test]
    fn test_scale_in_removes_children_first() {
        let plan = ActionPlan::new(&chi(&[("main", 2, 2)]), &chi(&[("main", 1, 1)]));

        assert_eq!(plan.removed_hosts_num(), 3);
        assert_eq!(
            describe(plan.removed_nodes()),
            vec![
                "host main/0/1",
                "host main/1/0",
                "host main/1/1",
                "shard main/1",
            ]
        );
    }

    #[test]
    fn test_removed_cluster_follows_its_shards() {
        let plan = ActionPlan::new(
            &chi(&[("main", 1, 1), ("archive", 1, 1)]),
            &chi(&[("main", 1, 1)]),
        );

        assert_eq!(
            describe(plan.removed_nodes()),
            vec!["host archive/0/0", "shard archive/0", "cluster archive"]
        );
    }
}

mod resources_tests {
    use super::{common::fixtures::ChiBuilder, normalize};
    use clickhouse_operator::config::OperatorConfig;
    use clickhouse_operator::resources::config_maps::{
        self, MACROS_FILE, REMOTE_SERVERS_FILE, SETTINGS_FILE, USERS_FILE, ZOOKEEPER_FILE,
    };
    use clickhouse_operator::resources::{services, statefulset};

    #[test]
    fn test_common_config_map_contents() {
        let config = OperatorConfig::default();
        let without_zookeeper = normalize(&ChiBuilder::new("events").cluster("main", 1, 1).build());
        let data = config_maps::common_config_map(&without_zookeeper, &config)
            .data
            .unwrap();
        assert!(data.contains_key(REMOTE_SERVERS_FILE));
        assert!(data.contains_key(SETTINGS_FILE));
        assert!(!data.contains_key(ZOOKEEPER_FILE));

        let with_zookeeper = normalize(
            &ChiBuilder::new("events")
                .cluster("main", 1, 1)
                .zookeeper("zookeeper.zoo")
                .setting("max_connections", "2048")
                .build(),
        );
        let data = config_maps::common_config_map(&with_zookeeper, &config)
            .data
            .unwrap();
        assert!(data[ZOOKEEPER_FILE].contains("<host>zookeeper.zoo</host>"));
        assert!(data[SETTINGS_FILE].contains("<max_connections>2048</max_connections>"));
    }

    #[test]
    fn test_remote_servers_lists_every_host() {
        let chi = normalize(
            &ChiBuilder::new("events")
                .namespace("analytics")
                .cluster("main", 2, 1)
                .build(),
        );
        let xml = config_maps::remote_servers_xml(&chi);

        assert!(xml.starts_with("<yandex>"));
        assert_eq!(xml.matches("<shard>").count(), 2);
        assert!(xml.contains("<host>chi-events-main-0-0.analytics.svc.cluster.local</host>"));
        assert!(xml.contains("<host>chi-events-main-1-0.analytics.svc.cluster.local</host>"));
    }

    #[test]
    fn test_users_include_operator_user() {
        let config = OperatorConfig::default();
        let chi = normalize(
            &ChiBuilder::new("events")
                .cluster("main", 1, 1)
                .user("reader/password", "secret")
                .build(),
        );
        let data = config_maps::users_config_map(&chi, &config).data.unwrap();

        assert!(data[USERS_FILE].contains("<reader>"));
        assert!(data[USERS_FILE].contains(&format!("<{}>", config.ch_username)));
    }

    #[test]
    fn test_host_macros() {
        let chi = normalize(&ChiBuilder::new("events").cluster("main", 2, 1).build());
        let host = &chi.clusters[0].shards[1].hosts[0];
        let data = config_maps::host_config_map(&chi, host).data.unwrap();

        let macros = &data[MACROS_FILE];
        assert!(macros.contains("<installation>events</installation>"));
        assert!(macros.contains("<shard>1</shard>"));
        assert!(macros.contains("<replica>chi-events-main-1-0</replica>"));
    }

    #[test]
    fn test_host_statefulset_shape() {
        let config = OperatorConfig::default();
        let chi = normalize(&ChiBuilder::new("events").cluster("main", 1, 1).build());
        let host = chi.hosts().next().unwrap();

        let sts = statefulset::host_statefulset(&chi, host, &config);
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name.as_deref(), Some("chi-events-main-0-0"));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.volumes.unwrap().len(), 3);
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == config_maps::CONFD_PATH));
        assert!(spec.volume_claim_templates.is_none());
    }

    #[test]
    fn test_host_service_is_headless() {
        let config = OperatorConfig::default();
        let chi = normalize(&ChiBuilder::new("events").cluster("main", 1, 1).build());
        let host = chi.hosts().next().unwrap();

        let spec = services::host_service(&chi, host, &config).spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_cluster_service_only_from_template() {
        let plain = normalize(&ChiBuilder::new("events").cluster("main", 1, 1).build());
        assert!(services::cluster_service(&plain, &plain.clusters[0]).is_none());

        let templated = normalize(
            &ChiBuilder::new("events")
                .cluster_with_service("main", 1, 1, "cluster-svc")
                .service_template("cluster-svc")
                .build(),
        );
        let service = services::cluster_service(&templated, &templated.clusters[0]).unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("cluster-events-main"));
    }
}

mod config_tests {
    use clickhouse_operator::config::OperatorConfig;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = OperatorConfig::from_yaml(
            r#"
watchNamespaces: [analytics]
reconcileWorkers: 4
"#,
        )
        .unwrap();

        assert_eq!(config.watch_namespaces, vec!["analytics"]);
        assert_eq!(config.reconcile_workers, 4);
        assert_eq!(config.ch_port, OperatorConfig::default().ch_port);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let config = OperatorConfig {
            reconcile_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
