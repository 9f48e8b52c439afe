//! Template, operator configuration and cache-invalidation items, plus the
//! queue-driven worker loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clickhouse_operator::client::clickhouse::DROP_DNS_CACHE_SQL;
use clickhouse_operator::config::OperatorConfig;
use clickhouse_operator::controller::{Change, ChangeItem, WorkQueue};
use clickhouse_operator::crd::{
    ChiTemplates, ChitSpec, ChopConfSpec, ClickHouseInstallationTemplate,
    ClickHouseOperatorConfiguration, ServiceTemplate,
};
use clickhouse_operator::controller::Error;
use clickhouse_operator::resources::common::{LABEL_APP, LABEL_APP_VALUE, LABEL_CHI, LABEL_CLUSTER};
use clickhouse_operator::run_worker;
use k8s_openapi::api::core::v1::{Endpoints, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::common::fixtures::ChiBuilder;
use crate::{Harness, KubeCall, RecordingKube, RecordingSql, add_item, fqdn};

fn template(services: &[&str]) -> Arc<ClickHouseInstallationTemplate> {
    let mut chit = ClickHouseInstallationTemplate::new(
        "shared",
        ChitSpec {
            templates: ChiTemplates {
                service_templates: services
                    .iter()
                    .map(|name| ServiceTemplate {
                        name: name.to_string(),
                        generate_name: None,
                        metadata: ObjectMeta::default(),
                        spec: ServiceSpec::default(),
                    })
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    chit.metadata.namespace = Some("ops".to_string());
    Arc::new(chit)
}

fn operator_config(config: OperatorConfig) -> Arc<ClickHouseOperatorConfiguration> {
    let mut chop = ClickHouseOperatorConfiguration::new("chop", ChopConfSpec { config });
    chop.metadata.namespace = Some("ops".to_string());
    Arc::new(chop)
}

fn endpoints(chi: Option<&str>) -> Arc<Endpoints> {
    let mut labels = BTreeMap::from([(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string())]);
    if let Some(chi) = chi {
        labels.insert(LABEL_CHI.to_string(), chi.to_string());
    }
    Arc::new(Endpoints {
        metadata: ObjectMeta {
            name: Some("chi-events-main-0-0".to_string()),
            namespace: Some("analytics".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn cluster_meta(cluster: &str) -> ObjectMeta {
    let mut meta = endpoints(Some("events")).metadata.clone();
    if let Some(labels) = meta.labels.as_mut() {
        labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    }
    meta
}

fn two_cluster_harness() -> Harness {
    let chi = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, 2)
        .cluster("backup", 1, 1)
        .build();
    Harness::new(
        RecordingKube::new().with_installation(chi),
        RecordingSql::new(),
    )
}

#[tokio::test]
async fn test_template_add_and_delete() {
    let h = Harness::default();
    let chit = template(&["shared-svc"]);

    h.worker
        .process_item(ChangeItem::Template(Change::Add(chit.clone())))
        .await
        .unwrap();
    assert_eq!(h.ctx().templates.len(), 1);

    h.worker
        .process_item(ChangeItem::Template(Change::Delete(chit)))
        .await
        .unwrap();
    assert!(h.ctx().templates.is_empty());
}

#[tokio::test]
async fn test_template_service_used_by_installation() {
    let h = Harness::default();
    h.worker
        .process_item(ChangeItem::Template(Change::Add(template(&["shared-svc"]))))
        .await
        .unwrap();

    let chi = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster_with_service("main", 1, 1, "shared-svc")
        .build();
    h.worker.process_item(add_item(chi)).await.unwrap();

    assert!(
        h.kube
            .applied_names()
            .contains(&"cluster-events-main".to_string())
    );
}

#[tokio::test]
async fn test_operator_config_override_and_reset() {
    let h = Harness::default();
    let custom = OperatorConfig {
        clickhouse_image: "clickhouse/clickhouse-server:24.3".to_string(),
        ..Default::default()
    };

    h.worker
        .process_item(ChangeItem::OperatorConfig(Change::Add(operator_config(
            custom,
        ))))
        .await
        .unwrap();
    assert_eq!(
        h.ctx().config.current().clickhouse_image,
        "clickhouse/clickhouse-server:24.3"
    );

    h.worker
        .process_item(ChangeItem::OperatorConfig(Change::Delete(operator_config(
            OperatorConfig::default(),
        ))))
        .await
        .unwrap();
    assert_eq!(
        h.ctx().config.current().clickhouse_image,
        OperatorConfig::default().clickhouse_image
    );
}

#[tokio::test]
async fn test_invalid_operator_config_is_rejected() {
    let h = Harness::default();
    let invalid = OperatorConfig {
        reconcile_workers: 0,
        clickhouse_image: "broken".to_string(),
        ..Default::default()
    };

    let result = h
        .worker
        .process_item(ChangeItem::OperatorConfig(Change::Add(operator_config(
            invalid,
        ))))
        .await;

    assert!(result.is_err());
    assert_eq!(
        h.ctx().config.current().clickhouse_image,
        OperatorConfig::default().clickhouse_image
    );
}

#[tokio::test]
async fn test_cache_invalidation_drops_dns_cache_on_every_host() {
    let chi = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, 2)
        .build();
    let h = Harness::new(
        RecordingKube::new().with_installation(chi),
        RecordingSql::new(),
    );

    h.worker
        .process_item(ChangeItem::CacheInvalidation(endpoints(Some("events"))))
        .await
        .unwrap();

    assert_eq!(
        h.sql.executed(),
        vec![
            (fqdn("events", "main", 0, 0), DROP_DNS_CACHE_SQL.to_string()),
            (fqdn("events", "main", 0, 1), DROP_DNS_CACHE_SQL.to_string()),
        ]
    );
}

#[tokio::test]
async fn test_cache_invalidation_scoped_to_labelled_cluster() {
    let h = two_cluster_harness();
    let endpoints = Arc::new(Endpoints {
        metadata: cluster_meta("backup"),
        ..Default::default()
    });

    h.worker
        .process_item(ChangeItem::CacheInvalidation(endpoints))
        .await
        .unwrap();

    assert_eq!(
        h.sql.executed(),
        vec![(fqdn("events", "backup", 0, 0), DROP_DNS_CACHE_SQL.to_string())]
    );
}

#[tokio::test]
async fn test_cache_invalidation_for_unknown_cluster() {
    let h = two_cluster_harness();
    let endpoints = Arc::new(Endpoints {
        metadata: cluster_meta("gone"),
        ..Default::default()
    });

    h.worker
        .process_item(ChangeItem::CacheInvalidation(endpoints))
        .await
        .unwrap();

    assert!(h.sql.calls().is_empty());
}

#[tokio::test]
async fn test_cluster_from_object_meta() {
    let h = two_cluster_harness();

    let cluster = h
        .worker
        .cluster_from_object_meta(&cluster_meta("main"))
        .await
        .unwrap();
    assert_eq!(cluster.address.cluster_name, "main");
    assert_eq!(cluster.hosts().count(), 2);

    let unlabelled = h
        .worker
        .cluster_from_object_meta(&endpoints(Some("events")).metadata)
        .await;
    assert!(matches!(unlabelled, Err(Error::NotFound(_))));

    let unknown = h
        .worker
        .cluster_from_object_meta(&cluster_meta("gone"))
        .await;
    assert!(matches!(unknown, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_cache_invalidation_for_missing_installation() {
    let h = Harness::default();

    h.worker
        .process_item(ChangeItem::CacheInvalidation(endpoints(Some("gone"))))
        .await
        .unwrap();

    assert!(h.sql.calls().is_empty());
}

#[tokio::test]
async fn test_cache_invalidation_for_unlabelled_endpoints() {
    let h = Harness::default();

    h.worker
        .process_item(ChangeItem::CacheInvalidation(endpoints(None)))
        .await
        .unwrap();

    assert!(!h.kube.calls().iter().any(|c| matches!(c, KubeCall::Get(_))));
    assert!(h.sql.calls().is_empty());
}

#[tokio::test]
async fn test_worker_loop_drains_queue() {
    let h = Harness::default();
    let queue = Arc::new(WorkQueue::new());
    let chi = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, 1)
        .build();
    assert!(queue.add(add_item(chi)));

    let handle = tokio::spawn(run_worker(0, h.worker.clone(), queue.clone(), None));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.kube.statuses().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.shut_down();
    handle.await.unwrap();

    assert!(queue.is_empty());
    assert_eq!(h.kube.applied().len(), 6);
    assert!(!queue.add(ChangeItem::CacheInvalidation(endpoints(None))));
}
