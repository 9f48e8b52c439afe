//! Removed hosts and removed installations.

use clickhouse_operator::client::{ResourceKind, ResourceRef};
use clickhouse_operator::controller::worker::{REASON_DELETE_COMPLETED, REASON_DELETE_STARTED};
use clickhouse_operator::crd::ChiPhase;
use clickhouse_operator::model::ChiRef;

use crate::common::fixtures::ChiBuilder;
use crate::{
    DROP_TABLE_DDL, Harness, KubeCall, RecordingKube, RecordingSql, add_item, delete_item, fqdn,
    update_item,
};

fn events(replicas: i32) -> ChiBuilder {
    ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, replicas)
}

fn host_objects(shard: usize, replica: usize) -> Vec<ResourceRef> {
    let suffix = format!("main-{shard}-{replica}");
    vec![
        ResourceRef::new(
            ResourceKind::StatefulSet,
            "analytics",
            format!("chi-events-{suffix}"),
        ),
        ResourceRef::new(
            ResourceKind::PersistentVolumeClaim,
            "analytics",
            format!("data-{shard}-{replica}"),
        ),
        ResourceRef::new(
            ResourceKind::ConfigMap,
            "analytics",
            format!("chi-events-deploy-confd-{suffix}"),
        ),
        ResourceRef::new(
            ResourceKind::Service,
            "analytics",
            format!("chi-events-{suffix}"),
        ),
    ]
}

#[tokio::test]
async fn test_scale_in_deletes_removed_host() {
    let h = Harness::default();
    let old = events(2).resource_version("1").build();
    let new = events(1).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert_eq!(h.kube.deleted(), host_objects(0, 1));
    assert!(
        h.sql
            .executed()
            .contains(&(fqdn("events", "main", 0, 1), DROP_TABLE_DDL.to_string()))
    );

    let status = h.kube.last_status();
    assert_eq!(status.status, ChiPhase::Completed);
    assert_eq!(status.delete_hosts_count, 1);
    assert_eq!(status.deleted_hosts_count, 1);
    assert_eq!(status.hosts_count, 1);
}

#[tokio::test]
async fn test_removed_host_is_deleted_after_reconcile() {
    let h = Harness::default();
    let old = events(2).resource_version("1").build();
    let new = events(1).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    let calls = h.kube.calls();
    let last_apply = calls
        .iter()
        .rposition(|c| matches!(c, KubeCall::Apply(_)))
        .unwrap();
    let first_delete = calls
        .iter()
        .position(|c| matches!(c, KubeCall::Delete(_)))
        .unwrap();
    assert!(last_apply < first_delete);
}

#[tokio::test]
async fn test_removed_host_cleanup_continues_past_failures() {
    let kube = RecordingKube::new().fail_delete(ResourceKind::StatefulSet, "chi-events-main-0-1");
    let sql = RecordingSql::new().down(fqdn("events", "main", 0, 1));
    let h = Harness::new(kube, sql);
    let old = events(2).resource_version("1").build();
    let new = events(1).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert_eq!(h.kube.deleted(), host_objects(0, 1));
    assert_eq!(h.kube.last_status().status, ChiPhase::Completed);
}

#[tokio::test]
async fn test_removed_cluster_takes_its_service() {
    let h = Harness::default();
    let old = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, 1)
        .cluster_with_service("archive", 1, 1, "cluster-svc")
        .service_template("cluster-svc")
        .resource_version("1")
        .build();
    let new = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", 1, 1)
        .service_template("cluster-svc")
        .resource_version("2")
        .build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    let deleted = h.kube.deleted_names();
    assert_eq!(
        deleted,
        vec![
            "chi-events-archive-0-0",
            "data-0-0",
            "chi-events-deploy-confd-archive-0-0",
            "chi-events-archive-0-0",
            "cluster-events-archive",
        ]
    );
    assert_eq!(h.kube.last_status().hosts_count, 1);
}

#[tokio::test]
async fn test_delete_chi_removes_children_first() {
    let h = Harness::default();
    let chi = ChiBuilder::new("events")
        .namespace("analytics")
        .cluster_with_service("main", 1, 2, "cluster-svc")
        .service_template("cluster-svc")
        .build();

    h.worker.process_item(delete_item(chi)).await.unwrap();

    let mut expected = host_objects(0, 0);
    expected.extend(host_objects(0, 1));
    expected.extend([
        ResourceRef::new(ResourceKind::Service, "analytics", "cluster-events-main"),
        ResourceRef::new(ResourceKind::ConfigMap, "analytics", "chi-events-common-configd"),
        ResourceRef::new(ResourceKind::ConfigMap, "analytics", "chi-events-common-usersd"),
        ResourceRef::new(ResourceKind::Service, "analytics", "clickhouse-events"),
    ]);
    assert_eq!(h.kube.deleted(), expected);

    assert_eq!(
        h.kube.calls().last(),
        Some(&KubeCall::RemoveFinalizer(ChiRef::new("analytics", "events")))
    );
    assert_eq!(
        h.kube.event_reasons(),
        vec![REASON_DELETE_STARTED, REASON_DELETE_COMPLETED]
    );
}

#[tokio::test]
async fn test_delete_chi_continues_past_failures() {
    let kube = RecordingKube::new()
        .fail_delete(ResourceKind::StatefulSet, "chi-events-main-0-0")
        .fail_delete(ResourceKind::ConfigMap, "chi-events-common-configd");
    let sql = RecordingSql::new().down(fqdn("events", "main", 0, 0));
    let h = Harness::new(kube, sql);

    h.worker
        .process_item(delete_item(events(1).build()))
        .await
        .unwrap();

    assert_eq!(
        h.kube.deleted_names(),
        vec![
            "chi-events-main-0-0",
            "data-0-0",
            "chi-events-deploy-confd-main-0-0",
            "chi-events-main-0-0",
            "chi-events-common-configd",
            "chi-events-common-usersd",
            "clickhouse-events",
        ]
    );
}

#[tokio::test]
async fn test_delete_chi_forgets_host_list() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(2).build()))
        .await
        .unwrap();
    let chi = ChiRef::new("analytics", "events");
    assert!(h.ctx().watch.hosts(&chi).is_some());

    h.worker
        .process_item(delete_item(events(2).build()))
        .await
        .unwrap();
    assert_eq!(h.ctx().watch.hosts(&chi), None);
}
