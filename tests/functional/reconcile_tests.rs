//! Creation and update passes.

use clickhouse_operator::client::ResourceKind;
use clickhouse_operator::controller::worker::{
    REASON_CREATE_STARTED, REASON_UPDATE_COMPLETED, REASON_UPDATE_FAILED,
    REASON_UPDATE_IN_PROGRESS,
};
use clickhouse_operator::crd::ChiPhase;
use clickhouse_operator::model::ChiRef;

use crate::common::fixtures::ChiBuilder;
use crate::{
    DATABASE_DDL, DISTRIBUTED_TABLE_DDL, Harness, KubeCall, REPLICATED_TABLE_DDL, RecordingKube,
    RecordingSql, SqlCall, add_item, fqdn, update_item,
};

fn events(shards: i32, replicas: i32) -> ChiBuilder {
    ChiBuilder::new("events")
        .namespace("analytics")
        .cluster("main", shards, replicas)
}

#[tokio::test]
async fn test_create_applies_objects_top_down() {
    let h = Harness::default();
    let chi = events(1, 2).resource_version("1").build();

    h.worker.process_item(add_item(chi)).await.unwrap();

    assert_eq!(
        h.kube.applied_names(),
        vec![
            "clickhouse-events",
            "chi-events-common-configd",
            "chi-events-common-usersd",
            "chi-events-main-0-0",
            "chi-events-deploy-confd-main-0-0",
            "chi-events-main-0-0",
            "chi-events-main-0-1",
            "chi-events-deploy-confd-main-0-1",
            "chi-events-main-0-1",
        ]
    );
    let kinds: Vec<ResourceKind> = h.kube.applied().into_iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Service,
            ResourceKind::ConfigMap,
            ResourceKind::ConfigMap,
            ResourceKind::Service,
            ResourceKind::ConfigMap,
            ResourceKind::StatefulSet,
            ResourceKind::Service,
            ResourceKind::ConfigMap,
            ResourceKind::StatefulSet,
        ]
    );
}

#[tokio::test]
async fn test_each_host_is_ready_before_the_next_starts() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(1, 2).build()))
        .await
        .unwrap();

    let calls = h.kube.calls();
    let ready = calls
        .iter()
        .position(|c| matches!(c, KubeCall::WaitReady(r) if r.name == "chi-events-main-0-0"))
        .unwrap();
    let next_host = calls
        .iter()
        .position(|c| matches!(c, KubeCall::Apply(r) if r.name == "chi-events-main-0-1"))
        .unwrap();
    assert!(ready < next_host);
}

#[tokio::test]
async fn test_create_reports_status_and_events() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(2, 2).generation(3).build()))
        .await
        .unwrap();

    let statuses = h.kube.statuses();
    let first = statuses.first().unwrap();
    assert_eq!(first.status, ChiPhase::InProgress);
    assert_eq!(first.added_hosts_count, 4);
    assert_eq!(first.delete_hosts_count, 0);
    assert_eq!(first.observed_generation, Some(3));

    let last = h.kube.last_status();
    assert_eq!(last.status, ChiPhase::Completed);
    assert_eq!(last.clusters_count, 1);
    assert_eq!(last.shards_count, 2);
    assert_eq!(last.hosts_count, 4);
    assert_eq!(last.updated_hosts_count, 4);
    assert_eq!(
        last.endpoint.as_deref(),
        Some("clickhouse-events.analytics.svc.cluster.local")
    );

    assert_eq!(
        h.kube.event_reasons(),
        vec![
            REASON_CREATE_STARTED,
            REASON_UPDATE_IN_PROGRESS,
            // cluster, two shards, four replicas
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_IN_PROGRESS,
            REASON_UPDATE_COMPLETED,
        ]
    );
}

fn topology_notes(h: &Harness) -> Vec<String> {
    h.kube
        .event_notes()
        .into_iter()
        .filter(|n| n.starts_with("Added") || n.starts_with("Removing"))
        .collect()
}

#[tokio::test]
async fn test_added_shards_and_replicas_are_announced() {
    let h = Harness::default();
    let old = events(1, 1).resource_version("1").build();
    let new = events(2, 2).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert_eq!(
        topology_notes(&h),
        vec![
            "Added shard 1 to cluster main",
            "Added replica 0 to shard 1 in cluster main",
            "Added replica 1 to shard 1 in cluster main",
            "Added replica 1 to shard 0 in cluster main",
        ]
    );
}

#[tokio::test]
async fn test_new_cluster_is_announced_top_down() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(2, 1).build()))
        .await
        .unwrap();

    assert_eq!(
        topology_notes(&h),
        vec![
            "Added cluster main",
            "Added shard 0 to cluster main",
            "Added replica 0 to shard 0 in cluster main",
            "Added shard 1 to cluster main",
            "Added replica 0 to shard 1 in cluster main",
        ]
    );
}

#[tokio::test]
async fn test_removed_replica_is_announced() {
    let h = Harness::default();
    let old = events(1, 2).resource_version("1").build();
    let new = events(1, 1).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert_eq!(
        topology_notes(&h),
        vec!["Removing replica 1 from shard 0 in cluster main"]
    );
}

#[tokio::test]
async fn test_create_publishes_host_list() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(1, 2).build()))
        .await
        .unwrap();

    assert_eq!(
        h.ctx().watch.hosts(&ChiRef::new("analytics", "events")),
        Some(vec![fqdn("events", "main", 0, 0), fqdn("events", "main", 0, 1)])
    );
}

#[tokio::test]
async fn test_schema_created_on_added_hosts() {
    let h = Harness::default();
    h.worker
        .process_item(add_item(events(1, 2).build()))
        .await
        .unwrap();

    let host0 = fqdn("events", "main", 0, 0);
    let host1 = fqdn("events", "main", 0, 1);

    // Replicated objects for the first host are read from its peer.
    let first = h.sql.calls().into_iter().next().unwrap();
    assert!(matches!(first, SqlCall::Query { .. }));
    assert_eq!(first.host(), host1);

    let on = |host: &str| -> Vec<String> {
        h.sql
            .executed()
            .into_iter()
            .filter(|(target, _)| target == host)
            .map(|(_, sql)| sql)
            .collect()
    };
    let expected = vec![
        DATABASE_DDL,
        REPLICATED_TABLE_DDL,
        DATABASE_DDL,
        DISTRIBUTED_TABLE_DDL,
        // shard-wide distributed objects
        DATABASE_DDL,
        DISTRIBUTED_TABLE_DDL,
    ];
    assert_eq!(on(&host0), expected);
    assert_eq!(on(&host1), expected);
}

#[tokio::test]
async fn test_schema_failure_does_not_fail_reconcile() {
    let sql = RecordingSql::new()
        .down(fqdn("events", "main", 0, 0))
        .down(fqdn("events", "main", 0, 1));
    let h = Harness::new(RecordingKube::new(), sql);

    h.worker
        .process_item(add_item(events(1, 2).build()))
        .await
        .unwrap();

    assert_eq!(h.kube.last_status().status, ChiPhase::Completed);
    assert!(h.sql.executed().is_empty());
}

#[tokio::test]
async fn test_failed_host_stops_reconcile() {
    let kube = RecordingKube::new().fail_apply(ResourceKind::StatefulSet, "chi-events-main-0-1");
    let h = Harness::new(kube, RecordingSql::new());

    let result = h.worker.process_item(add_item(events(1, 3).build())).await;
    assert!(result.is_err());

    let applied = h.kube.applied_names();
    assert!(!applied.iter().any(|n| n.ends_with("main-0-2")));
    assert!(h.kube.deleted().is_empty());
    assert!(
        !h.kube
            .calls()
            .iter()
            .any(|c| matches!(c, KubeCall::WaitReady(r) if r.name == "chi-events-main-0-1"))
    );

    let status = h.kube.last_status();
    assert_eq!(status.status, ChiPhase::Failed);
    assert_eq!(status.updated_hosts_count, 1);
    assert!(h.sql.calls().is_empty());
    assert_eq!(
        h.kube.event_reasons().last().map(String::as_str),
        Some(REASON_UPDATE_FAILED)
    );
    assert_eq!(h.ctx().watch.hosts(&ChiRef::new("analytics", "events")), None);
}

#[tokio::test]
async fn test_failed_common_object_stops_before_hosts() {
    let kube = RecordingKube::new().fail_apply(ResourceKind::ConfigMap, "chi-events-common-configd");
    let h = Harness::new(kube, RecordingSql::new());

    assert!(h.worker.process_item(add_item(events(1, 1).build())).await.is_err());
    assert_eq!(
        h.kube.applied_names(),
        vec!["clickhouse-events", "chi-events-common-configd"]
    );
    assert_eq!(h.kube.last_status().updated_hosts_count, 0);
}

#[tokio::test]
async fn test_unchanged_resource_version_is_noop() {
    let h = Harness::default();
    let old = events(1, 2).resource_version("7").build();
    let new = events(1, 2).resource_version("7").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert!(h.kube.calls().is_empty());
    assert!(h.sql.calls().is_empty());
    assert_eq!(
        h.ctx()
            .watch
            .hosts(&ChiRef::new("analytics", "events"))
            .map(|hosts| hosts.len()),
        Some(2)
    );
}

#[tokio::test]
async fn test_unchanged_spec_is_noop() {
    let h = Harness::default();
    let old = events(1, 2).resource_version("7").build();
    let new = events(1, 2).resource_version("8").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert!(h.kube.calls().is_empty());
}

#[tokio::test]
async fn test_content_change_reapplies_without_schema() {
    let h = Harness::default();
    let old = events(1, 2).resource_version("1").build();
    let new = events(1, 2)
        .setting("max_connections", "2048")
        .resource_version("2")
        .build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    assert_eq!(h.kube.applied().len(), 9);
    assert!(h.sql.calls().is_empty());
    let status = h.kube.last_status();
    assert_eq!(status.status, ChiPhase::Completed);
    assert_eq!(status.added_hosts_count, 0);
    assert_eq!(status.updated_hosts_count, 2);
}

#[tokio::test]
async fn test_added_shard_gets_schema_only_on_new_host() {
    let h = Harness::default();
    let old = events(1, 1).resource_version("1").build();
    let new = events(2, 1).resource_version("2").build();

    h.worker.process_item(update_item(old, new)).await.unwrap();

    let new_host = fqdn("events", "main", 1, 0);
    let executed = h.sql.executed();
    assert!(!executed.is_empty());
    assert!(executed.iter().all(|(host, _)| *host == new_host));

    // The existing host is the schema source.
    let first = h.sql.calls().into_iter().next().unwrap();
    assert_eq!(first.host(), fqdn("events", "main", 0, 0));

    assert_eq!(h.kube.statuses().first().unwrap().added_hosts_count, 1);
    assert_eq!(h.kube.last_status().hosts_count, 2);
}
