// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for clickhouse-operator.
//!
//! Uses proptest to generate random topologies and template sets and
//! verify the diff and merge invariants.

#[path = "../common/mod.rs"]
mod common;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use clickhouse_operator::config::OperatorConfig;
use clickhouse_operator::controller::Change;
use clickhouse_operator::crd::{ChiTemplates, ServiceTemplate};
use clickhouse_operator::model::templates::{merge_named, merge_template};
use clickhouse_operator::model::{ActionPlan, NormalizedChi, Normalizer, PlanNode, namer};
use common::fixtures::ChiBuilder;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Strategy for cluster layouts: (shards, replicas) per cluster.
fn layouts() -> impl Strategy<Value = Vec<(i32, i32)>> {
    prop::collection::vec((1..=4i32, 1..=3i32), 1..=3)
}

fn tree_named(prefix: &str, layouts: &[(i32, i32)]) -> NormalizedChi {
    let builder = layouts
        .iter()
        .enumerate()
        .fold(ChiBuilder::new("events"), |b, (i, (shards, replicas))| {
            b.cluster(format!("{prefix}{i}"), *shards, *replicas)
        });
    Normalizer::new(Arc::new(OperatorConfig::default()), ChiTemplates::default())
        .normalize(&builder.build())
}

fn tree(layouts: &[(i32, i32)]) -> NormalizedChi {
    tree_named("c", layouts)
}

type HostKey = (String, usize, usize);

fn host_keys(nodes: Vec<PlanNode<'_>>) -> Vec<HostKey> {
    nodes
        .into_iter()
        .filter_map(|node| match node {
            PlanNode::Host(h) => Some(h.address.key()),
            _ => None,
        })
        .collect()
}

fn service_template(name: &str, type_: Option<&str>, affinity: Option<&str>) -> ServiceTemplate {
    ServiceTemplate {
        name: name.to_string(),
        generate_name: None,
        metadata: ObjectMeta::default(),
        spec: ServiceSpec {
            type_: type_.map(String::from),
            session_affinity: affinity.map(String::from),
            ..Default::default()
        },
    }
}

/// Strategy for template lists with unique names.
fn service_templates() -> impl Strategy<Value = Vec<ServiceTemplate>> {
    prop::collection::btree_set("[a-h]", 0..=5).prop_map(|names: BTreeSet<String>| {
        names
            .iter()
            .map(|n| service_template(n, Some("ClusterIP"), None))
            .collect()
    })
}

proptest! {
    /// Property: Diffing a tree against itself finds nothing to do.
    #[test]
    fn test_self_diff_is_empty(layouts in layouts()) {
        let t = tree(&layouts);
        let plan = ActionPlan::new(&t, &t);
        prop_assert!(plan.is_no_changes());
        prop_assert!(!plan.has_content_changes());
    }

    /// Property: Every host only in the new tree is added exactly once
    /// and never removed.
    #[test]
    fn test_new_hosts_are_added_once(old in layouts(), new in layouts()) {
        let old = tree(&old);
        let new = tree(&new);
        let plan = ActionPlan::new(&old, &new);

        let existing: HashSet<HostKey> = old.hosts().map(|h| h.address.key()).collect();
        let added = host_keys(plan.added_nodes());
        let removed = host_keys(plan.removed_nodes());

        for host in new.hosts() {
            let key = host.address.key();
            if existing.contains(&key) {
                continue;
            }
            prop_assert_eq!(added.iter().filter(|k| **k == key).count(), 1);
            prop_assert!(!removed.contains(&key));
        }
    }

    /// Property: Added minus removed hosts equals the change in host count.
    #[test]
    fn test_host_balance(old in layouts(), new in layouts()) {
        let old = tree(&old);
        let new = tree(&new);
        let plan = ActionPlan::new(&old, &new);

        prop_assert_eq!(
            old.hosts_count() + plan.added_hosts_num(),
            new.hosts_count() + plan.removed_hosts_num()
        );
    }

    /// Property: Identity is positional, so renamed clusters are replaced.
    #[test]
    fn test_renamed_clusters_are_replaced(layouts in layouts()) {
        let old = tree_named("a", &layouts);
        let new = tree_named("b", &layouts);
        let plan = ActionPlan::new(&old, &new);

        prop_assert!(!plan.is_no_changes());
        prop_assert_eq!(plan.removed.clusters.len(), layouts.len());
        prop_assert_eq!(plan.added.clusters.len(), layouts.len());
        prop_assert_eq!(plan.removed_hosts_num(), old.hosts_count());
        prop_assert_eq!(plan.added_hosts_num(), new.hosts_count());
    }

    /// Property: Host object names never collide within an installation.
    #[test]
    fn test_host_names_unique(layouts in layouts()) {
        let t = tree(&layouts);
        let names: HashSet<String> = t.hosts().map(|h| namer::statefulset_name(&h.address)).collect();
        prop_assert_eq!(names.len(), t.hosts_count());
        prop_assert!(t.is_normalized());
    }

    /// Property: Merging keeps destination order and appends new names.
    #[test]
    fn test_merge_named_is_union(
        destination in service_templates(),
        source in service_templates()
    ) {
        let merged = merge_named(&destination, &source);
        let names: Vec<&str> = merged.iter().map(|t| t.name.as_str()).collect();

        let expected: Vec<&str> = destination
            .iter()
            .map(|t| t.name.as_str())
            .chain(
                source
                    .iter()
                    .map(|t| t.name.as_str())
                    .filter(|n| !destination.iter().any(|d| d.name == *n)),
            )
            .collect();
        prop_assert_eq!(names, expected);
    }

    /// Property: Merging an empty list changes nothing.
    #[test]
    fn test_merge_empty_is_identity(templates in service_templates()) {
        let empty: Vec<ServiceTemplate> = Vec::new();
        prop_assert_eq!(merge_named(&templates, &empty), templates.clone());
        prop_assert_eq!(merge_named(&empty, &templates), templates);
    }

    /// Property: Source fields override, unset source fields keep the destination.
    #[test]
    fn test_merge_template_overrides_set_fields(
        old_type in "[A-Za-z]{1,10}",
        new_type in "[A-Za-z]{1,10}",
        affinity in "[A-Za-z]{1,10}"
    ) {
        let destination = service_template("x", Some(&old_type), Some(&affinity));
        let source = service_template("x", Some(&new_type), None);

        let merged = merge_template(&destination, &source);
        prop_assert_eq!(merged.spec.type_, Some(new_type));
        prop_assert_eq!(merged.spec.session_affinity, Some(affinity));
    }

    /// Property: A burst of changes ending in a delete coalesces to that delete.
    #[test]
    fn test_coalesce_ends_in_delete(updates in prop::collection::vec(any::<u32>(), 0..5), last in any::<u32>()) {
        let mut change = Change::Add(0u32);
        let mut previous = 0u32;
        for value in updates {
            change = change.coalesce(Change::Update { old: previous, new: value });
            previous = value;
        }
        change = change.coalesce(Change::Delete(last));
        prop_assert_eq!(change, Change::Delete(last));
    }

    /// Property: Updates coalesce to the oldest old and the newest new.
    #[test]
    fn test_coalesce_spans_updates(values in prop::collection::vec(any::<u32>(), 2..6)) {
        let mut change = Change::Update { old: values[0], new: values[1] };
        for pair in values.windows(2).skip(1) {
            change = change.coalesce(Change::Update { old: pair[0], new: pair[1] });
        }
        prop_assert_eq!(
            change,
            Change::Update { old: values[0], new: *values.last().unwrap() }
        );
    }
}
