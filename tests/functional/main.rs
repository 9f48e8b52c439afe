// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the work-item worker.
//!
//! These tests drive `Worker::process_item` against recording fakes of the
//! Kubernetes and ClickHouse clients, WITHOUT a live cluster, and assert on
//! the order of side effects.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_create_applies_objects_top_down
//! ```
//!
//! ## Test Categories
//!
//! - **Reconcile tests**: creation, updates, fail-fast behaviour, schema
//! - **Delete tests**: removed hosts and whole installations
//! - **Item tests**: templates, operator configuration, cache invalidation
//!   and the queue-driven worker loop

#[path = "../common/mod.rs"]
mod common;

mod delete_tests;
mod item_tests;
mod reconcile_tests;

pub use mock_clients::*;

use clickhouse_operator::controller::{Change, ChangeItem};
use clickhouse_operator::crd::ClickHouseInstallation;
use clickhouse_operator::model::ChiSnapshot;

/// Installation item for a newly seen object.
pub fn add_item(chi: ClickHouseInstallation) -> ChangeItem {
    ChangeItem::Installation(Change::Add(ChiSnapshot::from(chi)))
}

/// Installation item for a modified object.
pub fn update_item(old: ClickHouseInstallation, new: ClickHouseInstallation) -> ChangeItem {
    ChangeItem::Installation(Change::Update {
        old: ChiSnapshot::from(old),
        new: ChiSnapshot::from(new),
    })
}

/// Installation item for a removed object.
pub fn delete_item(chi: ClickHouseInstallation) -> ChangeItem {
    ChangeItem::Installation(Change::Delete(ChiSnapshot::from(chi)))
}

/// Address of a host's headless Service.
pub fn fqdn(chi: &str, cluster: &str, shard: usize, replica: usize) -> String {
    format!("chi-{chi}-{cluster}-{shard}-{replica}.analytics.svc.cluster.local")
}
