//! Controller module for clickhouse-operator.
//!
//! Change items flow from the watchers through the [`queue::WorkQueue`] to
//! a pool of [`worker::Worker`]s, which normalize, diff and reconcile.

pub mod common;
pub mod context;
pub mod error;
pub mod informer;
pub mod queue;
pub mod status;
pub mod watch;
pub mod worker;

pub use context::Context;
pub use error::{Error, Result};
pub use queue::{Change, ChangeItem, ChangeOp, WorkQueue};
pub use watch::WatchRegistry;
pub use worker::Worker;
