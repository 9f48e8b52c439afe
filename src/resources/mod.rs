//! Kubernetes object generation.
//!
//! | Object | Scope | Purpose |
//! |--------|-------|---------|
//! | Service | installation | Client entry point (`clickhouse-<chi>`) |
//! | Service | cluster, shard | Only from a service template |
//! | Service | host | Headless, stable pod DNS |
//! | ConfigMap | installation | `config.d` and `users.d` XML |
//! | ConfigMap | host | `conf.d` macros |
//! | StatefulSet | host | One pod with its volume claims |

pub mod common;
pub mod config_maps;
pub mod services;
pub mod statefulset;

pub use common::{owner_reference, owner_references};
