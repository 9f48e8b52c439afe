//! Clients for the two external systems the operator drives.
//!
//! ## Architecture
//!
//! - `kube`: `ResourceClient` over the Kubernetes API (apply, delete, status, events)
//! - `clickhouse`: `SqlClient` over the ClickHouse HTTP interface
//!
//! Both are traits so the worker can be driven by recording fakes in tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use clickhouse_operator::client::{ClickHouseHttpClient, SqlClient};
//!
//! let client = ClickHouseHttpClient::new("clickhouse_operator", "secret", 8123);
//! let rows = client.query("chi-events-main-0-0", "SELECT 1", timeout).await?;
//! ```

pub mod clickhouse;
pub mod kube;

pub use self::clickhouse::{ClickHouseHttpClient, Rows, SqlClient, SqlError};
pub use self::kube::{
    ChiEvent, KubeResourceClient, ResourceClient, ResourceKind, ResourceRef, ResourceSpec,
};
