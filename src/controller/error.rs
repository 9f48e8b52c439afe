//! Error types for the controller.
//!
//! Reconcile paths propagate these with `?`. Deletion paths collect them
//! and only log.

use thiserror::Error;

use crate::client::clickhouse::SqlError;
use crate::config::ConfigError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// ClickHouse statement failed
    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    /// A referenced object could not be resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external call did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A work item that cannot be processed
    #[error("Unexpected item: {0}")]
    UnexpectedItem(String),

    /// Validation error in a generated or received object
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operator configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Sql(SqlError::Timeout { .. }))
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
