//! Custom Resource Definitions (CRDs) for clickhouse-operator.
//!
//! - `ClickHouseInstallation`: a clustered ClickHouse deployment
//! - `ClickHouseInstallationTemplate`: templates shared by installations
//! - `ClickHouseOperatorConfiguration`: in-cluster operator config

mod clickhouse_installation;
mod installation_template;
mod operator_configuration;

pub use clickhouse_installation::*;
pub use installation_template::*;
pub use operator_configuration::*;
