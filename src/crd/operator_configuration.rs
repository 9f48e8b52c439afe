//! ClickHouseOperatorConfiguration Custom Resource Definition.
//!
//! Lets the operator config be managed in-cluster. The spec is an
//! `OperatorConfig`; the most recent one replaces the file config.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::OperatorConfig;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clickhouse.altinity.com",
    version = "v1",
    kind = "ClickHouseOperatorConfiguration",
    plural = "clickhouseoperatorconfigurations",
    shortname = "chopconf",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ChopConfSpec {
    #[serde(flatten)]
    pub config: OperatorConfig,
}
