//! ClickHouseInstallationTemplate Custom Resource Definition.
//!
//! A CHIT has the same shape as an installation. Only its `templates`
//! are consumed: they join the operator-level template set that every
//! installation is normalized against.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ChiConfiguration, ChiDefaults, ChiTemplates};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clickhouse.altinity.com",
    version = "v1",
    kind = "ClickHouseInstallationTemplate",
    plural = "clickhouseinstallationtemplates",
    shortname = "chit",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ChitSpec {
    #[serde(default)]
    pub defaults: ChiDefaults,

    #[serde(default)]
    pub configuration: ChiConfiguration,

    #[serde(default)]
    pub templates: ChiTemplates,
}
