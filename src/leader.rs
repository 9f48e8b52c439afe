//! Lease-based leader election on `coordination.k8s.io/v1`.
//!
//! The holder renews by stamping the current epoch second into an
//! annotation. Another replica may take the lease over once that stamp is
//! older than the lease duration.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::controller::error::Result;

/// Annotation carrying the epoch second of the last renewal.
pub const RENEW_ANNOTATION: &str = "clickhouse.altinity.com/lease-renewed";

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lease_name: String,
    pub namespace: String,
    pub holder_id: String,
    pub lease_duration: Duration,
    pub retry_interval: Duration,
}

/// What to do with the lease as currently stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait { holder: Option<String> },
}

/// Decide from the stored lease and the current epoch second.
pub fn decide(
    lease: Option<&Lease>,
    holder_id: &str,
    now: i64,
    default_duration: i64,
) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(holder_id) {
        return LeaseDecision::Renew;
    }

    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .map_or(default_duration, i64::from);
    let renewed = lease
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RENEW_ANNOTATION))
        .and_then(|v| v.parse::<i64>().ok());

    match (holder, renewed) {
        (Some(_), Some(at)) if now <= at + duration => LeaseDecision::Wait {
            holder: holder.map(String::from),
        },
        _ => LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        },
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    fn duration_secs(&self) -> i64 {
        i64::try_from(self.config.lease_duration.as_secs()).unwrap_or(i64::MAX)
    }

    fn stamped(&self, mut meta: ObjectMeta, now: i64) -> ObjectMeta {
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(RENEW_ANNOTATION.to_string(), now.to_string());
        meta
    }

    /// One election round. Returns whether this replica holds the lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = jiff::Timestamp::now().as_second();
        let current = match self.api.get(&self.config.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let decision = decide(
            current.as_ref(),
            &self.config.holder_id,
            now,
            self.duration_secs(),
        );
        let lease = match decision {
            LeaseDecision::Wait { holder } => {
                debug!(holder = ?holder, "Lease held by another replica");
                return Ok(false);
            }
            LeaseDecision::Create => Lease {
                metadata: self.stamped(
                    ObjectMeta {
                        name: Some(self.config.lease_name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    now,
                ),
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.holder_id.clone()),
                    lease_duration_seconds: i32::try_from(self.duration_secs()).ok(),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            },
            LeaseDecision::Renew => {
                let mut lease = current.unwrap_or_default();
                lease.metadata = self.stamped(lease.metadata, now);
                lease
            }
            LeaseDecision::TakeOver { transitions } => {
                let mut lease = current.unwrap_or_default();
                lease.metadata = self.stamped(lease.metadata, now);
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(self.config.holder_id.clone());
                spec.lease_duration_seconds = i32::try_from(self.duration_secs()).ok();
                spec.lease_transitions = Some(transitions);
                lease
            }
        };

        let written = if lease.metadata.resource_version.is_some() {
            self.api
                .replace(&self.config.lease_name, &PostParams::default(), &lease)
                .await
        } else {
            self.api.create(&PostParams::default(), &lease).await
        };
        match written {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Lease write conflicted with another replica");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(
                        holder = %self.config.holder_id,
                        lease = %self.config.lease_name,
                        "Leadership acquired"
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Lease acquisition failed"),
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Renew until another replica holds the lease (`Ok`) or a renewal fails.
    pub async fn hold(&self) -> Result<()> {
        loop {
            tokio::time::sleep(self.config.retry_interval).await;
            if !self.try_acquire_or_renew().await? {
                return Ok(());
            }
        }
    }
}
