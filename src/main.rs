//! clickhouse-operator binary.
//!
//! Loads the operator configuration, serves health probes, waits for the
//! leader lease and then runs the controller until SIGTERM or SIGINT.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use clickhouse_operator::config::OperatorConfig;
use clickhouse_operator::controller::WorkQueue;
use clickhouse_operator::health::{HealthState, run_health_server};
use clickhouse_operator::leader::{LeaderElector, LeaseConfig};
use clickhouse_operator::run_controller;

const LEASE_NAME: &str = "clickhouse-operator-lock";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RETRY: Duration = Duration::from_secs(5);

/// Time given to in-flight work items after the queue closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!(version = env!("CARGO_PKG_VERSION"), "clickhouse-operator starting");

    let config = OperatorConfig::load()?;
    info!(
        namespaces = ?config.watch_namespaces,
        workers = config.reconcile_workers,
        image = %config.clickhouse_image,
        "Operator configuration loaded"
    );

    let client = Client::try_default().await?;
    let (holder_id, lease_namespace) = pod_identity();

    // Probes answer before leadership so a standby replica stays alive.
    let health_state = Arc::new(HealthState::new());
    let health_server = {
        let state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state).await {
                error!(error = %e, "Health server exited");
            }
        })
    };

    let elector = LeaderElector::new(
        client.clone(),
        LeaseConfig {
            lease_name: LEASE_NAME.to_string(),
            namespace: lease_namespace.clone(),
            holder_id: holder_id.clone(),
            lease_duration: LEASE_TTL,
            retry_interval: LEASE_RETRY,
        },
    );
    info!(
        holder = %holder_id,
        namespace = %lease_namespace,
        lease = LEASE_NAME,
        "Waiting for leadership"
    );
    elector.acquire().await;
    let lease_keeper = keep_leadership(elector);

    let queue = Arc::new(WorkQueue::new());
    let mut controller = tokio::spawn(run_controller(
        client,
        config,
        Some(health_state.clone()),
        queue.clone(),
    ));

    let drain = tokio::select! {
        joined = &mut controller => {
            if let Err(e) = joined {
                error!(error = %e, "Controller task failed");
            }
            false
        }
        joined = health_server => {
            if let Err(e) = joined {
                error!(error = %e, "Health server task failed");
            }
            false
        }
        joined = lease_keeper => {
            if let Err(e) = joined {
                error!(error = %e, "Lease task failed");
            }
            false
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            health_state.set_ready(false).await;
            true
        }
    };

    if drain {
        queue.shut_down();
        info!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Draining workers");
        if tokio::time::timeout(DRAIN_TIMEOUT, controller).await.is_err() {
            warn!("Workers still busy after drain timeout");
        }
    }

    info!("clickhouse-operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("clickhouse_operator=info".parse()?)
        .add_directive("kube=warn".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
    Ok(())
}

/// Lease holder id and namespace from the downward API, with fallbacks.
fn pod_identity() -> (String, String) {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "clickhouse-operator".to_string());
        warn!(holder = %host, "POD_NAME unset, falling back to hostname");
        host
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE unset, using default");
        "default".to_string()
    });
    (holder_id, namespace)
}

/// Renew the lease until it is lost, then exit so the pod restarts as a follower.
fn keep_leadership(elector: LeaderElector) -> JoinHandle<()> {
    #[allow(clippy::exit)]
    tokio::spawn(async move {
        match elector.hold().await {
            Ok(()) => error!("Leadership lost"),
            Err(e) => error!(error = %e, "Lease renewal failed"),
        }
        std::process::exit(1);
    })
}

/// Resolves on SIGINT or SIGTERM. Handler installation failure is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let interrupt = async {
        signal::ctrl_c().await.expect("install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
