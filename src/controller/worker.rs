//! Work item processing.
//!
//! A [`Worker`] turns one [`ChangeItem`] into Kubernetes objects, SQL and
//! status updates. Reconcile passes are top-down and stop at the first
//! failure; deletions are bottom-up and continue past failures.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::client::kube::{ChiEvent, ResourceKind, ResourceRef, ResourceSpec};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::queue::{Change, ChangeItem};
use crate::controller::status::phase_conditions;
use crate::crd::{
    ChiPhase, ChiStatus, ClickHouseInstallationTemplate, ClickHouseOperatorConfiguration,
};
use crate::model::action_plan::{ActionPlan, PlanNode};
use crate::model::namer;
use crate::model::topology::{ChiRef, ChiSnapshot, Cluster, Host, NormalizedChi, Shard};
use crate::resources::common::{chi_name_from_meta, cluster_name_from_meta, host_selector};
use crate::resources::{config_maps, services, statefulset};

pub const ACTION_CREATE: &str = "Create";
pub const ACTION_UPDATE: &str = "Update";
pub const ACTION_DELETE: &str = "Delete";

pub const REASON_CREATE_STARTED: &str = "CreateStarted";
pub const REASON_UPDATE_IN_PROGRESS: &str = "UpdateInProgress";
pub const REASON_UPDATE_COMPLETED: &str = "UpdateCompleted";
pub const REASON_UPDATE_FAILED: &str = "UpdateFailed";
pub const REASON_DELETE_STARTED: &str = "DeleteStarted";
pub const REASON_DELETE_COMPLETED: &str = "DeleteCompleted";

/// Processes work items against the shared [`Context`].
#[derive(Clone)]
pub struct Worker {
    ctx: Arc<Context>,
}

impl Worker {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Dispatch one item.
    pub async fn process_item(&self, item: ChangeItem) -> Result<()> {
        match item {
            ChangeItem::Installation(Change::Add(new)) => self.add_chi(new).await,
            ChangeItem::Installation(Change::Update { old, new }) => {
                self.update_chi(Some(old), new).await
            }
            ChangeItem::Installation(Change::Delete(old)) => {
                let chi = old.chi_ref();
                self.delete_chi(old).await;
                self.ctx.kube.remove_finalizer(&chi).await
            }
            ChangeItem::Template(change) => {
                self.template_changed(change);
                Ok(())
            }
            ChangeItem::OperatorConfig(change) => self.operator_config_changed(change),
            ChangeItem::CacheInvalidation(endpoints) => {
                self.drop_dns_cache(&endpoints.metadata).await;
                Ok(())
            }
        }
    }

    /// Create an installation: an update from the empty tree.
    pub async fn add_chi(&self, new: ChiSnapshot) -> Result<()> {
        let new = self.ctx.normalizer().normalize_snapshot(&new);
        info!(chi = %new.name, namespace = %new.namespace, "Adding installation");
        self.event(
            &new,
            ChiEvent::normal(REASON_CREATE_STARTED, ACTION_CREATE, "Add installation started"),
        )
        .await;
        self.update_chi(None, ChiSnapshot::Normalized(new)).await
    }

    /// Drive live state from `old` to `new`.
    pub async fn update_chi(&self, old: Option<ChiSnapshot>, new: ChiSnapshot) -> Result<()> {
        let start_time = Instant::now();
        let normalizer = self.ctx.normalizer();
        let new = normalizer.normalize_snapshot(&new);
        let old = match &old {
            Some(old) => normalizer.normalize_snapshot(old),
            None => Arc::new(NormalizedChi::empty(&new.namespace, &new.name)),
        };

        if let (Some(a), Some(b)) = (&old.resource_version, &new.resource_version) {
            if a == b {
                debug!(chi = %new.name, version = %a, "Same resource version, nothing to reconcile");
                self.ctx.watch.update(&new);
                return Ok(());
            }
        }

        let plan = ActionPlan::new(&old, &new);
        if plan.is_no_changes() && !plan.has_content_changes() {
            debug!(chi = %new.name, "No changes");
            return Ok(());
        }

        info!(
            chi = %new.name,
            namespace = %new.namespace,
            added_hosts = plan.added_hosts_num(),
            removed_hosts = plan.removed_hosts_num(),
            "Updating installation"
        );

        let mut status = new.status.clone();
        status.status = ChiPhase::InProgress;
        status.added_hosts_count = count(plan.added_hosts_num());
        status.deleted_hosts_count = 0;
        status.delete_hosts_count = count(plan.removed_hosts_num());
        status.updated_hosts_count = 0;
        status.observed_generation = new.generation;
        status.conditions = phase_conditions(
            &status.conditions,
            ChiPhase::InProgress,
            "Reconcile started",
            new.generation,
        );
        self.persist_status(&new, &status).await;
        self.event(
            &new,
            ChiEvent::normal(REASON_UPDATE_IN_PROGRESS, ACTION_UPDATE, "Update installation started"),
        )
        .await;

        if let Err(e) = self.reconcile(&new, &mut status).await {
            error!(chi = %new.name, namespace = %new.namespace, error = %e, "Reconcile failed");
            status.status = ChiPhase::Failed;
            status.conditions = phase_conditions(
                &status.conditions,
                ChiPhase::Failed,
                &e.to_string(),
                new.generation,
            );
            self.persist_status(&new, &status).await;
            self.event(
                &new,
                ChiEvent::warning(
                    REASON_UPDATE_FAILED,
                    ACTION_UPDATE,
                    format!("Update installation failed: {e}"),
                ),
            )
            .await;
            if let Some(health) = &self.ctx.health_state {
                health.metrics.record_error(&new.namespace, &new.name);
            }
            return Err(e);
        }

        self.create_added_schema(&plan, &new).await;

        for node in plan.removed_nodes() {
            match node {
                PlanNode::Host(host) => {
                    let address = &host.address;
                    self.progress(
                        &new,
                        ACTION_DELETE,
                        format!(
                            "Removing replica {} from shard {} in cluster {}",
                            address.replica_index, address.shard_index, address.cluster_name
                        ),
                    )
                    .await;
                    log_errors(self.delete_host(&old, host).await);
                    status.deleted_hosts_count += 1;
                    self.persist_status(&new, &status).await;
                }
                PlanNode::Shard(shard) => {
                    self.progress(
                        &new,
                        ACTION_DELETE,
                        format!(
                            "Removing shard {} from cluster {}",
                            shard.address.shard_index, shard.address.cluster_name
                        ),
                    )
                    .await;
                    log_errors(self.delete_shard_service(&old, shard).await);
                }
                PlanNode::Cluster(cluster) => {
                    self.progress(
                        &new,
                        ACTION_DELETE,
                        format!("Removing cluster {}", cluster.address.cluster_name),
                    )
                    .await;
                    log_errors(self.delete_cluster_service(&old, cluster).await);
                }
            }
        }

        status.status = ChiPhase::Completed;
        status.clusters_count = count(new.clusters.len());
        status.shards_count = count(new.shards_count());
        status.hosts_count = count(new.hosts_count());
        status.endpoint = Some(namer::chi_service_fqdn(&new.namespace, &new.name));
        status.conditions = phase_conditions(
            &status.conditions,
            ChiPhase::Completed,
            "Reconcile completed",
            new.generation,
        );
        self.persist_status(&new, &status).await;
        self.ctx.watch.update(&new);
        self.event(
            &new,
            ChiEvent::normal(REASON_UPDATE_COMPLETED, ACTION_UPDATE, "Update installation completed"),
        )
        .await;

        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_reconcile(
                &new.namespace,
                &new.name,
                start_time.elapsed().as_secs_f64(),
            );
            health
                .metrics
                .set_hosts(&new.namespace, &new.name, new.hosts_count() as i64);
        }
        info!(chi = %new.name, namespace = %new.namespace, "Installation reconciled");
        Ok(())
    }

    /// Apply every object of the tree, parents first. Stops at the first error.
    pub async fn reconcile(&self, chi: &NormalizedChi, status: &mut ChiStatus) -> Result<()> {
        let config = self.ctx.config.current();

        self.apply(ResourceSpec::Service(services::chi_service(chi, &config)))
            .await?;
        self.apply(ResourceSpec::ConfigMap(config_maps::common_config_map(chi, &config)))
            .await?;
        self.apply(ResourceSpec::ConfigMap(config_maps::users_config_map(chi, &config)))
            .await?;

        for cluster in &chi.clusters {
            if let Some(service) = services::cluster_service(chi, cluster) {
                self.apply(ResourceSpec::Service(service)).await?;
            }
            for shard in &cluster.shards {
                if let Some(service) = services::shard_service(chi, shard) {
                    self.apply(ResourceSpec::Service(service)).await?;
                }
                for host in &shard.hosts {
                    self.reconcile_host(chi, host).await?;
                    status.updated_hosts_count += 1;
                }
            }
        }
        Ok(())
    }

    /// Service and ConfigMap first: the StatefulSet mounts one and is
    /// addressed through the other.
    async fn reconcile_host(&self, chi: &NormalizedChi, host: &Host) -> Result<()> {
        let config = self.ctx.config.current();
        let address = &host.address;
        debug!(
            chi = %chi.name,
            cluster = %address.cluster_name,
            shard = address.shard_index,
            replica = address.replica_index,
            "Reconciling host"
        );

        self.apply(ResourceSpec::Service(services::host_service(chi, host, &config)))
            .await?;
        self.apply(ResourceSpec::ConfigMap(config_maps::host_config_map(chi, host)))
            .await?;
        let sts = ResourceSpec::StatefulSet(statefulset::host_statefulset(chi, host, &config));
        let sts_ref = sts.resource_ref();
        self.apply(sts).await?;
        self.ctx.kube.wait_ready(&sts_ref).await
    }

    async fn apply(&self, spec: ResourceSpec) -> Result<()> {
        debug!(resource = %spec.resource_ref(), "Applying");
        self.ctx.kube.apply(&spec).await
    }

    /// Schema for added nodes. Shard-wide distributed objects go last so
    /// every added host already has its replicated objects.
    async fn create_added_schema(&self, plan: &ActionPlan, chi: &NormalizedChi) {
        let schemer = self.ctx.schemer();
        let mut added_shards: Vec<&Shard> = Vec::new();

        for node in plan.added_nodes() {
            match node {
                PlanNode::Cluster(cluster) => {
                    info!(chi = %chi.name, cluster = %cluster.address.cluster_name, "Added cluster");
                    self.progress(
                        chi,
                        ACTION_CREATE,
                        format!("Added cluster {}", cluster.address.cluster_name),
                    )
                    .await;
                }
                PlanNode::Shard(shard) => {
                    let address = &shard.address;
                    info!(
                        chi = %chi.name,
                        cluster = %address.cluster_name,
                        shard = address.shard_index,
                        "Added shard"
                    );
                    self.progress(
                        chi,
                        ACTION_CREATE,
                        format!(
                            "Added shard {} to cluster {}",
                            address.shard_index, address.cluster_name
                        ),
                    )
                    .await;
                    added_shards.push(shard);
                }
                PlanNode::Host(host) => {
                    let address = &host.address;
                    info!(
                        chi = %chi.name,
                        cluster = %address.cluster_name,
                        shard = address.shard_index,
                        replica = address.replica_index,
                        "Added replica"
                    );
                    self.progress(
                        chi,
                        ACTION_CREATE,
                        format!(
                            "Added replica {} to shard {} in cluster {}",
                            address.replica_index, address.shard_index, address.cluster_name
                        ),
                    )
                    .await;
                    let Some(cluster) = chi.find_cluster(&address.cluster_name) else {
                        continue;
                    };
                    if let Err(e) = self.create_host_schema(&schemer, cluster, host).await {
                        warn!(
                            chi = %chi.name,
                            host = %namer::host_fqdn(&host.address),
                            error = %e,
                            "Failed to create schema on added host"
                        );
                    }
                }
            }
        }

        for shard in added_shards {
            let Some(cluster) = chi.find_cluster(&shard.address.cluster_name) else {
                continue;
            };
            let result = match schemer.distributed_objects(cluster).await {
                Ok(objects) => {
                    debug!(objects = ?objects.names, "Creating distributed objects on shard");
                    schemer.shard_apply_sqls(shard, &objects.sqls, true).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    chi = %chi.name,
                    cluster = %shard.address.cluster_name,
                    shard = shard.address.shard_index,
                    error = %e,
                    "Failed to create distributed objects on shard"
                );
            }
        }
    }

    async fn create_host_schema(
        &self,
        schemer: &crate::model::schemer::Schemer,
        cluster: &Cluster,
        host: &Host,
    ) -> Result<()> {
        let replicated = schemer.replicated_objects(cluster, host).await?;
        debug!(objects = ?replicated.names, "Creating replicated objects");
        schemer.host_apply_sqls(host, &replicated.sqls, true).await?;

        let distributed = schemer.distributed_objects(cluster).await?;
        debug!(objects = ?distributed.names, "Creating distributed objects");
        schemer.host_apply_sqls(host, &distributed.sqls, true).await?;
        Ok(())
    }

    /// Remove every object of an installation, children first.
    pub async fn delete_chi(&self, old: ChiSnapshot) {
        let chi = self.ctx.normalizer().normalize_snapshot(&old);
        let config = self.ctx.config.current();
        info!(chi = %chi.name, namespace = %chi.namespace, "Deleting installation");
        self.event(
            &chi,
            ChiEvent::normal(REASON_DELETE_STARTED, ACTION_DELETE, "Delete installation started"),
        )
        .await;

        for cluster in &chi.clusters {
            log_errors(self.delete_cluster(&chi, cluster).await);
        }

        let mut errors = Vec::new();
        for cm in [
            config_maps::common_config_map(&chi, &config),
            config_maps::users_config_map(&chi, &config),
        ] {
            self.delete(ResourceSpec::ConfigMap(cm).resource_ref(), &mut errors)
                .await;
        }
        let service = ResourceSpec::Service(services::chi_service(&chi, &config));
        self.delete(service.resource_ref(), &mut errors).await;
        log_errors(errors);

        self.ctx.watch.remove(&chi.chi_ref());
        if let Some(health) = &self.ctx.health_state {
            health.metrics.remove_hosts(&chi.namespace, &chi.name);
        }
        self.event(
            &chi,
            ChiEvent::normal(REASON_DELETE_COMPLETED, ACTION_DELETE, "Delete installation completed"),
        )
        .await;
        info!(chi = %chi.name, namespace = %chi.namespace, "Installation deleted");
    }

    pub async fn delete_cluster(&self, chi: &NormalizedChi, cluster: &Cluster) -> Vec<Error> {
        debug!(chi = %chi.name, cluster = %cluster.address.cluster_name, "Deleting cluster");
        let mut errors = Vec::new();
        for shard in &cluster.shards {
            errors.extend(self.delete_shard(chi, shard).await);
        }
        errors.extend(self.delete_cluster_service(chi, cluster).await);
        errors
    }

    pub async fn delete_shard(&self, chi: &NormalizedChi, shard: &Shard) -> Vec<Error> {
        debug!(
            chi = %chi.name,
            cluster = %shard.address.cluster_name,
            shard = shard.address.shard_index,
            "Deleting shard"
        );
        let mut errors = Vec::new();
        for host in &shard.hosts {
            errors.extend(self.delete_host(chi, host).await);
        }
        errors.extend(self.delete_shard_service(chi, shard).await);
        errors
    }

    /// Drop the host's tables, then its StatefulSet, volume claims,
    /// ConfigMap and Service. Every step runs regardless of earlier failures.
    pub async fn delete_host(&self, chi: &NormalizedChi, host: &Host) -> Vec<Error> {
        let address = &host.address;
        info!(
            chi = %chi.name,
            cluster = %address.cluster_name,
            shard = address.shard_index,
            replica = address.replica_index,
            "Deleting host"
        );
        let mut errors = Vec::new();

        let schemer = self.ctx.schemer();
        match schemer.host_drop_tables(host).await {
            Ok(tables) => {
                debug!(tables = ?tables.names, "Dropping tables");
                if let Err(e) = schemer.host_apply_sqls(host, &tables.sqls, false).await {
                    errors.push(e.into());
                }
            }
            Err(e) => errors.push(e.into()),
        }

        let config = self.ctx.config.current();
        let sts = ResourceSpec::StatefulSet(statefulset::host_statefulset(chi, host, &config));
        self.delete(sts.resource_ref(), &mut errors).await;

        match self
            .ctx
            .kube
            .list_by_labels(
                ResourceKind::PersistentVolumeClaim,
                &chi.namespace,
                &host_selector(address),
            )
            .await
        {
            Ok(claims) => {
                for claim in claims {
                    self.delete(claim, &mut errors).await;
                }
            }
            Err(e) => errors.push(e),
        }

        let cm = ResourceSpec::ConfigMap(config_maps::host_config_map(chi, host));
        self.delete(cm.resource_ref(), &mut errors).await;
        let service = ResourceSpec::Service(services::host_service(chi, host, &config));
        self.delete(service.resource_ref(), &mut errors).await;
        errors
    }

    async fn delete_shard_service(&self, chi: &NormalizedChi, shard: &Shard) -> Vec<Error> {
        let mut errors = Vec::new();
        if let Some(service) = services::shard_service(chi, shard) {
            self.delete(ResourceSpec::Service(service).resource_ref(), &mut errors)
                .await;
        }
        errors
    }

    async fn delete_cluster_service(&self, chi: &NormalizedChi, cluster: &Cluster) -> Vec<Error> {
        let mut errors = Vec::new();
        if let Some(service) = services::cluster_service(chi, cluster) {
            self.delete(ResourceSpec::Service(service).resource_ref(), &mut errors)
                .await;
        }
        errors
    }

    async fn delete(&self, resource: ResourceRef, errors: &mut Vec<Error>) {
        debug!(resource = %resource, "Deleting");
        if let Err(e) = self.ctx.kube.delete(&resource).await {
            errors.push(e);
        }
    }

    /// Resolve an operator-generated object back to its installation.
    pub async fn chi_from_object_meta(&self, meta: &ObjectMeta) -> Result<Arc<NormalizedChi>> {
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = chi_name_from_meta(meta).ok_or_else(|| {
            Error::NotFound(format!(
                "{namespace}/{} is not managed by the operator",
                meta.name.as_deref().unwrap_or_default()
            ))
        })?;
        let chi = self
            .ctx
            .kube
            .get_installation(&ChiRef::new(&namespace, name))
            .await?;
        Ok(Arc::new(self.ctx.normalizer().normalize(&chi)))
    }

    /// Resolve an operator-generated object back to its cluster.
    pub async fn cluster_from_object_meta(&self, meta: &ObjectMeta) -> Result<Cluster> {
        let chi = self.chi_from_object_meta(meta).await?;
        let cluster_name = cluster_name_from_meta(meta)
            .ok_or_else(|| Error::NotFound(format!("no cluster label on {}", chi.name)))?;
        chi.find_cluster(cluster_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cluster {cluster_name} in {}", chi.chi_ref())))
    }

    /// Ask the hosts behind an operator-generated object to drop cached
    /// addresses: its cluster when labelled with one, else the whole
    /// installation.
    pub async fn drop_dns_cache(&self, meta: &ObjectMeta) {
        let schemer = self.ctx.schemer();
        let errors = if cluster_name_from_meta(meta).is_some() {
            match self.cluster_from_object_meta(meta).await {
                Ok(cluster) => {
                    debug!(
                        chi = %cluster.address.chi_name,
                        cluster = %cluster.address.cluster_name,
                        "Dropping DNS cache"
                    );
                    schemer.cluster_drop_dns_cache(&cluster).await
                }
                Err(e) => return unresolved_for_cache(&e),
            }
        } else {
            match self.chi_from_object_meta(meta).await {
                Ok(chi) => {
                    debug!(chi = %chi.name, namespace = %chi.namespace, "Dropping DNS cache");
                    schemer.chi_drop_dns_cache(&chi).await
                }
                Err(e) => return unresolved_for_cache(&e),
            }
        };
        if !errors.is_empty() {
            warn!(failed = errors.len(), "DNS cache not dropped on every host");
        }
    }

    fn template_changed(&self, change: Change<Arc<ClickHouseInstallationTemplate>>) {
        let chit = change.latest();
        let key = format!("{}/{}", chit.namespace().unwrap_or_default(), chit.name_any());
        match &change {
            Change::Add(chit) | Change::Update { new: chit, .. } => {
                info!(template = %key, "Installation template updated");
                self.ctx.templates.upsert(&key, chit.spec.templates.clone());
            }
            Change::Delete(_) => {
                info!(template = %key, "Installation template removed");
                self.ctx.templates.remove(&key);
            }
        }
    }

    fn operator_config_changed(
        &self,
        change: Change<Arc<ClickHouseOperatorConfiguration>>,
    ) -> Result<()> {
        match change {
            Change::Add(conf) | Change::Update { new: conf, .. } => {
                let config = conf.spec.config.clone();
                config.validate()?;
                info!(config = %conf.name_any(), "Operator configuration updated");
                self.ctx.config.set_override(config);
            }
            Change::Delete(conf) => {
                info!(config = %conf.name_any(), "Operator configuration removed, using defaults");
                self.ctx.config.clear_override();
            }
        }
        Ok(())
    }

    async fn persist_status(&self, chi: &NormalizedChi, status: &ChiStatus) {
        if let Err(e) = self.ctx.kube.persist_status(&chi.chi_ref(), status).await {
            warn!(chi = %chi.name, namespace = %chi.namespace, error = %e, "Failed to persist status");
        }
    }

    /// Normal `UpdateInProgress` event for one topology step.
    async fn progress(&self, chi: &NormalizedChi, action: &str, note: String) {
        self.event(chi, ChiEvent::normal(REASON_UPDATE_IN_PROGRESS, action, note))
            .await;
    }

    async fn event(&self, chi: &NormalizedChi, event: ChiEvent) {
        self.ctx
            .kube
            .publish_event(&object_reference(chi), event)
            .await;
    }
}

/// Reference to the installation for events.
pub fn object_reference(chi: &NormalizedChi) -> ObjectReference {
    ObjectReference {
        api_version: Some("clickhouse.altinity.com/v1".to_string()),
        kind: Some("ClickHouseInstallation".to_string()),
        name: Some(chi.name.clone()),
        namespace: Some(chi.namespace.clone()),
        uid: chi.uid.clone(),
        resource_version: chi.resource_version.clone(),
        ..Default::default()
    }
}

fn unresolved_for_cache(e: &Error) {
    if e.is_not_found() {
        debug!(error = %e, "Cache invalidation for unknown installation or cluster");
    } else {
        warn!(error = %e, "Unable to resolve owner for cache invalidation");
    }
}

fn log_errors(errors: Vec<Error>) {
    for e in errors {
        warn!(error = %e, "Deletion step failed");
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
