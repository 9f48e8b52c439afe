//! Structural diff between two normalized trees.
//!
//! Clusters are matched by name, shards by index within a cluster and hosts
//! by index within a shard. Once a cluster or shard is classified as added
//! or removed its subtree is not compared further. Hosts present on both
//! sides are unchanged as far as the plan is concerned; their content is
//! applied by the ordinary per-host reconcile.

use std::cell::RefCell;

use crate::model::topology::{Cluster, Host, NormalizedChi, Shard};

/// Nodes classified on one side of the diff.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanSet {
    /// Whole clusters, with every shard and host inside them.
    pub clusters: Vec<Cluster>,
    /// Whole shards of clusters present on both sides.
    pub shards: Vec<Shard>,
    /// Single hosts of shards present on both sides.
    pub hosts: Vec<Host>,
}

impl PlanSet {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.shards.is_empty() && self.hosts.is_empty()
    }

    /// Hosts across every subtree in the set.
    pub fn hosts_num(&self) -> usize {
        self.clusters.iter().map(|c| c.hosts().count()).sum::<usize>()
            + self.shards.iter().map(|s| s.hosts.len()).sum::<usize>()
            + self.hosts.len()
    }
}

/// Added and removed nodes of one reconcile pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionPlan {
    pub added: PlanSet,
    pub removed: PlanSet,
    content_changed: bool,
}

impl ActionPlan {
    pub fn new(old: &NormalizedChi, new: &NormalizedChi) -> Self {
        let mut plan = ActionPlan {
            content_changed: !same_content(old, new),
            ..Default::default()
        };

        for cluster in &new.clusters {
            if old.find_cluster(&cluster.address.cluster_name).is_none() {
                plan.added.clusters.push(cluster.clone());
            }
        }
        for cluster in &old.clusters {
            match new.find_cluster(&cluster.address.cluster_name) {
                None => plan.removed.clusters.push(cluster.clone()),
                Some(updated) => plan.diff_shards(cluster, updated),
            }
        }

        plan
    }

    fn diff_shards(&mut self, old: &Cluster, new: &Cluster) {
        for (index, shard) in new.shards.iter().enumerate() {
            match old.shards.get(index) {
                None => self.added.shards.push(shard.clone()),
                Some(existing) => self.diff_hosts(existing, shard),
            }
        }
        self.removed
            .shards
            .extend(old.shards.iter().skip(new.shards.len()).cloned());
    }

    fn diff_hosts(&mut self, old: &Shard, new: &Shard) {
        self.added
            .hosts
            .extend(new.hosts.iter().skip(old.hosts.len()).cloned());
        self.removed
            .hosts
            .extend(old.hosts.iter().skip(new.hosts.len()).cloned());
    }

    /// No node added or removed.
    pub fn is_no_changes(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Something other than the structure differs between the trees.
    pub fn has_content_changes(&self) -> bool {
        self.content_changed
    }

    pub fn added_hosts_num(&self) -> usize {
        self.added.hosts_num()
    }

    pub fn removed_hosts_num(&self) -> usize {
        self.removed.hosts_num()
    }

    /// Visit added nodes parents first.
    ///
    /// Each added cluster is visited followed by its shards, each followed by
    /// its hosts. Added shards and added hosts of surviving parents follow.
    pub fn walk_added<'a, C, S, H>(&'a self, mut on_cluster: C, mut on_shard: S, mut on_host: H)
    where
        C: FnMut(&'a Cluster),
        S: FnMut(&'a Shard),
        H: FnMut(&'a Host),
    {
        for cluster in &self.added.clusters {
            on_cluster(cluster);
            for shard in &cluster.shards {
                on_shard(shard);
                shard.hosts.iter().for_each(&mut on_host);
            }
        }
        for shard in &self.added.shards {
            on_shard(shard);
            shard.hosts.iter().for_each(&mut on_host);
        }
        self.added.hosts.iter().for_each(&mut on_host);
    }

    /// Visit removed nodes children first.
    ///
    /// Single hosts go first, then each removed shard after its hosts, then
    /// each removed cluster after all of its hosts and then all of its shards.
    pub fn walk_removed<'a, C, S, H>(&'a self, mut on_cluster: C, mut on_shard: S, mut on_host: H)
    where
        C: FnMut(&'a Cluster),
        S: FnMut(&'a Shard),
        H: FnMut(&'a Host),
    {
        self.removed.hosts.iter().for_each(&mut on_host);
        for shard in &self.removed.shards {
            shard.hosts.iter().for_each(&mut on_host);
            on_shard(shard);
        }
        for cluster in &self.removed.clusters {
            cluster.hosts().for_each(&mut on_host);
            cluster.shards.iter().for_each(&mut on_shard);
            on_cluster(cluster);
        }
    }

    /// Added nodes in `walk_added` order.
    pub fn added_nodes(&self) -> Vec<PlanNode<'_>> {
        let nodes = RefCell::new(Vec::new());
        self.walk_added(
            |c| nodes.borrow_mut().push(PlanNode::Cluster(c)),
            |s| nodes.borrow_mut().push(PlanNode::Shard(s)),
            |h| nodes.borrow_mut().push(PlanNode::Host(h)),
        );
        nodes.into_inner()
    }

    /// Removed nodes in `walk_removed` order.
    pub fn removed_nodes(&self) -> Vec<PlanNode<'_>> {
        let nodes = RefCell::new(Vec::new());
        self.walk_removed(
            |c| nodes.borrow_mut().push(PlanNode::Cluster(c)),
            |s| nodes.borrow_mut().push(PlanNode::Shard(s)),
            |h| nodes.borrow_mut().push(PlanNode::Host(h)),
        );
        nodes.into_inner()
    }
}

/// A node visited by a plan walk.
#[derive(Clone, Copy, Debug)]
pub enum PlanNode<'a> {
    Cluster(&'a Cluster),
    Shard(&'a Shard),
    Host(&'a Host),
}

/// Everything except identity metadata and status.
fn same_content(old: &NormalizedChi, new: &NormalizedChi) -> bool {
    old.clusters == new.clusters
        && old.zookeeper == new.zookeeper
        && old.users == new.users
        && old.profiles == new.profiles
        && old.quotas == new.quotas
        && old.settings == new.settings
        && old.templates == new.templates
        && old.service_template == new.service_template
        && old.labels == new.labels
}
