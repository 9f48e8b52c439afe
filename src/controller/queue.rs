//! Work items and the queue the workers drain.
//!
//! The queue keeps at most one pending item per identity key. A newer
//! item for a pending key is coalesced into it, so a burst of updates to
//! one installation becomes a single diff from the oldest "old" to the
//! newest "new". A key handed to a worker is not handed out again until
//! the worker calls [`WorkQueue::done`] or [`WorkQueue::failed`].
//!
//! A key whose last item failed is held back with a per-key exponential
//! delay that resets on the next success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::controller::error::{Error, Result};
use crate::crd::{ClickHouseInstallationTemplate, ClickHouseOperatorConfiguration};
use crate::model::topology::{ChiRef, ChiSnapshot};

/// Operation carried by a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Add => write!(f, "add"),
            ChangeOp::Update => write!(f, "update"),
            ChangeOp::Delete => write!(f, "delete"),
        }
    }
}

/// A change to one object.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Add(T),
    Update { old: T, new: T },
    Delete(T),
}

impl<T> Change<T> {
    /// Build a change from an operation and the snapshots it came with.
    ///
    /// Add needs `new`, Update needs both, Delete needs `old`.
    pub fn from_parts(op: ChangeOp, old: Option<T>, new: Option<T>) -> Result<Self> {
        match (op, old, new) {
            (ChangeOp::Add, None, Some(new)) => Ok(Change::Add(new)),
            (ChangeOp::Update, Some(old), Some(new)) => Ok(Change::Update { old, new }),
            (ChangeOp::Delete, Some(old), None) => Ok(Change::Delete(old)),
            (op, old, new) => Err(Error::UnexpectedItem(format!(
                "{op} with old={} new={}",
                old.is_some(),
                new.is_some()
            ))),
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            Change::Add(_) => ChangeOp::Add,
            Change::Update { .. } => ChangeOp::Update,
            Change::Delete(_) => ChangeOp::Delete,
        }
    }

    /// The newest snapshot carried.
    pub fn latest(&self) -> &T {
        match self {
            Change::Add(t) | Change::Delete(t) => t,
            Change::Update { new, .. } => new,
        }
    }

    /// Fold a newer change for the same object into this one.
    pub fn coalesce(self, next: Change<T>) -> Change<T> {
        match (self, next) {
            (_, Change::Delete(t)) => Change::Delete(t),
            (Change::Add(_), Change::Add(new) | Change::Update { new, .. }) => Change::Add(new),
            (
                Change::Update { old, .. } | Change::Delete(old),
                Change::Add(new) | Change::Update { new, .. },
            ) => Change::Update { old, new },
        }
    }
}

/// Everything a worker can be asked to do.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeItem {
    Installation(Change<ChiSnapshot>),
    Template(Change<Arc<ClickHouseInstallationTemplate>>),
    OperatorConfig(Change<Arc<ClickHouseOperatorConfiguration>>),
    /// Endpoints of a host changed; cached addresses may be stale.
    CacheInvalidation(Arc<Endpoints>),
}

/// Identity of a queued item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Installation(ChiRef),
    Template(String, String),
    OperatorConfig(String, String),
    CacheInvalidation(String, String),
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKey::Installation(chi) => write!(f, "chi {chi}"),
            ItemKey::Template(ns, name) => write!(f, "chit {ns}/{name}"),
            ItemKey::OperatorConfig(ns, name) => write!(f, "chopconf {ns}/{name}"),
            ItemKey::CacheInvalidation(ns, name) => write!(f, "endpoints {ns}/{name}"),
        }
    }
}

impl ChangeItem {
    pub fn key(&self) -> ItemKey {
        match self {
            ChangeItem::Installation(change) => ItemKey::Installation(change.latest().chi_ref()),
            ChangeItem::Template(change) => {
                let chit = change.latest();
                ItemKey::Template(chit.namespace().unwrap_or_default(), chit.name_any())
            }
            ChangeItem::OperatorConfig(change) => {
                let conf = change.latest();
                ItemKey::OperatorConfig(conf.namespace().unwrap_or_default(), conf.name_any())
            }
            ChangeItem::CacheInvalidation(endpoints) => ItemKey::CacheInvalidation(
                endpoints.namespace().unwrap_or_default(),
                endpoints.name_any(),
            ),
        }
    }

    fn coalesce(self, next: ChangeItem) -> ChangeItem {
        match (self, next) {
            (ChangeItem::Installation(a), ChangeItem::Installation(b)) => {
                ChangeItem::Installation(a.coalesce(b))
            }
            (ChangeItem::Template(a), ChangeItem::Template(b)) => ChangeItem::Template(a.coalesce(b)),
            (ChangeItem::OperatorConfig(a), ChangeItem::OperatorConfig(b)) => {
                ChangeItem::OperatorConfig(a.coalesce(b))
            }
            (_, next) => next,
        }
    }
}

/// Delay before a failed key is handed out again; doubles per failure.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(5);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug)]
struct Backoff {
    failures: u32,
    not_before: Instant,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<ItemKey>,
    pending: HashMap<ItemKey, ChangeItem>,
    in_flight: HashSet<ItemKey>,
    backoff: HashMap<ItemKey, Backoff>,
    shut_down: bool,
}

impl QueueState {
    fn held_back(&self, key: &ItemKey, now: Instant) -> bool {
        self.backoff.get(key).is_some_and(|b| b.not_before > now)
    }
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::with_retry_delays(RETRY_BASE_DELAY, RETRY_MAX_DELAY)
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_delays(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Delay after `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Enqueue an item. Returns false once the queue is shut down.
    pub fn add(&self, item: ChangeItem) -> bool {
        let key = item.key();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.shut_down {
                return false;
            }
            match state.pending.remove(&key) {
                Some(existing) => {
                    state.pending.insert(key, existing.coalesce(item));
                }
                None => {
                    state.order.push_back(key.clone());
                    state.pending.insert(key, item);
                }
            }
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next item whose key is neither being processed nor
    /// held back after a failure.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<(ItemKey, ChangeItem)> {
        loop {
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.shut_down {
                    return None;
                }
                let now = Instant::now();
                let ready = state
                    .order
                    .iter()
                    .position(|k| !state.in_flight.contains(k) && !state.held_back(k, now));
                if let Some(index) = ready {
                    if let Some(key) = state.order.remove(index) {
                        if let Some(item) = state.pending.remove(&key) {
                            state.in_flight.insert(key.clone());
                            return Some((key, item));
                        }
                    }
                    continue;
                }
                state
                    .order
                    .iter()
                    .filter(|k| !state.in_flight.contains(*k))
                    .filter_map(|k| state.backoff.get(k).map(|b| b.not_before))
                    .min()
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key handed out by [`WorkQueue::next`] after success.
    pub fn done(&self, key: &ItemKey) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight.remove(key);
            state.backoff.remove(key);
        }
        self.notify.notify_waiters();
    }

    /// Release a key after a failure and queue its item again, held back
    /// for the retry delay. A newer pending item for the key is folded in.
    ///
    /// Returns the delay applied.
    pub fn failed(&self, key: &ItemKey, item: ChangeItem) -> Duration {
        let delay = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight.remove(key);
            let failures = state.backoff.get(key).map_or(0, |b| b.failures) + 1;
            let delay = self.retry_delay(failures);
            state.backoff.insert(
                key.clone(),
                Backoff {
                    failures,
                    not_before: Instant::now() + delay,
                },
            );
            if !state.shut_down {
                match state.pending.remove(key) {
                    Some(newer) => {
                        state.pending.insert(key.clone(), item.coalesce(newer));
                    }
                    None => {
                        state.order.push_back(key.clone());
                        state.pending.insert(key.clone(), item);
                    }
                }
            }
            delay
        };
        self.notify.notify_waiters();
        delay
    }

    /// Stop handing out items and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).shut_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).shut_down
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
