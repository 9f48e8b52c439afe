//! Host addresses of every reconciled installation.
//!
//! Refreshed at the end of each reconcile, served at `/chi` for external
//! monitors.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::model::topology::{ChiRef, NormalizedChi};

/// One watched installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WatchedChi {
    pub namespace: String,
    pub name: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: RwLock<BTreeMap<ChiRef, Vec<String>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the host list of an installation.
    pub fn update(&self, chi: &NormalizedChi) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chi.chi_ref(), chi.pod_fqdns());
    }

    pub fn remove(&self, chi: &ChiRef) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(chi);
    }

    pub fn hosts(&self, chi: &ChiRef) -> Option<Vec<String>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(chi)
            .cloned()
    }

    pub fn list(&self) -> Vec<WatchedChi> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(chi, hosts)| WatchedChi {
                namespace: chi.namespace.clone(),
                name: chi.name.clone(),
                hosts: hosts.clone(),
            })
            .collect()
    }
}
