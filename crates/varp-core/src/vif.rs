//! Local virtual interface registrations
//!
//! A vif entry claims a (vnet, vmac) pair as locally attached, which is
//! what makes the node answer resolution requests for it. Entries learned
//! from traffic expire unless refreshed; control-plane registrations can
//! be persistent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use varp_wire::{VnetId, Vmac};

use crate::error::{CoreError, CoreResult};

/// One locally attached (vnet, vmac) pair.
pub struct VifEntry {
    vnet: VnetId,
    vmac: Vmac,
    persistent: bool,
    last_seen: Mutex<Instant>,
}

impl VifEntry {
    /// Virtual network the interface is attached to
    pub fn vnet(&self) -> VnetId {
        self.vnet
    }

    /// MAC address claimed by the interface
    pub fn vmac(&self) -> Vmac {
        self.vmac
    }

    /// Whether the entry is exempt from idle expiry
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Refresh the idle timer
    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    /// Time since the last refresh
    pub async fn idle(&self) -> std::time::Duration {
        self.last_seen.lock().await.elapsed()
    }
}

/// Table of local interface registrations.
pub struct VifTable {
    entries: RwLock<HashMap<(VnetId, Vmac), Arc<VifEntry>>>,
}

impl VifTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a local interface, refreshing an existing entry.
    ///
    /// Re-registering an expiring entry as persistent upgrades it;
    /// persistence is never downgraded by a refresh.
    pub async fn register(&self, vnet: VnetId, vmac: Vmac, persistent: bool) -> Arc<VifEntry> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&(vnet, vmac)) {
                if entry.persistent || !persistent {
                    entry.touch().await;
                    return entry.clone();
                }
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&(vnet, vmac)) {
            if entry.persistent || !persistent {
                entry.touch().await;
                return entry.clone();
            }
        }
        let entry = Arc::new(VifEntry {
            vnet,
            vmac,
            persistent,
            last_seen: Mutex::new(Instant::now()),
        });
        entries.insert((vnet, vmac), entry.clone());
        debug!(
            "registered {} vif {} on {}",
            if persistent { "persistent" } else { "learned" },
            vmac,
            vnet
        );
        entry
    }

    /// Look up a registration
    pub async fn lookup(&self, vnet: VnetId, vmac: Vmac) -> Option<Arc<VifEntry>> {
        self.entries.read().await.get(&(vnet, vmac)).cloned()
    }

    /// Remove a registration
    pub async fn unregister(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()> {
        self.entries
            .write()
            .await
            .remove(&(vnet, vmac))
            .map(|_| ())
            .ok_or(CoreError::NotFound)
    }

    /// Drop every registration belonging to a vnet
    pub async fn remove_vnet(&self, vnet: VnetId) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(v, _), _| *v != vnet);
        before - entries.len()
    }

    /// Remove learned entries idle beyond `ttl`. Returns the number
    /// removed.
    pub async fn sweep(&self, now: Instant, ttl: std::time::Duration) -> usize {
        let mut entries = self.entries.write().await;
        let mut expired = Vec::new();
        for (key, entry) in entries.iter() {
            if entry.persistent {
                continue;
            }
            let last_seen = *entry.last_seen.lock().await;
            if now.duration_since(last_seen) > ttl {
                expired.push(*key);
            }
        }
        for key in &expired {
            entries.remove(key);
            info!("expired vif {} on {}", key.1, key.0);
        }
        expired.len()
    }

    /// All registrations, for control-plane listings
    pub async fn list(&self) -> Vec<Arc<VifEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Number of registrations
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for VifTable {
    fn default() -> Self {
        Self::new()
    }
}
