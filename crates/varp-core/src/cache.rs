//! Address resolution cache
//!
//! Maps (vnet, vmac) to a care-of address with an ARP-like probe/reply
//! protocol. Entries buffer outbound frames while resolution is in
//! flight; a per-entry probe task re-sends requests on a fixed interval
//! and fails the entry after too many unanswered probes.
//!
//! Lock order: the table lock is taken before any entry lock, and an
//! entry lock is always released before calling out to the send path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use varp_wire::{ether_dst, CareOfAddress, VarpMessage, VnetId, Vmac};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::vif::VifTable;

/// Identifies one resolution entry
pub type ResolutionKey = (VnetId, Vmac);

/// Side effects the cache needs from the rest of the node: tunnel sends,
/// overlay flooding, and probe transmission.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Send one frame to a resolved care-of address over the tunnel path
    async fn send_unicast(
        &self,
        vnet: VnetId,
        care_of: CareOfAddress,
        frame: Bytes,
    ) -> CoreResult<()>;

    /// Flood a broadcast/multicast frame to the peer overlay and
    /// multicast group
    async fn flood(&self, vnet: VnetId, frame: Bytes) -> CoreResult<()>;

    /// Transmit a resolution request for (vnet, vmac)
    async fn send_probe(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()>;
}

/// Resolution state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Resolution in progress, frames queued
    Incomplete,
    /// Care-of address known
    Reachable,
    /// Resolution gave up after max probes
    Failed,
}

struct EntryInner {
    state: EntryState,
    care_of: Option<CareOfAddress>,
    last_updated: Instant,
    probe_count: u32,
    permanent: bool,
    probing: bool,
    deleted: bool,
    /// Bumped on every probe arm so a stale timer task can tell it has
    /// been superseded
    probe_gen: u64,
    queue: VecDeque<Bytes>,
    dropped: u64,
}

/// One cached (vnet, vmac) -> care-of resolution.
///
/// Shared between the table and any in-flight probe task; the entry is
/// freed only when both have dropped their references.
pub struct ResolutionEntry {
    vnet: VnetId,
    vmac: Vmac,
    inner: Mutex<EntryInner>,
}

impl ResolutionEntry {
    fn new(vnet: VnetId, vmac: Vmac) -> Self {
        Self {
            vnet,
            vmac,
            inner: Mutex::new(EntryInner {
                state: EntryState::Incomplete,
                care_of: None,
                last_updated: Instant::now(),
                probe_count: 0,
                permanent: false,
                probing: false,
                deleted: false,
                probe_gen: 0,
                queue: VecDeque::new(),
                dropped: 0,
            }),
        }
    }

    /// Virtual network of this entry
    pub fn vnet(&self) -> VnetId {
        self.vnet
    }

    /// Virtual MAC of this entry
    pub fn vmac(&self) -> Vmac {
        self.vmac
    }

    /// Current resolution state
    pub async fn state(&self) -> EntryState {
        self.inner.lock().await.state
    }

    /// Resolved care-of address, if any
    pub async fn care_of(&self) -> Option<CareOfAddress> {
        self.inner.lock().await.care_of
    }

    /// Probes sent for the current resolution attempt
    pub async fn probe_count(&self) -> u32 {
        self.inner.lock().await.probe_count
    }

    /// Frames currently queued
    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Whether the entry is pinned against update/sweep/flush
    pub async fn is_permanent(&self) -> bool {
        self.inner.lock().await.permanent
    }

    /// Pin the entry to a fixed care-of address
    pub async fn set_permanent(&self, care_of: CareOfAddress) {
        let mut inner = self.inner.lock().await;
        inner.state = EntryState::Reachable;
        inner.care_of = Some(care_of);
        inner.permanent = true;
        inner.last_updated = Instant::now();
    }

    /// Snapshot for control-plane listings
    pub async fn snapshot(&self) -> EntrySnapshot {
        let inner = self.inner.lock().await;
        EntrySnapshot {
            vnet: self.vnet,
            vmac: self.vmac,
            state: inner.state,
            care_of: inner.care_of,
            probe_count: inner.probe_count,
            queue_len: inner.queue.len(),
            permanent: inner.permanent,
            age: inner.last_updated.elapsed(),
        }
    }
}

/// Control-plane view of one entry
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub vnet: VnetId,
    pub vmac: Vmac,
    pub state: EntryState,
    pub care_of: Option<CareOfAddress>,
    pub probe_count: u32,
    pub queue_len: usize,
    pub permanent: bool,
    pub age: std::time::Duration,
}

/// Cache counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub probes_sent: u64,
    pub frames_dropped: u64,
    pub entries_swept: u64,
}

#[derive(Default)]
struct StatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    probes_sent: AtomicU64,
    frames_dropped: AtomicU64,
    entries_swept: AtomicU64,
}

enum ProbeOutcome {
    /// Probe sent (or send failed and will be retried), keep the timer
    Rearmed,
    /// Entry resolved, removed, or superseded; timer stops
    Stopped,
    /// Probe budget exhausted; entry failed and queue dropped
    Failed,
}

/// The resolution cache.
pub struct AddressCache {
    entries: RwLock<HashMap<ResolutionKey, Arc<ResolutionEntry>>>,
    vifs: Arc<VifTable>,
    forwarder: Arc<dyn Forwarder>,
    config: CoreConfig,
    stats: StatsInner,
}

impl AddressCache {
    /// Create a cache
    pub fn new(config: CoreConfig, vifs: Arc<VifTable>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            vifs,
            forwarder,
            config,
            stats: StatsInner::default(),
        }
    }

    /// Look up an entry, creating an incomplete one on miss.
    pub async fn lookup_or_create(&self, vnet: VnetId, vmac: Vmac) -> Arc<ResolutionEntry> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&(vnet, vmac)) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check: another path may have created it while we upgraded
        if let Some(entry) = entries.get(&(vnet, vmac)) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return entry.clone();
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ResolutionEntry::new(vnet, vmac));
        entries.insert((vnet, vmac), entry.clone());
        trace!("created resolution entry for {} on {}", vmac, vnet);
        entry
    }

    /// Look up an entry without creating
    pub async fn lookup(&self, vnet: VnetId, vmac: Vmac) -> Option<Arc<ResolutionEntry>> {
        let entries = self.entries.read().await;
        let hit = entries.get(&(vnet, vmac)).cloned();
        match hit {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    /// Set address and state of an existing entry.
    ///
    /// Permanent entries are left untouched; a missing entry is an error.
    pub async fn update(
        &self,
        vnet: VnetId,
        vmac: Vmac,
        care_of: CareOfAddress,
        state: EntryState,
    ) -> CoreResult<()> {
        let entry = self.lookup(vnet, vmac).await.ok_or(CoreError::NotFound)?;
        let mut inner = entry.inner.lock().await;
        if inner.permanent {
            return Ok(());
        }
        inner.care_of = Some(care_of);
        inner.state = state;
        inner.last_updated = Instant::now();
        if state == EntryState::Reachable {
            inner.probing = false;
            inner.probe_count = 0;
        }
        Ok(())
    }

    /// Route one outbound frame through an entry.
    ///
    /// Reachable: drain any queued frames (oldest first), then send this
    /// one. Unresolved multicast/broadcast: flood instead of queuing.
    /// Otherwise: queue (evicting the oldest on overflow) and make sure
    /// a probe timer is running.
    pub async fn output(
        self: &Arc<Self>,
        entry: &Arc<ResolutionEntry>,
        frame: Bytes,
    ) -> CoreResult<()> {
        let dst = ether_dst(&frame)?;

        enum Action {
            Send(CareOfAddress, Vec<Bytes>),
            Flood,
            Queued(bool),
        }

        let action = {
            let mut inner = entry.inner.lock().await;
            match inner.state {
                EntryState::Reachable => {
                    let care_of = inner.care_of.ok_or(CoreError::NotFound)?;
                    let drained: Vec<Bytes> = inner.queue.drain(..).collect();
                    inner.last_updated = Instant::now();
                    Action::Send(care_of, drained)
                }
                _ if dst.is_multicast() => Action::Flood,
                EntryState::Incomplete | EntryState::Failed => {
                    if inner.state == EntryState::Failed {
                        // A fresh frame restarts resolution
                        inner.state = EntryState::Incomplete;
                        inner.probe_count = 0;
                    }
                    inner.queue.push_back(frame.clone());
                    if inner.queue.len() > self.config.queue_max {
                        inner.queue.pop_front();
                        inner.dropped += 1;
                        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("queue overflow for {} on {}", entry.vmac, entry.vnet);
                    }
                    let arm = !inner.probing;
                    if arm {
                        inner.probing = true;
                        inner.probe_gen += 1;
                    }
                    Action::Queued(arm)
                }
            }
        };

        match action {
            Action::Send(care_of, drained) => {
                for queued in drained {
                    if let Err(e) = self
                        .forwarder
                        .send_unicast(entry.vnet, care_of, queued)
                        .await
                    {
                        warn!("drain send to {} failed: {}", care_of, e);
                    }
                }
                self.forwarder.send_unicast(entry.vnet, care_of, frame).await
            }
            Action::Flood => self.forwarder.flood(entry.vnet, frame).await,
            Action::Queued(arm) => {
                if arm {
                    self.arm_probe(entry.clone()).await;
                }
                Ok(())
            }
        }
    }

    /// Answer a resolution request if the queried key is one of ours.
    pub async fn handle_request(
        &self,
        vnet: VnetId,
        vmac: Vmac,
        local: CareOfAddress,
    ) -> Option<VarpMessage> {
        if self.vifs.lookup(vnet, vmac).await.is_some() {
            debug!("answering resolution request for {} on {}", vmac, vnet);
            Some(VarpMessage::announce(vnet, vmac, local))
        } else {
            None
        }
    }

    /// Process an announce: create or update the entry to reachable and
    /// drain anything queued behind it, oldest first.
    pub async fn handle_announce(
        &self,
        vnet: VnetId,
        vmac: Vmac,
        care_of: CareOfAddress,
    ) -> CoreResult<()> {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(&(vnet, vmac)).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let mut entries = self.entries.write().await;
                entries
                    .entry((vnet, vmac))
                    .or_insert_with(|| Arc::new(ResolutionEntry::new(vnet, vmac)))
                    .clone()
            }
        };

        let drained = {
            let mut inner = entry.inner.lock().await;
            if inner.permanent {
                return Ok(());
            }
            inner.state = EntryState::Reachable;
            inner.care_of = Some(care_of);
            inner.last_updated = Instant::now();
            inner.probing = false;
            inner.probe_count = 0;
            inner.queue.drain(..).collect::<Vec<Bytes>>()
        };

        if !drained.is_empty() {
            debug!(
                "{} on {} reachable at {}, draining {} frames",
                vmac,
                vnet,
                care_of,
                drained.len()
            );
        }
        for frame in drained {
            if let Err(e) = self.forwarder.send_unicast(vnet, care_of, frame).await {
                warn!("drain send to {} failed: {}", care_of, e);
            }
        }
        Ok(())
    }

    /// Remove entries idle beyond the TTL that are neither probing nor
    /// permanent. Returns the number removed.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().await;
        let mut removed = Vec::new();
        for (key, entry) in entries.iter() {
            let mut inner = entry.inner.lock().await;
            if inner.probing || inner.permanent {
                continue;
            }
            if now.duration_since(inner.last_updated) > self.config.entry_ttl {
                inner.deleted = true;
                removed.push(*key);
            }
        }
        for key in &removed {
            entries.remove(key);
            info!("swept resolution entry for {} on {}", key.1, key.0);
        }
        self.stats
            .entries_swept
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }

    /// Administrative reset: drop every non-probing, non-permanent entry.
    pub async fn flush(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut removed = Vec::new();
        for (key, entry) in entries.iter() {
            let mut inner = entry.inner.lock().await;
            if inner.probing || inner.permanent {
                continue;
            }
            inner.deleted = true;
            removed.push(*key);
        }
        for key in &removed {
            entries.remove(key);
        }
        info!("flushed {} resolution entries", removed.len());
        removed.len()
    }

    /// Remove one entry regardless of state.
    pub async fn remove(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(&(vnet, vmac)).ok_or(CoreError::NotFound)?;
        entry.inner.lock().await.deleted = true;
        Ok(())
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshots of all entries
    pub async fn list(&self) -> Vec<EntrySnapshot> {
        let entries = self.entries.read().await;
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            snapshots.push(entry.snapshot().await);
        }
        snapshots
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            probes_sent: self.stats.probes_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            entries_swept: self.stats.entries_swept.load(Ordering::Relaxed),
        }
    }

    /// Spawn the probe timer task for an entry. The task holds its own
    /// reference so the entry outlives the table for as long as the
    /// timer runs.
    async fn arm_probe(self: &Arc<Self>, entry: Arc<ResolutionEntry>) {
        let generation = entry.inner.lock().await.probe_gen;
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match cache.probe_tick(&entry, generation).await {
                    ProbeOutcome::Rearmed => {
                        tokio::time::sleep(cache.config.probe_interval).await;
                    }
                    ProbeOutcome::Stopped | ProbeOutcome::Failed => break,
                }
            }
        });
    }

    /// One firing of an entry's probe timer.
    ///
    /// Checks the tombstone and generation under the entry lock before
    /// acting: a timer racing with removal or re-arm must no-op.
    async fn probe_tick(&self, entry: &Arc<ResolutionEntry>, generation: u64) -> ProbeOutcome {
        let dropped = {
            let mut inner = entry.inner.lock().await;
            if inner.deleted || !inner.probing || inner.probe_gen != generation {
                return ProbeOutcome::Stopped;
            }
            if inner.state != EntryState::Incomplete || inner.queue.is_empty() {
                inner.probing = false;
                return ProbeOutcome::Stopped;
            }
            if inner.probe_count >= self.config.max_probes {
                let dropped: Vec<Bytes> = inner.queue.drain(..).collect();
                inner.state = EntryState::Failed;
                inner.probing = false;
                inner.dropped += dropped.len() as u64;
                Some(dropped)
            } else {
                inner.probe_count += 1;
                None
            }
        };

        match dropped {
            Some(dropped) => {
                self.stats
                    .frames_dropped
                    .fetch_add(dropped.len() as u64, Ordering::Relaxed);
                warn!(
                    "resolution of {} on {} failed after {} probes, dropping {} frames",
                    entry.vmac,
                    entry.vnet,
                    self.config.max_probes,
                    dropped.len()
                );
                ProbeOutcome::Failed
            }
            None => {
                match self.forwarder.send_probe(entry.vnet, entry.vmac).await {
                    Ok(()) => {
                        self.stats.probes_sent.fetch_add(1, Ordering::Relaxed);
                        trace!("probe sent for {} on {}", entry.vmac, entry.vnet);
                    }
                    Err(e) => {
                        // Retried on the next tick
                        warn!("probe send for {} on {} failed: {}", entry.vmac, entry.vnet, e);
                    }
                }
                ProbeOutcome::Rearmed
            }
        }
    }
}
