//! Security associations
//!
//! An association binds an SPI to a peer, a protocol, and a pair of
//! transforms, and carries the outbound sequence counter and lifetime
//! accounting. Associations are immutable once built: rekeying replaces
//! the object rather than mutating it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use varp_crypto::{spi_mangle, CipherTransform, DigestTransform, TransformRegistry};
use varp_wire::{decode_secure, encode_secure, CareOfAddress, FormatError, SecurePacket};

use crate::error::{CoreError, CoreResult, CreateError, ReplaceError, SendError};

/// Attempts at deriving a collision-free SPI before giving up
pub const SPI_RETRY_MAX: u32 = 100;

/// Inbound anti-replay enforcement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Accept any sequence number
    Off,
    /// Sliding window of the given width (capped at 64)
    Window(u32),
}

/// Sliding-window replay state, standard ESP-style bitmap.
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: u32,
    bitmap: u64,
}

impl ReplayWindow {
    /// Accept `seq` if it is new within the window, recording it.
    fn check_and_update(&mut self, seq: u32, width: u32) -> bool {
        if seq == 0 {
            return false;
        }
        let width = width.clamp(1, 64);
        if seq > self.highest {
            let shift = seq - self.highest;
            if shift < 64 {
                self.bitmap = (self.bitmap << shift) | 1;
            } else {
                self.bitmap = 1;
            }
            self.highest = seq;
            return true;
        }
        let offset = self.highest - seq;
        if offset >= width {
            return false;
        }
        let bit = 1u64 << offset;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Lifecycle state of an association
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaState {
    /// Placeholder awaiting key material; carries no transforms
    Acquire,
    /// Fully keyed and usable
    Valid,
}

/// Transform selection and key material for a new association.
#[derive(Clone)]
pub struct SaTransforms {
    pub cipher: String,
    pub cipher_key: Vec<u8>,
    pub digest: String,
    pub digest_key: Vec<u8>,
    /// Encrypt the payload; when false the null cipher is used
    pub confidentiality: bool,
    /// Authenticate the packet; when false the null digest is used
    pub authentication: bool,
}

/// Parameters for creating or replacing an association.
#[derive(Clone)]
pub struct SaParams {
    /// Explicit SPI, or 0 to derive one
    pub spi: u32,
    pub protocol: u8,
    pub peer: CareOfAddress,
    pub transforms: SaTransforms,
    /// Bytes protected before a warning is logged (0 = none)
    pub soft_limit: u64,
    /// Bytes protected before the association refuses traffic (0 = none)
    pub hard_limit: u64,
    pub replay: ReplayPolicy,
}

/// One security association.
pub struct SecurityAssociation {
    id: u64,
    spi: u32,
    protocol: u8,
    peer: CareOfAddress,
    state: SaState,
    cipher: Option<Arc<dyn CipherTransform>>,
    digest: Option<Arc<dyn DigestTransform>>,
    seq: AtomicU32,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    integrity_failures: AtomicU64,
    replay_failures: AtomicU64,
    soft_warned: AtomicBool,
    soft_limit: u64,
    hard_limit: u64,
    replay_policy: ReplayPolicy,
    replay: Mutex<ReplayWindow>,
    created_at: Instant,
}

impl SecurityAssociation {
    /// Table-unique identifier, stable across rekey
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SPI carried on the wire (0 while in acquire state)
    pub fn spi(&self) -> u32 {
        self.spi
    }

    /// Inner protocol this association protects
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Remote endpoint
    pub fn peer(&self) -> CareOfAddress {
        self.peer
    }

    /// Lifecycle state
    pub fn state(&self) -> SaState {
        self.state
    }

    /// Bytes protected so far
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Inbound packets that failed integrity verification
    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Inbound packets rejected by the replay window
    pub fn replay_failures(&self) -> u64 {
        self.replay_failures.load(Ordering::Relaxed)
    }

    /// Time since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Next outbound sequence number; the first packet carries 1.
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wrap `payload` in the secure framing.
    pub fn protect(&self, next_proto: u8, payload: &[u8]) -> CoreResult<Bytes> {
        let (cipher, digest) = match (&self.cipher, &self.digest) {
            (Some(c), Some(d)) => (c, d),
            _ => return Err(SendError::NoRoute.into()),
        };

        let protected = self.tx_bytes.load(Ordering::Relaxed);
        if self.hard_limit > 0 && protected >= self.hard_limit {
            return Err(SendError::TransportFailure(format!(
                "association {:#010x} exceeded its hard lifetime limit",
                self.spi
            ))
            .into());
        }
        if self.soft_limit > 0
            && protected >= self.soft_limit
            && !self.soft_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                "association {:#010x} passed its soft lifetime limit, rekey recommended",
                self.spi
            );
        }

        let seq = self.next_seq();
        let packet = encode_secure(self.spi, seq, next_proto, payload, cipher.as_ref(), digest.as_ref())?;
        self.tx_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }

    /// Verify, decrypt, and replay-check one inbound packet.
    ///
    /// The integrity check runs before decryption; a forged packet never
    /// advances the replay window or any other inbound state.
    pub async fn unprotect(&self, datagram: &[u8]) -> CoreResult<SecurePacket> {
        let (cipher, digest) = match (&self.cipher, &self.digest) {
            (Some(c), Some(d)) => (c, d),
            _ => return Err(CoreError::NotFound),
        };

        let packet = match decode_secure(datagram, cipher.as_ref(), digest.as_ref()) {
            Ok(packet) => packet,
            Err(e @ FormatError::IntegrityCheckFailed) => {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if let ReplayPolicy::Window(width) = self.replay_policy {
            let mut window = self.replay.lock().await;
            if !window.check_and_update(packet.seq, width) {
                self.replay_failures.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::ReplayRejected(packet.seq));
            }
        }

        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }
}

impl std::fmt::Debug for SecurityAssociation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityAssociation")
            .field("id", &self.id)
            .field("spi", &format_args!("{:#010x}", self.spi))
            .field("protocol", &self.protocol)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}

/// Inbound fast-path index key
type SpiKey = (u32, u8, CareOfAddress);

/// Table of associations, indexed by (spi, protocol, peer) for the
/// inbound fast path and by id for the control plane.
pub struct SecurityAssociationTable {
    by_spi: RwLock<HashMap<SpiKey, Arc<SecurityAssociation>>>,
    by_id: RwLock<HashMap<u64, Arc<SecurityAssociation>>>,
    next_id: AtomicU64,
    registry: TransformRegistry,
}

impl SecurityAssociationTable {
    /// Create a table backed by the default transform registry
    pub fn new() -> Self {
        Self {
            by_spi: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            registry: TransformRegistry::with_defaults(),
        }
    }

    fn build(
        &self,
        id: u64,
        spi: u32,
        params: &SaParams,
    ) -> Result<SecurityAssociation, CreateError> {
        let t = &params.transforms;
        let cipher = if t.confidentiality {
            self.registry.cipher(&t.cipher, &t.cipher_key)
        } else {
            self.registry.cipher("null", &[])
        }
        .map_err(|_| CreateError::TransformUnavailable(t.cipher.clone()))?;
        let digest = if t.authentication {
            self.registry.digest(&t.digest, &t.digest_key)
        } else {
            self.registry.digest("null", &[])
        }
        .map_err(|_| CreateError::TransformUnavailable(t.digest.clone()))?;

        Ok(SecurityAssociation {
            id,
            spi,
            protocol: params.protocol,
            peer: params.peer,
            state: SaState::Valid,
            cipher: Some(cipher),
            digest: Some(digest),
            seq: AtomicU32::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            replay_failures: AtomicU64::new(0),
            soft_warned: AtomicBool::new(false),
            soft_limit: params.soft_limit,
            hard_limit: params.hard_limit,
            replay_policy: params.replay,
            replay: Mutex::new(ReplayWindow::default()),
            created_at: Instant::now(),
        })
    }

    /// Derive a collision-free SPI from the digest key, the protocol,
    /// and the peer address. Must run under the `by_spi` write lock so
    /// the chosen SPI cannot race with a concurrent create.
    fn derive_spi(
        taken: &HashMap<SpiKey, Arc<SecurityAssociation>>,
        params: &SaParams,
    ) -> Result<u32, CreateError> {
        let key = if params.transforms.digest_key.is_empty() {
            &params.transforms.cipher_key
        } else {
            &params.transforms.digest_key
        };
        let addr = params.peer.addr_bytes();
        for offset in 0..SPI_RETRY_MAX {
            let candidate = spi_mangle(key, offset, params.protocol, &addr);
            if candidate != 0 && !taken.contains_key(&(candidate, params.protocol, params.peer)) {
                return Ok(candidate);
            }
        }
        Err(CreateError::SpiExhausted(SPI_RETRY_MAX))
    }

    /// Create a valid association. A zero SPI in the parameters asks the
    /// table to derive one.
    pub async fn create(&self, params: SaParams) -> CoreResult<Arc<SecurityAssociation>> {
        let mut by_spi = self.by_spi.write().await;

        let spi = if params.spi == 0 {
            Self::derive_spi(&by_spi, &params)?
        } else {
            if by_spi.contains_key(&(params.spi, params.protocol, params.peer)) {
                return Err(CreateError::SpiInUse(params.spi).into());
            }
            params.spi
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sa = Arc::new(self.build(id, spi, &params)?);
        by_spi.insert((spi, params.protocol, params.peer), sa.clone());
        self.by_id.write().await.insert(id, sa.clone());
        info!(
            "installed association {:#010x} for protocol {} to {}",
            spi, params.protocol, params.peer
        );
        Ok(sa)
    }

    /// Create an acquire-state placeholder, visible by id only.
    pub async fn acquire(&self, protocol: u8, peer: CareOfAddress) -> Arc<SecurityAssociation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sa = Arc::new(SecurityAssociation {
            id,
            spi: 0,
            protocol,
            peer,
            state: SaState::Acquire,
            cipher: None,
            digest: None,
            seq: AtomicU32::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            replay_failures: AtomicU64::new(0),
            soft_warned: AtomicBool::new(false),
            soft_limit: 0,
            hard_limit: 0,
            replay_policy: ReplayPolicy::Off,
            replay: Mutex::new(ReplayWindow::default()),
            created_at: Instant::now(),
        });
        self.by_id.write().await.insert(id, sa.clone());
        debug!("acquire placeholder {} for protocol {} to {}", id, protocol, peer);
        sa
    }

    /// Key an acquire placeholder, turning it into a valid association
    /// under the same id.
    pub async fn replace(
        &self,
        id: u64,
        params: SaParams,
    ) -> CoreResult<Arc<SecurityAssociation>> {
        let mut by_spi = self.by_spi.write().await;
        let mut by_id = self.by_id.write().await;

        let existing = by_id.get(&id).ok_or(CoreError::NotFound)?;
        if existing.state != SaState::Acquire {
            return Err(ReplaceError::InvalidState.into());
        }

        let spi = if params.spi == 0 {
            Self::derive_spi(&by_spi, &params)?
        } else {
            if by_spi.contains_key(&(params.spi, params.protocol, params.peer)) {
                return Err(CreateError::SpiInUse(params.spi).into());
            }
            params.spi
        };

        let sa = Arc::new(self.build(id, spi, &params)?);
        by_spi.insert((spi, params.protocol, params.peer), sa.clone());
        by_id.insert(id, sa.clone());
        info!("replaced acquire {} with association {:#010x}", id, spi);
        Ok(sa)
    }

    /// Inbound fast-path lookup
    pub async fn lookup_by_spi(
        &self,
        spi: u32,
        protocol: u8,
        peer: CareOfAddress,
    ) -> Option<Arc<SecurityAssociation>> {
        self.by_spi.read().await.get(&(spi, protocol, peer)).cloned()
    }

    /// Control-plane lookup by id
    pub async fn lookup_by_id(&self, id: u64) -> Option<Arc<SecurityAssociation>> {
        self.by_id.read().await.get(&id).cloned()
    }

    /// First valid association for (protocol, peer), used by the
    /// outbound tunnel path.
    pub async fn find_valid(
        &self,
        protocol: u8,
        peer: CareOfAddress,
    ) -> Option<Arc<SecurityAssociation>> {
        let by_spi = self.by_spi.read().await;
        by_spi
            .values()
            .find(|sa| sa.state == SaState::Valid && sa.protocol == protocol && sa.peer == peer)
            .cloned()
    }

    /// Remove an association by id, whatever its state.
    pub async fn delete(&self, id: u64) -> CoreResult<()> {
        let mut by_spi = self.by_spi.write().await;
        let mut by_id = self.by_id.write().await;
        let sa = by_id.remove(&id).ok_or(CoreError::NotFound)?;
        if sa.spi != 0 {
            by_spi.remove(&(sa.spi, sa.protocol, sa.peer));
        }
        info!("deleted association {} (spi {:#010x})", id, sa.spi);
        Ok(())
    }

    /// Remove every association bound to a peer. Returns the number
    /// removed.
    pub async fn delete_peer(&self, peer: CareOfAddress) -> usize {
        let mut by_spi = self.by_spi.write().await;
        let mut by_id = self.by_id.write().await;
        let doomed: Vec<u64> = by_id
            .values()
            .filter(|sa| sa.peer == peer)
            .map(|sa| sa.id)
            .collect();
        for id in &doomed {
            if let Some(sa) = by_id.remove(id) {
                if sa.spi != 0 {
                    by_spi.remove(&(sa.spi, sa.protocol, sa.peer));
                }
            }
        }
        doomed.len()
    }

    /// All associations
    pub async fn list(&self) -> Vec<Arc<SecurityAssociation>> {
        self.by_id.read().await.values().cloned().collect()
    }

    /// Number of associations (acquire placeholders included)
    pub async fn len(&self) -> usize {
        self.by_id.read().await.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SecurityAssociationTable {
    fn default() -> Self {
        Self::new()
    }
}
