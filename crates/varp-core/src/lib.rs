//! VARP Core
//!
//! The concurrent heart of the system: the resolution cache with its
//! per-entry probe state machines, the tunnel registry and chains, the
//! security association table, the peer overlay, and the node dispatch
//! layer tying them to a datagram transport.
//!
//! Every table allows concurrent lookups from packet paths and
//! timer-driven background tasks; entries are shared `Arc`s so nothing
//! is freed while a probe timer or an in-flight send still holds it.

pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod peers;
pub mod sa;
pub mod transport;
pub mod tunnel;
pub mod vif;
pub mod vnet;

pub use cache::{AddressCache, CacheStats, EntrySnapshot, EntryState, Forwarder, ResolutionEntry};
pub use config::{CoreConfig, SaDefaults, DEFAULT_MULTICAST, DEFAULT_PORT};
pub use error::{CoreError, CoreResult, CreateError, ReplaceError, SendError};
pub use node::{NodeStats, VarpNode};
pub use peers::{Peer, PeerRegistry};
pub use sa::{
    ReplayPolicy, SaParams, SaState, SaTransforms, SecurityAssociation,
    SecurityAssociationTable,
};
pub use transport::{ChannelSink, FrameSink, MemoryTransport, Transport, UdpTransport};
pub use tunnel::{Tunnel, TunnelRegistry, TunnelStage};
pub use vif::{VifEntry, VifTable};
pub use vnet::{VnetDescriptor, VnetRegistry};
