//! Warden Policy Layer
//!
//! Per-application network policy: who may talk, over which transport,
//! to which destinations.
//!
//! Architecture:
//! 1. One `AppNetworkPolicy` per application identity, owned by the engine
//! 2. Readers get immutable `Arc` snapshots - a policy update swaps the
//!    snapshot, it never mutates one in place
//! 3. `evaluate()` is the hot path: ordered rules, first match wins

mod policy;
mod engine;

pub use policy::{
    AppId, AppNetworkPolicy, Cidr, Destination, DomainSet, HostAddr, LobbyMode, NetworkKind,
    PolicyError, mask_addr, normalize_domain,
};
pub use engine::{PolicyBlock, PolicyEngine, PolicyVerdict};
