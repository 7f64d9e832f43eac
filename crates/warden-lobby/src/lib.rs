//! Warden Traffic Lobby
//!
//! The classification and quarantine state machine. A flow the policy
//! engine cannot decide lands here and is either let through, held for
//! inspection, or dropped.
//!
//! State machine per flow:
//!
//! ```text
//! NEW -> CLASSIFYING -> ALLOW
//!                    -> BLOCK
//!                    -> LOBBY -> RESOLVED_ALLOW   (explicit or relaxed expiry)
//!                             -> RESOLVED_BLOCK   (explicit or balanced expiry)
//!                             -> EXPIRED
//! ```
//!
//! Fail-safe, not fail-open: classification errors degrade to LOBBY,
//! never ALLOW.

mod flow;
mod trigger;
mod config;
mod classifier;
mod lobby;

pub use flow::{Flow, FlowId, Protocol};
pub use trigger::{
    APP_CANCELLED_REASON, DUPLICATE_ENTRY_REASON, EXPIRED_REASON, THREAT_MATCH_REASON, Trigger,
};
pub use config::{LobbyConfig, LobbyTimeouts, expiry_for};
pub use classifier::{BeaconCheck, Classification, Classifier, no_beacon_check};
pub use lobby::{FlowTicket, LobbyEntry, LobbyError, LobbyState, SweepHandle, TrafficLobby, Verdict};
