//! Warden Connection Logger
//!
//! Durable, append-only record of every flow decision.
//!
//! Architecture:
//! 1. `record()` never blocks the decision path: entries go through an
//!    unbounded channel to a dedicated writer thread (JSON Lines)
//! 2. A bounded in-memory ring serves newest-first queries for the
//!    Privacy Dashboard collaborator
//! 3. An xxh3 pair-key set answers the lobby's first-contact heuristic

mod logger;

pub use logger::{
    ConnectionLogEntry, ConnectionLogger, Decision, LogError, LogQuery, unix_millis_now,
};
