//! Lobby configuration.

use std::time::Duration;
use warden_policy::LobbyMode;

/// How long a held flow may wait, per lobby mode.
#[derive(Debug, Clone, Copy)]
pub struct LobbyTimeouts {
    /// BALANCED: auto-BLOCK after this long
    pub balanced: Duration,
    /// RELAXED: auto-ALLOW after this long
    pub relaxed: Duration,
}

impl Default for LobbyTimeouts {
    fn default() -> Self {
        Self {
            balanced: Duration::from_secs(60),
            relaxed: Duration::from_secs(30),
        }
    }
}

/// Tunables for classification and the quarantine queue.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Uploads estimated above this are held for inspection
    pub upload_threshold_bytes: u64,
    pub timeouts: LobbyTimeouts,
    /// Granularity of the expiry sweep
    pub sweep_interval: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            upload_threshold_bytes: 5 * 1024 * 1024,
            timeouts: LobbyTimeouts::default(),
            sweep_interval: Duration::from_secs(2),
        }
    }
}

/// Expiry for a lobby entry. PARANOID entries never expire; someone has
/// to decide.
pub fn expiry_for(mode: LobbyMode, timeouts: &LobbyTimeouts) -> Option<Duration> {
    match mode {
        LobbyMode::Paranoid => None,
        LobbyMode::Balanced => Some(timeouts.balanced),
        LobbyMode::Relaxed => Some(timeouts.relaxed),
    }
}
