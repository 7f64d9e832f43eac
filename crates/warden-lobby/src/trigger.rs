//! Classification triggers.
//!
//! Any single trigger is enough to hold a flow in the lobby. The codes
//! are stable strings carried into the connection log `reason` lists.

use std::fmt;

/// Why a flow was held for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Direct-IP connection that bypassed DNS
    DirectIp,
    /// First-ever connection from this app to this destination
    FirstContact,
    /// Periodic connection pattern flagged by the beacon detector
    BeaconPattern,
    /// Estimated upload size over the configured threshold
    LargeUpload,
    /// App still inside its post-install probation window
    NewAppProbation,
    /// Threat scanner could not answer; failing safe
    ScannerUnavailable,
}

/// Reason code for a direct threat-intel block (no lobby entry exists).
pub const THREAT_MATCH_REASON: &str = "threat_match";

/// Reason code appended when an app's pending flows are cancelled.
pub const APP_CANCELLED_REASON: &str = "app_cancelled";

/// Reason code appended when the sweep auto-resolves an expired entry.
pub const EXPIRED_REASON: &str = "lobby_expired";

/// Reason code for a rejected duplicate lobby insert (fails closed).
pub const DUPLICATE_ENTRY_REASON: &str = "duplicate_lobby_entry";

impl Trigger {
    /// Stable snake_case code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DirectIp => "direct_ip",
            Self::FirstContact => "first_contact",
            Self::BeaconPattern => "beacon_pattern",
            Self::LargeUpload => "large_upload",
            Self::NewAppProbation => "new_app_probation",
            Self::ScannerUnavailable => "scanner_unavailable",
        }
    }

    /// Render a trigger list as log reason codes.
    pub fn codes(triggers: &[Trigger]) -> Vec<String> {
        triggers.iter().map(|t| t.code().to_string()).collect()
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
