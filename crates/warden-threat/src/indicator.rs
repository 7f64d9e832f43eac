//! Indicator types shared with the feed collaborator and the audit log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of thing an indicator names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorType {
    Domain,
    Ip,
    Hash,
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::Ip => write!(f, "ip"),
            Self::Hash => write!(f, "hash"),
        }
    }
}

/// Threat severity, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High-confidence threats are blocked outright, never quarantined.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One lookup result: an immutable snapshot of what the database knew.
///
/// Not retained by the lobby; it travels with the decision into the
/// connection log and nowhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatMatch {
    pub indicator: String,
    pub indicator_type: IndicatorType,
    /// Feed-owned vocabulary ("c2", "phishing", ...); deliberately a free
    /// string so new feed values never break ingestion
    pub threat_type: String,
    pub severity: Severity,
    pub campaign_id: Option<String>,
    /// 0-100
    pub confidence: u8,
}
