//! Threat Scanner
//!
//! The lookup service the decision pipeline calls inline. Read-only and
//! side-effect-free; the database it reads is refreshed out-of-band by
//! the feed-sync collaborator through `replace`/`merge`.
//!
//! Concurrency model: lookups clone an `Arc<ThreatDb>` snapshot out of a
//! short read lock and query without holding it. A refresh builds a
//! fresh database and swaps the Arc; readers mid-lookup keep the old one.

use crate::db::ThreatDb;
use crate::feed::FeedRecord;
use crate::indicator::{IndicatorType, ThreatMatch};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use warden_policy::{Destination, normalize_domain};

/// Scanner errors
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// No feed has ever been loaded (or the store is wedged); callers
    /// degrade toward LOBBY, never ALLOW
    #[error("Threat database unavailable")]
    Unavailable,
}

/// Lookup statistics
#[derive(Debug, Default)]
struct ScannerStats {
    lookups: AtomicU64,
    hits: AtomicU64,
}

struct Inner {
    /// Canonical record set keyed by (type, normalized indicator);
    /// `merge` overlays onto this and rebuilds the index
    records: HashMap<(IndicatorType, String), FeedRecord>,
    db: Option<Arc<ThreatDb>>,
}

/// Concurrent indicator lookup service.
pub struct ThreatScanner {
    inner: RwLock<Inner>,
    stats: ScannerStats,
}

impl ThreatScanner {
    /// A scanner with no database yet: every lookup reports
    /// `ScanError::Unavailable` until the first `replace`.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                db: None,
            }),
            stats: ScannerStats::default(),
        }
    }

    /// Replace the whole database with a new feed snapshot.
    pub fn replace(&self, records: Vec<FeedRecord>) {
        let mut map = HashMap::new();
        for record in records {
            map.insert(record_key(&record), record);
        }
        let db = Arc::new(ThreatDb::from_records(map.values()));

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        info!("Threat database replaced: {} entries", db.len());
        inner.records = map;
        inner.db = Some(db);
    }

    /// Overlay new records onto the current set; the newest record wins
    /// per indicator.
    pub fn merge(&self, records: Vec<FeedRecord>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            inner.records.insert(record_key(&record), record);
        }
        let db = Arc::new(ThreatDb::from_records(inner.records.values()));
        info!("Threat database merged: {} entries", db.len());
        inner.db = Some(db);
    }

    /// Look up one indicator. Bounded time, never network I/O.
    pub fn lookup(
        &self,
        indicator: &str,
        indicator_type: IndicatorType,
    ) -> Result<Option<ThreatMatch>, ScanError> {
        let db = self.snapshot()?;
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let hit = match indicator_type {
            IndicatorType::Domain => db.lookup_domain(indicator).cloned(),
            IndicatorType::Ip => indicator
                .trim()
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| db.lookup_ip(ip).cloned()),
            IndicatorType::Hash => db.lookup_hash(indicator).cloned(),
        };

        if let Some(ref threat) = hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Threat match: {} -> {} ({})",
                indicator, threat.threat_type, threat.severity
            );
        }

        Ok(hit)
    }

    /// Domain-or-IP lookup for a flow destination.
    pub fn lookup_destination(
        &self,
        destination: &Destination,
    ) -> Result<Option<ThreatMatch>, ScanError> {
        if let Some(domain) = destination.domain_name() {
            return self.lookup(domain, IndicatorType::Domain);
        }
        let db = self.snapshot()?;
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let hit = destination
            .ip_addr()
            .and_then(|ip| db.lookup_ip(ip).cloned());
        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    /// (lookups, hits)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.lookups.load(Ordering::Relaxed),
            self.stats.hits.load(Ordering::Relaxed),
        )
    }

    /// Number of indexed entries, if a database is loaded.
    pub fn entry_count(&self) -> Option<usize> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.db.as_ref().map(|db| db.len())
    }

    fn snapshot(&self) -> Result<Arc<ThreatDb>, ScanError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.db.clone().ok_or(ScanError::Unavailable)
    }
}

impl Default for ThreatScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn record_key(record: &FeedRecord) -> (IndicatorType, String) {
    let normalized = match record.indicator_type {
        IndicatorType::Domain => normalize_domain(&record.indicator),
        IndicatorType::Ip => record.indicator.trim().to_string(),
        IndicatorType::Hash => record.indicator.trim().to_lowercase(),
    };
    (record.indicator_type, normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::Severity;

    fn record(indicator: &str, indicator_type: IndicatorType, severity: Severity) -> FeedRecord {
        FeedRecord {
            indicator: indicator.to_string(),
            indicator_type,
            threat_type: "c2".to_string(),
            severity,
            campaign_id: Some("APT-1".to_string()),
            confidence: 90,
        }
    }

    #[test]
    fn test_unloaded_scanner_is_unavailable() {
        let scanner = ThreatScanner::new();
        let result = scanner.lookup("evil.example.com", IndicatorType::Domain);
        assert!(matches!(result, Err(ScanError::Unavailable)));
    }

    #[test]
    fn test_empty_replace_makes_scanner_available() {
        let scanner = ThreatScanner::new();
        scanner.replace(Vec::new());

        let result = scanner.lookup("evil.example.com", IndicatorType::Domain);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_lookup_after_replace() {
        let scanner = ThreatScanner::new();
        scanner.replace(vec![record(
            "evil.example.com",
            IndicatorType::Domain,
            Severity::High,
        )]);

        let hit = scanner
            .lookup("evil.example.com", IndicatorType::Domain)
            .unwrap()
            .unwrap();
        assert_eq!(hit.severity, Severity::High);
        assert_eq!(hit.campaign_id.as_deref(), Some("APT-1"));

        assert!(scanner
            .lookup("fine.example.org", IndicatorType::Domain)
            .unwrap()
            .is_none());

        let (lookups, hits) = scanner.stats();
        assert_eq!(lookups, 2);
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_merge_overlays_newest() {
        let scanner = ThreatScanner::new();
        scanner.replace(vec![record(
            "evil.example.com",
            IndicatorType::Domain,
            Severity::Low,
        )]);
        scanner.merge(vec![
            record("evil.example.com", IndicatorType::Domain, Severity::Critical),
            record("198.51.100.7", IndicatorType::Ip, Severity::Medium),
        ]);

        let hit = scanner
            .lookup("evil.example.com", IndicatorType::Domain)
            .unwrap()
            .unwrap();
        assert_eq!(hit.severity, Severity::Critical);
        assert_eq!(scanner.entry_count(), Some(2));
    }

    #[test]
    fn test_lookup_destination() {
        let scanner = ThreatScanner::new();
        scanner.replace(vec![
            record("evil.example.com", IndicatorType::Domain, Severity::High),
            record("203.0.113.0/24", IndicatorType::Ip, Severity::Critical),
        ]);

        let hit = scanner
            .lookup_destination(&Destination::domain("evil.example.com", 443))
            .unwrap();
        assert!(hit.is_some());

        let hit = scanner
            .lookup_destination(&Destination::ip("203.0.113.9".parse().unwrap(), 443))
            .unwrap();
        assert_eq!(hit.unwrap().severity, Severity::Critical);

        let hit = scanner
            .lookup_destination(&Destination::ip("192.0.2.1".parse().unwrap(), 443))
            .unwrap();
        assert!(hit.is_none());
    }
}
