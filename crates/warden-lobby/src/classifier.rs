//! Flow Classifier
//!
//! Runs only when the policy engine answered NEEDS_CLASSIFICATION.
//! Computes the trigger set for a flow; any trigger present means LOBBY,
//! a blocking-severity threat match means BLOCK outright, an empty set
//! means ALLOW.
//!
//! Error posture: a scanner failure is itself a trigger. The classifier
//! never errors toward ALLOW.

use crate::flow::Flow;
use crate::trigger::Trigger;
use std::sync::Arc;
use tracing::{debug, warn};
use warden_log::{ConnectionLogger, unix_millis_now};
use warden_policy::{AppId, AppNetworkPolicy, Destination};
use warden_threat::{ThreatMatch, ThreatScanner};

/// The beacon/periodicity detector collaborator. Opaque: window and
/// regularity thresholds live on the other side of this seam.
pub type BeaconCheck = Arc<dyn Fn(&AppId, &Destination) -> bool + Send + Sync>;

/// A detector that never fires; default wiring until a real one is
/// plugged in.
pub fn no_beacon_check() -> BeaconCheck {
    Arc::new(|_, _| false)
}

/// Outcome of classification.
#[derive(Debug, Clone)]
pub enum Classification {
    /// Nothing suspicious; the threat match (if any, sub-blocking
    /// severity) travels along for the log
    Allow { threat: Option<ThreatMatch> },
    /// Hold for inspection
    Lobby {
        triggers: Vec<Trigger>,
        threat: Option<ThreatMatch>,
    },
    /// Confirmed high-confidence threat: dropped outright, never merely
    /// quarantined
    Block { threat: ThreatMatch },
}

/// Computes trigger sets from flows and scanner verdicts.
pub struct Classifier {
    scanner: Arc<ThreatScanner>,
    logger: Arc<ConnectionLogger>,
    beacon: BeaconCheck,
    upload_threshold_bytes: u64,
}

impl Classifier {
    pub fn new(
        scanner: Arc<ThreatScanner>,
        logger: Arc<ConnectionLogger>,
        beacon: BeaconCheck,
        upload_threshold_bytes: u64,
    ) -> Self {
        Self {
            scanner,
            logger,
            beacon,
            upload_threshold_bytes,
        }
    }

    /// Classify one flow against its policy snapshot.
    pub fn classify(&self, flow: &Flow, policy: &AppNetworkPolicy) -> Classification {
        let mut triggers = Vec::new();

        let threat = match self.scanner.lookup_destination(&flow.destination) {
            Ok(hit) => hit,
            Err(e) => {
                // Fail toward LOBBY, never ALLOW
                warn!("Threat scanner unavailable for {}: {}", flow.destination, e);
                triggers.push(Trigger::ScannerUnavailable);
                None
            }
        };

        if let Some(ref hit) = threat {
            if hit.severity.is_blocking() {
                debug!(
                    "Flow {} blocked on threat {} ({})",
                    flow.flow_id, hit.indicator, hit.severity
                );
                return Classification::Block {
                    threat: hit.clone(),
                };
            }
        }

        if !flow.resolved_via_dns {
            triggers.push(Trigger::DirectIp);
        }

        if !self.logger.has_allowed(&flow.app_id, &flow.destination) {
            triggers.push(Trigger::FirstContact);
        }

        if (self.beacon)(&flow.app_id, &flow.destination) {
            triggers.push(Trigger::BeaconPattern);
        }

        if flow.byte_count_estimate > self.upload_threshold_bytes {
            triggers.push(Trigger::LargeUpload);
        }

        if policy.is_on_probation(unix_millis_now()) {
            triggers.push(Trigger::NewAppProbation);
        }

        if triggers.is_empty() {
            Classification::Allow { threat }
        } else {
            debug!("Flow {} lobbied: {:?}", flow.flow_id, triggers);
            Classification::Lobby { triggers, threat }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Protocol;
    use warden_log::{ConnectionLogEntry, Decision};
    use warden_policy::NetworkKind;
    use warden_threat::{FeedRecord, IndicatorType, Severity};

    fn scanner_with(records: Vec<FeedRecord>) -> Arc<ThreatScanner> {
        let scanner = ThreatScanner::new();
        scanner.replace(records);
        Arc::new(scanner)
    }

    fn feed_record(indicator: &str, indicator_type: IndicatorType, severity: Severity) -> FeedRecord {
        FeedRecord {
            indicator: indicator.to_string(),
            indicator_type,
            threat_type: "c2".to_string(),
            severity,
            campaign_id: None,
            confidence: 90,
        }
    }

    fn seed_allowed(logger: &ConnectionLogger, app: &str, dest: &Destination) {
        logger.record(ConnectionLogEntry {
            flow_id: "seed".to_string(),
            app_id: AppId::new(app),
            destination: dest.clone(),
            decision: Decision::Allow,
            reason: vec![],
            threat_match: None,
            decided_at: 1,
        });
    }

    fn flow(app: &str, dest: Destination, via_dns: bool) -> Flow {
        Flow::new(
            AppId::new(app),
            dest,
            Protocol::Tcp,
            NetworkKind::Wifi,
            via_dns,
            1024,
        )
    }

    fn open_policy(app: &str) -> AppNetworkPolicy {
        let mut policy = AppNetworkPolicy::new(AppId::new(app));
        policy.network_allowed = true;
        policy
    }

    #[test]
    fn test_clean_flow_with_history_allows() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("api.example.com", 443);
        seed_allowed(&logger, "com.example.app", &dest);

        let classifier = Classifier::new(
            scanner_with(vec![]),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let result = classifier.classify(
            &flow("com.example.app", dest, true),
            &open_policy("com.example.app"),
        );
        assert!(matches!(result, Classification::Allow { threat: None }));
    }

    #[test]
    fn test_first_contact_lobbies() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let classifier = Classifier::new(
            scanner_with(vec![]),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let result = classifier.classify(
            &flow(
                "com.example.app",
                Destination::domain("new.example.com", 443),
                true,
            ),
            &open_policy("com.example.app"),
        );
        match result {
            Classification::Lobby { triggers, .. } => {
                assert_eq!(triggers, vec![Trigger::FirstContact]);
            }
            other => panic!("Expected lobby, got {:?}", other),
        }
    }

    #[test]
    fn test_blocking_severity_blocks_outright() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("evil.example.com", 443);
        seed_allowed(&logger, "com.example.app", &dest);

        let classifier = Classifier::new(
            scanner_with(vec![feed_record(
                "evil.example.com",
                IndicatorType::Domain,
                Severity::High,
            )]),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let result = classifier.classify(
            &flow("com.example.app", dest, true),
            &open_policy("com.example.app"),
        );
        match result {
            Classification::Block { threat } => {
                assert_eq!(threat.severity, Severity::High);
            }
            other => panic!("Expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_low_severity_match_travels_with_allow() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("shady.example.com", 443);
        seed_allowed(&logger, "com.example.app", &dest);

        let classifier = Classifier::new(
            scanner_with(vec![feed_record(
                "shady.example.com",
                IndicatorType::Domain,
                Severity::Low,
            )]),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let result = classifier.classify(
            &flow("com.example.app", dest, true),
            &open_policy("com.example.app"),
        );
        match result {
            Classification::Allow { threat } => {
                assert_eq!(threat.unwrap().severity, Severity::Low);
            }
            other => panic!("Expected allow, got {:?}", other),
        }
    }

    #[test]
    fn test_scanner_unavailable_fails_toward_lobby() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("api.example.com", 443);
        seed_allowed(&logger, "com.example.app", &dest);

        // Never-loaded scanner: every lookup errors
        let classifier = Classifier::new(
            Arc::new(ThreatScanner::new()),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let result = classifier.classify(
            &flow("com.example.app", dest, true),
            &open_policy("com.example.app"),
        );
        match result {
            Classification::Lobby { triggers, .. } => {
                assert_eq!(triggers, vec![Trigger::ScannerUnavailable]);
            }
            other => panic!("Expected lobby, got {:?}", other),
        }
    }

    #[test]
    fn test_beacon_and_upload_triggers() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("sync.example.com", 443);
        seed_allowed(&logger, "com.example.app", &dest);

        let classifier = Classifier::new(
            scanner_with(vec![]),
            logger,
            Arc::new(|_: &AppId, _: &Destination| true),
            1_000,
        );

        let mut f = flow("com.example.app", dest, true);
        f.byte_count_estimate = 50_000;

        let result = classifier.classify(&f, &open_policy("com.example.app"));
        match result {
            Classification::Lobby { triggers, .. } => {
                assert_eq!(triggers, vec![Trigger::BeaconPattern, Trigger::LargeUpload]);
            }
            other => panic!("Expected lobby, got {:?}", other),
        }
    }

    #[test]
    fn test_probation_triggers() {
        let logger = Arc::new(ConnectionLogger::in_memory(16));
        let dest = Destination::domain("unknown.example.com", 443);
        seed_allowed(&logger, "com.example.new", &dest);

        let classifier = Classifier::new(
            scanner_with(vec![]),
            logger,
            no_beacon_check(),
            5 * 1024 * 1024,
        );

        let mut policy = open_policy("com.example.new");
        policy.probation_until = Some(unix_millis_now() + 86_400_000);

        let result = classifier.classify(&flow("com.example.new", dest, true), &policy);
        match result {
            Classification::Lobby { triggers, .. } => {
                assert_eq!(triggers, vec![Trigger::NewAppProbation]);
            }
            other => panic!("Expected lobby, got {:?}", other),
        }
    }
}
