//! Traffic Lobby
//!
//! Holds flows the classifier could not clear and manages them until an
//! explicit decision, an expiry, or an app cancellation resolves them.
//!
//! Concurrency model: the pending set is a `DashMap` keyed by flow id.
//! Admission uses insert-if-absent, resolution uses remove - whichever
//! of the resolution API and the expiry sweep removes the entry first
//! owns the (single) terminal transition. A held flow's caller parks on
//! a oneshot `FlowTicket` until that transition fires.

use crate::classifier::{Classification, Classifier};
use crate::config::{LobbyConfig, expiry_for};
use crate::flow::{Flow, FlowId};
use crate::trigger::{
    APP_CANCELLED_REASON, DUPLICATE_ENTRY_REASON, EXPIRED_REASON, THREAT_MATCH_REASON, Trigger,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use warden_log::{ConnectionLogEntry, ConnectionLogger, Decision, unix_millis_now};
use warden_policy::{AppId, AppNetworkPolicy, Destination, LobbyMode};
use warden_threat::ThreatMatch;

/// Lobby errors
#[derive(Debug, Clone, Error)]
pub enum LobbyError {
    /// Invariant violation: a second entry for an open flow. The insert
    /// is rejected; the data path keeps running.
    #[error("Duplicate lobby entry for flow {0}")]
    DuplicateEntry(FlowId),
}

/// Lifecycle of a held flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    Pending,
    ResolvedAllow,
    ResolvedBlock,
    Expired,
}

impl LobbyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One flow held for inspection.
#[derive(Debug, Clone)]
pub struct LobbyEntry {
    pub flow_id: FlowId,
    pub app_id: AppId,
    pub destination: Destination,
    /// Triggers that put the flow here, in evaluation order
    pub reason: Vec<Trigger>,
    pub lobby_mode: LobbyMode,
    /// Unix ms
    pub entered_at: u64,
    /// None for PARANOID: the entry waits for an explicit decision
    pub expires_at: Option<Instant>,
    pub state: LobbyState,
}

impl LobbyEntry {
    /// Time left before auto-resolution, if this entry expires at all.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Handle the flow's caller parks on while the flow sits in the lobby.
///
/// Resolves to `true` (release the flow) or `false` (drop it). A
/// cancelled entry resolves to `false`.
#[derive(Debug)]
pub struct FlowTicket {
    flow_id: FlowId,
    rx: oneshot::Receiver<bool>,
}

impl FlowTicket {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Wait for the terminal decision.
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

/// What the interceptor hands back to the packet path.
#[derive(Debug)]
pub enum Verdict {
    Allow,
    Block {
        reason: Vec<String>,
        threat: Option<ThreatMatch>,
    },
    /// The flow is suspended until the lobby resolves it
    Held(FlowTicket),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held(_))
    }
}

struct PendingFlow {
    entry: LobbyEntry,
    release: oneshot::Sender<bool>,
}

/// The quarantine state machine.
pub struct TrafficLobby {
    pending: DashMap<FlowId, PendingFlow>,
    classifier: Classifier,
    logger: Arc<ConnectionLogger>,
    config: LobbyConfig,
}

impl TrafficLobby {
    pub fn new(classifier: Classifier, logger: Arc<ConnectionLogger>, config: LobbyConfig) -> Self {
        Self {
            pending: DashMap::new(),
            classifier,
            logger,
            config,
        }
    }

    /// Classify a flow and act on the result. Called by the interceptor
    /// for every flow the policy engine could not decide.
    pub fn admit(&self, flow: Flow, policy: &AppNetworkPolicy) -> Verdict {
        match self.classifier.classify(&flow, policy) {
            Classification::Allow { threat } => {
                self.log(&flow.app_id, &flow.destination, flow.flow_id, Decision::Allow, vec![], threat);
                Verdict::Allow
            }
            Classification::Block { threat } => {
                self.log(
                    &flow.app_id,
                    &flow.destination,
                    flow.flow_id,
                    Decision::Block,
                    vec![THREAT_MATCH_REASON.to_string()],
                    Some(threat.clone()),
                );
                Verdict::Block {
                    reason: vec![THREAT_MATCH_REASON.to_string()],
                    threat: Some(threat),
                }
            }
            Classification::Lobby { triggers, threat } => self.hold(flow, policy, triggers, threat),
        }
    }

    /// Insert a pending entry and hand back the ticket. At most one
    /// entry per flow id; a duplicate is rejected and fails closed.
    fn hold(
        &self,
        flow: Flow,
        policy: &AppNetworkPolicy,
        triggers: Vec<Trigger>,
        threat: Option<ThreatMatch>,
    ) -> Verdict {
        let expires_at =
            expiry_for(policy.lobby_mode, &self.config.timeouts).map(|t| Instant::now() + t);
        let entry = LobbyEntry {
            flow_id: flow.flow_id,
            app_id: flow.app_id.clone(),
            destination: flow.destination.clone(),
            reason: triggers.clone(),
            lobby_mode: policy.lobby_mode,
            entered_at: unix_millis_now(),
            expires_at,
            state: LobbyState::Pending,
        };

        let (release, rx) = oneshot::channel();
        match self.pending.entry(flow.flow_id) {
            Entry::Occupied(_) => {
                error!("{}", LobbyError::DuplicateEntry(flow.flow_id));
                return Verdict::Block {
                    reason: vec![DUPLICATE_ENTRY_REASON.to_string()],
                    threat: None,
                };
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingFlow { entry, release });
            }
        }

        info!(
            "Flow {} from {} to {} lobbied ({:?}, mode {})",
            flow.flow_id, flow.app_id, flow.destination, triggers, policy.lobby_mode
        );
        self.log(
            &flow.app_id,
            &flow.destination,
            flow.flow_id,
            Decision::Lobby,
            Trigger::codes(&triggers),
            threat,
        );

        Verdict::Held(FlowTicket {
            flow_id: flow.flow_id,
            rx,
        })
    }

    /// Resolve a held flow. Idempotent: resolving an entry that is
    /// already terminal (or unknown) is a no-op returning `false`.
    pub fn resolve(&self, flow_id: FlowId, allow: bool) -> bool {
        let Some((_, pending)) = self.pending.remove(&flow_id) else {
            // Stale resolve: not an error to the caller
            debug!("Resolve for {} ignored, no pending entry", flow_id);
            return false;
        };

        let mut entry = pending.entry;
        entry.state = if allow {
            LobbyState::ResolvedAllow
        } else {
            LobbyState::ResolvedBlock
        };

        let _ = pending.release.send(allow);
        info!(
            "Flow {} resolved: {}",
            flow_id,
            if allow { "allow" } else { "block" }
        );
        self.log(
            &entry.app_id,
            &entry.destination,
            flow_id,
            if allow { Decision::Allow } else { Decision::Block },
            Trigger::codes(&entry.reason),
            None,
        );
        true
    }

    /// Snapshot of the pending entries, for the lobby UI surface.
    pub fn pending_entries(&self) -> Vec<LobbyEntry> {
        self.pending.iter().map(|r| r.value().entry.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending entry for an app that was killed or
    /// uninstalled. Held flows are released as BLOCK.
    pub fn cancel_app(&self, app_id: &AppId) -> usize {
        let ids: Vec<FlowId> = self
            .pending
            .iter()
            .filter(|r| &r.value().entry.app_id == app_id)
            .map(|r| *r.key())
            .collect();

        let mut cancelled = 0usize;
        for flow_id in ids {
            let Some((_, pending)) = self.pending.remove(&flow_id) else {
                continue;
            };
            let mut entry = pending.entry;
            entry.state = LobbyState::ResolvedBlock;
            // Dropping release without sending also unblocks the ticket;
            // send explicitly so the two paths read the same
            let _ = pending.release.send(false);

            let mut reason = Trigger::codes(&entry.reason);
            reason.push(APP_CANCELLED_REASON.to_string());
            self.log(
                &entry.app_id,
                &entry.destination,
                flow_id,
                Decision::Block,
                reason,
                None,
            );
            cancelled += 1;
        }

        if cancelled > 0 {
            info!("Cancelled {} pending flows for {}", cancelled, app_id);
        }
        cancelled
    }

    /// Auto-resolve every entry past its deadline. RELAXED expires to
    /// ALLOW, BALANCED to BLOCK; PARANOID entries carry no deadline.
    /// Each entry is removed exactly once, so a racing explicit resolve
    /// and the sweep cannot both log a terminal decision.
    pub fn expire_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<FlowId> = self
            .pending
            .iter()
            .filter(|r| {
                r.value()
                    .entry
                    .expires_at
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false)
            })
            .map(|r| *r.key())
            .collect();

        let mut expired = 0usize;
        for flow_id in due {
            let Some((_, pending)) = self.pending.remove(&flow_id) else {
                continue;
            };
            let mut entry = pending.entry;
            entry.state = LobbyState::Expired;

            let allow = entry.lobby_mode == LobbyMode::Relaxed;
            let _ = pending.release.send(allow);

            warn!(
                "Flow {} expired in lobby, auto-{}",
                flow_id,
                if allow { "allow" } else { "block" }
            );
            let mut reason = Trigger::codes(&entry.reason);
            reason.push(EXPIRED_REASON.to_string());
            self.log(
                &entry.app_id,
                &entry.destination,
                flow_id,
                if allow { Decision::Allow } else { Decision::Block },
                reason,
                None,
            );
            expired += 1;
        }
        expired
    }

    /// Start the periodic expiry sweep. Stopping the sweep does not
    /// touch pending state; entries stay in the map.
    pub fn spawn_sweep(self: &Arc<Self>) -> SweepHandle {
        let lobby = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            debug!("Lobby sweep started");
            let mut ticker = tokio::time::interval(lobby.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = lobby.expire_due();
                        if expired > 0 {
                            debug!("Sweep expired {} entries", expired);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Lobby sweep stopped");
        });

        SweepHandle {
            stop: stop_tx,
            handle,
        }
    }

    fn log(
        &self,
        app_id: &AppId,
        destination: &Destination,
        flow_id: FlowId,
        decision: Decision,
        reason: Vec<String>,
        threat_match: Option<ThreatMatch>,
    ) {
        self.logger.record(ConnectionLogEntry {
            flow_id: flow_id.to_string(),
            app_id: app_id.clone(),
            destination: destination.clone(),
            decision,
            reason,
            threat_match,
            decided_at: unix_millis_now(),
        });
    }
}

/// Handle for stopping the expiry sweep on shutdown.
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweep to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::no_beacon_check;
    use crate::config::LobbyTimeouts;
    use crate::flow::Protocol;
    use warden_log::LogQuery;
    use warden_policy::NetworkKind;
    use warden_threat::{FeedRecord, IndicatorType, Severity, ThreatScanner};

    fn feed_record(indicator: &str, severity: Severity) -> FeedRecord {
        FeedRecord {
            indicator: indicator.to_string(),
            indicator_type: IndicatorType::Domain,
            threat_type: "c2".to_string(),
            severity,
            campaign_id: Some("APT-7".to_string()),
            confidence: 95,
        }
    }

    struct Fixture {
        lobby: Arc<TrafficLobby>,
        logger: Arc<ConnectionLogger>,
    }

    fn fixture(records: Vec<FeedRecord>, timeouts: LobbyTimeouts) -> Fixture {
        let logger = Arc::new(ConnectionLogger::in_memory(64));
        let scanner = ThreatScanner::new();
        scanner.replace(records);

        let classifier = Classifier::new(
            Arc::new(scanner),
            Arc::clone(&logger),
            no_beacon_check(),
            5 * 1024 * 1024,
        );
        let config = LobbyConfig {
            timeouts,
            sweep_interval: Duration::from_millis(10),
            ..LobbyConfig::default()
        };
        let lobby = Arc::new(TrafficLobby::new(classifier, Arc::clone(&logger), config));
        Fixture { lobby, logger }
    }

    fn policy(app: &str, mode: LobbyMode) -> AppNetworkPolicy {
        let mut policy = AppNetworkPolicy::new(AppId::new(app));
        policy.network_allowed = true;
        policy.lobby_mode = mode;
        policy
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

    fn dns_flow(app: &str, dest: Destination) -> Flow {
        Flow::new(
            AppId::new(app),
            dest,
            Protocol::Tcp,
            NetworkKind::Wifi,
            true,
            1024,
        )
    }

    fn entries_for(logger: &ConnectionLogger, flow_id: FlowId) -> Vec<ConnectionLogEntry> {
        logger
            .query(&LogQuery::new())
            .into_iter()
            .filter(|e| e.flow_id == flow_id.to_string())
            .collect()
    }

    #[test]
    fn test_critical_severity_blocks_even_under_relaxed() {
        let fx = fixture(
            vec![feed_record("evil.example.com", Severity::Critical)],
            LobbyTimeouts::default(),
        );
        let dest = Destination::domain("evil.example.com", 443);
        let flow = dns_flow("com.example.app", dest);
        let flow_id = flow.flow_id;

        let verdict = fx
            .lobby
            .admit(flow, &policy("com.example.app", LobbyMode::Relaxed));
        assert!(verdict.is_block());

        // Terminal BLOCK entry with the threat attached
        let logged = entries_for(&fx.logger, flow_id);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].decision, Decision::Block);
        let threat = logged[0].threat_match.as_ref().unwrap();
        assert_eq!(threat.severity, Severity::Critical);
        assert_eq!(threat.campaign_id.as_deref(), Some("APT-7"));
    }

    #[test]
    fn test_direct_ip_scenario_reason() {
        let fx = fixture(vec![], LobbyTimeouts::default());
        let dest = Destination::ip("203.0.113.5".parse().unwrap(), 443);
        seed_allowed(&fx.logger, "com.example.trusted", &dest);

        let flow = Flow::new(
            AppId::new("com.example.trusted"),
            dest,
            Protocol::Tcp,
            NetworkKind::Wifi,
            false,
            1024,
        );

        let verdict = fx
            .lobby
            .admit(flow, &policy("com.example.trusted", LobbyMode::Balanced));
        match verdict {
            Verdict::Held(_) => {}
            other => panic!("Expected held, got {:?}", other),
        }

        let pending = fx.lobby.pending_entries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reason, vec![Trigger::DirectIp]);
        assert_eq!(pending[0].state, LobbyState::Pending);
    }

    #[test]
    fn test_probation_scenario_reason() {
        let fx = fixture(vec![], LobbyTimeouts::default());
        let dest = Destination::domain("unknown.example.com", 443);
        seed_allowed(&fx.logger, "com.example.new", &dest);

        let mut app_policy = policy("com.example.new", LobbyMode::Balanced);
        app_policy.probation_until = Some(unix_millis_now() + 86_400_000);

        let verdict = fx.lobby.admit(dns_flow("com.example.new", dest), &app_policy);
        assert!(verdict.is_held());

        let pending = fx.lobby.pending_entries();
        assert_eq!(pending[0].reason, vec![Trigger::NewAppProbation]);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let fx = fixture(vec![], LobbyTimeouts::default());
        let dest = Destination::domain("new.example.com", 443);

        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Paranoid),
        );
        let Verdict::Held(ticket) = verdict else {
            panic!("Expected held");
        };
        let flow_id = ticket.flow_id();

        assert!(fx.lobby.resolve(flow_id, true));
        assert!(ticket.wait().await);

        // Second resolve is a stale no-op, either way around
        assert!(!fx.lobby.resolve(flow_id, true));
        assert!(!fx.lobby.resolve(flow_id, false));

        // One LOBBY entry, exactly one terminal entry
        let logged = entries_for(&fx.logger, flow_id);
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].decision, Decision::Allow);
        assert_eq!(logged[0].reason, vec!["first_contact"]);
        assert_eq!(logged[1].decision, Decision::Lobby);
    }

    #[tokio::test]
    async fn test_relaxed_expiry_auto_allows_exactly_once() {
        let fx = fixture(
            vec![],
            LobbyTimeouts {
                balanced: Duration::from_secs(60),
                relaxed: Duration::ZERO,
            },
        );
        let dest = Destination::domain("new.example.com", 443);

        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Relaxed),
        );
        let Verdict::Held(ticket) = verdict else {
            panic!("Expected held");
        };
        let flow_id = ticket.flow_id();

        assert_eq!(fx.lobby.expire_due(), 1);
        assert_eq!(fx.lobby.expire_due(), 0);
        assert!(ticket.wait().await);

        let logged = entries_for(&fx.logger, flow_id);
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].decision, Decision::Allow);
        assert!(logged[0].reason.contains(&"lobby_expired".to_string()));
    }

    #[tokio::test]
    async fn test_balanced_expiry_auto_blocks() {
        let fx = fixture(
            vec![],
            LobbyTimeouts {
                balanced: Duration::ZERO,
                relaxed: Duration::from_secs(60),
            },
        );
        let dest = Destination::domain("new.example.com", 443);

        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Balanced),
        );
        let Verdict::Held(ticket) = verdict else {
            panic!("Expected held");
        };

        assert_eq!(fx.lobby.expire_due(), 1);
        assert!(!ticket.wait().await);
    }

    #[test]
    fn test_paranoid_never_auto_resolves() {
        let fx = fixture(
            vec![],
            LobbyTimeouts {
                balanced: Duration::ZERO,
                relaxed: Duration::ZERO,
            },
        );
        let dest = Destination::domain("new.example.com", 443);

        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Paranoid),
        );
        assert!(verdict.is_held());

        assert_eq!(fx.lobby.expire_due(), 0);
        assert_eq!(fx.lobby.pending_len(), 1);
        assert!(fx.lobby.pending_entries()[0].remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancel_app_releases_as_block() {
        let fx = fixture(vec![], LobbyTimeouts::default());

        let verdict = fx.lobby.admit(
            dns_flow(
                "com.example.doomed",
                Destination::domain("a.example.com", 443),
            ),
            &policy("com.example.doomed", LobbyMode::Paranoid),
        );
        let Verdict::Held(ticket) = verdict else {
            panic!("Expected held");
        };
        let flow_id = ticket.flow_id();

        fx.lobby.admit(
            dns_flow(
                "com.example.other",
                Destination::domain("b.example.com", 443),
            ),
            &policy("com.example.other", LobbyMode::Paranoid),
        );

        assert_eq!(fx.lobby.cancel_app(&AppId::new("com.example.doomed")), 1);
        assert!(!ticket.wait().await);
        assert_eq!(fx.lobby.pending_len(), 1);

        let logged = entries_for(&fx.logger, flow_id);
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].decision, Decision::Block);
        assert!(logged[0].reason.contains(&"app_cancelled".to_string()));
    }

    #[test]
    fn test_duplicate_admit_fails_closed() {
        let fx = fixture(vec![], LobbyTimeouts::default());
        let dest = Destination::domain("new.example.com", 443);
        let flow = dns_flow("com.example.app", dest);
        let dup = flow.clone();

        let first = fx
            .lobby
            .admit(flow, &policy("com.example.app", LobbyMode::Paranoid));
        assert!(first.is_held());

        let second = fx
            .lobby
            .admit(dup, &policy("com.example.app", LobbyMode::Paranoid));
        match second {
            Verdict::Block { reason, .. } => {
                assert_eq!(reason, vec![DUPLICATE_ENTRY_REASON]);
            }
            other => panic!("Expected block, got {:?}", other),
        }
        assert_eq!(fx.lobby.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_in_background() {
        let fx = fixture(
            vec![],
            LobbyTimeouts {
                balanced: Duration::from_secs(60),
                relaxed: Duration::from_millis(20),
            },
        );
        let dest = Destination::domain("new.example.com", 443);

        let sweep = fx.lobby.spawn_sweep();
        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Relaxed),
        );
        let Verdict::Held(ticket) = verdict else {
            panic!("Expected held");
        };

        assert!(ticket.wait().await);
        assert_eq!(fx.lobby.pending_len(), 0);

        sweep.stop().await;
    }

    #[test]
    fn test_clean_flow_allows() {
        let fx = fixture(vec![], LobbyTimeouts::default());
        let dest = Destination::domain("api.example.com", 443);
        seed_allowed(&fx.logger, "com.example.app", &dest);

        let verdict = fx.lobby.admit(
            dns_flow("com.example.app", dest),
            &policy("com.example.app", LobbyMode::Balanced),
        );
        assert!(verdict.is_allow());
    }
}
