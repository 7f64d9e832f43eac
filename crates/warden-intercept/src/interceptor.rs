//! Flow Interceptor
//!
//! The choke point: every outbound connection attempt becomes exactly
//! one `Flow` and gets exactly one verdict before anything touches the
//! network. Policy verdicts resolve synchronously inside the
//! packet-handling budget; only a LOBBY hold suspends the caller.
//!
//! Error posture: fail-closed. An internal error on this path converts
//! to BLOCK and is logged; it never propagates and it never allows.

use crate::dns::DnsInterceptor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error};
use warden_lobby::{Flow, FlowId, Protocol, TrafficLobby, Verdict};
use warden_log::{ConnectionLogEntry, ConnectionLogger, Decision, unix_millis_now};
use warden_policy::{AppId, Destination, NetworkKind, PolicyEngine, PolicyVerdict};

/// Reason code for fail-closed blocks.
pub const INTERCEPTOR_FAILURE_REASON: &str = "interceptor_failure";

/// Internal interceptor errors. Never escape `intercept()`; they are
/// converted to a BLOCK verdict.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Interceptor failure: {0}")]
    Internal(String),
}

/// Decision counters
#[derive(Debug, Default)]
pub struct InterceptorStats {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    lobbied: AtomicU64,
}

/// Front door for connection attempts.
pub struct FlowInterceptor {
    engine: Arc<PolicyEngine>,
    dns: Arc<DnsInterceptor>,
    lobby: Arc<TrafficLobby>,
    logger: Arc<ConnectionLogger>,
    stats: InterceptorStats,
}

impl FlowInterceptor {
    pub fn new(
        engine: Arc<PolicyEngine>,
        dns: Arc<DnsInterceptor>,
        lobby: Arc<TrafficLobby>,
        logger: Arc<ConnectionLogger>,
    ) -> Self {
        Self {
            engine,
            dns,
            lobby,
            logger,
            stats: InterceptorStats::default(),
        }
    }

    /// Render a verdict for one connection attempt.
    ///
    /// `app_id` comes from the OS identity resolver, never from packet
    /// contents. `Verdict::Held` carries the ticket the caller parks on.
    pub fn intercept(
        &self,
        app_id: AppId,
        destination: Destination,
        protocol: Protocol,
        network: NetworkKind,
        byte_count_estimate: u64,
    ) -> Verdict {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let verdict = match self.try_intercept(
            app_id.clone(),
            destination.clone(),
            protocol,
            network,
            byte_count_estimate,
        ) {
            Ok(verdict) => verdict,
            Err(e) => self.fail_closed(app_id, destination, e),
        };

        match &verdict {
            Verdict::Allow => self.stats.allowed.fetch_add(1, Ordering::Relaxed),
            Verdict::Block { .. } => self.stats.blocked.fetch_add(1, Ordering::Relaxed),
            Verdict::Held(_) => self.stats.lobbied.fetch_add(1, Ordering::Relaxed),
        };
        verdict
    }

    fn try_intercept(
        &self,
        app_id: AppId,
        destination: Destination,
        protocol: Protocol,
        network: NetworkKind,
        byte_count_estimate: u64,
    ) -> Result<Verdict, InterceptError> {
        // A direct-IP destination the app recently resolved through us is
        // upgraded to its domain and judged by name; an unbound IP stays
        // a direct-IP flow
        let (eval_dest, resolved_via_dns) = match destination.ip_addr() {
            Some(ip) => match self.dns.lookup_binding(&app_id, ip) {
                Some(domain) => (Destination::domain(&domain, destination.port), true),
                None => (destination, false),
            },
            // A by-name destination only exists because resolution produced it
            None => (destination, true),
        };

        let flow = Flow::new(
            app_id.clone(),
            eval_dest.clone(),
            protocol,
            network,
            resolved_via_dns,
            byte_count_estimate,
        );
        debug!(
            "Flow {}: {} -> {} ({}, dns={})",
            flow.flow_id, app_id, eval_dest, protocol, resolved_via_dns
        );

        match self.engine.evaluate(&app_id, &eval_dest, network) {
            PolicyVerdict::BlockedByPolicy(block) => {
                let reason = vec![block.code().to_string()];
                self.logger.record(ConnectionLogEntry {
                    flow_id: flow.flow_id.to_string(),
                    app_id,
                    destination: eval_dest,
                    decision: Decision::Block,
                    reason: reason.clone(),
                    threat_match: None,
                    decided_at: unix_millis_now(),
                });
                Ok(Verdict::Block {
                    reason,
                    threat: None,
                })
            }
            PolicyVerdict::AllowedByPolicy => {
                self.logger.record(ConnectionLogEntry {
                    flow_id: flow.flow_id.to_string(),
                    app_id,
                    destination: eval_dest,
                    decision: Decision::Allow,
                    reason: vec![],
                    threat_match: None,
                    decided_at: unix_millis_now(),
                });
                Ok(Verdict::Allow)
            }
            PolicyVerdict::NeedsClassification => {
                let policy = self.engine.get_policy(&app_id).ok_or_else(|| {
                    InterceptError::Internal("policy vanished during evaluation".to_string())
                })?;
                Ok(self.lobby.admit(flow, &policy))
            }
        }
    }

    /// Convert an internal error to the safest terminal decision and
    /// log it; the packet path never sees the error itself.
    fn fail_closed(&self, app_id: AppId, destination: Destination, e: InterceptError) -> Verdict {
        error!("{} - failing closed", e);
        let reason = vec![INTERCEPTOR_FAILURE_REASON.to_string()];
        self.logger.record(ConnectionLogEntry {
            flow_id: FlowId::new().to_string(),
            app_id,
            destination,
            decision: Decision::Block,
            reason: reason.clone(),
            threat_match: None,
            decided_at: unix_millis_now(),
        });
        Verdict::Block {
            reason,
            threat: None,
        }
    }

    /// (total, allowed, blocked, lobbied)
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.total.load(Ordering::Relaxed),
            self.stats.allowed.load(Ordering::Relaxed),
            self.stats.blocked.load(Ordering::Relaxed),
            self.stats.lobbied.load(Ordering::Relaxed),
        )
    }
}
