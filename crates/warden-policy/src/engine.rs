//! Policy Engine
//!
//! Owns every `AppNetworkPolicy` and evaluates destinations against them.
//!
//! Concurrency model: the registry maps app ids to `Arc<AppNetworkPolicy>`
//! snapshots. `set_policy` swaps the Arc under a short write lock; readers
//! that already cloned a snapshot keep evaluating against the old version.
//! A policy update therefore affects new flows only.

use crate::policy::{AppId, AppNetworkPolicy, Cidr, Destination, NetworkKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Which rule blocked a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyBlock {
    /// `network_allowed` is off (or the app was never configured)
    NetworkDisabled,
    /// The flow's transport is disallowed for this app
    TransportDisallowed(NetworkKind),
    /// Destination matched the blocked-domain set
    BlockedDomain(String),
    /// Destination matched a blocked network
    BlockedNetwork(Cidr),
}

impl PolicyBlock {
    /// Stable code for audit log `reason` lists.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkDisabled => "network_disabled",
            Self::TransportDisallowed(_) => "transport_disallowed",
            Self::BlockedDomain(_) => "blocked_domain",
            Self::BlockedNetwork(_) => "blocked_network",
        }
    }
}

impl std::fmt::Display for PolicyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkDisabled => write!(f, "network disabled"),
            Self::TransportDisallowed(kind) => write!(f, "transport disallowed: {:?}", kind),
            Self::BlockedDomain(d) => write!(f, "blocked domain: {}", d),
            Self::BlockedNetwork(c) => write!(f, "blocked network: {}", c),
        }
    }
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Destination explicitly allow-listed
    AllowedByPolicy,
    /// A deny rule fired
    BlockedByPolicy(PolicyBlock),
    /// No rule matched; the Traffic Lobby decides
    NeedsClassification,
}

/// Registry of per-app policies with snapshot reads.
pub struct PolicyEngine {
    policies: RwLock<HashMap<AppId, Arc<AppNetworkPolicy>>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Immutable snapshot of one app's policy.
    pub fn get_policy(&self, app_id: &AppId) -> Option<Arc<AppNetworkPolicy>> {
        let map = self
            .policies
            .read()
            .unwrap_or_else(|e| e.into_inner());
        map.get(app_id).cloned()
    }

    /// Install or replace a policy. The only mutator.
    ///
    /// Readers holding the previous snapshot are unaffected; in-flight
    /// flows already past evaluation keep their verdict.
    pub fn set_policy(&self, policy: AppNetworkPolicy) {
        let app_id = policy.app_id.clone();
        let mut map = self
            .policies
            .write()
            .unwrap_or_else(|e| e.into_inner());
        map.insert(app_id.clone(), Arc::new(policy));
        info!("Policy updated for {}", app_id);
    }

    /// Drop an app's policy (uninstall hook). Evaluation falls back to
    /// default-deny for any later flow.
    pub fn remove_policy(&self, app_id: &AppId) -> bool {
        let mut map = self
            .policies
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let removed = map.remove(app_id).is_some();
        if removed {
            info!("Policy removed for {}", app_id);
        }
        removed
    }

    /// Number of configured apps.
    pub fn len(&self) -> usize {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate a destination against an app's policy.
    ///
    /// Ordered rules, first match wins:
    /// 1. no policy / master switch off  -> blocked
    /// 2. transport disallowed           -> blocked
    /// 3. blocked domain or network      -> blocked
    /// 4. allowed domain                 -> allowed
    /// 5. otherwise                      -> needs classification
    pub fn evaluate(
        &self,
        app_id: &AppId,
        destination: &Destination,
        network: NetworkKind,
    ) -> PolicyVerdict {
        let Some(policy) = self.get_policy(app_id) else {
            // Unconfigured app: identical to network_allowed = false
            debug!("No policy for {}, default deny", app_id);
            return PolicyVerdict::BlockedByPolicy(PolicyBlock::NetworkDisabled);
        };
        Self::evaluate_snapshot(&policy, destination, network)
    }

    /// Evaluate against a snapshot the caller already holds, so a single
    /// flow sees one consistent policy version across checks.
    pub fn evaluate_snapshot(
        policy: &AppNetworkPolicy,
        destination: &Destination,
        network: NetworkKind,
    ) -> PolicyVerdict {
        if !policy.network_allowed {
            return PolicyVerdict::BlockedByPolicy(PolicyBlock::NetworkDisabled);
        }

        if !policy.transport_allowed(network) {
            return PolicyVerdict::BlockedByPolicy(PolicyBlock::TransportDisallowed(network));
        }

        if let Some(domain) = destination.domain_name() {
            if policy.blocked_domains.matches(domain) {
                return PolicyVerdict::BlockedByPolicy(PolicyBlock::BlockedDomain(
                    domain.to_string(),
                ));
            }
        }

        if let Some(ip) = destination.ip_addr() {
            for cidr in &policy.blocked_networks {
                if cidr.contains(ip) {
                    return PolicyVerdict::BlockedByPolicy(PolicyBlock::BlockedNetwork(*cidr));
                }
            }
        }

        if let Some(domain) = destination.domain_name() {
            if policy.allowed_domains.matches(domain) {
                return PolicyVerdict::AllowedByPolicy;
            }
        }

        PolicyVerdict::NeedsClassification
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}
