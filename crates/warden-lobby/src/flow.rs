//! Flow model: one record per (app, destination, protocol) attempt.

use std::fmt;
use uuid::Uuid;
use warden_log::unix_millis_now;
use warden_policy::{AppId, Destination, NetworkKind};

/// Unique identifier for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// One outbound connection attempt under evaluation.
///
/// Ephemeral: created at the first packet, gone once the flow tears
/// down or the lobby resolves it.
#[derive(Debug, Clone)]
pub struct Flow {
    pub flow_id: FlowId,
    pub app_id: AppId,
    pub destination: Destination,
    pub protocol: Protocol,
    pub network: NetworkKind,
    /// False means the app dialed an address no DNS answer ever named -
    /// itself a suspicion signal
    pub resolved_via_dns: bool,
    pub byte_count_estimate: u64,
    /// Unix ms
    pub created_at: u64,
}

impl Flow {
    pub fn new(
        app_id: AppId,
        destination: Destination,
        protocol: Protocol,
        network: NetworkKind,
        resolved_via_dns: bool,
        byte_count_estimate: u64,
    ) -> Self {
        Self {
            flow_id: FlowId::new(),
            app_id,
            destination,
            protocol,
            network,
            resolved_via_dns,
            byte_count_estimate,
            created_at: unix_millis_now(),
        }
    }
}
