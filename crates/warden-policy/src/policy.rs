//! Policy Data Model
//!
//! Types shared across the decision pipeline:
//! - `AppId`: OS-resolved application identity (trusted, never re-derived)
//! - `Destination`: domain-or-IP plus port
//! - `AppNetworkPolicy`: the per-app rule set, default-deny

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Policy-layer errors
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

/// Application identity as resolved by the OS identity collaborator.
///
/// Opaque to this crate; equality and hashing are all the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    /// Create a new app identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Host part of a destination: a name or a literal address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostAddr {
    Domain(String),
    Ip(IpAddr),
}

/// Where a flow is headed: domain or IP, plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: HostAddr,
    pub port: u16,
}

impl Destination {
    /// Destination by name. The domain is normalized on construction.
    pub fn domain(domain: &str, port: u16) -> Self {
        Self {
            host: HostAddr::Domain(normalize_domain(domain)),
            port,
        }
    }

    /// Destination by literal address.
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: HostAddr::Ip(addr),
            port,
        }
    }

    /// The domain name, if this destination has one.
    pub fn domain_name(&self) -> Option<&str> {
        match &self.host {
            HostAddr::Domain(d) => Some(d),
            HostAddr::Ip(_) => None,
        }
    }

    /// The literal address, if this destination is one.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match &self.host {
            HostAddr::Domain(_) => None,
            HostAddr::Ip(addr) => Some(*addr),
        }
    }

    /// True for destinations reached without a name (direct-IP).
    pub fn is_direct_ip(&self) -> bool {
        matches!(self.host, HostAddr::Ip(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostAddr::Domain(d) => write!(f, "{}:{}", d, self.port),
            HostAddr::Ip(addr) => write!(f, "{}:{}", addr, self.port),
        }
    }
}

/// Normalize a domain for consistent matching.
pub fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .trim_end_matches('.')
        .to_lowercase()
}

/// A network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    /// Create a CIDR block, validating the prefix length for the family.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, PolicyError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(PolicyError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// Check whether an address falls inside this block.
    ///
    /// Mixed address families never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - u32::from(self.prefix);
                (u32::from(net) >> shift) == (u32::from(host) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - u32::from(self.prefix);
                (u128::from(net) >> shift) == (u128::from(host) >> shift)
            }
            _ => false,
        }
    }

    /// The network address: host bits masked off.
    pub fn network(&self) -> IpAddr {
        mask_addr(self.addr, self.prefix)
    }
}

/// Mask an address down to its first `prefix` bits.
pub fn mask_addr(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = if prefix == 0 {
                0
            } else {
                u32::from(v4) & (u32::MAX << (32 - u32::from(prefix.min(32))))
            };
            IpAddr::V4(bits.into())
        }
        IpAddr::V6(v6) => {
            let bits = if prefix == 0 {
                0
            } else {
                u128::from(v6) & (u128::MAX << (128 - u32::from(prefix.min(128))))
            };
            IpAddr::V6(bits.into())
        }
    }
}

impl FromStr for Cidr {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| PolicyError::InvalidCidr(s.to_string()))?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| PolicyError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| PolicyError::InvalidCidr(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Case-insensitive domain set with subdomain matching.
///
/// An entry `tracker.com` matches `tracker.com` and any host beneath it
/// (`cdn.tracker.com`), never a sibling (`nottracker.com`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainSet(HashSet<String>);

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain to the set.
    pub fn insert(&mut self, domain: &str) {
        self.0.insert(normalize_domain(domain));
    }

    /// Exact membership, no parent walk.
    pub fn contains_exact(&self, domain: &str) -> bool {
        self.0.contains(&normalize_domain(domain))
    }

    /// Match a domain or any of its parents against the set.
    pub fn matches(&self, domain: &str) -> bool {
        let normalized = normalize_domain(domain);
        if self.0.contains(&normalized) {
            return true;
        }

        // Walk parent domains: a.b.c matches entries for b.c and c
        let parts: Vec<&str> = normalized.split('.').collect();
        for i in 1..parts.len() {
            let parent = parts[i..].join(".");
            if self.0.contains(&parent) {
                return true;
            }
        }

        false
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: AsRef<str>> FromIterator<S> for DomainSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = Self::new();
        for domain in iter {
            set.insert(domain.as_ref());
        }
        set
    }
}

/// How long an undecided flow may sit in the lobby, and what happens then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LobbyMode {
    /// Never auto-resolves; every held flow needs an explicit decision
    Paranoid,
    /// Auto-resolves to BLOCK after the timeout
    Balanced,
    /// Auto-resolves to ALLOW after the timeout
    Relaxed,
}

impl fmt::Display for LobbyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paranoid => write!(f, "paranoid"),
            Self::Balanced => write!(f, "balanced"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// Which transport a flow is riding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Wifi,
    Mobile,
}

/// The complete rule set for one application.
///
/// `network_allowed` is the master switch and defaults to off: an app
/// nobody configured can reach nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppNetworkPolicy {
    pub app_id: AppId,
    /// Master switch; everything below is moot while this is false
    #[serde(default)]
    pub network_allowed: bool,
    #[serde(default = "default_true")]
    pub wifi_allowed: bool,
    #[serde(default = "default_true")]
    pub mobile_allowed: bool,
    #[serde(default)]
    pub allowed_domains: DomainSet,
    #[serde(default)]
    pub blocked_domains: DomainSet,
    #[serde(default)]
    pub blocked_networks: Vec<Cidr>,
    #[serde(default = "default_lobby_mode")]
    pub lobby_mode: LobbyMode,
    /// Unix ms; new installs start on probation
    #[serde(default)]
    pub probation_until: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_lobby_mode() -> LobbyMode {
    LobbyMode::Balanced
}

impl AppNetworkPolicy {
    /// Default-deny policy for an app.
    pub fn new(app_id: AppId) -> Self {
        Self {
            app_id,
            network_allowed: false,
            wifi_allowed: true,
            mobile_allowed: true,
            allowed_domains: DomainSet::new(),
            blocked_domains: DomainSet::new(),
            blocked_networks: Vec::new(),
            lobby_mode: LobbyMode::Balanced,
            probation_until: None,
        }
    }

    /// Is the app still inside its post-install probation window?
    pub fn is_on_probation(&self, now_ms: u64) -> bool {
        match self.probation_until {
            Some(until) => now_ms < until,
            None => false,
        }
    }

    /// Is this transport allowed at all for the app?
    pub fn transport_allowed(&self, kind: NetworkKind) -> bool {
        match kind {
            NetworkKind::Wifi => self.wifi_allowed,
            NetworkKind::Mobile => self.mobile_allowed,
        }
    }
}
