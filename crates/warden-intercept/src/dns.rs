//! DNS Interceptor
//!
//! Per-app name resolution with pre-lookup policy enforcement:
//! - A blocked domain never resolves: the pipeline short-circuits with
//!   BLOCK before any IP-level flow exists
//! - Successful answers are cached with a TTL
//! - Every (app, answer ip) pair is remembered for a while so the flow
//!   interceptor can mark later connections as resolved-via-DNS and map
//!   them back to the name that produced them
//!
//! Upstream resolution goes through an encrypted resolver; which one is
//! policy-external.

use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_lobby::FlowId;
use warden_log::{ConnectionLogEntry, ConnectionLogger, Decision, unix_millis_now};
use warden_policy::{AppId, Destination, NetworkKind, PolicyEngine, PolicyVerdict, normalize_domain};

/// Reason code for resolutions refused at the DNS stage.
pub const DNS_BLOCKED_REASON: &str = "dns_blocked";

/// DNS interception errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Domain blocked for {app}: {domain}")]
    Blocked { app: AppId, domain: String },

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No addresses found for domain")]
    NoAddresses,

    #[error("Resolver error: {0}")]
    Resolver(String),
}

/// Which upstream answers our queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamResolver {
    /// Whatever the host is configured with
    System,
    /// DNS over HTTPS via Cloudflare
    CloudflareHttps,
}

/// DNS interceptor configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// How long an (app, ip) -> domain binding stays valid
    pub binding_ttl: Duration,
    /// Bound on the binding registry before expired entries are swept
    pub max_bindings: usize,
    pub upstream: UpstreamResolver,
    /// Timeout for upstream queries
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_cache_entries: 10_000,
            binding_ttl: Duration::from_secs(600),
            max_bindings: 50_000,
            upstream: UpstreamResolver::CloudflareHttps,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Cached DNS entry
#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// A remembered resolution for one app
struct Binding {
    domain: String,
    expires_at: Instant,
}

/// Per-app filtering DNS resolver.
pub struct DnsInterceptor {
    resolver: TokioAsyncResolver,
    engine: Arc<PolicyEngine>,
    logger: Arc<ConnectionLogger>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    bindings: DashMap<(AppId, IpAddr), Binding>,
    config: DnsConfig,
}

impl DnsInterceptor {
    pub fn new(
        config: DnsConfig,
        engine: Arc<PolicyEngine>,
        logger: Arc<ConnectionLogger>,
    ) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;

        let resolver = match config.upstream {
            UpstreamResolver::System => TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| DnsError::Resolver(e.to_string()))?,
            UpstreamResolver::CloudflareHttps => {
                TokioAsyncResolver::tokio(ResolverConfig::cloudflare_https(), opts)
            }
        };

        info!("DNS interceptor initialized ({:?} upstream)", config.upstream);

        Ok(Self {
            resolver,
            engine,
            logger,
            cache: RwLock::new(HashMap::new()),
            bindings: DashMap::new(),
            config,
        })
    }

    /// Resolve a domain for an app.
    ///
    /// Policy is applied before any network activity: a deny rule logs a
    /// BLOCK and the caller never sees an address. Domains on neither
    /// list resolve normally and get judged later as IP-flows.
    pub async fn resolve(
        &self,
        app_id: &AppId,
        domain: &str,
        network: NetworkKind,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let normalized = normalize_domain(domain);

        // Port is unknown at resolution time; 0 in the audit record
        let destination = Destination::domain(&normalized, 0);
        if let PolicyVerdict::BlockedByPolicy(block) =
            self.engine.evaluate(app_id, &destination, network)
        {
            debug!("DNS blocked for {}: {} ({})", app_id, domain, block);
            self.logger.record(ConnectionLogEntry {
                flow_id: FlowId::new().to_string(),
                app_id: app_id.clone(),
                destination,
                decision: Decision::Block,
                reason: vec![DNS_BLOCKED_REASON.to_string(), block.code().to_string()],
                threat_match: None,
                decided_at: unix_millis_now(),
            });
            return Err(DnsError::Blocked {
                app: app_id.clone(),
                domain: normalized,
            });
        }

        if let Some(cached) = self.get_cached(&normalized) {
            debug!("DNS cache hit for {}", normalized);
            self.record_bindings(app_id, &normalized, &cached);
            return Ok(cached);
        }

        debug!("DNS lookup for {}", normalized);
        let lookup = self
            .resolver
            .lookup_ip(normalized.as_str())
            .await
            .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DnsError::NoAddresses);
        }

        self.cache_addresses(&normalized, &addresses);
        self.record_bindings(app_id, &normalized, &addresses);

        Ok(addresses)
    }

    /// The domain an app recently resolved this address through, if any.
    ///
    /// Consumed by the flow interceptor: a hit means the flow is
    /// resolved-via-DNS and can be evaluated against the name.
    pub fn lookup_binding(&self, app_id: &AppId, ip: IpAddr) -> Option<String> {
        let key = (app_id.clone(), ip);
        let binding = self.bindings.get(&key)?;
        if binding.expires_at <= Instant::now() {
            drop(binding);
            self.bindings.remove(&key);
            return None;
        }
        Some(binding.domain.clone())
    }

    /// Remember that `app_id` resolved `ip` from `domain`. Exposed for
    /// collaborators that resolve out-of-band (e.g. a captive portal
    /// helper); `resolve()` records its own answers.
    pub fn record_binding(&self, app_id: &AppId, ip: IpAddr, domain: &str) {
        if self.bindings.len() >= self.config.max_bindings {
            let now = Instant::now();
            self.bindings.retain(|_, b| b.expires_at > now);
        }
        self.bindings.insert(
            (app_id.clone(), ip),
            Binding {
                domain: normalize_domain(domain),
                expires_at: Instant::now() + self.config.binding_ttl,
            },
        );
    }

    /// Clear all cached entries.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        info!("DNS cache cleared");
    }

    /// (total cached, still valid)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let total = cache.len();
        let expired = cache
            .values()
            .filter(|e| e.expires_at < Instant::now())
            .count();
        (total, total - expired)
    }

    fn record_bindings(&self, app_id: &AppId, domain: &str, addresses: &[IpAddr]) {
        for addr in addresses {
            self.record_binding(app_id, *addr, domain);
        }
    }

    fn get_cached(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(domain) {
            if entry.expires_at > Instant::now() {
                return Some(entry.addresses.clone());
            }
        }
        None
    }

    fn cache_addresses(&self, domain: &str, addresses: &[IpAddr]) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());

        // Evict old entries if cache is full
        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            // If still full, drop a chunk of arbitrary entries
            if cache.len() >= self.config.max_cache_entries {
                let keys_to_remove: Vec<_> =
                    cache.keys().take(cache.len() / 4).cloned().collect();
                for key in keys_to_remove {
                    cache.remove(&key);
                }
                warn!("DNS cache full, evicted a quarter of entries");
            }
        }

        cache.insert(
            domain.to_string(),
            CacheEntry {
                addresses: addresses.to_vec(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }
}
