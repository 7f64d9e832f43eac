//! Daemon Configuration
//!
//! TOML file loaded at startup. Every section has working defaults so
//! an empty file (or no file) yields a runnable daemon.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use warden_intercept::{DnsConfig, UpstreamResolver};
use warden_lobby::{LobbyConfig, LobbyTimeouts};
use warden_policy::AppNetworkPolicy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Sweep interval must be 1-5 seconds, got {0}")]
    InvalidSweepInterval(u64),

    #[error("Log ring capacity must be at least 1")]
    InvalidRingCapacity,

    #[error("Unknown DNS upstream: {0}")]
    UnknownUpstream(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// JSON Lines decision log
    pub log_path: PathBuf,
    /// In-memory query window
    pub log_ring_capacity: usize,
    /// JSON Lines threat feed snapshot, loaded at startup
    pub threat_feed_path: Option<PathBuf>,
    /// Policies installed before the pipeline starts
    pub policies: Vec<AppNetworkPolicy>,
    pub lobby: LobbySection,
    pub dns: DnsSection,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("warden-connections.jsonl"),
            log_ring_capacity: 10_000,
            threat_feed_path: None,
            policies: Vec::new(),
            lobby: LobbySection::default(),
            dns: DnsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LobbySection {
    pub balanced_timeout_secs: u64,
    pub relaxed_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub upload_threshold_bytes: u64,
}

impl Default for LobbySection {
    fn default() -> Self {
        let defaults = LobbyConfig::default();
        Self {
            balanced_timeout_secs: defaults.timeouts.balanced.as_secs(),
            relaxed_timeout_secs: defaults.timeouts.relaxed.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            upload_threshold_bytes: defaults.upload_threshold_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// "system" or "cloudflare-https"
    pub upstream: String,
    pub cache_ttl_secs: u64,
    pub max_cache_entries: usize,
    pub binding_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        let defaults = DnsConfig::default();
        Self {
            upstream: "cloudflare-https".to_string(),
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
            max_cache_entries: defaults.max_cache_entries,
            binding_ttl_secs: defaults.binding_ttl.as_secs(),
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

impl WardenConfig {
    /// Load from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the tunables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=5).contains(&self.lobby.sweep_interval_secs) {
            return Err(ConfigError::InvalidSweepInterval(
                self.lobby.sweep_interval_secs,
            ));
        }
        if self.log_ring_capacity == 0 {
            return Err(ConfigError::InvalidRingCapacity);
        }
        self.dns_upstream()?;
        Ok(())
    }

    pub fn lobby_config(&self) -> LobbyConfig {
        LobbyConfig {
            upload_threshold_bytes: self.lobby.upload_threshold_bytes,
            timeouts: LobbyTimeouts {
                balanced: Duration::from_secs(self.lobby.balanced_timeout_secs),
                relaxed: Duration::from_secs(self.lobby.relaxed_timeout_secs),
            },
            sweep_interval: Duration::from_secs(self.lobby.sweep_interval_secs),
        }
    }

    pub fn dns_config(&self) -> Result<DnsConfig, ConfigError> {
        Ok(DnsConfig {
            cache_ttl: Duration::from_secs(self.dns.cache_ttl_secs),
            max_cache_entries: self.dns.max_cache_entries,
            binding_ttl: Duration::from_secs(self.dns.binding_ttl_secs),
            upstream: self.dns_upstream()?,
            timeout: Duration::from_secs(self.dns.timeout_secs),
            ..DnsConfig::default()
        })
    }

    fn dns_upstream(&self) -> Result<UpstreamResolver, ConfigError> {
        match self.dns.upstream.as_str() {
            "system" => Ok(UpstreamResolver::System),
            "cloudflare-https" => Ok(UpstreamResolver::CloudflareHttps),
            other => Err(ConfigError::UnknownUpstream(other.to_string())),
        }
    }
}
