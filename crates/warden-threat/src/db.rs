//! Indexed Threat Database
//!
//! Immutable once built; the scanner swaps whole databases on feed
//! refresh. Lookup cost is bounded for the inline decision path:
//! - a bloom filter over every indexed key answers the common
//!   no-match case in one check
//! - domains: xxh3 hash map walked over parent domains
//! - IPs: exact map plus a per-prefix-length CIDR index (one masked
//!   lookup per populated prefix length)
//! - hashes: exact map over lowercase hex

use crate::feed::FeedRecord;
use crate::indicator::{IndicatorType, ThreatMatch};
use bloomfilter::Bloom;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};
use warden_policy::{mask_addr, normalize_domain};
use xxhash_rust::xxh3::xxh3_64;

/// Default false positive rate for the negative cache
const BLOOM_FP_RATE: f64 = 0.001;

/// Indexed, immutable snapshot of the threat feed.
pub struct ThreatDb {
    /// xxh3(normalized domain) -> match
    domains: HashMap<u64, ThreatMatch>,
    /// Exact address indicators
    ips: HashMap<IpAddr, ThreatMatch>,
    /// prefix length -> network address -> match
    cidrs: HashMap<u8, HashMap<IpAddr, ThreatMatch>>,
    /// Populated prefix lengths, most specific first
    prefixes: Vec<u8>,
    /// Lowercase hex digest -> match
    hashes: HashMap<String, ThreatMatch>,
    /// Negative cache over every indexed key
    bloom: Bloom<[u8]>,
    entries: usize,
}

impl ThreatDb {
    /// Build an index from raw feed records. Unparseable indicators are
    /// dropped with a warning.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a FeedRecord>,
    {
        let records: Vec<&FeedRecord> = records.into_iter().collect();
        let mut bloom = Bloom::new_for_fp_rate(records.len().max(16), BLOOM_FP_RATE);

        let mut domains = HashMap::new();
        let mut ips = HashMap::new();
        let mut cidrs: HashMap<u8, HashMap<IpAddr, ThreatMatch>> = HashMap::new();
        let mut hashes = HashMap::new();
        let mut skipped = 0usize;

        for record in &records {
            let threat = ThreatMatch {
                indicator: record.indicator.clone(),
                indicator_type: record.indicator_type,
                threat_type: record.threat_type.clone(),
                severity: record.severity,
                campaign_id: record.campaign_id.clone(),
                confidence: record.confidence.min(100),
            };

            match record.indicator_type {
                IndicatorType::Domain => {
                    let key = normalize_domain(&record.indicator);
                    if key.is_empty() {
                        skipped += 1;
                        continue;
                    }
                    bloom.set(key.as_bytes());
                    domains.insert(xxh3_64(key.as_bytes()), threat);
                }
                IndicatorType::Ip => {
                    let text = record.indicator.trim();
                    if let Some((addr_part, prefix_part)) = text.split_once('/') {
                        let parsed = addr_part
                            .parse::<IpAddr>()
                            .ok()
                            .zip(prefix_part.parse::<u8>().ok());
                        let Some((addr, prefix)) = parsed else {
                            warn!("Skipping unparseable IP indicator: {}", text);
                            skipped += 1;
                            continue;
                        };
                        let network = mask_addr(addr, prefix);
                        bloom.set(cidr_key(network, prefix).as_bytes());
                        cidrs.entry(prefix).or_default().insert(network, threat);
                    } else if let Ok(addr) = text.parse::<IpAddr>() {
                        bloom.set(text.as_bytes());
                        ips.insert(addr, threat);
                    } else {
                        warn!("Skipping unparseable IP indicator: {}", text);
                        skipped += 1;
                    }
                }
                IndicatorType::Hash => {
                    let key = record.indicator.trim().to_lowercase();
                    bloom.set(key.as_bytes());
                    hashes.insert(key, threat);
                }
            }
        }

        let mut prefixes: Vec<u8> = cidrs.keys().copied().collect();
        prefixes.sort_unstable_by(|a, b| b.cmp(a));

        let entries = domains.len()
            + ips.len()
            + hashes.len()
            + cidrs.values().map(HashMap::len).sum::<usize>();

        info!(
            "Threat database indexed: {} entries ({} domains, {} ips, {} networks, {} hashes), {} skipped",
            entries,
            domains.len(),
            ips.len(),
            cidrs.values().map(HashMap::len).sum::<usize>(),
            hashes.len(),
            skipped
        );

        Self {
            domains,
            ips,
            cidrs,
            prefixes,
            hashes,
            bloom,
            entries,
        }
    }

    /// Match a domain or any of its parents.
    pub fn lookup_domain(&self, domain: &str) -> Option<&ThreatMatch> {
        let normalized = normalize_domain(domain);
        if normalized.is_empty() {
            return None;
        }

        if let Some(hit) = self.check_domain_key(&normalized) {
            return Some(hit);
        }

        // Parent walk: evil.example.com matches an example.com indicator
        let parts: Vec<&str> = normalized.split('.').collect();
        for i in 1..parts.len() {
            let parent = parts[i..].join(".");
            if let Some(hit) = self.check_domain_key(&parent) {
                debug!("Indicator {} matched via parent {}", normalized, parent);
                return Some(hit);
            }
        }

        None
    }

    fn check_domain_key(&self, key: &str) -> Option<&ThreatMatch> {
        if !self.bloom.check(key.as_bytes()) {
            return None;
        }
        self.domains.get(&xxh3_64(key.as_bytes()))
    }

    /// Match an address exactly or against any indexed network.
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<&ThreatMatch> {
        if self.bloom.check(ip.to_string().as_bytes()) {
            if let Some(hit) = self.ips.get(&ip) {
                return Some(hit);
            }
        }

        for &prefix in &self.prefixes {
            let network = mask_addr(ip, prefix);
            if !self.bloom.check(cidr_key(network, prefix).as_bytes()) {
                continue;
            }
            if let Some(hit) = self.cidrs.get(&prefix).and_then(|m| m.get(&network)) {
                return Some(hit);
            }
        }

        None
    }

    /// Match a content hash.
    pub fn lookup_hash(&self, digest: &str) -> Option<&ThreatMatch> {
        let key = digest.trim().to_lowercase();
        if !self.bloom.check(key.as_bytes()) {
            return None;
        }
        self.hashes.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

fn cidr_key(network: IpAddr, prefix: u8) -> String {
    format!("{}/{}", network, prefix)
}
