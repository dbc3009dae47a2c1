//! IP-to-domain/label/CDN/ASN inference over observed traffic metadata.
//!
//! Observations come from DNS answers and TLS/QUIC SNI; each feeds an
//! IP-keyed cache so later packets on the same address classify without new
//! evidence. The cache is bounded by two min-heaps: one on last-seen for
//! overflow eviction, one on expiry for TTL cleanup. Heap entries are
//! reconciled lazily against a revision counter on each state update.

use crate::parser::registrable_domain;
use crate::sample::{Direction, PacketMetadata, TrafficClassification};
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use wildmatch::WildMatch;

pub const DNS_CONFIDENCE: f64 = 0.6;
pub const TLS_CONFIDENCE: f64 = 0.85;
pub const CACHED_CONFIDENCE_FACTOR: f64 = 0.8;
pub const DNS_TTL: Duration = Duration::from_secs(180);
pub const TLS_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_ENTRIES: usize = 2048;

/// User-supplied label with the domains that identify it.
#[derive(Debug, Clone)]
pub struct TrafficSignature {
    pub label: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationSource {
    Dns,
    Tls,
}

impl ObservationSource {
    fn confidence(self) -> f64 {
        match self {
            ObservationSource::Dns => DNS_CONFIDENCE,
            ObservationSource::Tls => TLS_CONFIDENCE,
        }
    }

    fn ttl(self) -> Duration {
        match self {
            ObservationSource::Dns => DNS_TTL,
            ObservationSource::Tls => TLS_TTL,
        }
    }
}

struct CacheEntry {
    domain: String,
    host: String,
    confidence: f64,
    source: ObservationSource,
    expires_at: Instant,
    last_seen: Instant,
    revision: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapSlot {
    at: Instant,
    revision: u64,
    address: IpAddr,
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.revision).cmp(&(other.at, other.revision))
    }
}

struct Signature {
    label: String,
    exact: Vec<String>,
    wildcards: Vec<WildMatch>,
}

pub struct TrafficClassifier {
    signatures: Vec<Signature>,
    cache: FxHashMap<IpAddr, CacheEntry>,
    last_seen_heap: BinaryHeap<Reverse<HeapSlot>>,
    expiry_heap: BinaryHeap<Reverse<HeapSlot>>,
    max_entries: usize,
    next_revision: u64,
}

impl TrafficClassifier {
    pub fn new(signatures: &[TrafficSignature], max_entries: usize) -> Self {
        let signatures = signatures
            .iter()
            .map(|signature| {
                let mut exact = Vec::new();
                let mut wildcards = Vec::new();
                for domain in &signature.domains {
                    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
                    if normalized.is_empty() {
                        continue;
                    }
                    if normalized.contains('*') {
                        wildcards.push(WildMatch::new(&normalized));
                    } else {
                        exact.push(normalized);
                    }
                }
                Signature {
                    label: signature.label.clone(),
                    exact,
                    wildcards,
                }
            })
            .collect();
        Self {
            signatures,
            cache: FxHashMap::default(),
            last_seen_heap: BinaryHeap::new(),
            expiry_heap: BinaryHeap::new(),
            max_entries: max_entries.max(1),
            next_revision: 1,
        }
    }

    /// Classifies one packet, updating the cache from whatever the metadata
    /// reveals. Returns `None` when nothing is known about the remote.
    pub fn classify(
        &mut self,
        metadata: &PacketMetadata,
        direction: Direction,
        now: Instant,
    ) -> Option<TrafficClassification> {
        self.cleanup_expired(now);

        let remote = match direction {
            Direction::Outbound => metadata.dst,
            Direction::Inbound => metadata.src,
        };

        // DNS answers map every returned address to the queried name.
        if let Some(dns) = &metadata.dns {
            if dns.is_response && !dns.addresses.is_empty() {
                for address in &dns.addresses {
                    self.observe(*address, &dns.query_name, ObservationSource::Dns, now);
                }
            }
        }

        let sni = metadata.tls_server_name.as_deref().or_else(|| {
            metadata
                .quic
                .as_ref()
                .and_then(|quic| quic.server_name.as_deref())
        });
        if let Some(host) = sni {
            self.observe(remote, host, ObservationSource::Tls, now);
        }

        let mut reasons = Vec::new();
        let (host, domain, confidence) = if let Some(host) = sni {
            reasons.push("tls-sni".to_string());
            (host.to_string(), registrable_domain(host), TLS_CONFIDENCE)
        } else if let Some(dns) = metadata.dns.as_ref().filter(|dns| dns.is_response) {
            reasons.push("dns-answer".to_string());
            (
                dns.query_name.clone(),
                registrable_domain(&dns.query_name),
                DNS_CONFIDENCE,
            )
        } else if let Some(entry) = self.cache.get_mut(&remote) {
            entry.last_seen = now;
            entry.revision = self.next_revision;
            self.next_revision += 1;
            self.last_seen_heap.push(Reverse(HeapSlot {
                at: now,
                revision: entry.revision,
                address: remote,
            }));
            reasons.push("cached-mapping".to_string());
            (
                entry.host.clone(),
                entry.domain.clone(),
                entry.confidence * CACHED_CONFIDENCE_FACTOR,
            )
        } else {
            return None;
        };

        let label = self.match_signature(&host, &domain);
        if label.is_some() {
            reasons.push("signature".to_string());
        }
        let cdn = infer_cdn(&host);
        if cdn.is_some() {
            reasons.push("cdn-suffix".to_string());
        }
        let (cdn, asn) = match cdn {
            Some((provider, asn)) => (Some(provider.to_string()), Some(asn.to_string())),
            None => (None, None),
        };
        Some(TrafficClassification {
            label,
            domain: Some(domain),
            cdn,
            asn,
            confidence,
            reasons,
        })
    }

    /// Inserts or refreshes a cache entry. Lower-confidence sources never
    /// replace a live higher-confidence entry for the same address.
    fn observe(&mut self, address: IpAddr, host: &str, source: ObservationSource, now: Instant) {
        let normalized = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if normalized.is_empty() {
            return;
        }
        if let Some(existing) = self.cache.get(&address) {
            if existing.expires_at > now && existing.confidence > source.confidence() {
                return;
            }
        }
        if !self.cache.contains_key(&address) {
            self.evict_to_capacity();
        }
        let revision = self.next_revision;
        self.next_revision += 1;
        let expires_at = now + source.ttl();
        self.cache.insert(
            address,
            CacheEntry {
                domain: registrable_domain(&normalized),
                host: normalized,
                confidence: source.confidence(),
                source,
                expires_at,
                last_seen: now,
                revision,
            },
        );
        self.last_seen_heap.push(Reverse(HeapSlot {
            at: now,
            revision,
            address,
        }));
        self.expiry_heap.push(Reverse(HeapSlot {
            at: expires_at,
            revision,
            address,
        }));
    }

    /// Lazy TTL cleanup, run once per classify call.
    fn cleanup_expired(&mut self, now: Instant) {
        while let Some(Reverse(slot)) = self.expiry_heap.peek().copied() {
            if slot.at > now {
                break;
            }
            self.expiry_heap.pop();
            match self.cache.get(&slot.address) {
                Some(entry) if entry.revision == slot.revision && entry.expires_at <= now => {
                    self.cache.remove(&slot.address);
                }
                _ => {}
            }
        }
    }

    /// Overflow eviction: oldest last-seen entry goes first.
    fn evict_to_capacity(&mut self) {
        while self.cache.len() >= self.max_entries {
            let Some(Reverse(slot)) = self.last_seen_heap.pop() else {
                break;
            };
            match self.cache.get(&slot.address) {
                Some(entry) if entry.revision == slot.revision => {
                    self.cache.remove(&slot.address);
                }
                _ => continue,
            }
        }
    }

    fn match_signature(&self, host: &str, domain: &str) -> Option<String> {
        let host = host.to_ascii_lowercase();
        for signature in &self.signatures {
            for candidate in &signature.exact {
                if domain == candidate
                    || domain.ends_with(&format!(".{candidate}"))
                    || host == *candidate
                    || host.ends_with(&format!(".{candidate}"))
                {
                    return Some(signature.label.clone());
                }
            }
            for wildcard in &signature.wildcards {
                if wildcard.matches(&host) || wildcard.matches(domain) {
                    return Some(signature.label.clone());
                }
            }
        }
        None
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    fn cached_source(&self, address: &IpAddr) -> Option<ObservationSource> {
        self.cache.get(address).map(|entry| entry.source)
    }

    #[cfg(test)]
    fn cached_expiry(&self, address: &IpAddr) -> Option<Instant> {
        self.cache.get(address).map(|entry| entry.expires_at)
    }
}

/// Fixed suffix table mapping CDN hostnames to their provider and ASN tag.
const CDN_SUFFIXES: &[(&str, &str, &str)] = &[
    ("akamai.net", "Akamai", "AS20940"),
    ("akamaiedge.net", "Akamai", "AS20940"),
    ("akamaized.net", "Akamai", "AS20940"),
    ("cloudflare.com", "Cloudflare", "AS13335"),
    ("cloudflare.net", "Cloudflare", "AS13335"),
    ("fastly.net", "Fastly", "AS54113"),
    ("fastlylb.net", "Fastly", "AS54113"),
    ("cloudfront.net", "CloudFront", "AS16509"),
    ("googleusercontent.com", "Google", "AS15169"),
    ("gstatic.com", "Google", "AS15169"),
    ("googlevideo.com", "Google", "AS15169"),
    ("1e100.net", "Google", "AS15169"),
    ("fbcdn.net", "Meta", "AS32934"),
    ("facebook.com", "Meta", "AS32934"),
    ("apple.com", "Apple", "AS714"),
    ("aaplimg.com", "Apple", "AS714"),
    ("cdn-apple.com", "Apple", "AS714"),
    ("icloud.com", "Apple", "AS714"),
    ("azureedge.net", "Microsoft", "AS8075"),
    ("msedge.net", "Microsoft", "AS8075"),
    ("llnwd.net", "Edgio", "AS22822"),
];

fn infer_cdn(host: &str) -> Option<(&'static str, &'static str)> {
    let host = host.to_ascii_lowercase();
    for (suffix, provider, asn) in CDN_SUFFIXES {
        if host == *suffix || host.ends_with(&format!(".{suffix}")) {
            return Some((provider, asn));
        }
    }
    None
}
