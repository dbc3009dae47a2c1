//! Maps remote addresses back to the hostname that was originally requested.
//!
//! Entries arrive from DNS answers, TLS/QUIC SNI observations, and explicit
//! host hints. The cache is a bounded LRU with a per-entry TTL; expired
//! entries answer `None` and are dropped on touch.

use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub const FORWARD_HOST_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct ForwardHostEntry {
    pub host: String,
    pub observed_at: Instant,
    pub ttl: Duration,
}

impl ForwardHostEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.observed_at) >= self.ttl
    }
}

pub struct ForwardHostTracker {
    entries: Mutex<LruCache<IpAddr, ForwardHostEntry>>,
}

impl ForwardHostTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records `host` as the most recent name for `address`. Later
    /// observations overwrite earlier ones (last writer wins). The name is
    /// kept exactly as requested; consumers normalize case themselves.
    pub fn observe(&self, address: IpAddr, host: &str, ttl: Option<Duration>) {
        let trimmed = host.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return;
        }
        let entry = ForwardHostEntry {
            host: trimmed.to_string(),
            observed_at: Instant::now(),
            ttl: ttl.unwrap_or(FORWARD_HOST_TTL),
        };
        self.entries.lock().put(address, entry);
    }

    /// O(1) lookup; `None` once the entry has expired.
    pub fn lookup(&self, address: IpAddr) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&address) {
            Some(entry) if !entry.expired(now) => Some(entry.host.clone()),
            Some(_) => {
                entries.pop(&address);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live entries, most recently used first. Serves the
    /// `dnsHistory` control request.
    pub fn snapshot(&self) -> Vec<(IpAddr, ForwardHostEntry)> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.expired(now))
            .map(|(address, entry)| (*address, entry.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn last_writer_wins_and_case_is_preserved() {
        let tracker = ForwardHostTracker::new(16);
        tracker.observe(ip(1), "first.example.com", None);
        tracker.observe(ip(1), "Second.Example.COM.", None);
        assert_eq!(tracker.lookup(ip(1)), Some("Second.Example.COM".into()));
    }

    #[test]
    fn expired_entries_answer_none_and_are_dropped() {
        let tracker = ForwardHostTracker::new(16);
        tracker.observe(ip(2), "gone.example.com", Some(Duration::from_millis(0)));
        assert_eq!(tracker.lookup(ip(2)), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let tracker = ForwardHostTracker::new(2);
        tracker.observe(ip(1), "a.example", None);
        tracker.observe(ip(2), "b.example", None);
        // Touch the first entry so the second becomes the eviction victim.
        assert!(tracker.lookup(ip(1)).is_some());
        tracker.observe(ip(3), "c.example", None);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.lookup(ip(2)), None);
        assert!(tracker.lookup(ip(1)).is_some());
        assert!(tracker.lookup(ip(3)).is_some());
    }
}
