//! Name resolution with a host override layer.
//!
//! The host may install a resolver closure; its answers, when non-empty, pin
//! the subsequent dial. Otherwise the internal resolver answers. Every
//! successful resolution is recorded into the forward-host tracker so later
//! flows to the same address can be attributed to the hostname.

mod forward_host;
mod system;

pub use forward_host::{
    ForwardHostTracker, DEFAULT_CAPACITY as FORWARD_HOST_CAPACITY, FORWARD_HOST_TTL,
};
pub use system::SystemResolver;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Closure supplied by the host; may suspend while the platform resolves.
pub type HostResolverFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Vec<IpAddr>> + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("unsupported hostname")]
    Unsupported,
    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub addresses: Vec<IpAddr>,
    pub ttl: Duration,
    /// True when the host resolver supplied the answer; such addresses pin
    /// the dial.
    pub pinned: bool,
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError>;
}

type SharedLookup = Shared<BoxFuture<'static, Result<ResolveOutcome, ResolveError>>>;

/// Two-layer resolver: host closure first, internal resolver second.
/// Duplicate in-flight lookups for the same host coalesce behind one future.
pub struct EngineResolver {
    host_resolver: Option<HostResolverFn>,
    internal: Option<Arc<SystemResolver>>,
    forward_hosts: Arc<ForwardHostTracker>,
    pending: Mutex<HashMap<String, SharedLookup>>,
}

impl EngineResolver {
    pub fn new(
        host_resolver: Option<HostResolverFn>,
        use_system_resolver: bool,
        forward_hosts: Arc<ForwardHostTracker>,
    ) -> Self {
        Self {
            host_resolver,
            internal: use_system_resolver.then(|| Arc::new(SystemResolver::default())),
            forward_hosts,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        let trimmed = host.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::Unsupported);
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(ResolveOutcome {
                addresses: vec![ip],
                ttl: FORWARD_HOST_TTL,
                pinned: false,
            });
        }
        let key = trimmed.to_ascii_lowercase();
        let lookup = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get(&key) {
                existing.clone()
            } else {
                let lookup = Self::start_lookup(
                    key.clone(),
                    self.host_resolver.clone(),
                    self.internal.clone(),
                    Arc::clone(&self.forward_hosts),
                );
                pending.insert(key.clone(), lookup.clone());
                lookup
            }
        };
        let outcome = lookup.await;
        self.pending.lock().remove(&key);
        outcome
    }

    fn start_lookup(
        host: String,
        host_resolver: Option<HostResolverFn>,
        internal: Option<Arc<SystemResolver>>,
        forward_hosts: Arc<ForwardHostTracker>,
    ) -> SharedLookup {
        async move {
            if let Some(resolver) = host_resolver {
                let addresses = resolver(host.clone()).await;
                if !addresses.is_empty() {
                    record(&forward_hosts, &host, &addresses);
                    return Ok(ResolveOutcome {
                        addresses,
                        ttl: FORWARD_HOST_TTL,
                        pinned: true,
                    });
                }
            }
            let Some(internal) = internal else {
                return Err(ResolveError::LookupFailed(
                    "no resolver available".to_string(),
                ));
            };
            let outcome = internal.resolve(&host)?;
            record(&forward_hosts, &host, &outcome.addresses);
            Ok(outcome)
        }
        .boxed()
        .shared()
    }

    /// Number of lookups currently in flight (test probe).
    pub fn pending_lookups(&self) -> usize {
        self.pending.lock().len()
    }
}

fn record(forward_hosts: &ForwardHostTracker, host: &str, addresses: &[IpAddr]) {
    for address in addresses {
        forward_hosts.observe(*address, host, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> Arc<ForwardHostTracker> {
        Arc::new(ForwardHostTracker::new(64))
    }

    #[tokio::test]
    async fn host_resolver_answers_pin_the_dial() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_probe = Arc::clone(&calls);
        let host_resolver: HostResolverFn = Arc::new(move |_host| {
            calls_probe.fetch_add(1, Ordering::SeqCst);
            async { vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))] }.boxed()
        });
        let forward = tracker();
        let resolver = EngineResolver::new(Some(host_resolver), true, Arc::clone(&forward));

        let outcome = resolver.resolve("pinned.example.com").await.expect("resolve");
        assert!(outcome.pinned);
        assert_eq!(outcome.addresses.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            forward.lookup(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))),
            Some("pinned.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn empty_host_answer_falls_back_to_internal() {
        let host_resolver: HostResolverFn = Arc::new(|_host| async { Vec::new() }.boxed());
        let resolver = EngineResolver::new(Some(host_resolver), true, tracker());
        let outcome = resolver.resolve("localhost").await.expect("resolve");
        assert!(!outcome.pinned);
        assert!(!outcome.addresses.is_empty());
    }

    #[tokio::test]
    async fn ip_literals_bypass_both_layers() {
        let resolver = EngineResolver::new(None, false, tracker());
        let outcome = resolver.resolve("192.0.2.7").await.expect("resolve");
        assert_eq!(
            outcome.addresses,
            vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))]
        );
    }

    #[tokio::test]
    async fn duplicate_lookups_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_probe = Arc::clone(&calls);
        let host_resolver: HostResolverFn = Arc::new(move |_host| {
            let calls = Arc::clone(&calls_probe);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))]
            }
            .boxed()
        });
        let resolver =
            Arc::new(EngineResolver::new(Some(host_resolver), false, tracker()));
        let first = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve("coalesce.example").await })
        };
        let second = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve("coalesce.example").await })
        };
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single upstream lookup");
        assert_eq!(resolver.pending_lookups(), 0);
    }

    #[tokio::test]
    async fn no_layers_means_lookup_failure() {
        let resolver = EngineResolver::new(None, false, tracker());
        assert!(matches!(
            resolver.resolve("nobody.example").await,
            Err(ResolveError::LookupFailed(_))
        ));
        assert!(matches!(
            resolver.resolve("   ").await,
            Err(ResolveError::Unsupported)
        ));
    }
}
