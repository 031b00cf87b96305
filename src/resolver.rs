use std::collections::HashMap;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("reverse lookup for {0} timed out")]
    Timeout(IpAddr),
    #[error("reverse lookup for {addr} failed: {source}")]
    Failed {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no hostname for {0}")]
    NotFound(IpAddr),
}

pub trait ReverseLookup: Send + Sync {
    fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError>;
}

/// Reverse DNS through the system resolver, abandoned after `timeout`.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        DnsResolver { timeout }
    }
}

impl ReverseLookup for DnsResolver {
    fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError> {
        let (tx, rx) = bounded(1);
        // the lookup thread is left to finish on its own if we stop waiting
        thread::spawn(move || {
            let _ = tx.send(dns_lookup::lookup_addr(&addr));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(name)) if name.is_empty() || name == addr.to_string() => {
                Err(LookupError::NotFound(addr))
            }
            Ok(Ok(name)) => Ok(name),
            Ok(Err(source)) => Err(LookupError::Failed { addr, source }),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(LookupError::Timeout(addr))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CachedName {
    Host(String),
    Unresolved,
}

/// IP to hostname cache. Entries live for the whole run.
pub struct ResolverCache<L> {
    lookup: L,
    names: Mutex<HashMap<IpAddr, CachedName>>,
}

impl<L: ReverseLookup> ResolverCache<L> {
    pub fn new(lookup: L) -> Self {
        ResolverCache {
            lookup,
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Hostname for `addr`, or the address itself when it cannot be resolved.
    pub fn resolve(&self, addr: IpAddr) -> String {
        if let Some(cached) = self.names.lock().get(&addr) {
            return match cached {
                CachedName::Host(name) => name.clone(),
                CachedName::Unresolved => addr.to_string(),
            };
        }

        // not holding the lock across the lookup
        let entry = match self.lookup.reverse_lookup(addr) {
            Ok(name) => CachedName::Host(name),
            Err(e) => {
                debug!("{}", e);
                CachedName::Unresolved
            }
        };
        let name = match &entry {
            CachedName::Host(name) => name.clone(),
            CachedName::Unresolved => addr.to_string(),
        };
        self.names.lock().entry(addr).or_insert(entry);
        name
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
        answer: Option<&'static str>,
    }

    impl CountingLookup {
        fn new(answer: Option<&'static str>) -> Self {
            CountingLookup {
                calls: AtomicUsize::new(0),
                answer,
            }
        }
    }

    impl ReverseLookup for CountingLookup {
        fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map(str::to_string)
                .ok_or(LookupError::NotFound(addr))
        }
    }

    #[test]
    fn second_resolve_hits_cache() {
        let cache = ResolverCache::new(CountingLookup::new(Some("router.lan")));
        let addr: IpAddr = "192.168.1.1".parse().unwrap();

        assert_eq!(cache.resolve(addr), "router.lan");
        assert_eq!(cache.resolve(addr), "router.lan");
        assert_eq!(cache.lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_degrades_to_address_and_is_cached() {
        let cache = ResolverCache::new(CountingLookup::new(None));
        let addr: IpAddr = "203.0.113.7".parse().unwrap();

        assert_eq!(cache.resolve(addr), "203.0.113.7");
        assert_eq!(cache.resolve(addr), "203.0.113.7");
        assert_eq!(cache.lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_addresses_each_looked_up() {
        let cache = ResolverCache::new(CountingLookup::new(Some("host")));
        cache.resolve("10.0.0.1".parse().unwrap());
        cache.resolve("10.0.0.2".parse().unwrap());
        cache.resolve("::1".parse().unwrap());
        assert_eq!(cache.lookup.calls.load(Ordering::SeqCst), 3);
    }

    struct SlowLookup;

    impl ReverseLookup for SlowLookup {
        fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError> {
            Err(LookupError::Timeout(addr))
        }
    }

    #[test]
    fn timeout_falls_back_to_address() {
        let cache = ResolverCache::new(SlowLookup);
        assert_eq!(cache.resolve("2001:db8::1".parse().unwrap()), "2001:db8::1");
    }
}
