// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Generic single-flight TTL cache used by every backend (§4.B, §1A).
//!
//! Concurrent callers requesting the same key while a fetch is already in
//! flight wait on that fetch rather than launching a second one; callers
//! that have waited past [`Cache::MAX_WAIT`] fall back to whatever stale
//! value is cached, if any, rather than blocking indefinitely on a slow
//! upstream.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::stats;

/// Callers that have waited this long for an in-flight fetch stop waiting
/// and either return stale data or drive the fetch themselves.
const MAX_WAIT: Duration = Duration::from_secs(10);

struct Inner<Args, V> {
    data: HashMap<Args, (V, Instant)>,
    in_flight: HashSet<Args>,
}

/// A TTL-bounded, single-flight memoizing cache keyed by `Args`.
pub struct Cache<Args, V> {
    ttl: Duration,
    inner: Mutex<Inner<Args, V>>,
    notify: Notify,
}

impl<Args, V> Cache<Args, V>
where
    Args: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Cache {
            ttl,
            inner: Mutex::new(Inner {
                data: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Returns the cached value for `args`, calling `fetch` to populate it if
    /// missing or expired. Concurrent callers for the same `args` share one
    /// in-flight fetch.
    pub async fn get<F, Fut, E>(&self, args: Args, fetch: F) -> Result<V, E>
    where
        F: FnOnce(Args) -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        loop {
            let mut guard = self.inner.lock().await;
            if let Some((v, at)) = guard.data.get(&args) {
                if at.elapsed() < self.ttl {
                    stats::CACHE_HITS.inc();
                    return Ok(v.clone());
                }
            }
            if !guard.in_flight.contains(&args) {
                guard.in_flight.insert(args.clone());
                drop(guard);

                stats::CACHE_MISSES.inc();
                let result = fetch(args.clone()).await;
                let mut guard = self.inner.lock().await;
                guard.in_flight.remove(&args);
                match &result {
                    Ok(v) => {
                        guard.data.insert(args.clone(), (v.clone(), Instant::now()));
                    }
                    Err(_) => {
                        // Leave any existing stale entry in place; a failed
                        // refresh should not evict data that was merely old.
                    }
                }
                drop(guard);
                self.notify.notify_waiters();
                return result;
            }
            drop(guard);

            stats::CACHE_SINGLE_FLIGHT_WAITS.inc();
            let waited = tokio::time::timeout(MAX_WAIT, self.notify.notified()).await;
            if waited.is_err() {
                // Gave up waiting on the in-flight fetch. Return stale data if
                // we have any; otherwise loop back around and drive the fetch
                // ourselves.
                let guard = self.inner.lock().await;
                if let Some((v, _)) = guard.data.get(&args) {
                    stats::CACHE_STALE_RETURNS.inc();
                    return Ok(v.clone());
                }
            }
        }
    }

    /// Drops any cached value for `args`, forcing the next `get` to refetch.
    pub async fn invalidate(&self, args: &Args) {
        let mut guard = self.inner.lock().await;
        guard.data.remove(args);
    }

    /// True if `args` has no unexpired cached value.
    pub async fn expired(&self, args: &Args) -> bool {
        let guard = self.inner.lock().await;
        match guard.data.get(args) {
            Some((_, at)) => at.elapsed() >= self.ttl,
            None => true,
        }
    }
}

/// Convenience alias for the common case of a cache shared across tasks.
pub type SharedCache<Args, V> = Arc<Cache<Args, V>>;
