use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::model::{FetchResult, LiveStatus, StreamState};

/// Values that decide for themselves whether they are worth keeping.
pub trait Cacheable: Clone {
    fn is_cacheable(&self) -> bool;
}

impl Cacheable for FetchResult {
    fn is_cacheable(&self) -> bool {
        self.is_ok()
    }
}

impl Cacheable for LiveStatus {
    fn is_cacheable(&self) -> bool {
        self.state != StreamState::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub capacity: usize,
    /// How long a caller waits on someone else's in-flight fetch before
    /// fetching on its own.
    pub wait_timeout: Duration,
    /// Outstanding upstream calls allowed for this cache at once.
    pub max_in_flight: usize,
}

enum Slot<V> {
    Ready {
        value: V,
        fetched_at: Instant,
        last_used: Instant,
    },
    Pending {
        id: u64,
        rx: watch::Receiver<Option<V>>,
    },
}

enum Role<V> {
    Hit(V),
    Wait(watch::Receiver<Option<V>>),
    Lead(u64, watch::Sender<Option<V>>),
}

/// Time-bounded, size-bounded memo of fetch results for one source class.
///
/// Concurrent callers for the same key share a single upstream call.
pub struct FetchCache<V> {
    class: &'static str,
    policy: CachePolicy,
    slots: Mutex<HashMap<String, Slot<V>>>,
    in_flight: Semaphore,
    next_id: AtomicU64,
}

impl<V: Cacheable> FetchCache<V> {
    pub fn new(class: &'static str, policy: CachePolicy) -> Self {
        let permits = policy.max_in_flight.max(1);
        Self {
            class,
            policy,
            slots: Mutex::new(HashMap::new()),
            in_flight: Semaphore::new(permits),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the live entry for `source` at `limit`, or run `fetch` to
    /// produce one. `fetch` runs at most once per key at any instant.
    pub async fn get_or_fetch<F, Fut>(&self, source: &str, limit: usize, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let key = format!("{}:{}", source, limit);
        let give_up = Instant::now() + self.policy.wait_timeout;

        // An abandoned leader sends waiters back here; one of them takes over.
        loop {
            match self.claim(&key) {
                Role::Hit(value) => {
                    debug!(class = self.class, key = %key, "cache hit");
                    return value;
                }
                Role::Lead(id, tx) => return self.lead(&key, id, tx, fetch).await,
                Role::Wait(rx) => match timeout_at(give_up, wait_for(rx)).await {
                    Ok(Some(value)) => return value,
                    Ok(None) => {
                        debug!(class = self.class, key = %key, "in-flight fetch abandoned, reclaiming");
                    }
                    Err(_) => {
                        warn!(class = self.class, key = %key, "timed out waiting on in-flight fetch, fetching directly");
                        return self.fetch_detached(&key, fetch).await;
                    }
                },
            }
        }
    }

    fn claim(&self, key: &str) -> Role<V> {
        let mut slots = self.lock();
        let now = Instant::now();

        match slots.get_mut(key) {
            Some(Slot::Ready {
                value,
                fetched_at,
                last_used,
            }) if now.duration_since(*fetched_at) < self.policy.ttl => {
                *last_used = now;
                return Role::Hit(value.clone());
            }
            Some(Slot::Pending { rx, .. }) => return Role::Wait(rx.clone()),
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), Slot::Pending { id, rx });
        Role::Lead(id, tx)
    }

    async fn lead<F, Fut>(&self, key: &str, id: u64, tx: watch::Sender<Option<V>>, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let mut guard = PendingGuard {
            cache: self,
            key,
            id,
            armed: true,
        };

        let value = {
            let _permit = self.in_flight.acquire().await.ok();
            fetch().await
        };

        self.settle(key, Some(id), &value);
        guard.armed = false;
        let _ = tx.send(Some(value.clone()));
        value
    }

    async fn fetch_detached<F, Fut>(&self, key: &str, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let value = {
            let _permit = self.in_flight.acquire().await.ok();
            fetch().await
        };
        self.settle(key, None, &value);
        value
    }

    /// Record the outcome of a fetch. `owner` is the pending slot this fetch
    /// was registered under; detached fetches never replace someone else's
    /// pending slot.
    fn settle(&self, key: &str, owner: Option<u64>, value: &V) {
        let mut slots = self.lock();

        let replaceable = match (slots.get(key), owner) {
            (Some(Slot::Pending { id, .. }), Some(owner)) => *id == owner,
            (Some(Slot::Pending { .. }), None) => false,
            _ => true,
        };
        if !replaceable {
            return;
        }

        if value.is_cacheable() {
            let now = Instant::now();
            slots.insert(
                key.to_string(),
                Slot::Ready {
                    value: value.clone(),
                    fetched_at: now,
                    last_used: now,
                },
            );
            self.evict(&mut slots, now);
        } else if owner.is_some() {
            slots.remove(key);
        }
    }

    fn evict(&self, slots: &mut HashMap<String, Slot<V>>, now: Instant) {
        if slots.len() <= self.policy.capacity {
            return;
        }

        let ttl = self.policy.ttl;
        slots.retain(|_, slot| match slot {
            Slot::Ready { fetched_at, .. } => now.duration_since(*fetched_at) < ttl,
            Slot::Pending { .. } => true,
        });

        while slots.len() > self.policy.capacity {
            let oldest = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((key.clone(), *last_used)),
                    Slot::Pending { .. } => None,
                })
                .min_by_key(|(_, last_used)| *last_used);

            match oldest {
                Some((key, _)) => {
                    debug!(class = self.class, key = %key, "evicting least recently used entry");
                    slots.remove(&key);
                }
                None => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn wait_for<V: Clone>(mut rx: watch::Receiver<Option<V>>) -> Option<V> {
    let value = rx.wait_for(Option::is_some).await.ok()?.clone();
    value
}

/// Clears a pending slot if its leader is dropped before finishing, so the
/// next caller starts a fresh fetch instead of waiting on a dead one.
struct PendingGuard<'a, V: Cacheable> {
    cache: &'a FetchCache<V>,
    key: &'a str,
    id: u64,
    armed: bool,
}

impl<V: Cacheable> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.cache.lock();
        if matches!(slots.get(self.key), Some(Slot::Pending { id, .. }) if *id == self.id) {
            slots.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use crate::model::Item;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn policy(ttl_secs: u64, capacity: usize) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(ttl_secs),
            capacity,
            wait_timeout: Duration::from_secs(5),
            max_in_flight: 4,
        }
    }

    fn result_with(title: &str) -> FetchResult {
        FetchResult::from_items(vec![Item {
            title: title.to_string(),
            ..Default::default()
        }])
    }

    async fn counted(counter: &AtomicUsize, title: &str) -> FetchResult {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        result_with(title)
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_callers() {
        let cache = FetchCache::new("feed", policy(60, 16));
        let counter = AtomicUsize::new(0);

        let calls = (0..12).map(|_| {
            cache.get_or_fetch("https://example.com/feed", 5, || counted(&counter, "shared"))
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.items[0].title == "shared"));
    }

    #[tokio::test]
    async fn test_single_flight_across_tasks() {
        let cache = Arc::new(FetchCache::new("feed", policy(60, 16)));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("key", 3, || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        result_with("spawned")
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().items[0].title, "spawned");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_served_until_ttl_expires() {
        let cache = FetchCache::new("feed", policy(600, 16));
        let counter = AtomicUsize::new(0);

        cache.get_or_fetch("key", 5, || counted(&counter, "first")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(599)).await;
        let cached = cache.get_or_fetch("key", 5, || counted(&counter, "second")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cached.items[0].title, "first");

        tokio::time::advance(Duration::from_secs(1)).await;
        let refreshed = cache.get_or_fetch("key", 5, || counted(&counter, "second")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.items[0].title, "second");
    }

    #[tokio::test]
    async fn test_limit_is_part_of_key() {
        let cache = FetchCache::new("feed", policy(60, 16));
        let counter = AtomicUsize::new(0);

        cache.get_or_fetch("key", 3, || counted(&counter, "three")).await;
        cache.get_or_fetch("key", 5, || counted(&counter, "five")).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = FetchCache::new("feed", policy(60, 16));
        let counter = AtomicUsize::new(0);

        let failed = cache
            .get_or_fetch("key", 5, || async {
                counter.fetch_add(1, Ordering::SeqCst);
                FetchResult::failed(FetchErrorKind::Timeout)
            })
            .await;
        assert!(!failed.is_ok());
        assert!(cache.is_empty());

        let ok = cache.get_or_fetch("key", 5, || counted(&counter, "recovered")).await;
        assert!(ok.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_live_status_not_cached() {
        let cache = FetchCache::new("live", policy(60, 16));

        cache
            .get_or_fetch("shroud", 1, || async {
                LiveStatus::unknown("shroud", FetchErrorKind::Network)
            })
            .await;
        assert!(cache.is_empty());

        cache
            .get_or_fetch("shroud", 1, || async { LiveStatus::offline("shroud") })
            .await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let cache = FetchCache::new("subreddit", policy(600, 2));
        let counter = AtomicUsize::new(0);

        cache.get_or_fetch("a", 5, || counted(&counter, "a")).await;
        cache.get_or_fetch("b", 5, || counted(&counter, "b")).await;
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get_or_fetch("a", 5, || counted(&counter, "a")).await;
        cache.get_or_fetch("c", 5, || counted(&counter, "c")).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        cache.get_or_fetch("a", 5, || counted(&counter, "a")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        cache.get_or_fetch("b", 5, || counted(&counter, "b")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_falls_back_after_wait_timeout() {
        let cache = FetchCache::new(
            "feed",
            CachePolicy {
                wait_timeout: Duration::from_secs(1),
                ..policy(60, 16)
            },
        );
        let counter = AtomicUsize::new(0);

        let stuck = cache.get_or_fetch("key", 5, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            result_with("stuck")
        });
        let impatient = cache.get_or_fetch("key", 5, || counted(&counter, "direct"));

        tokio::select! {
            biased;
            _ = stuck => panic!("stuck fetch should not finish first"),
            result = impatient => assert_eq!(result.items[0].title, "direct"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_elect_new_leader_after_abort() {
        let cache = Arc::new(FetchCache::new("feed", policy(60, 16)));
        let counter = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = cache.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("key", 5, || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<FetchResult>().await
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let counter = counter.clone();
            waiters.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("key", 5, || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        result_with("successor")
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().items[0].title, "successor");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_key() {
        let cache = FetchCache::new("feed", policy(60, 16));
        let counter = AtomicUsize::new(0);

        let abandoned = cache.get_or_fetch("key", 5, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<FetchResult>().await
        });
        let outcome = tokio::time::timeout(Duration::from_millis(20), abandoned).await;
        assert!(outcome.is_err());

        let fresh = cache.get_or_fetch("key", 5, || counted(&counter, "fresh")).await;
        assert_eq!(fresh.items[0].title, "fresh");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }
}
