//! Revalidation cache shared by resource bindings.
//!
//! # Design
//! `SwrCache` is a cheap cloneable handle over a `moka` future cache keyed by
//! fingerprint. Concurrent `fetch` calls for the same key are coalesced into
//! one loader run; a settled value is served from memory until its
//! time-to-live expires. Errors are never cached, so a failed key is fetched
//! again on the next attempt.
//!
//! Instances are injected into bindings explicitly. Listing data defaults to
//! a short lifetime; collection options use a long-lived instance that
//! several collections may share.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::HttpError;

/// Lifetime of entries in a cache built with [`SwrCache::new`].
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Lifetime of the collection options cache.
pub const OPTIONS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_CAPACITY: u64 = 10_000;

/// How often a failed fetch is retried, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub count: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(count: u32, interval: Duration) -> Self {
        Self { count, interval }
    }

    pub fn none() -> Self {
        Self {
            count: 0,
            interval: Duration::from_secs(5),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Clone)]
pub struct SwrCache<T> {
    entries: Cache<String, T>,
}

impl<T> SwrCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(DEFAULT_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { entries }
    }

    /// Return the cached value for `key`, or run `loader` once for all
    /// concurrent callers asking for the same key.
    pub async fn fetch<F>(&self, key: &str, loader: F) -> Result<T, HttpError>
    where
        F: Future<Output = Result<T, HttpError>> + Send,
    {
        self.entries
            .try_get_with(key.to_string(), loader)
            .await
            .map_err(|e: Arc<HttpError>| (*e).clone())
    }

    /// Seed or overwrite the value for `key` without fetching.
    pub async fn mutate(&self, key: &str, value: T) {
        self.entries.insert(key.to_string(), value).await;
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).await
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

impl<T> Default for SwrCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_fetches_share_one_load() {
        let cache: SwrCache<String> = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let load = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, HttpError>("value".to_string())
        };

        let (a, b) = tokio::join!(
            cache.fetch("get:1:/x", load(calls.clone())),
            cache.fetch("get:1:/x", load(calls.clone())),
        );
        assert_eq!(a.unwrap(), "value");
        assert_eq!(b.unwrap(), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: SwrCache<String> = SwrCache::new();
        let err = cache
            .fetch("k", async { Err(HttpError::Unknown { raw: "boom".into() }) })
            .await
            .unwrap_err();
        assert_eq!(err.raw(), "boom");

        let ok = cache.fetch("k", async { Ok("fine".to_string()) }).await.unwrap();
        assert_eq!(ok, "fine");
    }

    #[tokio::test]
    async fn mutate_seeds_without_loading() {
        let cache: SwrCache<u32> = SwrCache::new();
        cache.mutate("k", 7).await;
        let value = cache
            .fetch("k", async { Err(HttpError::Unknown { raw: "loader ran".into() }) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache: SwrCache<u32> = SwrCache::with_ttl(OPTIONS_TTL);
        let other = cache.clone();
        cache.mutate("k", 1).await;
        assert_eq!(other.get("k").await, Some(1));
        other.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
