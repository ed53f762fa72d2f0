//! Resilient Fetch Coordinator — concurrent provider acquisition with
//! retry, backoff, quota gating, and cache fallback.
//!
//! Every configured provider comes back with *some* snapshot: a fresh
//! fetch, a cached one with its computed tier, or the provider's static
//! defaults. Absence is impossible by construction, which is the
//! invariant every downstream consumer leans on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::provider::{ProviderError, ProviderFetch, ProviderId, SourceSnapshot, TimeWindow, TrustTier};
use crate::store::StoreError;

/// Attempts per provider within one acquisition.
const MAX_ATTEMPTS: usize = 3;

/// Backoff escalation schedule between attempts, in seconds.
const BACKOFF_SECS: [u64; MAX_ATTEMPTS] = [2, 4, 8];

/// Errors from the coordinator itself. Individual provider failures
/// never surface here; they downgrade to cache.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch phase aborted by shutdown signal")]
    Aborted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Timing knobs for the fetch phase.
#[derive(Debug, Clone, Copy)]
pub struct FetchTiming {
    /// Timeout applied to each individual fetch attempt.
    pub attempt_timeout: Duration,
    /// Wall-clock deadline for a provider's whole acquisition
    /// (attempts plus backoff); a provider still pending at the
    /// deadline is treated as failed and falls back to cache.
    pub phase_deadline: Duration,
}

impl Default for FetchTiming {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            phase_deadline: Duration::from_secs(60),
        }
    }
}

/// Coordinates concurrent fetches against the cache & quota store.
pub struct FetchCoordinator {
    cache: Arc<CacheStore>,
    timing: FetchTiming,
}

impl FetchCoordinator {
    pub fn new(cache: Arc<CacheStore>, timing: FetchTiming) -> Self {
        Self { cache, timing }
    }

    /// Acquire a snapshot for every provider, concurrently.
    ///
    /// Returns an entry per provider, always. If the shutdown signal
    /// fires mid-phase the run is aborted and in-flight tasks are
    /// abandoned rather than assembled into a partial result.
    pub async fn acquire(
        &self,
        providers: &[Arc<dyn ProviderFetch>],
        window: TimeWindow,
        now: i64,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<HashMap<ProviderId, SourceSnapshot>> {
        let mut handles = Vec::with_capacity(providers.len());
        for provider in providers {
            let cache = Arc::clone(&self.cache);
            let provider = Arc::clone(provider);
            let timing = self.timing;
            handles.push(tokio::spawn(async move {
                acquire_one(cache, provider, window, now, timing).await
            }));
        }

        let joined = futures::future::join_all(handles);
        tokio::select! {
            results = joined => {
                let mut map = HashMap::with_capacity(results.len());
                for result in results {
                    match result {
                        Ok(Ok((id, snapshot))) => {
                            map.insert(id, snapshot);
                        }
                        Ok(Err(e)) => return Err(FetchError::Store(e)),
                        Err(e) => {
                            // A panicked task is a bug, not a provider
                            // failure; surface it loudly.
                            log::error!("[FetchCoordinator] provider task failed: {}", e);
                        }
                    }
                }
                Ok(map)
            }
            _ = shutdown.changed() => {
                log::warn!("[FetchCoordinator] shutdown mid-fetch, aborting run");
                Err(FetchError::Aborted)
            }
        }
    }
}

/// Acquire one provider's snapshot. Infallible with respect to the
/// provider: every path ends in a snapshot. Only store-level failures
/// propagate.
async fn acquire_one(
    cache: Arc<CacheStore>,
    provider: Arc<dyn ProviderFetch>,
    window: TimeWindow,
    now: i64,
    timing: FetchTiming,
) -> std::result::Result<(ProviderId, SourceSnapshot), StoreError> {
    let id = provider.id().to_string();

    // Quota gate: denied providers skip straight to cache, no network.
    if !cache.charge_quota(&id, now)? {
        let (snapshot, tier) = cache.get(&id, now)?;
        log::info!(
            "[FetchCoordinator] {}: quota exhausted, serving {} cache",
            id,
            tier.label()
        );
        return Ok((id, snapshot));
    }

    let attempt = tokio::time::timeout(
        timing.phase_deadline,
        fetch_with_retries(provider.as_ref(), window, timing.attempt_timeout),
    )
    .await;

    match attempt {
        Ok(Ok(mut snapshot)) => {
            snapshot.fetched_at = now;
            snapshot.trust_tier = TrustTier::Fresh;
            cache.put(&id, &snapshot)?;
            log::info!(
                "[FetchCoordinator] {}: fresh fetch, {} readings",
                id,
                snapshot.readings.len()
            );
            Ok((id, snapshot))
        }
        Ok(Err(e)) => {
            log::warn!("[FetchCoordinator] {}: all attempts failed ({}), falling back to cache", id, e);
            let (snapshot, _) = cache.get(&id, now)?;
            Ok((id, snapshot))
        }
        Err(_) => {
            log::warn!(
                "[FetchCoordinator] {}: still pending at phase deadline, falling back to cache",
                id
            );
            let (snapshot, _) = cache.get(&id, now)?;
            Ok((id, snapshot))
        }
    }
}

/// Up to [`MAX_ATTEMPTS`] fetches with escalating backoff.
///
/// Retries are sequential within the task; only transient failures are
/// retried, a permanent failure (parse error, client error) returns
/// immediately.
async fn fetch_with_retries(
    provider: &dyn ProviderFetch,
    window: TimeWindow,
    attempt_timeout: Duration,
) -> std::result::Result<SourceSnapshot, ProviderError> {
    let mut last_err = ProviderError::Timeout;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = BACKOFF_SECS[attempt - 1];
            log::info!(
                "[FetchCoordinator] {}: retry {}/{} after {}s",
                provider.id(),
                attempt,
                MAX_ATTEMPTS - 1,
                delay
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        match tokio::time::timeout(attempt_timeout, provider.fetch(window)).await {
            Ok(Ok(snapshot)) => {
                if attempt > 0 {
                    log::info!(
                        "[FetchCoordinator] {}: succeeded on attempt {}",
                        provider.id(),
                        attempt + 1
                    );
                }
                return Ok(snapshot);
            }
            Ok(Err(e)) => {
                log::warn!(
                    "[FetchCoordinator] {}: attempt {} failed: {}",
                    provider.id(),
                    attempt + 1,
                    e
                );
                if !e.is_transient() {
                    return Err(e);
                }
                last_err = e;
            }
            Err(_) => {
                log::warn!(
                    "[FetchCoordinator] {}: attempt {} timed out",
                    provider.id(),
                    attempt + 1
                );
                last_err = ProviderError::Timeout;
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProviderProfile;
    use crate::provider::{Metric, Reading};
    use crate::store::Store;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scripted provider: fails `failures` times, then succeeds.
    struct ScriptedProvider {
        id: String,
        failures: usize,
        error: fn() -> ProviderError,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(id: &str, failures: usize) -> Self {
            Self {
                id: id.into(),
                failures,
                error: || ProviderError::Network("connection reset".into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_with(id: &str, error: fn() -> ProviderError) -> Self {
            Self {
                id: id.into(),
                failures: usize::MAX,
                error,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderFetch for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch(&self, window: TimeWindow) -> std::result::Result<SourceSnapshot, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(SourceSnapshot {
                provider: self.id.clone(),
                readings: vec![Reading::new(&*self.id, window.start, Metric::Temperature, 9.0)],
                fetched_at: 0,
                trust_tier: TrustTier::Fresh,
                is_synthesized: false,
            })
        }
    }

    fn test_cache(profiles: Vec<ProviderProfile>) -> (Arc<CacheStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let cache = CacheStore::new(Arc::new(Mutex::new(store)), profiles, 0);
        (Arc::new(cache), dir)
    }

    fn profile(id: &str, quota: Option<u32>) -> ProviderProfile {
        let mut defaults = BTreeMap::new();
        defaults.insert(Metric::Temperature, 12.0);
        ProviderProfile {
            id: id.into(),
            daily_quota: quota,
            defaults,
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::new(100_000, 100_000 + 24 * 3600)
    }

    fn shutdown_rx() -> watch::Receiver<()> {
        let (_tx, rx) = watch::channel(());
        // Leak the sender so the receiver stays live for the test.
        std::mem::forget(_tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn success_tags_fresh_and_caches() {
        let (cache, _dir) = test_cache(vec![profile("nws", None)]);
        let coordinator = FetchCoordinator::new(Arc::clone(&cache), FetchTiming::default());
        let provider: Arc<dyn ProviderFetch> = Arc::new(ScriptedProvider::new("nws", 0));

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&[provider], window(), 100_000, &mut rx)
            .await
            .unwrap();

        let snap = &map["nws"];
        assert_eq!(snap.trust_tier, TrustTier::Fresh);
        assert_eq!(snap.fetched_at, 100_000);
        // And the cache was updated
        let (cached, tier) = cache.get("nws", 100_000).unwrap();
        assert_eq!(tier, TrustTier::Fresh);
        assert!(!cached.is_synthesized);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let (cache, _dir) = test_cache(vec![profile("nws", None)]);
        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());
        let scripted = Arc::new(ScriptedProvider::new("nws", 2));
        let provider: Arc<dyn ProviderFetch> = scripted.clone();

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&[provider], window(), 100_000, &mut rx)
            .await
            .unwrap();

        assert_eq!(scripted.calls(), 3);
        assert_eq!(map["nws"].trust_tier, TrustTier::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_does_not_retry() {
        let (cache, _dir) = test_cache(vec![profile("nws", None)]);
        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());
        let scripted = Arc::new(ScriptedProvider::failing_with("nws", || {
            ProviderError::Parse("truncated body".into())
        }));
        let provider: Arc<dyn ProviderFetch> = scripted.clone();

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&[provider], window(), 100_000, &mut rx)
            .await
            .unwrap();

        assert_eq!(scripted.calls(), 1);
        // Never cached, so defaults
        assert_eq!(map["nws"].trust_tier, TrustTier::Default);
        assert!(map["nws"].is_synthesized);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_cache() {
        let (cache, _dir) = test_cache(vec![profile("nws", None)]);
        // Seed the cache 2 hours ago
        let seeded = SourceSnapshot {
            provider: "nws".into(),
            readings: vec![Reading::new("nws", 100_000, Metric::Temperature, 7.0)],
            fetched_at: 100_000 - 2 * 3600,
            trust_tier: TrustTier::Fresh,
            is_synthesized: false,
        };
        cache.put("nws", &seeded).unwrap();

        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());
        let scripted = Arc::new(ScriptedProvider::new("nws", usize::MAX));
        let provider: Arc<dyn ProviderFetch> = scripted.clone();

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&[provider], window(), 100_000, &mut rx)
            .await
            .unwrap();

        assert_eq!(scripted.calls(), MAX_ATTEMPTS);
        assert_eq!(map["nws"].trust_tier, TrustTier::Acceptable);
        assert!(!map["nws"].is_synthesized);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_denial_skips_network() {
        let (cache, _dir) = test_cache(vec![profile("accuweather", Some(42))]);
        // Burn the whole quota
        for _ in 0..42 {
            assert!(cache.charge_quota("accuweather", 100_000).unwrap());
        }
        // Seed a cache entry so the fallback is CACHE, not DEFAULT
        let seeded = SourceSnapshot {
            provider: "accuweather".into(),
            readings: vec![Reading::new("accuweather", 100_000, Metric::Temperature, 6.5)],
            fetched_at: 100_000 - 3600,
            trust_tier: TrustTier::Fresh,
            is_synthesized: false,
        };
        cache.put("accuweather", &seeded).unwrap();

        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());
        let scripted = Arc::new(ScriptedProvider::new("accuweather", 0));
        let provider: Arc<dyn ProviderFetch> = scripted.clone();

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&[provider], window(), 100_000, &mut rx)
            .await
            .unwrap();

        // The 43rd call attempt performed no network call
        assert_eq!(scripted.calls(), 0);
        let snap = &map["accuweather"];
        assert_ne!(snap.trust_tier, TrustTier::Fresh);
        assert_eq!(snap.value_at(100_000, Metric::Temperature), Some(6.5));
    }

    #[tokio::test(start_paused = true)]
    async fn every_provider_gets_an_entry() {
        let (cache, _dir) = test_cache(vec![
            profile("a", None),
            profile("b", None),
            profile("c", None),
        ]);
        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());
        let providers: Vec<Arc<dyn ProviderFetch>> = vec![
            Arc::new(ScriptedProvider::new("a", 0)),
            Arc::new(ScriptedProvider::new("b", usize::MAX)),
            Arc::new(ScriptedProvider::failing_with("c", || ProviderError::Http {
                status: 404,
            })),
        ];

        let mut rx = shutdown_rx();
        let map = coordinator
            .acquire(&providers, window(), 100_000, &mut rx)
            .await
            .unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map["a"].trust_tier, TrustTier::Fresh);
        assert_eq!(map["b"].trust_tier, TrustTier::Default);
        assert_eq!(map["c"].trust_tier, TrustTier::Default);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_run() {
        let (cache, _dir) = test_cache(vec![profile("nws", None)]);
        let coordinator = FetchCoordinator::new(cache, FetchTiming::default());

        /// Never resolves; the shutdown branch must win.
        struct HangingProvider;

        #[async_trait]
        impl ProviderFetch for HangingProvider {
            fn id(&self) -> &str {
                "nws"
            }
            async fn fetch(
                &self,
                _window: TimeWindow,
            ) -> std::result::Result<SourceSnapshot, ProviderError> {
                std::future::pending().await
            }
        }

        let (tx, mut rx) = watch::channel(());
        let provider: Arc<dyn ProviderFetch> = Arc::new(HangingProvider);
        let providers = [provider];
        let acquire = coordinator.acquire(&providers, window(), 100_000, &mut rx);
        tokio::pin!(acquire);

        // Let the task start, then signal shutdown.
        let send = async {
            tokio::task::yield_now().await;
            let _ = tx.send(());
            std::future::pending::<Result<HashMap<ProviderId, SourceSnapshot>>>().await
        };

        let result = tokio::select! {
            r = &mut acquire => r,
            r = send => r,
        };
        assert!(matches!(result, Err(FetchError::Aborted)));
    }
}
