//! Process-wide cache registry and warm-up scheduling.
//!
//! [`CacheManager`] owns one slot per corpus and hides the warm-up guard
//! behind accessors. The lifecycle per corpus is
//! `not_started → warming → warmed`; the transition into `warming` is a
//! locked check-and-set, so two concurrent callers can never both launch a
//! build. A caller that loses the race serves from whatever is currently
//! published (possibly an empty list) instead of blocking.
//!
//! A failed build releases the guard on every exit path — the slot drops
//! back to `not_started` and a later call retries. Invalidation bumps a
//! per-slot generation, so a build already in flight discards its stale
//! result instead of resurrecting the old cache. Warm-up is launched
//! fire-and-forget at server boot and re-triggered (a no-op when already
//! warming or warmed) on the first search request as a safety net.

use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use crate::cache::CacheEntry;

/// Warm-up lifecycle of one corpus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmState {
    NotStarted,
    Warming,
    Warmed,
}

impl WarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmState::NotStarted => "not_started",
            WarmState::Warming => "warming",
            WarmState::Warmed => "warmed",
        }
    }
}

/// Guarded slot state. The generation bumps on every invalidation, so a
/// build that started before an invalidation can tell its result is stale
/// and must not be published.
struct SlotState {
    state: WarmState,
    generation: u64,
}

struct CorpusSlot {
    state: Mutex<SlotState>,
    /// Published cache. Readers clone the `Arc`; a rebuild swaps in a brand
    /// new list so nobody ever sees a partially-built one.
    entries: RwLock<Arc<Vec<CacheEntry>>>,
}

impl CorpusSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                state: WarmState::NotStarted,
                generation: 0,
            }),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

/// Shared, per-process registry of embedding caches, one slot per corpus.
pub struct CacheManager {
    slots: HashMap<String, CorpusSlot>,
}

impl CacheManager {
    /// Create a manager with one empty slot per configured corpus.
    pub fn new(corpora: &[String]) -> Self {
        let slots = corpora
            .iter()
            .map(|c| (c.clone(), CorpusSlot::new()))
            .collect();
        Self { slots }
    }

    fn slot(&self, corpus: &str) -> Option<&CorpusSlot> {
        self.slots.get(corpus)
    }

    /// The currently published cache for a corpus (empty until warmed).
    pub fn current(&self, corpus: &str) -> Arc<Vec<CacheEntry>> {
        match self.slot(corpus) {
            Some(slot) => slot.entries.read().expect("cache lock poisoned").clone(),
            None => Arc::new(Vec::new()),
        }
    }

    /// Warm-up state of a corpus slot, for `cache status` output.
    pub fn state(&self, corpus: &str) -> WarmState {
        match self.slot(corpus) {
            Some(slot) => slot.state.lock().expect("warm state lock poisoned").state,
            None => WarmState::NotStarted,
        }
    }

    /// Ensure the corpus cache is warm, running `build` at most once.
    ///
    /// Returns `Ok(true)` when this call performed the build, `Ok(false)`
    /// when the slot was already warming or warmed (nothing to do), and
    /// `Err` when the build ran and failed — in which case the guard has
    /// already been released so a later call retries.
    pub async fn ensure_warm<F, Fut>(&self, corpus: &str, build: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Vec<CacheEntry>>>>,
    {
        let slot = match self.slot(corpus) {
            Some(slot) => slot,
            None => anyhow::bail!("Unknown corpus: {}", corpus),
        };

        // Check-and-set under the lock: exactly one caller wins the
        // not_started → warming transition. The generation snapshot lets
        // the winner detect an invalidation that happened mid-build.
        let generation = {
            let mut guard = slot.state.lock().expect("warm state lock poisoned");
            match guard.state {
                WarmState::Warming | WarmState::Warmed => return Ok(false),
                WarmState::NotStarted => {
                    guard.state = WarmState::Warming;
                    guard.generation
                }
            }
        };

        match build().await {
            Ok(entries) => {
                let mut guard = slot.state.lock().expect("warm state lock poisoned");
                if guard.generation != generation {
                    // Invalidated while building; the result is stale and
                    // must not be published. The invalidation already reset
                    // the state, so nothing to release here.
                    return Ok(false);
                }
                {
                    let mut published = slot.entries.write().expect("cache lock poisoned");
                    *published = entries;
                }
                guard.state = WarmState::Warmed;
                Ok(true)
            }
            Err(e) => {
                // Release the guard so the failure cannot wedge the slot in
                // `warming` forever. After an invalidation the slot is no
                // longer ours to reset.
                let mut guard = slot.state.lock().expect("warm state lock poisoned");
                if guard.generation == generation {
                    guard.state = WarmState::NotStarted;
                }
                Err(e)
            }
        }
    }

    /// Drop the in-memory cache and reset the slot to `not_started`.
    ///
    /// Used after a corpus re-harvest; the next warm-up rebuilds from
    /// scratch. Publishes an empty list so readers in flight keep a
    /// coherent (if stale-free) view.
    pub fn invalidate(&self, corpus: &str) {
        if let Some(slot) = self.slot(corpus) {
            let mut guard = slot.state.lock().expect("warm state lock poisoned");
            // The bump tells any in-flight build its result is stale.
            guard.generation += 1;
            guard.state = WarmState::NotStarted;
            let mut published = slot.entries.write().expect("cache lock poisoned");
            *published = Arc::new(Vec::new());
        }
    }

    /// All corpora known to this manager.
    pub fn corpora(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(&["gazette".to_string()]))
    }

    fn entries(n: usize) -> Arc<Vec<CacheEntry>> {
        Arc::new(
            (0..n)
                .map(|i| CacheEntry {
                    id: i as i64,
                    title: None,
                    published_at: None,
                    reference: None,
                    source_url: None,
                    vector: vec![1.0, 0.0],
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_warmup_builds_exactly_once() {
        let mgr = manager();
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                let _ = mgr
                    .ensure_warm("gazette", || {
                        let builds = builds.clone();
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(entries(3))
                        }
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state("gazette"), WarmState::Warmed);
        assert_eq!(mgr.current("gazette").len(), 3);
    }

    #[tokio::test]
    async fn test_caller_during_warming_serves_current_cache() {
        let mgr = manager();

        // Winner holds the slot in `warming`.
        let winner = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.ensure_warm("gazette", || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(entries(2))
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.state("gazette"), WarmState::Warming);

        // A loser neither blocks nor builds; it sees the (empty) cache.
        let ran = mgr
            .ensure_warm("gazette", || async { Ok(entries(99)) })
            .await
            .unwrap();
        assert!(!ran);
        assert!(mgr.current("gazette").is_empty());

        assert!(winner.await.unwrap().unwrap());
        assert_eq!(mgr.current("gazette").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_releases_guard_for_retry() {
        let mgr = manager();

        let err = mgr
            .ensure_warm("gazette", || async { anyhow::bail!("store unreachable") })
            .await;
        assert!(err.is_err());
        assert_eq!(mgr.state("gazette"), WarmState::NotStarted);
        assert!(mgr.current("gazette").is_empty());

        // The retry path is open.
        let ran = mgr
            .ensure_warm("gazette", || async { Ok(entries(1)) })
            .await
            .unwrap();
        assert!(ran);
        assert_eq!(mgr.state("gazette"), WarmState::Warmed);
    }

    #[tokio::test]
    async fn test_warm_is_idempotent_until_invalidated() {
        let mgr = manager();

        assert!(mgr
            .ensure_warm("gazette", || async { Ok(entries(5)) })
            .await
            .unwrap());

        let first = mgr.current("gazette");
        assert!(!mgr
            .ensure_warm("gazette", || async { Ok(entries(7)) })
            .await
            .unwrap());
        // Same published reference, not a rebuild.
        assert!(Arc::ptr_eq(&first, &mgr.current("gazette")));

        mgr.invalidate("gazette");
        assert_eq!(mgr.state("gazette"), WarmState::NotStarted);
        assert!(mgr.current("gazette").is_empty());

        assert!(mgr
            .ensure_warm("gazette", || async { Ok(entries(7)) })
            .await
            .unwrap());
        assert_eq!(mgr.current("gazette").len(), 7);
    }

    #[tokio::test]
    async fn test_invalidate_during_build_discards_stale_entries() {
        let mgr = manager();

        // The build is slow enough for an invalidation to land mid-flight.
        let winner = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.ensure_warm("gazette", || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(entries(5))
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.state("gazette"), WarmState::Warming);
        mgr.invalidate("gazette");

        // The build finishes but must not publish its pre-invalidation
        // result or flip the slot back to warmed.
        assert!(!winner.await.unwrap().unwrap());
        assert_eq!(mgr.state("gazette"), WarmState::NotStarted);
        assert!(mgr.current("gazette").is_empty());

        // The slot is free for a fresh build.
        assert!(mgr
            .ensure_warm("gazette", || async { Ok(entries(2)) })
            .await
            .unwrap());
        assert_eq!(mgr.current("gazette").len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_corpus_is_an_error() {
        let mgr = manager();
        let res = mgr.ensure_warm("rulings", || async { Ok(entries(1)) }).await;
        assert!(res.is_err());
    }
}
