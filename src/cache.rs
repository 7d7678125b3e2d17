//! Two-tier mail cache with single-flight fetching.
//!
//! [`MailCache`] fronts a [`MailProvider`] with:
//!
//! - a **hot** tier (default 30s) answering normal reads,
//! - a **stale** tier (default 300s) served only when the provider fails,
//! - one shared in-flight fetch per address, so concurrent callers for the
//!   same address trigger a single upstream call.
//!
//! Provider failures never surface from [`MailCache::get_or_fetch`]: the
//! caller gets the stale payload or an empty list, and the failure is logged
//! and counted in [`CacheStats`].
//!
//! # Example
//!
//! ```
//! use tempmail_sync::{MailCache, CacheConfig};
//! use tempmail_sync::provider::FnProvider;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let provider = FnProvider::new("empty", |_| async { Ok(Vec::new()) });
//! let cache = MailCache::new(Arc::new(provider), CacheConfig::default());
//!
//! let lookup = cache.get_or_fetch("me@example.com", false).await;
//! assert!(!lookup.from_cache());
//!
//! let lookup = cache.get_or_fetch("me@example.com", false).await;
//! assert!(lookup.from_cache());
//! # }
//! ```

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::model::MailRecord;
use crate::provider::MailProvider;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

type FetchOutcome = Result<Arc<Vec<MailRecord>>, Arc<FetchError>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache tier of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Short-lived tier for the normal read path.
    Hot,
    /// Long-lived tier used as a fallback.
    Stale,
}

/// A cached fetch result for one address.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Arc<Vec<MailRecord>>,
    cached_at: Instant,
    tier: CacheTier,
}

impl CacheEntry {
    fn new(payload: Arc<Vec<MailRecord>>, cached_at: Instant, tier: CacheTier) -> Self {
        Self {
            payload,
            cached_at,
            tier,
        }
    }

    /// The cached mails.
    #[must_use]
    pub fn payload(&self) -> &[MailRecord] {
        &self.payload
    }

    /// When the entry was written.
    #[must_use]
    pub fn cached_at(&self) -> Instant {
        self.cached_at
    }

    /// Which tier holds the entry.
    #[must_use]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    /// An entry is valid only while `now - cached_at < ttl`.
    #[must_use]
    pub fn is_valid(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.cached_at) < ttl
    }
}

/// Where a lookup's mails came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// Unexpired hot-tier entry.
    Hot,
    /// Result of another caller's in-flight fetch.
    Coalesced,
    /// This caller's own upstream fetch.
    Upstream,
    /// Stale-tier fallback after a provider failure.
    Stale,
    /// Nothing usable; the provider failed and no stale entry was valid.
    Empty,
}

/// Result of [`MailCache::get_or_fetch`].
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The mails, in provider order.
    pub mails: Vec<MailRecord>,
    /// Where they came from.
    pub source: LookupSource,
}

impl CacheLookup {
    fn new(mails: &[MailRecord], source: LookupSource) -> Self {
        Self {
            mails: mails.to_vec(),
            source,
        }
    }

    /// Returns `true` unless the mails come from this caller's own fetch
    /// (or nothing usable was available).
    #[must_use]
    pub fn from_cache(&self) -> bool {
        matches!(
            self.source,
            LookupSource::Hot | LookupSource::Coalesced | LookupSource::Stale
        )
    }
}

/// Snapshot of cache state and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Addresses holding a valid stale-tier entry.
    pub cached_addresses: usize,
    /// Addresses with an upstream fetch still running.
    pub in_flight: usize,
    /// Configured hot TTL.
    pub hot_ttl: Duration,
    /// Configured stale TTL.
    pub stale_ttl: Duration,
    /// Lookups answered from the hot tier.
    pub hot_hits: u64,
    /// Lookups that joined another caller's fetch.
    pub coalesced: u64,
    /// Successful upstream fetches.
    pub upstream_fetches: u64,
    /// Failed upstream fetches.
    pub upstream_failures: u64,
    /// Lookups answered from the stale tier after a failure.
    pub stale_served: u64,
    /// Lookups answered with nothing after a failure or a stalled fetch.
    pub empty_served: u64,
    /// Lookups that gave up waiting on another caller's fetch.
    pub coalesce_timeouts: u64,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hot_hits: AtomicU64,
    coalesced: AtomicU64,
    upstream_fetches: AtomicU64,
    upstream_failures: AtomicU64,
    stale_served: AtomicU64,
    empty_served: AtomicU64,
    coalesce_timeouts: AtomicU64,
}

impl CacheMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct InFlight {
    generation: u64,
    future: SharedFetch,
    completed_at: Option<Instant>,
}

impl InFlight {
    /// Pending fetches are always joinable; completed ones only within the grace period.
    fn is_joinable(&self, now: Instant, grace: Duration, pending_only: bool) -> bool {
        match self.completed_at {
            None => true,
            Some(_) if pending_only => false,
            Some(done) => now.saturating_duration_since(done) < grace,
        }
    }
}

#[derive(Default)]
struct AddressSlot {
    hot: Option<CacheEntry>,
    stale: Option<CacheEntry>,
    in_flight: Option<InFlight>,
}

type Slot = Arc<Mutex<AddressSlot>>;

struct CacheInner {
    provider: Arc<dyn MailProvider>,
    config: CacheConfig,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    metrics: CacheMetrics,
}

enum Plan {
    Join(SharedFetch),
    Lead(SharedFetch),
}

/// Two-tier TTL cache with per-address single-flight fetching.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct MailCache {
    inner: Arc<CacheInner>,
}

impl MailCache {
    /// Creates a cache in front of `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn MailProvider>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                provider,
                config,
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Returns the mails for `address`, fetching at most once per address at a time.
    ///
    /// 1. Unless `force_refresh`, an unexpired hot entry is returned directly.
    /// 2. If another caller's fetch is running, this caller waits for it, up to
    ///    `coalesce_wait`. A fetch that completed less than `release_grace` ago
    ///    is still joinable (except with `force_refresh`).
    /// 3. Otherwise this caller starts the fetch. Success refreshes both tiers.
    ///
    /// A provider failure, or a joined fetch outliving `coalesce_wait`, yields
    /// the stale payload if it is still valid and an empty list otherwise.
    #[instrument(name = "MailCache::get_or_fetch", skip(self))]
    pub async fn get_or_fetch(&self, address: &str, force_refresh: bool) -> CacheLookup {
        let config = &self.inner.config;
        let metrics = &self.inner.metrics;
        let slot = self.inner.slot(address);

        let plan = {
            let mut guard = lock(&slot);
            let now = Instant::now();

            if !force_refresh {
                if let Some(entry) = guard.hot.as_ref().filter(|e| e.is_valid(now, config.hot_ttl)) {
                    CacheMetrics::bump(&metrics.hot_hits);
                    debug!(count = entry.payload.len(), "Hot cache hit");
                    return CacheLookup::new(entry.payload(), LookupSource::Hot);
                }
            }

            match guard.in_flight.as_ref() {
                Some(in_flight)
                    if in_flight.is_joinable(now, config.release_grace, force_refresh) =>
                {
                    Plan::Join(in_flight.future.clone())
                }
                _ => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn_fetch(address, &slot, generation);
                    guard.in_flight = Some(InFlight {
                        generation,
                        future: future.clone(),
                        completed_at: None,
                    });
                    Plan::Lead(future)
                }
            }
        };

        match plan {
            Plan::Lead(future) => match future.await {
                Ok(mails) => CacheLookup::new(&mails, LookupSource::Upstream),
                Err(e) => self.degraded(address, &slot, &e.to_string()),
            },
            Plan::Join(future) => {
                CacheMetrics::bump(&metrics.coalesced);
                debug!("Joining in-flight fetch");
                match tokio::time::timeout(config.coalesce_wait, future).await {
                    Ok(Ok(mails)) => CacheLookup::new(&mails, LookupSource::Coalesced),
                    Ok(Err(e)) => self.degraded(address, &slot, &e.to_string()),
                    Err(_) => {
                        CacheMetrics::bump(&metrics.coalesce_timeouts);
                        warn!(
                            wait_ms = u64::try_from(config.coalesce_wait.as_millis()).unwrap_or(u64::MAX),
                            "In-flight fetch did not finish in time"
                        );
                        self.degraded(address, &slot, "in-flight fetch stalled")
                    }
                }
            }
        }
    }

    /// Removes both tier entries for `address` and detaches any running fetch,
    /// whose result will then not be written back.
    #[instrument(name = "MailCache::invalidate", skip(self))]
    pub fn invalidate(&self, address: &str) {
        let removed = lock(&self.inner.slots).remove(address);
        if let Some(slot) = removed {
            let mut guard = lock(&slot);
            guard.hot = None;
            guard.stale = None;
            guard.in_flight = None;
            debug!("Cache entries invalidated");
        }
    }

    /// Returns the current entry of `tier` for `address`, valid or not.
    #[must_use]
    pub fn entry(&self, address: &str, tier: CacheTier) -> Option<CacheEntry> {
        let slot = lock(&self.inner.slots).get(address).cloned()?;
        let guard = lock(&slot);
        match tier {
            CacheTier::Hot => guard.hot.clone(),
            CacheTier::Stale => guard.stale.clone(),
        }
    }

    /// Drops addresses whose stale entry expired and that have no fetch running.
    ///
    /// Returns the number of addresses removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let stale_ttl = self.inner.config.stale_ttl;
        let grace = self.inner.config.release_grace;

        let mut slots = lock(&self.inner.slots);
        let before = slots.len();
        slots.retain(|_, slot| {
            let guard = lock(slot);
            let fresh = guard
                .stale
                .as_ref()
                .is_some_and(|entry| entry.is_valid(now, stale_ttl));
            let busy = guard
                .in_flight
                .as_ref()
                .is_some_and(|f| f.is_joinable(now, grace, false));
            fresh || busy
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, "Purged expired cache slots");
        }
        removed
    }

    /// Returns a snapshot of cache state and counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let config = &self.inner.config;
        let metrics = &self.inner.metrics;

        let (cached_addresses, in_flight) = lock(&self.inner.slots).values().fold(
            (0, 0),
            |(cached, running), slot| {
                let guard = lock(slot);
                let cached_here = guard
                    .stale
                    .as_ref()
                    .is_some_and(|e| e.is_valid(now, config.stale_ttl));
                let running_here = guard
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.completed_at.is_none());
                (
                    cached + usize::from(cached_here),
                    running + usize::from(running_here),
                )
            },
        );

        CacheStats {
            cached_addresses,
            in_flight,
            hot_ttl: config.hot_ttl,
            stale_ttl: config.stale_ttl,
            hot_hits: metrics.hot_hits.load(Ordering::Relaxed),
            coalesced: metrics.coalesced.load(Ordering::Relaxed),
            upstream_fetches: metrics.upstream_fetches.load(Ordering::Relaxed),
            upstream_failures: metrics.upstream_failures.load(Ordering::Relaxed),
            stale_served: metrics.stale_served.load(Ordering::Relaxed),
            empty_served: metrics.empty_served.load(Ordering::Relaxed),
            coalesce_timeouts: metrics.coalesce_timeouts.load(Ordering::Relaxed),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts the upstream fetch on its own task so it completes (and fills
    /// the cache) even if every waiting caller goes away.
    fn spawn_fetch(&self, address: &str, slot: &Slot, generation: u64) -> SharedFetch {
        let inner = Arc::clone(&self.inner);
        let task_slot = Arc::clone(slot);
        let task_address = address.to_string();

        let task = tokio::spawn(async move {
            let outcome = inner.provider.fetch(&task_address).await;
            inner.complete(&task_address, &task_slot, generation, outcome)
        });

        let inner = Arc::clone(&self.inner);
        let join_slot = Arc::clone(slot);
        let join_address = address.to_string();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = FetchError::Aborted {
                        message: join_error.to_string(),
                    };
                    inner.complete(&join_address, &join_slot, generation, Err(error))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn degraded(&self, address: &str, slot: &Slot, reason: &str) -> CacheLookup {
        let now = Instant::now();
        let metrics = &self.inner.metrics;
        let guard = lock(slot);

        if let Some(entry) = guard
            .stale
            .as_ref()
            .filter(|e| e.is_valid(now, self.inner.config.stale_ttl))
        {
            CacheMetrics::bump(&metrics.stale_served);
            warn!(
                address,
                reason,
                count = entry.payload.len(),
                "Serving stale cache entry"
            );
            return CacheLookup::new(entry.payload(), LookupSource::Stale);
        }

        CacheMetrics::bump(&metrics.empty_served);
        error!(address, reason, "No usable cache entry, returning empty mail list");
        CacheLookup::new(&[], LookupSource::Empty)
    }
}

impl CacheInner {
    fn slot(&self, address: &str) -> Slot {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(address.to_string()).or_default())
    }

    /// Records a finished fetch and schedules release of its in-flight marker.
    fn complete(
        self: &Arc<Self>,
        address: &str,
        slot: &Slot,
        generation: u64,
        outcome: Result<Vec<MailRecord>, FetchError>,
    ) -> FetchOutcome {
        let now = Instant::now();
        let outcome = outcome.map(Arc::new).map_err(Arc::new);

        {
            let mut guard = lock(slot);
            let current = guard
                .in_flight
                .as_ref()
                .is_some_and(|f| f.generation == generation);

            match &outcome {
                Ok(mails) => {
                    CacheMetrics::bump(&self.metrics.upstream_fetches);
                    debug!(address, count = mails.len(), "Upstream fetch completed");
                    if current {
                        guard.hot = Some(CacheEntry::new(Arc::clone(mails), now, CacheTier::Hot));
                        guard.stale =
                            Some(CacheEntry::new(Arc::clone(mails), now, CacheTier::Stale));
                    }
                }
                Err(e) => {
                    CacheMetrics::bump(&self.metrics.upstream_failures);
                    warn!(address, error = %e, retryable = e.is_retryable(), "Upstream fetch failed");
                }
            }

            if let Some(in_flight) = guard.in_flight.as_mut().filter(|_| current) {
                in_flight.completed_at = Some(now);
            }
        }

        let grace = self.config.release_grace;
        let release_slot = Arc::clone(slot);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut guard = lock(&release_slot);
            if guard
                .in_flight
                .as_ref()
                .is_some_and(|f| f.generation == generation)
            {
                guard.in_flight = None;
            }
        });

        outcome
    }
}

impl std::fmt::Debug for MailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCache")
            .field("provider", &self.inner.provider.name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
