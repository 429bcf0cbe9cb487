//! Fingerprint-keyed result cache with single-flight population
//!
//! Entries live in a moka cache (LRU eviction, per-entry expiry). A miss
//! goes through a per-fingerprint flight registry: the first caller spawns
//! the computation, callers arriving while it runs await the same shared
//! future, and the registry slot is released by the computation itself once
//! it settles.

use crate::entry::{CacheDraft, CacheEntry, CacheSummary, EntryCell, Origin};
use crate::error::{CacheError, FlightLabel};
use crate::store::CacheStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use scriptgate_model::{ExecutionResult, Fingerprint, Language};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache sizing and expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Capacity bound in entries
    pub max_entries: u64,
    /// TTL used by [`ResultCache::get_or_create`]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Entry snapshot
    pub entry: CacheEntry,
    /// How the entry was obtained
    pub origin: Origin,
}

/// Counters reported by [`ResultCache::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries (approximate until maintenance runs)
    pub entries: u64,
    /// Lookups served from an existing entry
    pub hits: u64,
    /// Lookups that ran the factory
    pub misses: u64,
    /// Lookups that joined another caller's flight
    pub coalesced: u64,
    /// Entries dropped by expiry or capacity
    pub evictions: u64,
    /// Flights currently running
    pub in_flight: u64,
}

impl CacheStats {
    /// Fraction of lookups that did not generate
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = (self.hits + self.coalesced) as f64 / total as f64;
            rate
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

/// Expiry driven by each entry's own deadline
struct EntryExpiry;

impl Expiry<Fingerprint, Arc<EntryCell>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Arc<EntryCell>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining())
    }
}

/// What a settled flight yields
#[derive(Debug, Clone)]
struct Landed {
    cell: Arc<EntryCell>,
    /// Found in the cache on the re-check, so no factory ran
    from_cache: bool,
}

type Flight<E> = Shared<BoxFuture<'static, Result<Landed, CacheError<E>>>>;

struct Inner<E> {
    entries: Cache<Fingerprint, Arc<EntryCell>>,
    inflight: DashMap<Fingerprint, Flight<E>>,
    store: Option<Arc<dyn CacheStore>>,
    counters: Arc<Counters>,
    config: CacheConfig,
}

/// Fingerprint-keyed cache of scanned scripts
///
/// `E` is the error type of the factories passed to
/// [`get_or_create`](Self::get_or_create). Cloning is cheap and clones share
/// the same entries and flights.
pub struct ResultCache<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ResultCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for ResultCache<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.entry_count())
            .field("in_flight", &self.inner.inflight.len())
            .field("persistent", &self.inner.store.is_some())
            .finish()
    }
}

impl<E> ResultCache<E>
where
    E: Send + Sync + 'static,
{
    /// Memory-only cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache backed by `store`, warmed with its unexpired entries
    ///
    /// # Errors
    /// Returns [`CacheError::Unavailable`] if the store cannot be read
    pub async fn open(config: CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, CacheError<E>> {
        let stored = store.load_all()?;
        let cache = Self::build(config, Some(Arc::clone(&store)));
        let now = chrono::Utc::now();
        let mut warmed = 0usize;
        for entry in stored {
            if entry.is_expired_at(now) || !entry.scan.is_passed() {
                if let Err(err) = store.remove(&entry.fingerprint) {
                    tracing::warn!(%err, "could not drop stale cache record");
                }
                continue;
            }
            let fingerprint = entry.fingerprint;
            cache
                .inner
                .entries
                .insert(fingerprint, Arc::new(EntryCell::from_entry(entry)))
                .await;
            warmed += 1;
        }
        tracing::info!(warmed, "result cache opened");
        Ok(cache)
    }

    fn build(config: CacheConfig, store: Option<Arc<dyn CacheStore>>) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);
        let listener_store = store.clone();

        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .eviction_listener(move |key: Arc<Fingerprint>, _value, cause: RemovalCause| {
                if !cause.was_evicted() {
                    return;
                }
                listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("scriptgate_cache_evictions_total").increment(1);
                tracing::debug!(fingerprint = %key.short(), ?cause, "cache entry evicted");
                if let Some(store) = &listener_store {
                    if let Err(err) = store.remove(&key) {
                        tracing::warn!(%err, "could not drop evicted cache record");
                    }
                }
            })
            .build();

        Self {
            inner: Arc::new(Inner {
                entries,
                inflight: DashMap::new(),
                store,
                counters,
                config,
            }),
        }
    }

    /// Cache configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Entry for `fingerprint`, running `factory` on a miss
    ///
    /// Uses the configured default TTL.
    ///
    /// # Errors
    /// Returns the factory's error (shared by every coalesced caller) or
    /// [`CacheError::FlightAborted`] if the computation panicked
    pub async fn get_or_create<F, Fut>(&self, fingerprint: Fingerprint, factory: F) -> Result<Lookup, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CacheDraft, E>> + Send + 'static,
    {
        self.get_or_create_with_ttl(fingerprint, self.inner.config.default_ttl, factory)
            .await
    }

    /// Like [`get_or_create`](Self::get_or_create) with an explicit TTL
    ///
    /// At most one factory runs per fingerprint at a time. A draft whose
    /// scan did not pass is handed back to the callers but never stored.
    ///
    /// # Errors
    /// See [`get_or_create`](Self::get_or_create)
    pub async fn get_or_create_with_ttl<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        ttl: Duration,
        factory: F,
    ) -> Result<Lookup, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CacheDraft, E>> + Send + 'static,
    {
        if let Some(cell) = self.inner.entries.get(&fingerprint).await {
            return Ok(self.hit(&cell, Origin::Cached));
        }

        let (flight, leader) = match self.inner.inflight.entry(fingerprint) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let flight = self.launch(fingerprint, ttl, factory);
                vacant.insert(flight.clone());
                (flight, true)
            }
        };

        let landed = flight.await.map_err(|err| {
            tracing::debug!(fingerprint = %fingerprint.short(), outcome = %FlightLabel(&err), "flight failed");
            err
        })?;
        let origin = match (landed.from_cache, leader) {
            (true, _) => Origin::Cached,
            (false, true) => Origin::Generated,
            (false, false) => Origin::Coalesced,
        };
        Ok(self.hit(&landed.cell, origin))
    }

    /// Spawn the computation behind a new flight
    fn launch<F, Fut>(&self, fingerprint: Fingerprint, ttl: Duration, factory: F) -> Flight<E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CacheDraft, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = compute(&inner, fingerprint, ttl, factory).await;
            // released on every path, even if all callers went away
            inner.inflight.remove(&fingerprint);
            outcome
        });
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join) => Err(CacheError::FlightAborted(join.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    fn hit(&self, cell: &Arc<EntryCell>, origin: Origin) -> Lookup {
        let counter = match origin {
            Origin::Cached => &self.inner.counters.hits,
            Origin::Generated => &self.inner.counters.misses,
            Origin::Coalesced => &self.inner.counters.coalesced,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("scriptgate_cache_lookups_total", "origin" => origin.as_str()).increment(1);
        cell.touch();
        Lookup {
            entry: cell.snapshot(),
            origin,
        }
    }

    /// Entry for `fingerprint`, if present and unexpired
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let cell = self.inner.entries.get(fingerprint).await?;
        Some(self.hit(&cell, Origin::Cached).entry)
    }

    /// Entry detail without counting a lookup
    pub async fn inspect(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.inner
            .entries
            .get(fingerprint)
            .await
            .map(|cell| cell.snapshot())
    }

    /// Remove `fingerprint`; returns whether an entry was removed
    ///
    /// Removing a missing entry is a no-op. Callers already holding a
    /// snapshot of the entry are unaffected.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.inner.entries.remove(fingerprint).await.is_some();
        if let Some(store) = &self.inner.store {
            if let Err(err) = store.remove(fingerprint) {
                tracing::warn!(%err, "could not remove cache record");
            }
        }
        removed
    }

    /// Remove every entry; returns how many were live
    pub async fn clear(&self) -> usize {
        let count = self.inner.entries.iter().count();
        self.inner.entries.invalidate_all();
        self.inner.entries.run_pending_tasks().await;
        if let Some(store) = &self.inner.store {
            if let Err(err) = store.clear() {
                tracing::warn!(%err, "could not clear cache store");
            }
        }
        count
    }

    /// Record the latest execution of a cached script
    ///
    /// Returns false if the entry is gone.
    pub async fn attach_execution(&self, fingerprint: &Fingerprint, result: ExecutionResult) -> bool {
        let Some(cell) = self.inner.entries.get(fingerprint).await else {
            return false;
        };
        cell.record_execution(result);
        self.persist(&cell);
        true
    }

    /// Cached scripts, oldest first
    #[must_use]
    pub fn list(&self, language: Option<Language>) -> Vec<CacheSummary> {
        let mut rows: Vec<_> = self
            .inner
            .entries
            .iter()
            .filter(|(_, cell)| language.map_or(true, |l| cell.language() == l))
            .filter(|(_, cell)| cell.remaining() > Duration::ZERO)
            .map(|(_, cell)| (cell.created_at(), cell.snapshot().summary()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.script_id.cmp(&b.1.script_id)));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Counters and live size
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            entries: self.inner.entries.entry_count(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            in_flight: self.inner.inflight.len() as u64,
        }
    }

    /// Apply pending expiry and eviction work now
    pub async fn run_maintenance(&self) {
        self.inner.entries.run_pending_tasks().await;
    }

    fn persist(&self, cell: &EntryCell) {
        if let Some(store) = &self.inner.store {
            persist_to(store.as_ref(), cell);
        }
    }
}

fn persist_to(store: &dyn CacheStore, cell: &EntryCell) {
    if let Err(err) = store.put(&cell.snapshot()) {
        // the in-memory entry stays authoritative
        tracing::warn!(%err, "cache write-through failed");
    }
}

async fn compute<E, F, Fut>(
    inner: &Inner<E>,
    fingerprint: Fingerprint,
    ttl: Duration,
    factory: F,
) -> Result<Landed, CacheError<E>>
where
    E: Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<CacheDraft, E>> + Send + 'static,
{
    // a previous flight may have landed between the caller's miss and now
    if let Some(cell) = inner.entries.get(&fingerprint).await {
        return Ok(Landed {
            cell,
            from_cache: true,
        });
    }

    let draft = factory().await.map_err(|e| CacheError::Factory(Arc::new(e)))?;
    let cell = Arc::new(EntryCell::from_draft(fingerprint, draft, ttl));
    if cell.is_admitted() {
        inner.entries.insert(fingerprint, Arc::clone(&cell)).await;
        if let Some(store) = &inner.store {
            persist_to(store.as_ref(), &cell);
        }
    } else {
        tracing::debug!(fingerprint = %fingerprint.short(), "draft not admitted; not cached");
    }
    Ok(Landed {
        cell,
        from_cache: false,
    })
}
