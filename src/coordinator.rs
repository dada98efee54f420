//! Cache Coordinator - Two-Tier Read-Through Cache
//!
//! Orchestrates the per-process local tier and the shared store behind one
//! `get`/`set`/`invalidate` surface: read-through population, stampede-safe
//! compute-on-miss, stale-while-revalidate, tag and pattern invalidation,
//! and cross-process eviction broadcast.
//!
//! Shared-tier read failures are fail-open (a miss, logged); write failures
//! raise. Cross-process coherence is best-effort: a process that misses a
//! broadcast serves its local copy for at most the entry's remaining TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{InMemoryBackend, StoreBackend};
use crate::codec::{CodecConfig, PayloadCodec};
use crate::error::{Error, Result};
use crate::invalidation::{self, InvalidationMessage};
use crate::local::{LocalConfig, LocalTier};
use crate::metrics::{CacheMetrics, CacheStats, LatencyTracker};

/// Slack added to a tag index TTL so the index outlives every entry it references
const TAG_TTL_SLACK: Duration = Duration::from_secs(60);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key namespace; prefixes every shared-tier key and the broadcast channel
    pub namespace: String,
    /// TTL applied when a call does not specify one
    pub default_ttl: Duration,
    /// Hard ceiling on any entry TTL
    pub max_ttl: Duration,
    /// TTL of the stampede lock; bounds how long a crashed owner blocks a key
    pub lock_ttl: Duration,
    /// How long a waiting caller polls for another owner's result
    pub wait_timeout: Duration,
    /// Delay between polls while waiting on another owner
    pub poll_interval: Duration,
    /// Keys per page during keyspace scans and bulk deletes
    pub scan_page_size: usize,
    /// Interval of the periodic stats report; `None` or zero disables it
    pub report_interval: Option<Duration>,
    /// Local tier configuration
    pub local: LocalConfig,
    /// Payload codec configuration
    pub codec: CodecConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "cache".to_string(),
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86_400),
            lock_ttl: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            scan_page_size: 100,
            report_interval: Some(Duration::from_secs(60)),
            local: LocalConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

/// Per-call options for `get`/`set`/`get_or_set`
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Entry TTL; falls back to the configured default, clamped to the maximum
    pub ttl: Option<Duration>,
    /// Tags indexing this entry for group invalidation
    pub tags: Vec<String>,
    /// Compress the payload regardless of size
    pub compress: bool,
    /// Bypass the local tier for this call
    pub skip_local: bool,
    /// Bypass the shared tier for this call
    pub skip_shared: bool,
    /// How long past expiry a stale copy stays eligible for serve-then-refresh
    pub stale_while_revalidate: Option<Duration>,
}

/// One entry of a bulk [`CacheCoordinator::warm`] prefill.
///
/// Values arrive as interchange JSON so one call can mix payload shapes.
#[derive(Debug, Clone)]
pub struct WarmEntry {
    /// Cache key
    pub key: String,
    /// Value to store
    pub value: serde_json::Value,
    /// Write options applied to this entry
    pub options: CacheOptions,
}

/// Stored form of an entry: the tag list travels with the payload so a
/// read-through populate carries the writer's tags, not the reader's.
#[derive(Serialize)]
struct StoredEntryRef<'a, T> {
    tags: &'a [String],
    value: &'a T,
}

#[derive(Deserialize)]
struct StoredEntry<T> {
    tags: Vec<String>,
    value: T,
}

/// Unified cache coordinator.
///
/// Every field is a shared handle; cloning yields another handle to the
/// same engine, which is how background refresh tasks borrow it.
#[derive(Clone)]
pub struct CacheCoordinator {
    /// Local in-process tier
    local: Arc<LocalTier>,
    /// Shared store
    store: Arc<dyn StoreBackend>,
    /// Payload codec
    codec: PayloadCodec,
    /// Configuration
    config: CacheConfig,
    /// Metrics collector
    metrics: Arc<CacheMetrics>,
    /// Identity stamped on broadcasts so this process skips its own
    origin: Uuid,
    /// Broadcast channel name, derived from the namespace
    channel: String,
    /// Per-key gates deduplicating same-process computations
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Signals background tasks to stop
    shutdown: CancellationToken,
    /// Background task handles joined on shutdown
    tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl CacheCoordinator {
    /// Create a new coordinator with default configuration
    pub async fn new(store: Arc<dyn StoreBackend>) -> Result<Self> {
        Self::with_config(CacheConfig::default(), store).await
    }

    /// Create a new coordinator with custom configuration.
    ///
    /// Subscribes to the invalidation broadcast channel and starts the
    /// periodic stats reporter; fails if the subscription cannot be opened.
    pub async fn with_config(config: CacheConfig, store: Arc<dyn StoreBackend>) -> Result<Self> {
        let channel = invalidation::channel_for(&config.namespace);
        let feed = store.subscribe(&channel).await?;

        let origin = Uuid::new_v4();
        let local = Arc::new(LocalTier::with_config(config.local.clone()));
        let metrics = Arc::new(CacheMetrics::new());
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(invalidation::run_listener(
            feed,
            Arc::clone(&local),
            origin,
            shutdown.clone(),
        )));
        if let Some(period) = config.report_interval.filter(|p| !p.is_zero()) {
            tasks.push(tokio::spawn(report_loop(
                Arc::clone(&metrics),
                Arc::clone(&local),
                period,
                shutdown.clone(),
            )));
        }

        info!(namespace = %config.namespace, %origin, "cache coordinator started");

        Ok(Self {
            local,
            store,
            codec: PayloadCodec::new(config.codec.clone()),
            config,
            metrics,
            origin,
            channel,
            in_flight: Arc::new(DashMap::new()),
            shutdown,
            tasks: Arc::new(parking_lot::Mutex::new(tasks)),
        })
    }

    /// Create a coordinator over an in-memory store (for tests and
    /// single-process use)
    pub async fn in_memory() -> Result<Self> {
        Self::new(Arc::new(InMemoryBackend::new())).await
    }

    /// Get a value, consulting the local tier first and then the shared
    /// tier, populating the local tier on a shared hit.
    ///
    /// Never computes and never raises: unreachable stores and unreadable
    /// payloads read as misses.
    #[instrument(skip(self, options))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        let tracker = LatencyTracker::start();
        let value = self.read_tiers(key, options).await;
        self.metrics.record_read_latency(tracker.elapsed());
        value
    }

    async fn read_tiers<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> Option<T> {
        if !options.skip_local {
            match self.local.get(key) {
                Some(plain) => match self.codec.deserialize::<StoredEntry<T>>(&plain) {
                    Ok(entry) => {
                        self.metrics.record_local_hit();
                        return Some(entry.value);
                    }
                    Err(e) => {
                        self.metrics.record_decode_failure();
                        self.metrics.record_local_miss();
                        warn!(key, error = %e, "local payload unreadable, treating as miss");
                    }
                },
                None => self.metrics.record_local_miss(),
            }
        }

        if options.skip_shared {
            return None;
        }

        let entry_key = self.entry_key(key);
        let sealed = match self.store.get(&entry_key).await {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                self.metrics.record_shared_miss();
                return None;
            }
            Err(e) => {
                // fail open: an unreachable shared tier reads as a miss
                self.metrics.record_read_error();
                self.metrics.record_shared_miss();
                warn!(key, error = %e, "shared tier read failed, treating as miss");
                return None;
            }
        };

        let (plain, tags, value) = match self.decode::<T>(&sealed) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.metrics.record_decode_failure();
                self.metrics.record_shared_miss();
                warn!(key, error = %e, "stored payload unreadable, treating as miss");
                return None;
            }
        };

        self.metrics.record_shared_hit();

        // carry the shared tier's remaining lifetime and the writer's tags
        // into the local copy
        if !options.skip_local {
            match self.store.remaining_ttl(&entry_key).await {
                Ok(Some(ttl)) => self.local.insert(key.to_string(), plain, ttl, &tags),
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "ttl lookup failed, skipping local populate"),
            }
        }

        Some(value)
    }

    fn decode<T: DeserializeOwned>(&self, sealed: &[u8]) -> Result<(Bytes, Vec<String>, T)> {
        let plain = self.codec.open(sealed)?;
        let entry: StoredEntry<T> = self.codec.deserialize(&plain)?;
        Ok((plain, entry.tags, entry.value))
    }

    /// Get a value or compute it on miss, with at most one computation per
    /// key in flight cluster-wide.
    ///
    /// Callers that lose the stampede lock poll until the owner's result
    /// appears or `wait_timeout` elapses, then raise
    /// [`Error::StampedeTimeout`]. The same window bounds waiting on a
    /// same-process computation. Compute failures propagate as
    /// [`Error::Compute`] with the lock released and nothing cached.
    #[instrument(skip(self, compute, options))]
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
        options: &CacheOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if let Some(value) = self.get(key, options).await {
            return Ok(value);
        }

        // serve a stale shadow immediately and refresh behind it
        if options.stale_while_revalidate.is_some() && !options.skip_shared {
            if let Some(stale) = self.read_stale::<T>(key).await {
                self.metrics.record_stale_serve();
                self.spawn_refresh(key, compute, options.clone());
                debug!(key, "serving stale value while revalidating");
                return Ok(stale);
            }
        }

        // same-process callers queue here instead of all racing for the
        // distributed lock
        let gate = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let queued = Instant::now();
        let _permit = match timeout(self.config.wait_timeout, gate.lock()).await {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.record_stampede_timeout();
                warn!(key, "timed out waiting for an in-process computation");
                return Err(Error::StampedeTimeout {
                    key: key.to_string(),
                    waited: queued.elapsed(),
                });
            }
        };
        let _cleanup = InFlightGuard {
            map: Arc::clone(&self.in_flight),
            key: key.to_string(),
        };

        // the previous gate holder may have filled the cache while we waited
        if let Some(value) = self.get(key, options).await {
            return Ok(value);
        }

        if options.skip_shared {
            // no shared tier in play, so no cluster-wide stampede to control
            return self.compute_and_cache(key, compute, options).await;
        }

        let token = Uuid::new_v4().to_string();
        let lock_key = self.lock_key(key);
        let acquired = match self
            .store
            .set_if_absent(&lock_key, Bytes::from(token.clone()), self.config.lock_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                // shared tier down: compute directly rather than failing the read
                self.metrics.record_read_error();
                warn!(key, error = %e, "stampede lock unavailable, computing without it");
                return self.compute_and_cache(key, compute, options).await;
            }
        };

        if acquired {
            self.metrics.record_lock_acquired();
            let outcome = self.compute_and_cache(key, compute, options).await;
            self.release_lock(&lock_key, &token).await;
            outcome
        } else {
            self.metrics.record_lock_wait();
            self.wait_for_owner(key, options).await
        }
    }

    /// Run the compute function and write the result through both tiers.
    /// Write-back failures are logged, not raised: the caller already has
    /// the value it asked for.
    async fn compute_and_cache<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
        options: &CacheOptions,
    ) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match compute().await {
            Ok(value) => {
                if let Err(e) = self.set(key, &value, options).await {
                    warn!(key, error = %e, "write-back after compute failed");
                }
                Ok(value)
            }
            Err(source) => Err(Error::Compute {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn release_lock(&self, lock_key: &str, token: &str) {
        match self.store.compare_and_delete(lock_key, token.as_bytes()).await {
            Ok(true) => {}
            Ok(false) => debug!(lock_key, "stampede lock already expired or reowned"),
            Err(e) => warn!(lock_key, error = %e, "stampede lock release failed"),
        }
    }

    /// Poll until another owner's result appears or the wait window closes
    async fn wait_for_owner<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> Result<T> {
        let started = Instant::now();
        let poll = self.config.poll_interval;

        let waited = timeout(self.config.wait_timeout, async {
            loop {
                sleep(poll).await;
                if let Some(value) = self.get(key, options).await {
                    return value;
                }
            }
        })
        .await;

        match waited {
            Ok(value) => Ok(value),
            Err(_) => {
                self.metrics.record_stampede_timeout();
                warn!(key, "timed out waiting for another owner's computation");
                Err(Error::StampedeTimeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    async fn read_stale<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let sealed = match self.store.get(&self.stale_key(key)).await {
            Ok(Some(sealed)) => sealed,
            Ok(None) => return None,
            Err(e) => {
                self.metrics.record_read_error();
                warn!(key, error = %e, "stale shadow read failed");
                return None;
            }
        };

        match self.decode::<T>(&sealed) {
            Ok((_, _, value)) => Some(value),
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(key, error = %e, "stale shadow unreadable");
                None
            }
        }
    }

    /// Recompute a stale key in the background, still under the cluster-wide
    /// lock so concurrent refreshers collapse to one.
    fn spawn_refresh<T, F, Fut>(&self, key: &str, compute: F, options: CacheOptions)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let coordinator = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let token = Uuid::new_v4().to_string();
            let lock_key = coordinator.lock_key(&key);
            match coordinator
                .store
                .set_if_absent(&lock_key, Bytes::from(token.clone()), coordinator.config.lock_ttl)
                .await
            {
                Ok(true) => {
                    coordinator.metrics.record_lock_acquired();
                    match compute().await {
                        Ok(value) => {
                            if let Err(e) = coordinator.set(&key, &value, &options).await {
                                warn!(key = %key, error = %e, "stale refresh write failed");
                            }
                        }
                        Err(e) => warn!(key = %key, error = %e, "stale refresh compute failed"),
                    }
                    coordinator.release_lock(&lock_key, &token).await;
                }
                Ok(false) => debug!(key = %key, "stale refresh already owned elsewhere"),
                Err(e) => warn!(key = %key, error = %e, "stale refresh lock failed"),
            }
        });
    }

    /// Write a value through both tiers and broadcast the overwrite.
    ///
    /// Shared-tier write failures raise; silently dropping a write is a
    /// correctness risk the caller must decide how to handle.
    #[instrument(skip(self, value, options))]
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> Result<()> {
        let tracker = LatencyTracker::start();
        let plain = self.codec.serialize(&StoredEntryRef {
            tags: &options.tags,
            value,
        })?;
        let ttl = self.effective_ttl(options);

        if !options.skip_shared {
            let sealed = self.codec.seal(&plain, options.compress);
            self.store.set(&self.entry_key(key), sealed.clone(), ttl).await?;
            self.index_tags(key, ttl, &options.tags).await?;
            if let Some(window) = options.stale_while_revalidate {
                self.store.set(&self.stale_key(key), sealed, ttl + window).await?;
            }
        }

        if !options.skip_local {
            self.local.insert(key.to_string(), plain, ttl, &options.tags);
        }

        if !options.skip_shared {
            self.broadcast(&InvalidationMessage::key(self.origin, key)).await;
        }

        self.metrics.record_set();
        self.metrics.record_write_latency(tracker.elapsed());
        self.refresh_gauges();
        Ok(())
    }

    /// Delete a key from both tiers and broadcast the eviction.
    /// Returns whether the key was present in either tier.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let tracker = LatencyTracker::start();

        let doomed = [self.entry_key(key), self.stale_key(key)];
        let shared_removed = self.store.delete(&doomed).await?;
        let local_removed = self.local.remove(key);

        self.broadcast(&InvalidationMessage::key(self.origin, key)).await;

        self.metrics.record_delete();
        self.metrics.record_write_latency(tracker.elapsed());
        self.refresh_gauges();
        Ok(local_removed || shared_removed > 0)
    }

    /// Delete every key carrying a tag, plus the tag index itself, from the
    /// shared tier; evict matching local entries fleet-wide via broadcast.
    /// Returns how many tagged keys were removed from the shared tier.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64> {
        let tag_key = self.tag_key(tag);
        let members = self.store.set_members(&tag_key).await?;

        let entry_keys: Vec<String> = members.iter().map(|k| self.entry_key(k)).collect();
        let mut removed = 0u64;
        for page in entry_keys.chunks(self.config.scan_page_size) {
            removed += self.store.delete(page).await?;
        }
        if removed != members.len() as u64 {
            // the index may reference entries that already expired
            debug!(tag, expected = members.len(), removed, "tag index out of step");
        }

        // stale shadows and the index itself go too, outside the reported count
        let mut leftovers: Vec<String> = members.iter().map(|k| self.stale_key(k)).collect();
        leftovers.push(tag_key);
        for page in leftovers.chunks(self.config.scan_page_size) {
            self.store.delete(page).await?;
        }

        self.local.remove_by_tag(tag);
        self.broadcast(&InvalidationMessage::tag(self.origin, tag)).await;

        self.metrics.record_invalidations(removed);
        self.refresh_gauges();
        info!(tag, removed, "tag invalidated");
        Ok(removed)
    }

    /// Delete every shared-tier key matching a glob pattern, scanning in
    /// bounded pages; evict matching local entries fleet-wide via broadcast.
    /// Returns how many keys were removed from the shared tier.
    #[instrument(skip(self))]
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64> {
        let scan_pattern = self.entry_key(pattern);
        let prefix = format!("{}:", self.config.namespace);

        let mut removed = 0u64;
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .store
                .scan(cursor, &scan_pattern, self.config.scan_page_size)
                .await?;
            if !keys.is_empty() {
                removed += self.store.delete(&keys).await?;
                let shadows: Vec<String> = keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(|bare| self.stale_key(bare))
                    .collect();
                if !shadows.is_empty() {
                    self.store.delete(&shadows).await?;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.local.remove_by_pattern(pattern);
        self.broadcast(&InvalidationMessage::pattern(self.origin, pattern)).await;

        self.metrics.record_invalidations(removed);
        self.refresh_gauges();
        info!(pattern, removed, "pattern invalidated");
        Ok(removed)
    }

    /// Empty the local tier and the entire shared-tier namespace, and
    /// broadcast a fleet-wide local clear
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let pattern = format!("{}:*", self.config.namespace);

        let mut removed = 0u64;
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .store
                .scan(cursor, &pattern, self.config.scan_page_size)
                .await?;
            if !keys.is_empty() {
                removed += self.store.delete(&keys).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.local.clear();
        self.broadcast(&InvalidationMessage::clear(self.origin)).await;

        self.metrics.record_invalidations(removed);
        self.refresh_gauges();
        info!(namespace = %self.config.namespace, removed, "cache cleared");
        Ok(())
    }

    /// Bulk prefill both tiers. Writes go through the plain write path,
    /// bypassing stampede control: there is no miss to protect against.
    #[instrument(skip(self, entries))]
    pub async fn warm(&self, entries: &[WarmEntry]) -> Result<()> {
        for entry in entries {
            self.set(&entry.key, &entry.value, &entry.options).await?;
        }
        debug!(count = entries.len(), "cache warmed");
        Ok(())
    }

    /// Snapshot engine metrics and start a fresh observation window
    pub fn stats(&self) -> CacheStats {
        self.refresh_gauges();
        self.metrics.snapshot_and_reset()
    }

    /// Check that the shared store is reachable
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Stop the stats reporter and the invalidation listener, closing the
    /// broadcast subscription. Idempotent; always invoke on process shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(namespace = %self.config.namespace, "cache coordinator stopped");
    }

    /// Get reference to the local tier
    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn effective_ttl(&self, options: &CacheOptions) -> Duration {
        options
            .ttl
            .unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl)
    }

    /// Extend each tag's member set and keep the index alive at least as
    /// long as the entry referencing it
    async fn index_tags(&self, key: &str, ttl: Duration, tags: &[String]) -> Result<()> {
        let floor = ttl + TAG_TTL_SLACK;
        for tag in tags {
            let tag_key = self.tag_key(tag);
            self.store.set_add(&tag_key, key).await?;
            match self.store.remaining_ttl(&tag_key).await? {
                Some(current) if current >= floor => {}
                _ => self.store.expire(&tag_key, floor).await?,
            }
        }
        Ok(())
    }

    /// Best-effort invalidation broadcast; delivery failures are logged
    async fn broadcast(&self, message: &InvalidationMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "invalidation message encode failed");
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.channel, &payload).await {
            warn!(kind = message.kind(), error = %e, "invalidation broadcast failed");
        }
    }

    fn refresh_gauges(&self) {
        self.metrics
            .update_local_stats(self.local.bytes(), self.local.len() as u64);
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.config.namespace, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.config.namespace, tag)
    }

    fn stale_key(&self, key: &str) -> String {
        format!("{}:stale:{}", self.config.namespace, key)
    }
}

/// Removes the in-flight gate entry when the computation ends, even on
/// early return or panic
struct InFlightGuard {
    map: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Emit one metrics window per interval until shutdown
async fn report_loop(
    metrics: Arc<CacheMetrics>,
    local: Arc<LocalTier>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("stats reporter stopped");
                return;
            }
            _ = ticker.tick() => {
                metrics.update_local_stats(local.bytes(), local.len() as u64);
                let stats = metrics.snapshot_and_reset();
                info!(
                    local_hit_ratio = stats.local_hit_ratio,
                    shared_hit_ratio = stats.shared_hit_ratio,
                    overall_hit_ratio = stats.overall_hit_ratio,
                    sets = stats.sets,
                    deletes = stats.deletes,
                    invalidations = stats.invalidations,
                    read_p99_us = stats.read_latency.p99_us,
                    local_entries = stats.local_entries,
                    "cache stats window"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
        roles: Vec<String>,
    }

    fn sample_profile() -> Profile {
        Profile {
            id: 42,
            name: "ada".to_string(),
            roles: vec!["admin".to_string(), "ops".to_string()],
        }
    }

    #[tokio::test]
    async fn test_coordinator_creation() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        assert!(cache.local().is_empty());
        assert_eq!(cache.config().namespace, "cache");
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        let profile = sample_profile();
        cache.set("user:42", &profile, &options).await.unwrap();

        let loaded: Option<Profile> = cache.get("user:42", &options).await;
        assert_eq!(loaded, Some(profile));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_miss() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let loaded: Option<String> = cache.get("absent", &CacheOptions::default()).await;
        assert!(loaded.is_none());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_hit_populates_local() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        cache.set("k", &"v".to_string(), &options).await.unwrap();
        cache.local().clear();
        assert!(!cache.local().contains("k"));

        let loaded: Option<String> = cache.get("k", &options).await;
        assert_eq!(loaded.as_deref(), Some("v"));
        assert!(cache.local().contains("k"));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_local_leaves_local_tier_untouched() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions {
            skip_local: true,
            ..Default::default()
        };

        cache.set("k", &1u32, &options).await.unwrap();
        assert!(!cache.local().contains("k"));

        let loaded: Option<u32> = cache.get("k", &options).await;
        assert_eq!(loaded, Some(1));
        assert!(!cache.local().contains("k"));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_shared_keeps_value_process_private() {
        let store = Arc::new(InMemoryBackend::new());
        let a = CacheCoordinator::new(store.clone()).await.unwrap();
        let b = CacheCoordinator::new(store).await.unwrap();
        let options = CacheOptions {
            skip_shared: true,
            ..Default::default()
        };

        a.set("k", &1u32, &options).await.unwrap();
        assert_eq!(a.get::<u32>("k", &options).await, Some(1));
        assert_eq!(b.get::<u32>("k", &CacheOptions::default()).await, None);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        cache.set("k", &"v".to_string(), &options).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.local().contains("k"));
        assert_eq!(cache.get::<String>("k", &options).await, None);

        // second delete finds nothing
        assert!(!cache.delete("k").await.unwrap());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_ttl_clamped_to_configured_maximum() {
        let store = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            max_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let cache = CacheCoordinator::with_config(config, store.clone())
            .await
            .unwrap();

        let options = CacheOptions {
            ttl: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        cache.set("k", &1u32, &options).await.unwrap();

        let remaining = store.remaining_ttl("cache:k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_or_set_computes_once_then_hits() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        let value = cache
            .get_or_set("answer", || async { Ok(41u32 + 1) }, &options)
            .await
            .unwrap();
        assert_eq!(value, 42);

        // second call is a pure cache hit
        let value: u32 = cache
            .get_or_set(
                "answer",
                || async { anyhow::bail!("must not recompute") },
                &options,
            )
            .await
            .unwrap();
        assert_eq!(value, 42);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_or_set_compute_error_caches_nothing() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        let outcome: Result<u32> = cache
            .get_or_set("fragile", || async { anyhow::bail!("upstream down") }, &options)
            .await;
        assert!(matches!(outcome, Err(Error::Compute { .. })));
        assert_eq!(cache.get::<u32>("fragile", &options).await, None);

        // the lock was released, so the next caller computes freely
        let value = cache
            .get_or_set("fragile", || async { Ok(7u32) }, &options)
            .await
            .unwrap();
        assert_eq!(value, 7);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_times_out_with_distinct_error() {
        let store = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            wait_timeout: Duration::from_millis(120),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let cache = CacheCoordinator::with_config(config, store.clone())
            .await
            .unwrap();

        // plant a foreign owner's lock so this process can only wait
        let planted = store
            .set_if_absent(
                "cache:lock:slow",
                Bytes::from_static(b"someone-else"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(planted);

        let outcome: Result<u32> = cache
            .get_or_set("slow", || async { Ok(1u32) }, &CacheOptions::default())
            .await;
        assert!(matches!(outcome, Err(Error::StampedeTimeout { .. })));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_report_three_quarter_local_hit_rate() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        let options = CacheOptions::default();

        cache.set("k", &1u32, &options).await.unwrap();
        for _ in 0..3 {
            assert_eq!(cache.get::<u32>("k", &options).await, Some(1));
        }
        assert_eq!(cache.get::<u32>("absent", &options).await, None);

        let stats = cache.stats();
        assert!((stats.local_hit_ratio - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.local_hits, 3);
        assert_eq!(stats.local_misses, 1);

        // the snapshot opened a fresh window
        assert_eq!(cache.stats().local_hits, 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cache = CacheCoordinator::in_memory().await.unwrap();
        cache.shutdown().await;
        cache.shutdown().await;
    }
}
