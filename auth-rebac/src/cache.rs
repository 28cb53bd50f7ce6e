//! L1 in-memory permission cache.
//!
//! Bounded LRU of per-check results with revision-quantized keys, tiered
//! TTLs by relation class, ±20 % TTL jitter, XFetch probabilistic early
//! refresh, and secondary indexes giving O(index hits) targeted
//! invalidation. The cache is advisory: it never surfaces errors.

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::repository::TupleStore;

/// Identity of one cached check. The revision bucket is part of the key, so
/// a bucket change is a natural miss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub subject_type: String,
    pub subject_id: String,
    pub permission: String,
    pub object_type: String,
    pub object_id: String,
    pub zone_id: String,
    pub revision_bucket: u64,
}

impl CacheKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subject_type: &str,
        subject_id: &str,
        permission: &str,
        object_type: &str,
        object_id: &str,
        zone_id: &str,
        revision_bucket: u64,
    ) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            permission: permission.to_string(),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            zone_id: zone_id.to_string(),
            revision_bucket,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: bool,
    created_at: Instant,
    /// TTL after jitter.
    ttl: Duration,
    /// Observed compute latency in seconds, consumed by XFetch.
    delta: f64,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl
    }
}

/// Invalidation strategy. `Targeted` maintains secondary indexes and
/// removes exactly the affected keys; `ZoneWide` is the legacy fallback
/// that wipes the whole zone instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
    Targeted,
    ZoneWide,
}

/// Tiered TTLs by relation class. Grants through stable relations live
/// longer; denials turn over fastest.
#[derive(Debug, Clone)]
pub struct TieredTtl {
    pub owner: Duration,
    pub editor: Duration,
    pub viewer: Duration,
    pub inherited: Duration,
    pub denial: Duration,
}

impl Default for TieredTtl {
    fn default() -> Self {
        Self {
            owner: Duration::from_secs(3600),
            editor: Duration::from_secs(600),
            viewer: Duration::from_secs(600),
            inherited: Duration::from_secs(300),
            denial: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionCacheConfig {
    pub max_size: usize,
    pub base_ttl: Duration,
    pub tiered_ttl: TieredTtl,
    /// Uniform jitter applied to stored TTLs, as a fraction (0.2 = ±20 %).
    pub jitter_ratio: f64,
    /// XFetch aggressiveness; 1.0 per the VLDB 2015 recommendation.
    pub xfetch_beta: f64,
    /// Age fraction past which zero-delta entries report "refresh".
    pub refresh_ahead_factor: f64,
    pub invalidation_mode: InvalidationMode,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100_000,
            base_ttl: Duration::from_secs(300),
            tiered_ttl: TieredTtl::default(),
            jitter_ratio: 0.2,
            xfetch_beta: 1.0,
            refresh_ahead_factor: 0.7,
            invalidation_mode: InvalidationMode::Targeted,
        }
    }
}

type SubjectIndexKey = (String, String, String);
type ObjectIndexKey = (String, String, String);
type PrefixIndexKey = (String, String, String);

/// Everything guarded by one lock: the LRU and its secondary indexes move
/// together.
struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    /// (zone, subject_type, subject_id) -> keys.
    subject_index: AHashMap<SubjectIndexKey, AHashSet<CacheKey>>,
    /// (zone, object_type, object_id) -> keys.
    object_index: AHashMap<ObjectIndexKey, AHashSet<CacheKey>>,
    /// (zone, object_type, ancestor_path) -> keys, for hierarchical ids.
    path_prefix_index: AHashMap<PrefixIndexKey, AHashSet<CacheKey>>,
    /// Keys with a compute in flight (single-flight coalescing).
    in_flight: AHashSet<CacheKey>,
}

impl CacheState {
    fn unindex(&mut self, key: &CacheKey) {
        let subject_key = (
            key.zone_id.clone(),
            key.subject_type.clone(),
            key.subject_id.clone(),
        );
        if let Some(keys) = self.subject_index.get_mut(&subject_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.subject_index.remove(&subject_key);
            }
        }

        let object_key = (
            key.zone_id.clone(),
            key.object_type.clone(),
            key.object_id.clone(),
        );
        if let Some(keys) = self.object_index.get_mut(&object_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.object_index.remove(&object_key);
            }
        }

        for ancestor in ancestor_prefixes(&key.object_id) {
            let prefix_key = (key.zone_id.clone(), key.object_type.clone(), ancestor);
            if let Some(keys) = self.path_prefix_index.get_mut(&prefix_key) {
                keys.remove(key);
                if keys.is_empty() {
                    self.path_prefix_index.remove(&prefix_key);
                }
            }
        }
    }

    fn index(&mut self, key: &CacheKey) {
        self.subject_index
            .entry((
                key.zone_id.clone(),
                key.subject_type.clone(),
                key.subject_id.clone(),
            ))
            .or_default()
            .insert(key.clone());
        self.object_index
            .entry((
                key.zone_id.clone(),
                key.object_type.clone(),
                key.object_id.clone(),
            ))
            .or_default()
            .insert(key.clone());
        for ancestor in ancestor_prefixes(&key.object_id) {
            self.path_prefix_index
                .entry((key.zone_id.clone(), key.object_type.clone(), ancestor))
                .or_default()
                .insert(key.clone());
        }
    }

    fn remove_keys(&mut self, keys: Vec<CacheKey>, targeted: bool) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.entries.pop(&key).is_some() {
                removed += 1;
            }
            if targeted {
                self.unindex(&key);
            }
        }
        removed
    }
}

/// Ancestor directory prefixes of a hierarchical id: `/a/b/c.txt` indexes
/// under `/a` and `/a/b`. Flat ids produce nothing.
fn ancestor_prefixes(object_id: &str) -> Vec<String> {
    if !object_id.starts_with('/') {
        return Vec::new();
    }
    let mut prefixes = Vec::new();
    let trimmed = object_id.trim_end_matches('/');
    let mut end = 0usize;
    for (idx, ch) in trimmed.char_indices().skip(1) {
        if ch == '/' {
            end = idx;
            prefixes.push(trimmed[..end].to_string());
        }
    }
    prefixes
}

/// Counters kept outside the state lock.
#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    xfetch_early_refreshes: AtomicU64,
    targeted_invalidations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub xfetch_early_refreshes: u64,
    pub targeted_invalidations: u64,
    pub current_size: usize,
    pub subject_index_size: usize,
    pub object_index_size: usize,
    pub path_prefix_index_size: usize,
}

/// The L1 permission cache.
pub struct PermissionCache {
    state: Mutex<CacheState>,
    config: PermissionCacheConfig,
    metrics: CacheMetrics,
}

/// Outcome of a cached lookup: the stored result plus the XFetch verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLookup {
    pub result: bool,
    /// The entry is technically valid but the caller should recompute now
    /// to spread refreshes across the expiry window.
    pub needs_refresh: bool,
}

impl PermissionCache {
    pub fn new(config: PermissionCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                subject_index: AHashMap::new(),
                object_index: AHashMap::new(),
                path_prefix_index: AHashMap::new(),
                in_flight: AHashSet::new(),
            }),
            config,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn config(&self) -> &PermissionCacheConfig {
        &self.config
    }

    /// Plain lookup; expired entries count as misses and are dropped.
    pub fn get(&self, key: &CacheKey) -> Option<bool> {
        self.lookup(key).map(|l| l.result)
    }

    /// Lookup with the XFetch early-refresh verdict.
    pub fn get_with_refresh(&self, key: &CacheKey) -> Option<CacheLookup> {
        self.lookup(key)
    }

    fn lookup(&self, key: &CacheKey) -> Option<CacheLookup> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(key) else {
            drop(state);
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) {
            state.entries.pop(key);
            let targeted = self.config.invalidation_mode == InvalidationMode::Targeted;
            if targeted {
                state.unindex(key);
            }
            drop(state);
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let lookup = CacheLookup {
            result: entry.result,
            needs_refresh: self.should_refresh_xfetch(entry, now),
        };
        drop(state);

        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        if lookup.needs_refresh {
            self.metrics
                .xfetch_early_refreshes
                .fetch_add(1, Ordering::Relaxed);
            trace!(?key, "xfetch early refresh");
        }
        Some(lookup)
    }

    /// XFetch (VLDB 2015): refresh when `delta * beta * -ln(rand)` reaches
    /// the remaining TTL. Entries without an observed delta fall back to an
    /// age threshold.
    fn should_refresh_xfetch(&self, entry: &CacheEntry, now: Instant) -> bool {
        let remaining = entry.ttl.as_secs_f64() - entry.age(now).as_secs_f64();
        if remaining <= 0.0 {
            return true;
        }
        if entry.delta > 0.0 {
            let draw: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
            entry.delta * self.config.xfetch_beta * (-draw.ln()) >= remaining
        } else {
            entry.age(now).as_secs_f64()
                >= self.config.refresh_ahead_factor * entry.ttl.as_secs_f64()
        }
    }

    /// Store a result. The TTL tier comes from the relation that produced
    /// the grant (denials and inherited grants have their own tiers), then
    /// jitter is applied.
    pub fn set(&self, key: CacheKey, result: bool, relation: Option<&str>, is_inherited: bool, delta: f64) {
        let ttl = self.ttl_for(relation, !result, is_inherited);
        let ttl = jittered(ttl, self.config.jitter_ratio);
        let entry = CacheEntry {
            result,
            created_at: Instant::now(),
            ttl,
            delta,
        };

        let targeted = self.config.invalidation_mode == InvalidationMode::Targeted;
        let mut state = self.state.lock();
        if let Some((evicted_key, _)) = state.entries.push(key.clone(), entry) {
            // `push` hands back either the LRU victim or the replaced entry
            // under the same key; only a real eviction needs unindexing.
            if targeted && evicted_key != key {
                state.unindex(&evicted_key);
            }
        }
        if targeted {
            state.index(&key);
        }
        drop(state);
        self.metrics.sets.fetch_add(1, Ordering::Relaxed);
    }

    fn ttl_for(&self, relation: Option<&str>, is_denial: bool, is_inherited: bool) -> Duration {
        let tiers = &self.config.tiered_ttl;
        if is_denial {
            return tiers.denial;
        }
        if is_inherited {
            return tiers.inherited;
        }
        let Some(relation) = relation else {
            return self.config.base_ttl;
        };
        let lowered = relation.to_ascii_lowercase();
        if ["owner", "admin", "manage"].iter().any(|k| lowered.contains(k)) {
            tiers.owner
        } else if ["editor", "write", "contributor"].iter().any(|k| lowered.contains(k)) {
            tiers.editor
        } else if ["viewer", "read"].iter().any(|k| lowered.contains(k)) {
            tiers.viewer
        } else {
            self.config.base_ttl
        }
    }

    // ------------------------------------------------------------------
    // Single-flight coalescing
    // ------------------------------------------------------------------

    /// Claim the compute for a key. `false` means another caller is already
    /// computing it; the loser computes too but skips the cache write.
    pub fn try_acquire_compute(&self, key: &CacheKey) -> bool {
        self.state.lock().in_flight.insert(key.clone())
    }

    /// Publish a computed result and release the claim.
    pub fn release_compute(
        &self,
        key: CacheKey,
        result: bool,
        relation: Option<&str>,
        is_inherited: bool,
        delta: f64,
    ) {
        self.state.lock().in_flight.remove(&key);
        self.set(key, result, relation, is_inherited, delta);
    }

    /// Drop a claim without publishing (compute failed).
    pub fn abandon_compute(&self, key: &CacheKey) {
        self.state.lock().in_flight.remove(key);
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    pub fn invalidate_subject(&self, subject_type: &str, subject_id: &str, zone_id: &str) -> usize {
        if self.config.invalidation_mode == InvalidationMode::ZoneWide {
            return self.clear_zone(zone_id);
        }
        let mut state = self.state.lock();
        let index_key = (
            zone_id.to_string(),
            subject_type.to_string(),
            subject_id.to_string(),
        );
        let keys: Vec<CacheKey> = state
            .subject_index
            .get(&index_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let removed = state.remove_keys(keys, true);
        drop(state);
        self.note_invalidation(removed);
        removed
    }

    pub fn invalidate_object(&self, object_type: &str, object_id: &str, zone_id: &str) -> usize {
        if self.config.invalidation_mode == InvalidationMode::ZoneWide {
            return self.clear_zone(zone_id);
        }
        let mut state = self.state.lock();
        let index_key = (
            zone_id.to_string(),
            object_type.to_string(),
            object_id.to_string(),
        );
        let keys: Vec<CacheKey> = state
            .object_index
            .get(&index_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let removed = state.remove_keys(keys, true);
        drop(state);
        self.note_invalidation(removed);
        removed
    }

    /// Invalidate everything cached under a hierarchical prefix: entries
    /// for the prefix itself and for all ids beneath it.
    pub fn invalidate_object_prefix(&self, object_type: &str, prefix: &str, zone_id: &str) -> usize {
        if self.config.invalidation_mode == InvalidationMode::ZoneWide {
            return self.clear_zone(zone_id);
        }
        let normalized = if prefix.len() > 1 {
            prefix.trim_end_matches('/')
        } else {
            prefix
        };

        let mut state = self.state.lock();
        let mut keys: AHashSet<CacheKey> = state
            .path_prefix_index
            .get(&(
                zone_id.to_string(),
                object_type.to_string(),
                normalized.to_string(),
            ))
            .cloned()
            .unwrap_or_default();
        // The prefix itself may be a cached object id.
        if let Some(direct) = state.object_index.get(&(
            zone_id.to_string(),
            object_type.to_string(),
            normalized.to_string(),
        )) {
            keys.extend(direct.iter().cloned());
        }
        let removed = state.remove_keys(keys.into_iter().collect(), true);
        drop(state);
        self.note_invalidation(removed);
        removed
    }

    /// Invalidate every permission cached for one (subject, object) pair.
    #[allow(clippy::too_many_arguments)]
    pub fn invalidate_pair(
        &self,
        subject_type: &str,
        subject_id: &str,
        object_type: &str,
        object_id: &str,
        zone_id: &str,
    ) -> usize {
        if self.config.invalidation_mode == InvalidationMode::ZoneWide {
            return self.clear_zone(zone_id);
        }
        let mut state = self.state.lock();
        let subject_key = (
            zone_id.to_string(),
            subject_type.to_string(),
            subject_id.to_string(),
        );
        let keys: Vec<CacheKey> = state
            .subject_index
            .get(&subject_key)
            .map(|set| {
                set.iter()
                    .filter(|k| k.object_type == object_type && k.object_id == object_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let removed = state.remove_keys(keys, true);
        drop(state);
        self.note_invalidation(removed);
        removed
    }

    pub fn clear_zone(&self, zone_id: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.zone_id == zone_id)
            .map(|(k, _)| k.clone())
            .collect();
        let targeted = self.config.invalidation_mode == InvalidationMode::Targeted;
        let removed = state.remove_keys(keys, targeted);
        drop(state);
        if removed > 0 {
            debug!(zone_id, removed, "zone cache cleared");
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.subject_index.clear();
        state.object_index.clear();
        state.path_prefix_index.clear();
        state.in_flight.clear();
    }

    fn note_invalidation(&self, removed: usize) {
        if removed > 0 {
            self.metrics
                .targeted_invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            sets: self.metrics.sets.load(Ordering::Relaxed),
            xfetch_early_refreshes: self
                .metrics
                .xfetch_early_refreshes
                .load(Ordering::Relaxed),
            targeted_invalidations: self
                .metrics
                .targeted_invalidations
                .load(Ordering::Relaxed),
            current_size: state.entries.len(),
            subject_index_size: state.subject_index.len(),
            object_index_size: state.object_index.len(),
            path_prefix_index_size: state.path_prefix_index.len(),
        }
    }

    pub fn reset_stats(&self) {
        self.metrics.hits.store(0, Ordering::Relaxed);
        self.metrics.misses.store(0, Ordering::Relaxed);
        self.metrics.sets.store(0, Ordering::Relaxed);
        self.metrics.xfetch_early_refreshes.store(0, Ordering::Relaxed);
        self.metrics.targeted_invalidations.store(0, Ordering::Relaxed);
    }
}

/// Apply ± `ratio` uniform jitter to a TTL.
fn jittered(ttl: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return ttl;
    }
    let factor = 1.0 - ratio + rand::random::<f64>() * 2.0 * ratio;
    Duration::from_secs_f64((ttl.as_secs_f64() * factor).max(0.001))
}

// ---------------------------------------------------------------------------
// Revision tracking
// ---------------------------------------------------------------------------

/// Short-TTL cached view of per-zone revisions, so cache lookups do not pay
/// a storage round-trip. Buckets are `revision / quantization_window`.
pub struct RevisionTracker {
    store: Arc<dyn TupleStore>,
    cached: DashMap<String, (u64, Instant)>,
    ttl: Duration,
    quantization_window: u64,
    enabled: bool,
}

impl RevisionTracker {
    pub fn new(store: Arc<dyn TupleStore>) -> Self {
        Self {
            store,
            cached: DashMap::new(),
            ttl: Duration::from_secs(5),
            quantization_window: 10,
            enabled: true,
        }
    }

    pub fn with_window(mut self, quantization_window: u64, enabled: bool) -> Self {
        self.quantization_window = quantization_window.max(1);
        self.enabled = enabled;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn bucket_of(&self, revision: u64) -> u64 {
        if self.enabled {
            revision / self.quantization_window
        } else {
            0
        }
    }

    /// Current bucket for a zone. Storage faults degrade to bucket 0 (the
    /// cache is advisory, never an error source).
    pub async fn bucket(&self, zone_id: &str) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.bucket_of(self.revision(zone_id).await)
    }

    pub async fn revision(&self, zone_id: &str) -> u64 {
        let now = Instant::now();
        if let Some(cached) = self.cached.get(zone_id) {
            let (revision, fetched_at) = *cached;
            if now.duration_since(fetched_at) < self.ttl {
                return revision;
            }
        }
        match self.store.zone_revision(zone_id).await {
            Ok(revision) => {
                self.cached
                    .insert(zone_id.to_string(), (revision, now));
                revision
            }
            Err(error) => {
                warn!(%zone_id, %error, "revision read failed; degrading to bucket 0");
                0
            }
        }
    }

    /// Drop the cached view after a write so the writer's next read sees
    /// the new revision (read-your-writes).
    pub fn forget(&self, zone_id: &str) {
        self.cached.remove(zone_id);
    }
}

/// Seed a revision into the tracker's local view. Test hook.
#[cfg(test)]
impl RevisionTracker {
    fn seed(&self, zone_id: &str, revision: u64) {
        self.cached
            .insert(zone_id.to_string(), (revision, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, TupleWrite, DEFAULT_ZONE};
    use crate::repository::MemoryTupleStore;

    fn key(subject_id: &str, permission: &str, object_id: &str) -> CacheKey {
        CacheKey::new("agent", subject_id, permission, "file", object_id, DEFAULT_ZONE, 0)
    }

    fn cache() -> PermissionCache {
        PermissionCache::new(PermissionCacheConfig {
            max_size: 100,
            base_ttl: Duration::from_secs(60),
            ..Default::default()
        })
    }

    #[test]
    fn basic_get_set() {
        let cache = cache();
        assert_eq!(cache.get(&key("alice", "read", "/doc.txt")), None);

        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        assert_eq!(cache.get(&key("alice", "read", "/doc.txt")), Some(true));
        assert_eq!(cache.get(&key("alice", "write", "/doc.txt")), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PermissionCache::new(PermissionCacheConfig {
            max_size: 100,
            base_ttl: Duration::from_millis(20),
            jitter_ratio: 0.0,
            ..Default::default()
        });
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        assert_eq!(cache.get(&key("alice", "read", "/doc.txt")), Some(true));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&key("alice", "read", "/doc.txt")), None);
    }

    #[test]
    fn zone_isolation_in_keys() {
        let cache = cache();
        let mut z1 = key("alice", "read", "/doc.txt");
        z1.zone_id = "zone1".to_string();
        let mut z2 = key("alice", "read", "/doc.txt");
        z2.zone_id = "zone2".to_string();

        cache.set(z1.clone(), true, None, false, 0.0);
        cache.set(z2.clone(), false, None, false, 0.0);

        assert_eq!(cache.get(&z1), Some(true));
        assert_eq!(cache.get(&z2), Some(false));
    }

    #[test]
    fn revision_bucket_is_part_of_the_key() {
        let cache = cache();
        let mut bucket2 = key("alice", "read", "/doc.txt");
        bucket2.revision_bucket = 2;
        cache.set(bucket2.clone(), true, None, false, 0.0);

        assert_eq!(cache.get(&bucket2), Some(true));

        let mut bucket3 = bucket2.clone();
        bucket3.revision_bucket = 3;
        assert_eq!(cache.get(&bucket3), None);
    }

    #[test]
    fn invalidate_subject_removes_only_their_entries() {
        let cache = cache();
        cache.set(key("alice", "read", "/doc1.txt"), true, None, false, 0.0);
        cache.set(key("alice", "write", "/doc2.txt"), true, None, false, 0.0);
        cache.set(key("bob", "read", "/doc3.txt"), true, None, false, 0.0);

        let removed = cache.invalidate_subject("agent", "alice", DEFAULT_ZONE);
        assert_eq!(removed, 2);

        assert_eq!(cache.get(&key("alice", "read", "/doc1.txt")), None);
        assert_eq!(cache.get(&key("alice", "write", "/doc2.txt")), None);
        assert_eq!(cache.get(&key("bob", "read", "/doc3.txt")), Some(true));

        let stats = cache.stats();
        assert_eq!(stats.targeted_invalidations, 2);
        // Index entry for alice is cleaned up.
        assert_eq!(stats.subject_index_size, 1);
    }

    #[test]
    fn invalidate_object_removes_every_subjects_entries() {
        let cache = cache();
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        cache.set(key("bob", "write", "/doc.txt"), true, None, false, 0.0);
        cache.set(key("alice", "read", "/other.txt"), false, None, false, 0.0);

        let removed = cache.invalidate_object("file", "/doc.txt", DEFAULT_ZONE);
        assert_eq!(removed, 2);
        assert_eq!(cache.get(&key("alice", "read", "/other.txt")), Some(false));
    }

    #[test]
    fn invalidate_pair_is_precise() {
        let cache = cache();
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        cache.set(key("alice", "write", "/doc.txt"), true, None, false, 0.0);
        cache.set(key("alice", "read", "/other.txt"), true, None, false, 0.0);
        cache.set(key("bob", "read", "/doc.txt"), true, None, false, 0.0);

        let removed = cache.invalidate_pair("agent", "alice", "file", "/doc.txt", DEFAULT_ZONE);
        assert_eq!(removed, 2);
        assert_eq!(cache.get(&key("alice", "read", "/other.txt")), Some(true));
        assert_eq!(cache.get(&key("bob", "read", "/doc.txt")), Some(true));
    }

    #[test]
    fn invalidate_prefix_covers_the_subtree() {
        let cache = cache();
        cache.set(key("alice", "read", "/workspace/project/a.txt"), true, None, false, 0.0);
        cache.set(key("bob", "write", "/workspace/project/b.txt"), true, None, false, 0.0);
        cache.set(key("alice", "read", "/workspace/other/c.txt"), true, None, false, 0.0);
        cache.set(key("alice", "read", "/home/d.txt"), true, None, false, 0.0);

        let removed = cache.invalidate_object_prefix("file", "/workspace/project", DEFAULT_ZONE);
        assert_eq!(removed, 2);

        assert_eq!(cache.get(&key("alice", "read", "/workspace/project/a.txt")), None);
        assert_eq!(cache.get(&key("bob", "write", "/workspace/project/b.txt")), None);
        assert_eq!(cache.get(&key("alice", "read", "/workspace/other/c.txt")), Some(true));
        assert_eq!(cache.get(&key("alice", "read", "/home/d.txt")), Some(true));
    }

    #[test]
    fn deep_hierarchy_indexes_every_ancestor() {
        let cache = cache();
        let deep = "/workspace/project/src/utils/helpers/common.py";
        cache.set(key("alice", "read", deep), true, None, false, 0.0);

        assert_eq!(
            ancestor_prefixes(deep),
            vec![
                "/workspace",
                "/workspace/project",
                "/workspace/project/src",
                "/workspace/project/src/utils",
                "/workspace/project/src/utils/helpers",
            ]
        );

        let removed = cache.invalidate_object_prefix("file", "/workspace", DEFAULT_ZONE);
        assert_eq!(removed, 1);
        assert_eq!(cache.get(&key("alice", "read", deep)), None);
    }

    #[test]
    fn zone_wide_mode_skips_indexes_and_wipes_the_zone() {
        let cache = PermissionCache::new(PermissionCacheConfig {
            max_size: 100,
            invalidation_mode: InvalidationMode::ZoneWide,
            ..Default::default()
        });
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        cache.set(key("bob", "read", "/other.txt"), true, None, false, 0.0);

        let stats = cache.stats();
        assert_eq!(stats.subject_index_size, 0);
        assert_eq!(stats.object_index_size, 0);

        let removed = cache.invalidate_subject("agent", "alice", DEFAULT_ZONE);
        assert_eq!(removed, 2, "zone-wide mode wipes the whole zone");
    }

    #[test]
    fn clear_drops_entries_and_indexes() {
        let cache = cache();
        cache.set(key("alice", "read", "/doc1.txt"), true, None, false, 0.0);
        cache.set(key("bob", "write", "/doc2.txt"), false, None, false, 0.0);
        assert_eq!(cache.stats().current_size, 2);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.subject_index_size, 0);
        assert_eq!(stats.object_index_size, 0);
        assert_eq!(stats.path_prefix_index_size, 0);
    }

    #[test]
    fn lru_eviction_unindexes_the_victim() {
        let cache = PermissionCache::new(PermissionCacheConfig {
            max_size: 2,
            ..Default::default()
        });
        cache.set(key("a", "read", "/1"), true, None, false, 0.0);
        cache.set(key("b", "read", "/2"), true, None, false, 0.0);
        cache.set(key("c", "read", "/3"), true, None, false, 0.0);

        let stats = cache.stats();
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.subject_index_size, 2);
        assert_eq!(cache.get(&key("a", "read", "/1")), None);
    }

    #[test]
    fn tiered_ttl_selection() {
        let cache = cache();
        let tiers = TieredTtl::default();

        assert_eq!(cache.ttl_for(Some("owner"), false, false), tiers.owner);
        assert_eq!(cache.ttl_for(Some("direct_owner"), false, false), tiers.owner);
        assert_eq!(cache.ttl_for(Some("admin"), false, false), tiers.owner);
        assert_eq!(cache.ttl_for(Some("editor"), false, false), tiers.editor);
        assert_eq!(cache.ttl_for(Some("write"), false, false), tiers.editor);
        assert_eq!(cache.ttl_for(Some("viewer"), false, false), tiers.viewer);
        assert_eq!(cache.ttl_for(Some("can_read"), false, false), tiers.viewer);
        assert_eq!(cache.ttl_for(Some("owner"), false, true), tiers.inherited);
        assert_eq!(cache.ttl_for(Some("anything"), true, false), tiers.denial);
        assert_eq!(
            cache.ttl_for(Some("custom_relation"), false, false),
            cache.config.base_ttl
        );
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let ttl = Duration::from_secs(3600);
        for _ in 0..200 {
            let jittered = jittered(ttl, 0.2);
            assert!(jittered >= Duration::from_secs(2880));
            assert!(jittered <= Duration::from_secs(4320));
        }
    }

    #[test]
    fn xfetch_fresh_entries_rarely_refresh() {
        let cache = PermissionCache::new(PermissionCacheConfig {
            max_size: 100,
            base_ttl: Duration::from_secs(300),
            jitter_ratio: 0.0,
            ..Default::default()
        });
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.01);

        let mut refreshes = 0;
        for _ in 0..1000 {
            let lookup = cache.get_with_refresh(&key("alice", "read", "/doc.txt")).unwrap();
            if lookup.needs_refresh {
                refreshes += 1;
            }
        }
        assert!(
            (refreshes as f64) / 1000.0 < 0.05,
            "fresh entry refresh rate too high: {refreshes}/1000"
        );
    }

    #[test]
    fn xfetch_larger_delta_refreshes_earlier() {
        let config = PermissionCacheConfig {
            base_ttl: Duration::from_secs(60),
            jitter_ratio: 0.0,
            ..Default::default()
        };
        let cache = PermissionCache::new(config);

        // Entries near expiry: 2 seconds remaining out of 60.
        let near_expiry = |delta: f64| CacheEntry {
            result: true,
            created_at: Instant::now() - Duration::from_secs(58),
            ttl: Duration::from_secs(60),
            delta,
        };

        let now = Instant::now();
        let mut small = 0;
        let mut large = 0;
        for _ in 0..1000 {
            if cache.should_refresh_xfetch(&near_expiry(0.5), now) {
                small += 1;
            }
            if cache.should_refresh_xfetch(&near_expiry(5.0), now) {
                large += 1;
            }
        }
        assert!(large > small, "delta=5 ({large}) should refresh more than delta=0.5 ({small})");
    }

    #[test]
    fn xfetch_zero_delta_uses_refresh_ahead_threshold() {
        let cache = PermissionCache::new(PermissionCacheConfig {
            refresh_ahead_factor: 0.7,
            jitter_ratio: 0.0,
            ..Default::default()
        });
        let now = Instant::now();

        let young = CacheEntry {
            result: true,
            created_at: now - Duration::from_secs(30),
            ttl: Duration::from_secs(60),
            delta: 0.0,
        };
        assert!(!cache.should_refresh_xfetch(&young, now));

        let old = CacheEntry {
            result: true,
            created_at: now - Duration::from_secs(45),
            ttl: Duration::from_secs(60),
            delta: 0.0,
        };
        assert!(cache.should_refresh_xfetch(&old, now));
    }

    #[test]
    fn single_flight_claims_and_releases() {
        let cache = cache();
        let k = key("alice", "read", "/doc.txt");

        assert!(cache.try_acquire_compute(&k));
        assert!(!cache.try_acquire_compute(&k), "second claim loses");

        cache.release_compute(k.clone(), true, Some("direct_viewer"), false, 0.1);
        assert_eq!(cache.get(&k), Some(true));
        assert!(cache.try_acquire_compute(&k), "claim free again after release");
        cache.abandon_compute(&k);
        assert!(cache.try_acquire_compute(&k));
    }

    #[test]
    fn stats_track_hits_misses_sets() {
        let cache = cache();
        cache.get(&key("alice", "read", "/doc.txt"));
        cache.set(key("alice", "read", "/doc.txt"), true, None, false, 0.0);
        cache.get(&key("alice", "read", "/doc.txt"));
        cache.get(&key("alice", "read", "/doc.txt"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        // Entries survive a stats reset.
        assert_eq!(cache.get(&key("alice", "read", "/doc.txt")), Some(true));
    }

    #[tokio::test]
    async fn revision_tracker_buckets_and_read_your_writes() {
        let store = Arc::new(MemoryTupleStore::new());
        let tracker = RevisionTracker::new(store.clone()).with_window(10, true);

        for (revision, expected) in [(0u64, 0u64), (9, 0), (10, 1), (19, 1), (20, 2), (99, 9), (100, 10)] {
            assert_eq!(tracker.bucket_of(revision), expected, "revision {revision}");
        }

        assert_eq!(tracker.bucket(DEFAULT_ZONE).await, 0);

        // Writes bump the stored revision, but the tracker's cached view
        // hides it until forgotten.
        tracker.seed(DEFAULT_ZONE, 25);
        assert_eq!(tracker.bucket(DEFAULT_ZONE).await, 2);

        for i in 0..30 {
            store
                .insert(TupleWrite::new(
                    Entity::user("alice"),
                    "direct_viewer",
                    Entity::file(&format!("/f{i}")),
                    DEFAULT_ZONE,
                ))
                .await
                .unwrap();
        }
        assert_eq!(tracker.bucket(DEFAULT_ZONE).await, 2, "cached view still serves");

        tracker.forget(DEFAULT_ZONE);
        assert_eq!(tracker.bucket(DEFAULT_ZONE).await, 3, "fresh read after forget");
    }

    #[tokio::test]
    async fn disabled_quantization_pins_bucket_zero() {
        let store = Arc::new(MemoryTupleStore::new());
        let tracker = RevisionTracker::new(store).with_window(10, false);
        tracker.seed("z1", 999);
        assert_eq!(tracker.bucket("z1").await, 0);
    }
}
