//! Multi-phase bulk permission evaluation.
//!
//! Phase 0 probes the L1 cache, phase 0.5 the bitmap cache, phase 1 fetches
//! every relevant tuple in a single query (synthesizing filesystem `parent`
//! edges in memory), phase 2 computes the remainder against the prefetched
//! graph with a shared memo, and phase 3 writes results back through the
//! caches. One bulk call replaces N independent checks' worth of queries.

use ahash::AHashSet;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::bitmap::{BitmapCache, BitmapKey};
use crate::cache::{CacheKey, PermissionCache, RevisionTracker};
use crate::error::Result;
use crate::graph::{self, ancestor_chain, parent_path, SharedMemo, TupleGraph};
use crate::models::{CheckItem, ConsistencyLevel, Entity};
use crate::repository::TupleStore;
use crate::schema::NamespaceRegistry;

/// Checks at or above this count run the rayon compute path; below it the
/// sequential path avoids thread-pool overhead. Both paths share the memo
/// table and produce identical results.
pub const PARALLEL_THRESHOLD: usize = 50;

/// Outcome of a bulk evaluation. `results` holds a decision for every
/// input check; `timed_out` marks that the soft deadline expired and the
/// remaining checks were denied.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub results: HashMap<CheckItem, bool>,
    pub timed_out: bool,
}

/// Multi-phase bulk checker. Explicit composition: every collaborator is
/// injected, nothing is global.
pub struct BulkPermissionChecker {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    l1: Option<Arc<PermissionCache>>,
    bitmap: Option<Arc<BitmapCache>>,
    revisions: Arc<RevisionTracker>,
    max_depth: u32,
    parallel_threshold: usize,
}

impl BulkPermissionChecker {
    pub fn new(
        store: Arc<dyn TupleStore>,
        registry: Arc<NamespaceRegistry>,
        l1: Option<Arc<PermissionCache>>,
        bitmap: Option<Arc<BitmapCache>>,
        revisions: Arc<RevisionTracker>,
        max_depth: u32,
    ) -> Self {
        Self {
            store,
            registry,
            l1,
            bitmap,
            revisions,
            max_depth,
            parallel_threshold: PARALLEL_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold.max(1);
        self
    }

    /// Evaluate `checks` within one zone. Duplicates collapse into one memo
    /// entry; every input gets a decision. `deadline` is soft: once passed,
    /// remaining checks deny and the outcome is flagged.
    pub async fn check_bulk(
        &self,
        checks: &[CheckItem],
        zone_id: &str,
        consistency: ConsistencyLevel,
        deadline: Option<Instant>,
    ) -> Result<BulkOutcome> {
        let started = Instant::now();
        let mut outcome = BulkOutcome::default();
        if checks.is_empty() {
            return Ok(outcome);
        }
        debug!(count = checks.len(), %zone_id, ?consistency, "bulk check started");

        let bucket = match consistency {
            ConsistencyLevel::Strong => 0,
            _ => self.revisions.bucket(zone_id).await,
        };

        // Phase 0: L1 probe.
        let mut misses = self.phase_l1(checks, zone_id, bucket, consistency, &mut outcome.results);
        if misses.is_empty() {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "all checks from L1");
            return Ok(outcome);
        }

        // Phase 0.5: bitmap probe resolves positives.
        misses = self.phase_bitmap(&misses, zone_id, bucket, consistency, &mut outcome.results);
        if misses.is_empty() {
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "all checks from L1 + bitmap"
            );
            return Ok(outcome);
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            self.deny_remaining(&misses, &mut outcome);
            return Ok(outcome);
        }

        // Phase 1: one bulk fetch for the whole entity closure.
        let graph = self.phase_fetch(&misses, zone_id).await?;

        if deadline.is_some_and(|d| Instant::now() >= d) {
            self.deny_remaining(&misses, &mut outcome);
            return Ok(outcome);
        }

        // Phase 2: in-memory compute with a shared memo.
        let compute_started = Instant::now();
        let computed = self.phase_compute(&misses, &graph, deadline, &mut outcome.timed_out);
        let compute_elapsed = compute_started.elapsed();

        // Phase 3: write-through.
        let avg_delta = compute_elapsed.as_secs_f64() / misses.len().max(1) as f64;
        self.phase_write_through(&computed, zone_id, bucket, avg_delta);

        outcome.results.extend(computed);

        let granted = outcome.results.values().filter(|v| **v).count();
        debug!(
            total = outcome.results.len(),
            granted,
            denied = outcome.results.len() - granted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            timed_out = outcome.timed_out,
            "bulk check finished"
        );
        Ok(outcome)
    }

    fn phase_l1(
        &self,
        checks: &[CheckItem],
        zone_id: &str,
        bucket: u64,
        consistency: ConsistencyLevel,
        results: &mut HashMap<CheckItem, bool>,
    ) -> Vec<CheckItem> {
        let Some(l1) = &self.l1 else {
            return dedup(checks);
        };
        if consistency == ConsistencyLevel::Strong {
            return dedup(checks);
        }

        let mut misses = Vec::new();
        let mut seen = HashSet::new();
        let mut hits = 0usize;
        for check in checks {
            if !seen.insert(check.clone()) {
                continue;
            }
            match l1.get(&cache_key(check, zone_id, bucket)) {
                Some(result) => {
                    results.insert(check.clone(), result);
                    hits += 1;
                }
                None => misses.push(check.clone()),
            }
        }
        debug!(hits, misses = misses.len(), "bulk L1 probe");
        misses
    }

    fn phase_bitmap(
        &self,
        misses: &[CheckItem],
        zone_id: &str,
        bucket: u64,
        consistency: ConsistencyLevel,
        results: &mut HashMap<CheckItem, bool>,
    ) -> Vec<CheckItem> {
        let Some(bitmap) = &self.bitmap else {
            return misses.to_vec();
        };
        if consistency != ConsistencyLevel::Eventual {
            // Bitmaps serve only the loosest tier.
            return misses.to_vec();
        }

        let verdicts = bitmap.check_bulk(misses, zone_id);
        let mut remaining = Vec::new();
        let mut hits = 0usize;
        for check in misses {
            match verdicts.get(check).copied().flatten() {
                Some(true) => {
                    results.insert(check.clone(), true);
                    hits += 1;
                    if let Some(l1) = &self.l1 {
                        l1.set(
                            cache_key(check, zone_id, bucket),
                            true,
                            Some(check.permission.as_str()),
                            false,
                            0.0,
                        );
                    }
                }
                // Advisory negatives and unknowns both go to compute.
                _ => remaining.push(check.clone()),
            }
        }
        debug!(hits, remaining = remaining.len(), "bulk bitmap probe");
        remaining
    }

    async fn phase_fetch(&self, misses: &[CheckItem], zone_id: &str) -> Result<TupleGraph> {
        let mut entities: AHashSet<Entity> = AHashSet::new();
        for check in misses {
            entities.insert(check.subject.clone());
            entities.insert(check.object.clone());
        }

        // Filesystem objects pull in their whole ancestor chain so parent
        // inheritance can resolve without extra queries.
        let mut ancestors: AHashSet<String> = AHashSet::new();
        for entity in entities.iter() {
            if entity.entity_type == "file" && entity.entity_id.starts_with('/') {
                for ancestor in ancestor_chain(&entity.entity_id) {
                    ancestors.insert(ancestor);
                }
            }
        }
        for ancestor in &ancestors {
            entities.insert(Entity::new("file", ancestor.clone()));
        }

        let entity_list: Vec<Entity> = entities.into_iter().collect();
        let fetch_started = Instant::now();
        let tuples = self.store.bulk_fetch(&entity_list, zone_id).await?;
        debug!(
            entities = entity_list.len(),
            tuples = tuples.len(),
            elapsed_ms = fetch_started.elapsed().as_millis() as u64,
            "bulk tuple fetch"
        );

        let mut graph = TupleGraph::from_tuples(&tuples);

        // Synthesize the hierarchy in memory instead of storing parent rows
        // for every path.
        let mut synthesized = 0usize;
        for path in &ancestors {
            if let Some(parent) = parent_path(path) {
                graph.add_parent_edge(&Entity::new("file", path.clone()), &Entity::new("file", parent));
                synthesized += 1;
            }
        }
        if synthesized > 0 {
            debug!(synthesized, "parent edges synthesized in memory");
        }

        Ok(graph)
    }

    fn phase_compute(
        &self,
        misses: &[CheckItem],
        graph: &TupleGraph,
        deadline: Option<Instant>,
        timed_out: &mut bool,
    ) -> HashMap<CheckItem, bool> {
        let namespaces = self.registry.snapshot();
        let memo = SharedMemo::default();

        if misses.len() >= self.parallel_threshold {
            // Parallel path; the shared DashMap memo keeps results identical
            // to the sequential path. Deadline is checked per item.
            let results: Vec<(CheckItem, bool)> = misses
                .par_iter()
                .map(|check| {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return (check.clone(), false);
                    }
                    let allowed = graph::compute(
                        &check.subject,
                        &check.permission,
                        &check.object,
                        graph,
                        &namespaces,
                        &memo,
                        &mut AHashSet::new(),
                        0,
                        self.max_depth,
                    );
                    (check.clone(), allowed)
                })
                .collect();
            if deadline.is_some_and(|d| Instant::now() >= d) {
                *timed_out = true;
                warn!("bulk compute exceeded its deadline; late checks denied");
            }
            results.into_iter().collect()
        } else {
            let mut results = HashMap::with_capacity(misses.len());
            for check in misses {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    *timed_out = true;
                    warn!("bulk compute deadline hit; denying remaining checks");
                    results.insert(check.clone(), false);
                    continue;
                }
                let allowed = graph::compute(
                    &check.subject,
                    &check.permission,
                    &check.object,
                    graph,
                    &namespaces,
                    &memo,
                    &mut AHashSet::new(),
                    0,
                    self.max_depth,
                );
                results.insert(check.clone(), allowed);
            }
            results
        }
    }

    fn phase_write_through(
        &self,
        computed: &HashMap<CheckItem, bool>,
        zone_id: &str,
        bucket: u64,
        avg_delta: f64,
    ) {
        if let Some(l1) = &self.l1 {
            for (check, result) in computed {
                l1.set(
                    cache_key(check, zone_id, bucket),
                    *result,
                    Some(check.permission.as_str()),
                    false,
                    avg_delta,
                );
            }
        }

        let Some(bitmap) = &self.bitmap else {
            return;
        };
        // Positives only, grouped per bitmap.
        let mut grouped: HashMap<BitmapKey, Vec<String>> = HashMap::new();
        for (check, result) in computed {
            if !result {
                continue;
            }
            grouped
                .entry(BitmapKey::new(
                    &check.subject.entity_type,
                    &check.subject.entity_id,
                    &check.permission,
                    &check.object.entity_type,
                    zone_id,
                ))
                .or_default()
                .push(check.object.entity_id.clone());
        }
        for (key, resource_ids) in grouped {
            bitmap.add_to_bitmap_bulk(&key, &resource_ids);
            bitmap.persist_bitmap_bulk(&key, resource_ids);
        }
    }

    fn deny_remaining(&self, misses: &[CheckItem], outcome: &mut BulkOutcome) {
        warn!(
            remaining = misses.len(),
            "bulk deadline expired before compute; denying remaining checks"
        );
        outcome.timed_out = true;
        for check in misses {
            outcome.results.entry(check.clone()).or_insert(false);
        }
    }
}

fn cache_key(check: &CheckItem, zone_id: &str, bucket: u64) -> CacheKey {
    CacheKey::new(
        &check.subject.entity_type,
        &check.subject.entity_id,
        &check.permission,
        &check.object.entity_type,
        &check.object.entity_id,
        zone_id,
        bucket,
    )
}

fn dedup(checks: &[CheckItem]) -> Vec<CheckItem> {
    let mut seen = HashSet::new();
    checks
        .iter()
        .filter(|check| seen.insert((*check).clone()))
        .cloned()
        .collect()
}
