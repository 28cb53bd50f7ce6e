//! Authorization engine facade.
//!
//! Owns the tuple store, namespace registry, permission computer, subject
//! expander, bulk checker and the cache tiers, and wires invalidation
//! through all of them. Collaborators register callbacks instead of
//! holding back-pointers; a process may host several independent engines.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bitmap::{BitmapCache, BitmapKey};
use crate::bulk::{BulkOutcome, BulkPermissionChecker};
use crate::cache::{CacheKey, CacheStats, PermissionCache, PermissionCacheConfig, RevisionTracker};
use crate::check::{Explanation, PermissionComputer};
use crate::conditions::AccessContext;
use crate::error::{RebacError, Result};
use crate::expand::SubjectExpander;
use crate::models::{
    CheckItem, ConsistencyLevel, Entity, RelationshipTuple, TupleFilter, TupleWrite,
    ZoneConsistencyMode,
};
use crate::repository::TupleStore;
use crate::schema::{NamespaceConfig, NamespaceRegistry};

/// What changed, for collaborators that mirror authorization state
/// (directory visibility caches and the like).
#[derive(Debug, Clone)]
pub enum InvalidationEvent {
    TupleWritten {
        zone_id: String,
        subject: Entity,
        relation: String,
        object: Entity,
    },
    TupleDeleted {
        zone_id: String,
        subject: Entity,
        relation: String,
        object: Entity,
    },
    SchemaChanged,
    ZoneCleared {
        zone_id: String,
    },
}

/// Callback registration interface; no back-pointers into the engine.
pub trait Invalidator: Send + Sync {
    fn on_invalidate(&self, event: &InvalidationEvent);
}

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_depth: u32,
    /// Soft deadline applied to bulk calls; `None` disables it.
    pub bulk_deadline: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::check::DEFAULT_MAX_DEPTH,
            bulk_deadline: Some(Duration::from_secs(10)),
        }
    }
}

/// The authorization engine.
pub struct AuthorizationEngine {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    computer: PermissionComputer,
    expander: SubjectExpander,
    bulk: BulkPermissionChecker,
    l1: Option<Arc<PermissionCache>>,
    bitmap: Option<Arc<BitmapCache>>,
    revisions: Arc<RevisionTracker>,
    invalidators: RwLock<Vec<Arc<dyn Invalidator>>>,
    zone_modes: DashMap<String, ZoneConsistencyMode>,
    config: EngineConfig,
}

/// Builder for the engine; every collaborator is optional except the store.
pub struct EngineBuilder {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    l1: Option<Arc<PermissionCache>>,
    bitmap: Option<Arc<BitmapCache>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TupleStore>) -> Self {
        Self {
            store,
            registry: Arc::new(NamespaceRegistry::with_filesystem_schema()),
            l1: None,
            bitmap: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<NamespaceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_l1_cache(mut self, config: PermissionCacheConfig) -> Self {
        self.l1 = Some(Arc::new(PermissionCache::new(config)));
        self
    }

    pub fn with_bitmap_cache(mut self, bitmap: Arc<BitmapCache>) -> Self {
        self.bitmap = Some(bitmap);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> AuthorizationEngine {
        let revisions = Arc::new(RevisionTracker::new(self.store.clone()));
        let computer = PermissionComputer::new(self.store.clone(), self.registry.clone())
            .with_max_depth(self.config.max_depth);
        let expander = SubjectExpander::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.max_depth,
        );
        let bulk = BulkPermissionChecker::new(
            self.store.clone(),
            self.registry.clone(),
            self.l1.clone(),
            self.bitmap.clone(),
            revisions.clone(),
            self.config.max_depth,
        );
        AuthorizationEngine {
            store: self.store,
            registry: self.registry,
            computer,
            expander,
            bulk,
            l1: self.l1,
            bitmap: self.bitmap,
            revisions,
            invalidators: RwLock::new(Vec::new()),
            zone_modes: DashMap::new(),
            config: self.config,
        }
    }
}

impl AuthorizationEngine {
    /// Engine over a store with the default filesystem schema, an L1 cache
    /// and a bitmap cache.
    pub fn new(store: Arc<dyn TupleStore>) -> Self {
        EngineBuilder::new(store)
            .with_l1_cache(PermissionCacheConfig::default())
            .with_bitmap_cache(Arc::new(BitmapCache::new()))
            .build()
    }

    pub fn builder(store: Arc<dyn TupleStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TupleStore> {
        &self.store
    }

    pub fn register_invalidator(&self, invalidator: Arc<dyn Invalidator>) {
        self.invalidators.write().push(invalidator);
    }

    fn notify(&self, event: InvalidationEvent) {
        for invalidator in self.invalidators.read().iter() {
            invalidator.on_invalidate(&event);
        }
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    pub async fn check(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<bool> {
        self.check_with_context(subject, permission, object, zone_id, None, None)
            .await
    }

    /// Full check entry point. Context-bearing checks skip the caches: the
    /// stored key has no context dimension, and ABAC answers are not
    /// reusable across contexts.
    pub async fn check_with_context(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
        consistency: Option<ConsistencyLevel>,
    ) -> Result<bool> {
        let level = consistency.unwrap_or_else(|| self.default_level(zone_id));
        let cacheable = context.is_none() && level != ConsistencyLevel::Strong;

        let key = if cacheable {
            let bucket = self.revisions.bucket(zone_id).await;
            Some(CacheKey::new(
                &subject.entity_type,
                &subject.entity_id,
                permission,
                &object.entity_type,
                &object.entity_id,
                zone_id,
                bucket,
            ))
        } else {
            None
        };

        if let (Some(l1), Some(key)) = (&self.l1, &key) {
            if let Some(lookup) = l1.get_with_refresh(key) {
                if !lookup.needs_refresh {
                    return Ok(lookup.result);
                }
                debug!(%permission, subject = %subject, "xfetch early refresh, recomputing");
            }
        }

        if level == ConsistencyLevel::Eventual {
            if let Some(bitmap) = &self.bitmap {
                if bitmap.check(
                    &subject.entity_type,
                    &subject.entity_id,
                    permission,
                    &object.entity_type,
                    &object.entity_id,
                    zone_id,
                ) == Some(true)
                {
                    if let (Some(l1), Some(key)) = (&self.l1, &key) {
                        l1.set(key.clone(), true, Some(permission), false, 0.0);
                    }
                    return Ok(true);
                }
            }
        }

        // Single-flight: the first caller through claims the cache write.
        let claimed = match (&self.l1, &key) {
            (Some(l1), Some(key)) => l1.try_acquire_compute(key),
            _ => false,
        };

        let compute_started = Instant::now();
        let result = self
            .computer
            .check(subject, permission, object, zone_id, context)
            .await;
        let delta = compute_started.elapsed().as_secs_f64();

        let result = match result {
            Ok(result) => result,
            Err(error) => {
                if let (Some(l1), Some(key)) = (&self.l1, &key) {
                    if claimed {
                        l1.abandon_compute(key);
                    }
                }
                return Err(error);
            }
        };

        if let (Some(l1), Some(key)) = (&self.l1, key.clone()) {
            if claimed {
                l1.release_compute(key, result, Some(permission), false, delta);
            }
        }

        if result && level == ConsistencyLevel::Eventual {
            if let Some(bitmap) = &self.bitmap {
                let bitmap_key = BitmapKey::new(
                    &subject.entity_type,
                    &subject.entity_id,
                    permission,
                    &object.entity_type,
                    zone_id,
                );
                bitmap.add_to_bitmap_bulk(&bitmap_key, &[object.entity_id.clone()]);
                bitmap.persist_bitmap_bulk(&bitmap_key, vec![object.entity_id.clone()]);
            }
        }

        Ok(result)
    }

    /// Evaluate many checks in one call. Every input check gets a decision;
    /// a deadline overrun denies the remainder and logs the incident.
    pub async fn check_bulk(
        &self,
        checks: &[CheckItem],
        zone_id: &str,
        consistency: Option<ConsistencyLevel>,
    ) -> Result<HashMap<CheckItem, bool>> {
        let level = consistency.unwrap_or_else(|| self.default_level(zone_id));
        let deadline = self.config.bulk_deadline.map(|d| Instant::now() + d);
        let BulkOutcome { results, timed_out } =
            self.bulk.check_bulk(checks, zone_id, level, deadline).await?;
        if timed_out {
            warn!(%zone_id, checks = checks.len(), "bulk check hit its deadline");
        }
        Ok(results)
    }

    pub async fn expand(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        self.expander.expand(permission, object, zone_id).await
    }

    pub async fn explain(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Explanation> {
        self.computer.explain(subject, permission, object, zone_id).await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create a tuple and propagate invalidations. The write is
    /// transactional in the store; cache trouble never blocks it.
    pub async fn write(&self, write: TupleWrite) -> Result<Uuid> {
        self.validate_against_schema(&write)?;

        let subject = write.subject.entity.clone();
        let relation = write.relation.clone();
        let object = write.object.clone();
        let zone_id = write.zone_id.clone();
        let subject_zone = write.subject_zone_id.clone();
        let object_zone = write.object_zone_id.clone();

        let tuple_id = self.store.insert(write).await?;
        debug!(%tuple_id, subject = %subject, %relation, object = %object, "tuple written");

        // Shares land in the object's zone and are checked from the
        // recipient's zone; invalidate every zone the tuple touches.
        self.invalidate_tuple(&subject, &object, &zone_id);
        self.revisions.forget(&zone_id);
        for endpoint_zone in [subject_zone, object_zone].into_iter().flatten() {
            if endpoint_zone != zone_id {
                self.invalidate_tuple(&subject, &object, &endpoint_zone);
                self.revisions.forget(&endpoint_zone);
            }
        }

        self.notify(InvalidationEvent::TupleWritten {
            zone_id,
            subject,
            relation,
            object,
        });
        Ok(tuple_id)
    }

    /// Delete by id. Returns whether a tuple was removed.
    pub async fn delete(&self, tuple_id: Uuid) -> Result<bool> {
        let Some(tuple) = self.store.delete(tuple_id).await? else {
            return Ok(false);
        };
        debug!(%tuple_id, "tuple deleted");

        self.invalidate_tuple(&tuple.subject.entity, &tuple.object, &tuple.zone_id);
        if tuple.subject_zone_id != tuple.zone_id {
            self.invalidate_tuple(&tuple.subject.entity, &tuple.object, &tuple.subject_zone_id);
            self.revisions.forget(&tuple.subject_zone_id);
        }
        self.revisions.forget(&tuple.zone_id);

        self.notify(InvalidationEvent::TupleDeleted {
            zone_id: tuple.zone_id.clone(),
            subject: tuple.subject.entity.clone(),
            relation: tuple.relation.clone(),
            object: tuple.object.clone(),
        });
        Ok(true)
    }

    /// Bulk delete with zone-wide invalidation of the affected zones.
    pub async fn delete_where(&self, filter: &TupleFilter) -> Result<u64> {
        let affected: Vec<String> = match &filter.zone_id {
            Some(zone_id) => vec![zone_id.clone()],
            None => {
                // Without a zone filter the affected set is unknown; fall
                // back to clearing everything.
                Vec::new()
            }
        };

        let removed = self.store.delete_where(filter).await?;
        if removed == 0 {
            return Ok(0);
        }

        if affected.is_empty() {
            if let Some(l1) = &self.l1 {
                l1.clear();
            }
            if let Some(bitmap) = &self.bitmap {
                bitmap.clear();
            }
        } else {
            for zone_id in &affected {
                if let Some(l1) = &self.l1 {
                    l1.clear_zone(zone_id);
                }
                if let Some(bitmap) = &self.bitmap {
                    bitmap.clear_zone(zone_id);
                }
                self.revisions.forget(zone_id);
                self.notify(InvalidationEvent::ZoneCleared {
                    zone_id: zone_id.clone(),
                });
            }
        }
        Ok(removed)
    }

    pub async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>> {
        self.store.read_tuples(filter).await
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.store.cleanup_expired().await
    }

    pub async fn zone_revision(&self, zone_id: &str) -> Result<u64> {
        self.store.zone_revision(zone_id).await
    }

    /// Relations must be declared by the object type's namespace when one
    /// exists. Unknown object types stay permissive (direct-check only
    /// semantics downstream).
    fn validate_against_schema(&self, write: &TupleWrite) -> Result<()> {
        let Some(namespace) = self.registry.get(&write.object.entity_type) else {
            return Ok(());
        };
        if namespace.relations.is_empty() {
            return Ok(());
        }
        if namespace.relation_config(&write.relation).is_none()
            && !namespace.has_permission(&write.relation)
        {
            return Err(RebacError::Validation(format!(
                "relation '{}' is not declared for object type '{}'",
                write.relation, write.object.entity_type
            )));
        }
        Ok(())
    }

    /// Targeted invalidation fan-out for one tuple change: the subject, the
    /// object, their pair, and (for hierarchical objects) the subtree under
    /// the object's path.
    fn invalidate_tuple(&self, subject: &Entity, object: &Entity, zone_id: &str) {
        if let Some(l1) = &self.l1 {
            l1.invalidate_subject(&subject.entity_type, &subject.entity_id, zone_id);
            l1.invalidate_object(&object.entity_type, &object.entity_id, zone_id);
            if object.entity_type == "file" && object.entity_id.starts_with('/') {
                l1.invalidate_object_prefix(&object.entity_type, &object.entity_id, zone_id);
            }
        }
        if let Some(bitmap) = &self.bitmap {
            bitmap.invalidate_subject(&subject.entity_type, &subject.entity_id, zone_id);
            bitmap.invalidate_object(&object.entity_type, &object.entity_id, zone_id);
        }
    }

    // ------------------------------------------------------------------
    // Namespace management
    // ------------------------------------------------------------------

    pub fn register_namespace(&self, object_type: &str, config: NamespaceConfig) -> Result<()> {
        self.registry.register(object_type, config)?;
        self.clear_caches();
        self.notify(InvalidationEvent::SchemaChanged);
        info!(object_type, "namespace registered, caches cleared");
        Ok(())
    }

    pub fn load_schema_json(&self, document: &str) -> Result<()> {
        self.registry.load_json(document)?;
        self.clear_caches();
        self.notify(InvalidationEvent::SchemaChanged);
        Ok(())
    }

    pub fn load_schema_yaml(&self, document: &str) -> Result<()> {
        self.registry.load_yaml(document)?;
        self.clear_caches();
        self.notify(InvalidationEvent::SchemaChanged);
        Ok(())
    }

    pub fn remove_namespace(&self, object_type: &str) -> bool {
        let removed = self.registry.remove(object_type);
        if removed {
            self.clear_caches();
            self.notify(InvalidationEvent::SchemaChanged);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Cache and consistency controls
    // ------------------------------------------------------------------

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.l1.as_ref().map(|l1| l1.stats())
    }

    pub fn clear_caches(&self) {
        if let Some(l1) = &self.l1 {
            l1.clear();
        }
        if let Some(bitmap) = &self.bitmap {
            bitmap.clear();
        }
    }

    /// Per-zone default consistency, used when a caller passes none.
    pub fn set_zone_consistency(&self, zone_id: &str, mode: ZoneConsistencyMode) {
        self.zone_modes.insert(zone_id.to_string(), mode);
    }

    fn default_level(&self, zone_id: &str) -> ConsistencyLevel {
        self.zone_modes
            .get(zone_id)
            .map(|mode| mode.default_level())
            .unwrap_or(ConsistencyLevel::Eventual)
    }
}
