//! Durable persistence and pure queries over relationship tuples.
//!
//! The store owns zone validation, parent-cycle detection, idempotency, the
//! per-zone revision counter and the write-audit changelog. It performs no
//! cache management and no graph traversal; those live above it.

pub mod postgres;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conditions::{self, AccessContext};
use crate::error::{RebacError, Result};
use crate::models::{
    is_cross_zone_relation, ChangeType, ChangelogEntry, Entity, RelationshipTuple, SubjectSet,
    TupleFilter, TupleWrite,
};

/// Maximum ancestor-walk depth for the write-time parent-cycle check. A
/// storage-side safety bound, deeper than any legal hierarchy.
pub const CYCLE_CHECK_MAX_DEPTH: usize = 50;

/// The relation forming the filesystem hierarchy DAG.
pub const PARENT_RELATION: &str = "parent";

/// Storage contract for relationship tuples.
///
/// All write operations are transactional: a failed write leaves no tuple,
/// no changelog row, and no revision bump.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Insert a tuple. Validates zones (cross-zone only for the `shared-*`
    /// family, stored under the object's zone), rejects parent cycles, and
    /// is idempotent on (subject, relation, object, zone): re-inserting
    /// returns the existing id without bumping the zone revision.
    async fn insert(&self, write: TupleWrite) -> Result<Uuid>;

    /// Delete by id, returning the removed tuple so callers can run
    /// targeted cache invalidation. Bumps the zone revision.
    async fn delete(&self, tuple_id: Uuid) -> Result<Option<RelationshipTuple>>;

    /// Delete everything matching the filter; returns the number removed.
    /// Each affected zone's revision is bumped once.
    async fn delete_where(&self, filter: &TupleFilter) -> Result<u64>;

    /// Find a direct concrete-subject grant: exact match, then in-zone
    /// wildcard, then cross-zone wildcard, then (for `shared-*` relations)
    /// a cross-zone concrete match. Tuples whose ABAC conditions fail the
    /// context are skipped, letting a later rung still grant. Does not
    /// follow usersets.
    async fn find_direct_tuple(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
    ) -> Result<Option<RelationshipTuple>>;

    /// All userset-as-subject grants of `relation` on `object` in the zone.
    async fn find_subject_sets(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Vec<SubjectSet>>;

    /// Objects reachable from `obj` as tuple subject via `relation`
    /// (parent-pattern traversal: parents of file X are tuples
    /// `(X, parent, Y)`).
    async fn find_related_objects(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>>;

    /// Subjects holding `relation` on `obj` (group-pattern traversal).
    async fn find_subjects_with_relation(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>>;

    /// Filtered listing for dumps and admin surfaces.
    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>>;

    /// Every non-expired tuple touching any of `entities` as subject or
    /// object within the zone, plus all cross-zone shares whose subject is
    /// in the set.
    async fn bulk_fetch(
        &self,
        entities: &[Entity],
        zone_id: &str,
    ) -> Result<Vec<RelationshipTuple>>;

    /// Current zone revision (0 if the zone has no writes yet). Read-only.
    async fn zone_revision(&self, zone_id: &str) -> Result<u64>;

    /// Physically remove expired tuples. Reads already ignore them; this is
    /// housekeeping. Returns the number removed.
    async fn cleanup_expired(&self) -> Result<u64>;
}

/// Validate a write and resolve its effective zones.
///
/// Returns `(zone_id, subject_zone_id, object_zone_id)`. Cross-zone writes
/// with an allowlisted relation land in the object's zone; everything else
/// must be same-zone.
pub(crate) fn resolve_zones(write: &TupleWrite) -> Result<(String, String, String)> {
    if write.subject.entity.entity_type.is_empty() || write.subject.entity.entity_id.is_empty() {
        return Err(RebacError::Validation("empty subject entity".to_string()));
    }
    if write.object.entity_type.is_empty() || write.object.entity_id.is_empty() {
        return Err(RebacError::Validation("empty object entity".to_string()));
    }
    if write.relation.is_empty() {
        return Err(RebacError::Validation("empty relation".to_string()));
    }
    if let Some(subject_relation) = &write.subject.relation {
        if subject_relation.is_empty() {
            return Err(RebacError::Validation(
                "empty subject relation in userset subject".to_string(),
            ));
        }
    }
    if write.zone_id.is_empty() {
        return Err(RebacError::Validation("empty zone_id".to_string()));
    }

    let mut zone_id = write.zone_id.clone();
    let subject_zone = write.subject_zone_id.clone().unwrap_or_else(|| zone_id.clone());
    let object_zone = write.object_zone_id.clone().unwrap_or_else(|| zone_id.clone());
    let cross_zone_allowed = is_cross_zone_relation(&write.relation);

    if subject_zone != object_zone {
        if cross_zone_allowed {
            // Shares live in the resource owner's zone.
            zone_id = object_zone.clone();
            debug!(
                subject_zone = %subject_zone,
                object_zone = %object_zone,
                relation = %write.relation,
                "cross-zone share stored under object zone"
            );
        } else {
            return Err(RebacError::zone_isolation(
                format!(
                    "cannot create cross-zone relationship: subject in '{subject_zone}', \
                     object in '{object_zone}'"
                ),
                Some(&subject_zone),
                Some(&object_zone),
            ));
        }
    }
    if subject_zone != zone_id && !cross_zone_allowed {
        return Err(RebacError::zone_isolation(
            format!("subject zone '{subject_zone}' does not match tuple zone '{zone_id}'"),
            Some(&subject_zone),
            Some(&zone_id),
        ));
    }

    Ok((zone_id, subject_zone, object_zone))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    tuples: HashMap<Uuid, RelationshipTuple>,
    revisions: HashMap<String, u64>,
    changelog: Vec<ChangelogEntry>,
}

impl StoreState {
    fn bump_revision(&mut self, zone_id: &str) -> u64 {
        let revision = self.revisions.entry(zone_id.to_string()).or_insert(0);
        *revision += 1;
        *revision
    }

    fn log_change(&mut self, change_type: ChangeType, tuple: &RelationshipTuple) {
        self.changelog.push(ChangelogEntry {
            change_type,
            tuple_id: tuple.tuple_id,
            zone_id: tuple.zone_id.clone(),
            subject: tuple.subject.clone(),
            relation: tuple.relation.clone(),
            object: tuple.object.clone(),
            created_at: Utc::now(),
        });
    }

    /// Walk parent edges upward from `start`; true if `needle` is an
    /// ancestor.
    fn is_ancestor(&self, start: &Entity, needle: &Entity, zone_id: &str) -> bool {
        let now = Utc::now();
        let mut frontier = vec![start.clone()];
        let mut seen: HashSet<Entity> = HashSet::new();
        let mut depth = 0usize;

        while !frontier.is_empty() && depth < CYCLE_CHECK_MAX_DEPTH {
            let mut next = Vec::new();
            for node in frontier.drain(..) {
                if !seen.insert(node.clone()) {
                    continue;
                }
                for tuple in self.tuples.values() {
                    if tuple.relation == PARENT_RELATION
                        && tuple.zone_id == zone_id
                        && tuple.subject.relation.is_none()
                        && tuple.subject.entity == node
                        && tuple.is_live(now)
                    {
                        if tuple.object == *needle {
                            return true;
                        }
                        next.push(tuple.object.clone());
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        false
    }
}

/// In-memory tuple store: the reference implementation, used by tests and
/// single-process embeddings.
pub struct MemoryTupleStore {
    state: RwLock<StoreState>,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Changelog snapshot, newest last.
    pub fn changelog(&self) -> Vec<ChangelogEntry> {
        self.state.read().changelog.clone()
    }
}

impl Default for MemoryTupleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleStore for MemoryTupleStore {
    async fn insert(&self, write: TupleWrite) -> Result<Uuid> {
        let (zone_id, subject_zone, object_zone) = resolve_zones(&write)?;

        let mut state = self.state.write();

        if write.relation == PARENT_RELATION {
            if write.subject.entity == write.object {
                return Err(RebacError::Cycle(format!(
                    "parent relation from {} to itself",
                    write.object
                )));
            }
            if state.is_ancestor(&write.object, &write.subject.entity, &zone_id) {
                return Err(RebacError::Cycle(format!(
                    "{} is an ancestor of {}; parent edge would close a loop",
                    write.subject.entity, write.object
                )));
            }
        }

        // Idempotency on the 4-key: re-insert returns the existing row.
        let now = Utc::now();
        if let Some(existing) = state.tuples.values().find(|t| {
            t.subject == write.subject
                && t.relation == write.relation
                && t.object == write.object
                && t.zone_id == zone_id
                && t.is_live(now)
        }) {
            return Ok(existing.tuple_id);
        }

        let tuple = RelationshipTuple {
            tuple_id: Uuid::new_v4(),
            subject: write.subject,
            relation: write.relation,
            object: write.object,
            zone_id: zone_id.clone(),
            subject_zone_id: subject_zone,
            object_zone_id: object_zone,
            conditions: write.conditions,
            expires_at: write.expires_at,
            created_at: now,
        };
        let tuple_id = tuple.tuple_id;
        state.log_change(ChangeType::Insert, &tuple);
        state.tuples.insert(tuple_id, tuple);
        state.bump_revision(&zone_id);
        Ok(tuple_id)
    }

    async fn delete(&self, tuple_id: Uuid) -> Result<Option<RelationshipTuple>> {
        let mut state = self.state.write();
        let Some(tuple) = state.tuples.remove(&tuple_id) else {
            return Ok(None);
        };
        state.log_change(ChangeType::Delete, &tuple);
        state.bump_revision(&tuple.zone_id);
        Ok(Some(tuple))
    }

    async fn delete_where(&self, filter: &TupleFilter) -> Result<u64> {
        let mut state = self.state.write();
        let matching: Vec<Uuid> = state
            .tuples
            .values()
            .filter(|t| filter.matches(t))
            .map(|t| t.tuple_id)
            .collect();

        let mut affected_zones: HashSet<String> = HashSet::new();
        for tuple_id in &matching {
            if let Some(tuple) = state.tuples.remove(tuple_id) {
                affected_zones.insert(tuple.zone_id.clone());
                state.log_change(ChangeType::Delete, &tuple);
            }
        }
        for zone_id in affected_zones {
            state.bump_revision(&zone_id);
        }
        Ok(matching.len() as u64)
    }

    async fn find_direct_tuple(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
    ) -> Result<Option<RelationshipTuple>> {
        let state = self.state.read();
        let now = Utc::now();

        let passes = |tuple: &RelationshipTuple| -> bool {
            tuple
                .conditions
                .as_ref()
                .map_or(true, |c| conditions::evaluate(c, context))
        };
        let concrete = |t: &&RelationshipTuple| t.subject.relation.is_none() && t.is_live(now);

        // Rung 1: exact concrete subject in-zone.
        if let Some(found) = state.tuples.values().filter(concrete).find(|t| {
            t.zone_id == zone_id
                && t.subject.entity == *subject
                && t.relation == relation
                && t.object == *object
                && passes(t)
        }) {
            return Ok(Some(found.clone()));
        }

        if !subject.is_wildcard() {
            let wildcard = Entity::wildcard();

            // Rung 2: in-zone public grant.
            if let Some(found) = state.tuples.values().filter(concrete).find(|t| {
                t.zone_id == zone_id
                    && t.subject.entity == wildcard
                    && t.relation == relation
                    && t.object == *object
                    && passes(t)
            }) {
                return Ok(Some(found.clone()));
            }

            // Rung 3: cross-zone public grant (wildcards allow across zones).
            if let Some(found) = state.tuples.values().filter(concrete).find(|t| {
                t.subject.entity == wildcard
                    && t.relation == relation
                    && t.object == *object
                    && passes(t)
            }) {
                debug!(%relation, object = %object, "cross-zone wildcard grant");
                return Ok(Some(found.clone()));
            }
        }

        // Rung 4: cross-zone share, stored under the object's zone but
        // visible from the recipient's zone.
        if is_cross_zone_relation(relation) {
            if let Some(found) = state.tuples.values().filter(concrete).find(|t| {
                t.subject.entity == *subject
                    && t.relation == relation
                    && t.object == *object
                    && passes(t)
            }) {
                debug!(subject = %subject, %relation, object = %object, "cross-zone share grant");
                return Ok(Some(found.clone()));
            }
        }

        Ok(None)
    }

    async fn find_subject_sets(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Vec<SubjectSet>> {
        let state = self.state.read();
        let now = Utc::now();
        Ok(state
            .tuples
            .values()
            .filter(|t| {
                t.zone_id == zone_id
                    && t.relation == relation
                    && t.object == *object
                    && t.subject.relation.is_some()
                    && t.is_live(now)
            })
            .map(|t| SubjectSet {
                tuple_id: t.tuple_id,
                entity: t.subject.entity.clone(),
                relation: t.subject.relation.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn find_related_objects(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        let state = self.state.read();
        let now = Utc::now();
        Ok(state
            .tuples
            .values()
            .filter(|t| {
                t.zone_id == zone_id
                    && t.subject.entity == *obj
                    && t.subject.relation.is_none()
                    && t.relation == relation
                    && t.is_live(now)
            })
            .map(|t| t.object.clone())
            .collect())
    }

    async fn find_subjects_with_relation(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        let state = self.state.read();
        let now = Utc::now();
        Ok(state
            .tuples
            .values()
            .filter(|t| {
                t.zone_id == zone_id
                    && t.object == *obj
                    && t.relation == relation
                    && t.is_live(now)
            })
            .map(|t| t.subject.entity.clone())
            .collect())
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>> {
        let state = self.state.read();
        let now = Utc::now();
        Ok(state
            .tuples
            .values()
            .filter(|t| t.is_live(now) && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn bulk_fetch(
        &self,
        entities: &[Entity],
        zone_id: &str,
    ) -> Result<Vec<RelationshipTuple>> {
        let wanted: HashSet<&Entity> = entities.iter().collect();
        let state = self.state.read();
        let now = Utc::now();

        let mut out = Vec::new();
        for tuple in state.tuples.values() {
            if !tuple.is_live(now) {
                continue;
            }
            let touches = wanted.contains(&tuple.subject.entity) || wanted.contains(&tuple.object);
            let in_zone = tuple.zone_id == zone_id;
            let cross_zone_share =
                is_cross_zone_relation(&tuple.relation) && wanted.contains(&tuple.subject.entity);
            if (in_zone && touches) || cross_zone_share {
                out.push(tuple.clone());
            }
        }
        Ok(out)
    }

    async fn zone_revision(&self, zone_id: &str) -> Result<u64> {
        Ok(self
            .state
            .read()
            .revisions
            .get(zone_id)
            .copied()
            .unwrap_or(0))
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut state = self.state.write();
        let now = Utc::now();
        let expired: Vec<Uuid> = state
            .tuples
            .values()
            .filter(|t| !t.is_live(now))
            .map(|t| t.tuple_id)
            .collect();
        let count = expired.len() as u64;
        for tuple_id in expired {
            state.tuples.remove(&tuple_id);
        }
        if count > 0 {
            warn!(count, "removed expired tuples");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_ZONE;
    use chrono::Duration;

    fn grant(subject: Entity, relation: &str, object: Entity) -> TupleWrite {
        TupleWrite::new(subject, relation, object, DEFAULT_ZONE)
    }

    #[tokio::test]
    async fn insert_is_idempotent_and_bumps_revision_once() {
        let store = MemoryTupleStore::new();
        let write = grant(Entity::user("alice"), "direct_viewer", Entity::file("/a"));

        let first = store.insert(write.clone()).await.unwrap();
        assert_eq!(store.zone_revision(DEFAULT_ZONE).await.unwrap(), 1);

        let second = store.insert(write).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.zone_revision(DEFAULT_ZONE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_four_key_and_bumps_revision() {
        let store = MemoryTupleStore::new();
        let write = grant(Entity::user("alice"), "direct_viewer", Entity::file("/a"));
        let tuple_id = store.insert(write).await.unwrap();

        let removed = store.delete(tuple_id).await.unwrap().unwrap();
        assert_eq!(removed.tuple_id, tuple_id);
        assert_eq!(store.zone_revision(DEFAULT_ZONE).await.unwrap(), 2);

        let found = store
            .find_direct_tuple(
                &Entity::user("alice"),
                "direct_viewer",
                &Entity::file("/a"),
                DEFAULT_ZONE,
                None,
            )
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(store.delete(tuple_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cross_zone_write_is_rejected_unless_shared() {
        let store = MemoryTupleStore::new();

        let err = store
            .insert(
                TupleWrite::new(
                    Entity::user("alice@partner"),
                    "direct_viewer",
                    Entity::file("/doc"),
                    "z_acme",
                )
                .between_zones("z_partner", "z_acme"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::ZoneIsolation { .. }));

        // The shared-* family is allowed and lands in the object's zone.
        let tuple_id = store
            .insert(
                TupleWrite::new(
                    Entity::user("alice@partner"),
                    "shared-viewer",
                    Entity::file("/doc"),
                    "z_acme",
                )
                .between_zones("z_partner", "z_acme"),
            )
            .await
            .unwrap();
        let tuples = store
            .read_tuples(&TupleFilter {
                zone_id: Some("z_acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].tuple_id, tuple_id);
        assert_eq!(tuples[0].subject_zone_id, "z_partner");
    }

    #[tokio::test]
    async fn parent_cycles_are_rejected() {
        let store = MemoryTupleStore::new();
        store
            .insert(grant(Entity::file("/a"), "parent", Entity::file("/b")))
            .await
            .unwrap();

        let err = store
            .insert(grant(Entity::file("/b"), "parent", Entity::file("/a")))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::Cycle(_)));

        let err = store
            .insert(grant(Entity::file("/c"), "parent", Entity::file("/c")))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::Cycle(_)));

        // Longer chains are caught too: /b -> /c then /c -> /a closes a loop.
        store
            .insert(grant(Entity::file("/b"), "parent", Entity::file("/d")))
            .await
            .unwrap();
        let err = store
            .insert(grant(Entity::file("/d"), "parent", Entity::file("/a")))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::Cycle(_)));
    }

    #[tokio::test]
    async fn expired_tuples_are_invisible_everywhere() {
        let store = MemoryTupleStore::new();
        let write = grant(Entity::user("alice"), "direct_viewer", Entity::file("/a"))
            .with_expiry(Utc::now() - Duration::seconds(5));
        store.insert(write).await.unwrap();

        assert!(store
            .find_direct_tuple(
                &Entity::user("alice"),
                "direct_viewer",
                &Entity::file("/a"),
                DEFAULT_ZONE,
                None,
            )
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read_tuples(&TupleFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wildcard_grants_apply_in_and_across_zones() {
        let store = MemoryTupleStore::new();
        store
            .insert(TupleWrite::new(
                Entity::wildcard(),
                "direct_viewer",
                Entity::file("/public"),
                "z1",
            ))
            .await
            .unwrap();

        for zone in ["z1", "z2"] {
            let found = store
                .find_direct_tuple(
                    &Entity::user("bob"),
                    "direct_viewer",
                    &Entity::file("/public"),
                    zone,
                    None,
                )
                .await
                .unwrap();
            assert!(found.is_some(), "wildcard should grant in zone {zone}");
        }
    }

    #[tokio::test]
    async fn conditional_tuple_is_skipped_when_context_fails() {
        use crate::conditions::{TimeWindow, TupleConditions};

        let store = MemoryTupleStore::new();
        store
            .insert(
                grant(Entity::user("alice"), "direct_viewer", Entity::file("/a")).with_conditions(
                    TupleConditions {
                        time_window: Some(TimeWindow {
                            start: "09:00".to_string(),
                            end: "17:00".to_string(),
                        }),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();

        let in_hours = AccessContext::at_time("12:00");
        assert!(store
            .find_direct_tuple(
                &Entity::user("alice"),
                "direct_viewer",
                &Entity::file("/a"),
                DEFAULT_ZONE,
                Some(&in_hours),
            )
            .await
            .unwrap()
            .is_some());

        let after_hours = AccessContext::at_time("20:00");
        assert!(store
            .find_direct_tuple(
                &Entity::user("alice"),
                "direct_viewer",
                &Entity::file("/a"),
                DEFAULT_ZONE,
                Some(&after_hours),
            )
            .await
            .unwrap()
            .is_none());

        // No context at all also denies.
        assert!(store
            .find_direct_tuple(
                &Entity::user("alice"),
                "direct_viewer",
                &Entity::file("/a"),
                DEFAULT_ZONE,
                None,
            )
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn bulk_fetch_returns_the_entity_closure_plus_shares() {
        let store = MemoryTupleStore::new();
        let alice = Entity::user("alice");

        store
            .insert(TupleWrite::new(
                alice.clone(),
                "direct_viewer",
                Entity::file("/proj/a.txt"),
                "z1",
            ))
            .await
            .unwrap();
        store
            .insert(TupleWrite::new(
                alice.clone(),
                "member",
                Entity::group("eng"),
                "z1",
            ))
            .await
            .unwrap();
        // Unrelated tuple in another zone.
        store
            .insert(TupleWrite::new(
                Entity::user("bob"),
                "direct_viewer",
                Entity::file("/other"),
                "z2",
            ))
            .await
            .unwrap();
        // Cross-zone share with alice as subject, stored under z_acme.
        store
            .insert(
                TupleWrite::new(alice.clone(), "shared-viewer", Entity::file("/doc"), "z_acme")
                    .between_zones("z1", "z_acme"),
            )
            .await
            .unwrap();

        let fetched = store
            .bulk_fetch(&[alice.clone(), Entity::file("/proj/a.txt")], "z1")
            .await
            .unwrap();
        assert_eq!(fetched.len(), 3, "grant + membership + cross-zone share");
        assert!(fetched.iter().any(|t| t.relation == "shared-viewer"));
        assert!(!fetched.iter().any(|t| t.zone_id == "z2"));
    }

    #[tokio::test]
    async fn delete_where_bumps_each_zone_once() {
        let store = MemoryTupleStore::new();
        for path in ["/a", "/b", "/c"] {
            store
                .insert(grant(Entity::user("alice"), "direct_viewer", Entity::file(path)))
                .await
                .unwrap();
        }
        assert_eq!(store.zone_revision(DEFAULT_ZONE).await.unwrap(), 3);

        let removed = store
            .delete_where(&TupleFilter {
                subject: Some(Entity::user("alice")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.zone_revision(DEFAULT_ZONE).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn changelog_records_inserts_and_deletes() {
        let store = MemoryTupleStore::new();
        let tuple_id = store
            .insert(grant(Entity::user("alice"), "direct_viewer", Entity::file("/a")))
            .await
            .unwrap();
        store.delete(tuple_id).await.unwrap();

        let changelog = store.changelog();
        assert_eq!(changelog.len(), 2);
        assert_eq!(changelog[0].change_type, ChangeType::Insert);
        assert_eq!(changelog[1].change_type, ChangeType::Delete);
        assert_eq!(changelog[1].tuple_id, tuple_id);
    }
}
