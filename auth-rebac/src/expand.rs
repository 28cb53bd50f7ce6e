//! Permission expansion: every subject granted a permission on an object.
//!
//! Drives share-list UIs. Walks the same namespace rewrites as the
//! computer, but collects subjects instead of testing one. Userset grants
//! are expanded into their members.

use ahash::AHashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::models::Entity;
use crate::repository::TupleStore;
use crate::schema::{NamespaceRegistry, RelationDef, UsersetRef};

type ExpandVisitKey = (String, String, String);

/// Expands a permission on an object into the set of granted subjects.
pub struct SubjectExpander {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    max_depth: u32,
}

impl SubjectExpander {
    pub fn new(store: Arc<dyn TupleStore>, registry: Arc<NamespaceRegistry>, max_depth: u32) -> Self {
        Self {
            store,
            registry,
            max_depth,
        }
    }

    /// All subjects with `permission` on `object` within the zone, sorted
    /// for deterministic output. The wildcard subject appears as `(*, *)`
    /// when a public grant exists.
    pub async fn expand(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        let mut subjects = AHashSet::new();
        let mut visited = AHashSet::new();
        self.expand_into(permission, object, zone_id, &mut subjects, &mut visited, 0)
            .await?;

        let mut out: Vec<Entity> = subjects.into_iter().collect();
        out.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id))
        });
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn expand_into(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        subjects: &mut AHashSet<Entity>,
        visited: &mut AHashSet<ExpandVisitKey>,
        depth: u32,
    ) -> Result<()> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Ok(());
            }

            let visit_key = (
                permission.to_string(),
                object.entity_type.clone(),
                object.entity_id.clone(),
            );
            if visited.contains(&visit_key) {
                return Ok(());
            }
            visited.insert(visit_key);

            let Some(namespace) = self.registry.get(&object.entity_type) else {
                self.collect_direct(permission, object, zone_id, subjects, visited, depth)
                    .await?;
                return Ok(());
            };

            if let Some(usersets) = namespace.permission_usersets(permission) {
                for userset in usersets {
                    match userset {
                        UsersetRef::Relation(relation) => {
                            self.expand_into(
                                relation,
                                object,
                                zone_id,
                                subjects,
                                &mut visited.clone(),
                                depth + 1,
                            )
                            .await?;
                        }
                        UsersetRef::Rewrite(def) => {
                            self.expand_rewrite(def, object, zone_id, subjects, visited, depth)
                                .await?;
                        }
                    }
                }
                return Ok(());
            }

            if let Some(def) = namespace.relation_config(permission) {
                if !matches!(def, RelationDef::This {}) {
                    return self
                        .expand_rewrite(def, object, zone_id, subjects, visited, depth)
                        .await;
                }
            }

            self.collect_direct(permission, object, zone_id, subjects, visited, depth)
                .await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn expand_rewrite(
        &self,
        def: &RelationDef,
        object: &Entity,
        zone_id: &str,
        subjects: &mut AHashSet<Entity>,
        visited: &mut AHashSet<ExpandVisitKey>,
        depth: u32,
    ) -> Result<()> {
        Box::pin(async move {
            match def {
                RelationDef::This {} => Ok(()),
                RelationDef::Union(members) => {
                    for member in members {
                        self.expand_into(
                            member,
                            object,
                            zone_id,
                            subjects,
                            &mut visited.clone(),
                            depth + 1,
                        )
                        .await?;
                    }
                    Ok(())
                }
                RelationDef::Intersection(members) => {
                    // Subjects granted by every member.
                    let mut intersection: Option<AHashSet<Entity>> = None;
                    for member in members {
                        let mut member_subjects = AHashSet::new();
                        self.expand_into(
                            member,
                            object,
                            zone_id,
                            &mut member_subjects,
                            &mut visited.clone(),
                            depth + 1,
                        )
                        .await?;
                        intersection = Some(match intersection {
                            None => member_subjects,
                            Some(acc) => {
                                acc.intersection(&member_subjects).cloned().collect()
                            }
                        });
                    }
                    if let Some(intersection) = intersection {
                        subjects.extend(intersection);
                    }
                    Ok(())
                }
                RelationDef::Exclusion { include, exclude } => {
                    let mut included = AHashSet::new();
                    self.expand_into(
                        include,
                        object,
                        zone_id,
                        &mut included,
                        &mut visited.clone(),
                        depth + 1,
                    )
                    .await?;
                    let mut excluded = AHashSet::new();
                    self.expand_into(
                        exclude,
                        object,
                        zone_id,
                        &mut excluded,
                        &mut visited.clone(),
                        depth + 1,
                    )
                    .await?;
                    subjects.extend(included.difference(&excluded).cloned());
                    Ok(())
                }
                RelationDef::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let mut related = self
                        .store
                        .find_related_objects(object, tupleset, zone_id)
                        .await?;
                    if let Some(parent) = crate::graph::virtual_parent(object, tupleset) {
                        if !related.contains(&parent) {
                            related.push(parent);
                        }
                    }
                    debug!(
                        %tupleset,
                        count = related.len(),
                        "expanding tupleToUserset targets"
                    );
                    for next in &related {
                        self.expand_into(
                            computed_userset,
                            next,
                            zone_id,
                            subjects,
                            &mut visited.clone(),
                            depth + 1,
                        )
                        .await?;
                    }
                    Ok(())
                }
            }
        })
        .await
    }

    /// Direct grants on the object: concrete subjects as-is, userset
    /// subjects expanded into their members.
    #[allow(clippy::too_many_arguments)]
    async fn collect_direct(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        subjects: &mut AHashSet<Entity>,
        visited: &mut AHashSet<ExpandVisitKey>,
        depth: u32,
    ) -> Result<()> {
        for subject in self
            .store
            .find_subjects_with_relation(object, relation, zone_id)
            .await?
        {
            subjects.insert(subject);
        }

        // Userset grants contribute their members, not the set itself.
        for set in self.store.find_subject_sets(relation, object, zone_id).await? {
            subjects.remove(&set.entity);
            self.expand_into(
                &set.relation,
                &set.entity,
                zone_id,
                subjects,
                &mut visited.clone(),
                depth + 1,
            )
            .await?;
        }
        Ok(())
    }
}
