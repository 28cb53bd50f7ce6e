//! Prefetched permission graph for bulk evaluation.
//!
//! The bulk pipeline fetches every relevant tuple once, indexes it three
//! ways, and evaluates all checks in memory with a shared memo table. The
//! traversal mirrors the live `PermissionComputer` so bulk and single
//! checks agree.

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;

use crate::models::{Entity, RelationshipTuple, SubjectSet};
use crate::schema::{NamespaceSnapshot, RelationDef, UsersetRef};

/// Maximum traversal depth for in-memory compute. Matches the live
/// computer's default.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

type TupleKey = (String, String, String, String, String);
type EdgeKey = (String, String, String);

/// Memoization key: one entry per (subject, permission, object).
pub type MemoKey = (String, String, String, String, String);

/// Shared memo table. A `DashMap` so the rayon path and the sequential path
/// use the same structure and produce identical results.
pub type SharedMemo = DashMap<MemoKey, bool, ahash::RandomState>;

type VisitedSet = AHashSet<MemoKey>;

/// Tuple graph with O(1) lookups for the three traversal patterns.
#[derive(Debug, Default)]
pub struct TupleGraph {
    /// (object_type, object_id, relation, subject_type, subject_id) for
    /// concrete-subject tuples.
    tuple_index: AHashSet<TupleKey>,
    /// (subject_type, subject_id, relation) -> objects; parent-pattern
    /// adjacency (`find_related_objects`).
    adjacency: AHashMap<EdgeKey, Vec<Entity>>,
    /// (object_type, object_id, relation) -> subjects; group-pattern
    /// adjacency (`find_subjects_with_relation`).
    reverse_adjacency: AHashMap<EdgeKey, Vec<Entity>>,
    /// (object_type, object_id, relation) -> userset-as-subject grants.
    userset_index: AHashMap<EdgeKey, Vec<SubjectSet>>,
}

impl TupleGraph {
    pub fn from_tuples(tuples: &[RelationshipTuple]) -> Self {
        let mut graph = TupleGraph::default();
        for tuple in tuples {
            graph.add_tuple(tuple);
        }
        graph
    }

    pub fn add_tuple(&mut self, tuple: &RelationshipTuple) {
        let object_key = (
            tuple.object.entity_type.clone(),
            tuple.object.entity_id.clone(),
            tuple.relation.clone(),
        );

        match &tuple.subject.relation {
            Some(subject_relation) => {
                self.userset_index
                    .entry(object_key.clone())
                    .or_default()
                    .push(SubjectSet {
                        tuple_id: tuple.tuple_id,
                        entity: tuple.subject.entity.clone(),
                        relation: subject_relation.clone(),
                    });
            }
            None => {
                self.tuple_index.insert((
                    tuple.object.entity_type.clone(),
                    tuple.object.entity_id.clone(),
                    tuple.relation.clone(),
                    tuple.subject.entity.entity_type.clone(),
                    tuple.subject.entity.entity_id.clone(),
                ));
            }
        }

        self.adjacency
            .entry((
                tuple.subject.entity.entity_type.clone(),
                tuple.subject.entity.entity_id.clone(),
                tuple.relation.clone(),
            ))
            .or_default()
            .push(tuple.object.clone());

        self.reverse_adjacency
            .entry(object_key)
            .or_default()
            .push(tuple.subject.entity.clone());
    }

    /// Synthesized edge used for the in-memory filesystem hierarchy.
    pub fn add_parent_edge(&mut self, child: &Entity, parent: &Entity) {
        self.tuple_index.insert((
            parent.entity_type.clone(),
            parent.entity_id.clone(),
            "parent".to_string(),
            child.entity_type.clone(),
            child.entity_id.clone(),
        ));
        self.adjacency
            .entry((
                child.entity_type.clone(),
                child.entity_id.clone(),
                "parent".to_string(),
            ))
            .or_default()
            .push(parent.clone());
        self.reverse_adjacency
            .entry((
                parent.entity_type.clone(),
                parent.entity_id.clone(),
                "parent".to_string(),
            ))
            .or_default()
            .push(child.clone());
    }

    /// Direct concrete grant, including the wildcard subject.
    pub fn has_direct_relation(&self, subject: &Entity, relation: &str, object: &Entity) -> bool {
        let exact = (
            object.entity_type.clone(),
            object.entity_id.clone(),
            relation.to_string(),
            subject.entity_type.clone(),
            subject.entity_id.clone(),
        );
        if self.tuple_index.contains(&exact) {
            return true;
        }
        let wildcard = (
            object.entity_type.clone(),
            object.entity_id.clone(),
            relation.to_string(),
            "*".to_string(),
            "*".to_string(),
        );
        self.tuple_index.contains(&wildcard)
    }

    pub fn related_objects(&self, object: &Entity, relation: &str) -> &[Entity] {
        self.adjacency
            .get(&(
                object.entity_type.clone(),
                object.entity_id.clone(),
                relation.to_string(),
            ))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn subjects_with_relation(&self, object: &Entity, relation: &str) -> &[Entity] {
        self.reverse_adjacency
            .get(&(
                object.entity_type.clone(),
                object.entity_id.clone(),
                relation.to_string(),
            ))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn usersets(&self, object: &Entity, relation: &str) -> &[SubjectSet] {
        self.userset_index
            .get(&(
                object.entity_type.clone(),
                object.entity_id.clone(),
                relation.to_string(),
            ))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Parent of a hierarchical path: `/a/b/c.txt` -> `/a/b`, `/a` -> `/`,
/// `/` -> none.
pub(crate) fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

/// Every ancestor of a path including itself, root last.
pub(crate) fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = vec![path.to_string()];
    let mut current = path.to_string();
    while let Some(parent) = parent_path(&current) {
        chain.push(parent.clone());
        current = parent;
    }
    chain
}

/// The virtual filesystem hierarchy: a hierarchical `file` id implies its
/// parent edge without a stored tuple. Applied identically by the live
/// computer, the expander and the bulk graph so all paths agree.
pub(crate) fn virtual_parent(object: &Entity, tupleset: &str) -> Option<Entity> {
    if tupleset == "parent" && object.entity_type == "file" && object.entity_id.starts_with('/') {
        parent_path(&object.entity_id).map(|parent| Entity::new("file", parent))
    } else {
        None
    }
}

fn memo_key(subject: &Entity, permission: &str, object: &Entity) -> MemoKey {
    (
        subject.entity_type.clone(),
        subject.entity_id.clone(),
        permission.to_string(),
        object.entity_type.clone(),
        object.entity_id.clone(),
    )
}

/// Compute one check against the prefetched graph.
///
/// Traversal order matches the live computer: declared permissions first,
/// then relation operators, then the direct check. Depth overruns and
/// revisits deny.
pub fn compute(
    subject: &Entity,
    permission: &str,
    object: &Entity,
    graph: &TupleGraph,
    namespaces: &NamespaceSnapshot,
    memo: &SharedMemo,
    visited: &mut VisitedSet,
    depth: u32,
    max_depth: u32,
) -> bool {
    if depth > max_depth {
        return false;
    }

    let key = memo_key(subject, permission, object);
    if let Some(result) = memo.get(&key) {
        return *result;
    }
    if visited.contains(&key) {
        return false;
    }
    visited.insert(key.clone());

    let namespace = namespaces.get(&object.entity_type);

    let result = match namespace {
        None => direct_with_usersets(
            subject, permission, object, graph, namespaces, memo, visited, depth, max_depth,
        ),
        Some(namespace) => {
            if let Some(usersets) = namespace.permission_usersets(permission) {
                usersets.iter().any(|userset| match userset {
                    UsersetRef::Relation(relation) => compute(
                        subject,
                        relation,
                        object,
                        graph,
                        namespaces,
                        memo,
                        &mut visited.clone(),
                        depth + 1,
                        max_depth,
                    ),
                    UsersetRef::Rewrite(def) => evaluate_rewrite(
                        subject, def, object, graph, namespaces, memo, visited, depth, max_depth,
                    ),
                })
            } else if let Some(def) = namespace.relation_config(permission) {
                match def {
                    RelationDef::This {} => direct_with_usersets(
                        subject, permission, object, graph, namespaces, memo, visited, depth,
                        max_depth,
                    ),
                    _ => evaluate_rewrite(
                        subject, def, object, graph, namespaces, memo, visited, depth, max_depth,
                    ),
                }
            } else {
                direct_with_usersets(
                    subject, permission, object, graph, namespaces, memo, visited, depth, max_depth,
                )
            }
        }
    };

    memo.insert(key, result);
    result
}

/// Evaluate a rewrite rule (union / intersection / exclusion /
/// tupleToUserset) in place.
#[allow(clippy::too_many_arguments)]
fn evaluate_rewrite(
    subject: &Entity,
    def: &RelationDef,
    object: &Entity,
    graph: &TupleGraph,
    namespaces: &NamespaceSnapshot,
    memo: &SharedMemo,
    visited: &mut VisitedSet,
    depth: u32,
    max_depth: u32,
) -> bool {
    match def {
        RelationDef::This {} => false,
        RelationDef::Union(members) => members.iter().any(|member| {
            compute(
                subject,
                member,
                object,
                graph,
                namespaces,
                memo,
                &mut visited.clone(),
                depth + 1,
                max_depth,
            )
        }),
        RelationDef::Intersection(members) => {
            !members.is_empty()
                && members.iter().all(|member| {
                    compute(
                        subject,
                        member,
                        object,
                        graph,
                        namespaces,
                        memo,
                        &mut visited.clone(),
                        depth + 1,
                        max_depth,
                    )
                })
        }
        RelationDef::Exclusion { include, exclude } => {
            compute(
                subject,
                include,
                object,
                graph,
                namespaces,
                memo,
                &mut visited.clone(),
                depth + 1,
                max_depth,
            ) && !compute(
                subject,
                exclude,
                object,
                graph,
                namespaces,
                memo,
                &mut visited.clone(),
                depth + 1,
                max_depth,
            )
        }
        RelationDef::TupleToUserset {
            tupleset,
            computed_userset,
        } => {
            // Parent pattern: objects this object points to via the tupleset.
            let via_parent = graph.related_objects(object, tupleset).iter().any(|next| {
                compute(
                    subject,
                    computed_userset,
                    next,
                    graph,
                    namespaces,
                    memo,
                    &mut visited.clone(),
                    depth + 1,
                    max_depth,
                )
            });
            if via_parent {
                return true;
            }
            // Group pattern: subjects holding the tupleset relation on it.
            graph
                .subjects_with_relation(object, tupleset)
                .iter()
                .any(|next| {
                    compute(
                        subject,
                        computed_userset,
                        next,
                        graph,
                        namespaces,
                        memo,
                        &mut visited.clone(),
                        depth + 1,
                        max_depth,
                    )
                })
        }
    }
}

/// Direct grant plus userset-as-subject grants.
#[allow(clippy::too_many_arguments)]
fn direct_with_usersets(
    subject: &Entity,
    relation: &str,
    object: &Entity,
    graph: &TupleGraph,
    namespaces: &NamespaceSnapshot,
    memo: &SharedMemo,
    visited: &mut VisitedSet,
    depth: u32,
    max_depth: u32,
) -> bool {
    if graph.has_direct_relation(subject, relation, object) {
        return true;
    }
    graph.usersets(object, relation).iter().any(|userset| {
        compute(
            subject,
            &userset.relation,
            &userset.entity,
            graph,
            namespaces,
            memo,
            &mut visited.clone(),
            depth + 1,
            max_depth,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TupleSubject, TupleWrite};
    use crate::schema::{filesystem_schema, NamespaceConfig};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn tuple(subject: TupleSubject, relation: &str, object: Entity) -> RelationshipTuple {
        let write = TupleWrite::new(subject, relation, object, "z1");
        RelationshipTuple {
            tuple_id: Uuid::new_v4(),
            subject: write.subject,
            relation: write.relation,
            object: write.object,
            zone_id: write.zone_id.clone(),
            subject_zone_id: write.zone_id.clone(),
            object_zone_id: write.zone_id,
            conditions: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn fs_namespaces() -> NamespaceSnapshot {
        Arc::new(
            filesystem_schema()
                .into_iter()
                .map(|(k, v)| (k, Arc::new(v)))
                .collect(),
        )
    }

    fn check(
        graph: &TupleGraph,
        namespaces: &NamespaceSnapshot,
        subject: &Entity,
        permission: &str,
        object: &Entity,
    ) -> bool {
        let memo = SharedMemo::default();
        compute(
            subject,
            permission,
            object,
            graph,
            namespaces,
            &memo,
            &mut AHashSet::new(),
            0,
            DEFAULT_MAX_DEPTH,
        )
    }

    #[test]
    fn direct_grant_resolves_through_permission_expansion() {
        let graph = TupleGraph::from_tuples(&[tuple(
            Entity::user("alice").into(),
            "direct_viewer",
            Entity::file("/a.txt"),
        )]);
        let namespaces = fs_namespaces();

        assert!(check(
            &graph,
            &namespaces,
            &Entity::user("alice"),
            "read",
            &Entity::file("/a.txt")
        ));
        assert!(!check(
            &graph,
            &namespaces,
            &Entity::user("bob"),
            "read",
            &Entity::file("/a.txt")
        ));
        assert!(!check(
            &graph,
            &namespaces,
            &Entity::user("alice"),
            "write",
            &Entity::file("/a.txt")
        ));
    }

    #[test]
    fn parent_inheritance_via_synthesized_edges() {
        let mut graph = TupleGraph::from_tuples(&[tuple(
            Entity::user("alice").into(),
            "direct_viewer",
            Entity::file("/proj"),
        )]);
        graph.add_parent_edge(&Entity::file("/proj/a.txt"), &Entity::file("/proj"));
        let namespaces = fs_namespaces();

        assert!(check(
            &graph,
            &namespaces,
            &Entity::user("alice"),
            "read",
            &Entity::file("/proj/a.txt")
        ));
    }

    #[test]
    fn group_membership_via_userset_subject() {
        let graph = TupleGraph::from_tuples(&[
            tuple(Entity::user("carol").into(), "member", Entity::group("eng")),
            tuple(
                TupleSubject::userset(Entity::group("eng"), "member"),
                "direct_editor",
                Entity::file("/src.txt"),
            ),
        ]);
        let namespaces = fs_namespaces();

        assert!(check(
            &graph,
            &namespaces,
            &Entity::user("carol"),
            "write",
            &Entity::file("/src.txt")
        ));
        assert!(!check(
            &graph,
            &namespaces,
            &Entity::user("mallory"),
            "write",
            &Entity::file("/src.txt")
        ));
    }

    #[test]
    fn wildcard_grants_any_subject() {
        let graph = TupleGraph::from_tuples(&[tuple(
            Entity::wildcard().into(),
            "direct_viewer",
            Entity::file("/public.txt"),
        )]);
        let namespaces = fs_namespaces();

        assert!(check(
            &graph,
            &namespaces,
            &Entity::user("anyone"),
            "read",
            &Entity::file("/public.txt")
        ));
    }

    #[test]
    fn intersection_and_exclusion_operators() {
        let mut relations = HashMap::new();
        relations.insert("employee".to_string(), RelationDef::This {});
        relations.insert("cleared".to_string(), RelationDef::This {});
        relations.insert("banned".to_string(), RelationDef::This {});
        relations.insert(
            "secure_access".to_string(),
            RelationDef::Intersection(vec!["employee".to_string(), "cleared".to_string()]),
        );
        relations.insert(
            "allowed".to_string(),
            RelationDef::Exclusion {
                include: "employee".to_string(),
                exclude: "banned".to_string(),
            },
        );
        let mut namespaces: HashMap<String, Arc<NamespaceConfig>> = HashMap::new();
        namespaces.insert(
            "vault".to_string(),
            Arc::new(NamespaceConfig {
                relations,
                permissions: HashMap::new(),
            }),
        );
        let namespaces: NamespaceSnapshot = Arc::new(namespaces);

        let vault = Entity::new("vault", "v1");
        let graph = TupleGraph::from_tuples(&[
            tuple(Entity::user("alice").into(), "employee", vault.clone()),
            tuple(Entity::user("alice").into(), "cleared", vault.clone()),
            tuple(Entity::user("bob").into(), "employee", vault.clone()),
            tuple(Entity::user("bob").into(), "banned", vault.clone()),
        ]);

        assert!(check(&graph, &namespaces, &Entity::user("alice"), "secure_access", &vault));
        assert!(!check(&graph, &namespaces, &Entity::user("bob"), "secure_access", &vault));

        assert!(check(&graph, &namespaces, &Entity::user("alice"), "allowed", &vault));
        assert!(!check(&graph, &namespaces, &Entity::user("bob"), "allowed", &vault));
    }

    #[test]
    fn deep_chains_are_cut_at_max_depth() {
        let mut graph = TupleGraph::default();
        // Chain far deeper than the limit.
        for i in 0..32 {
            graph.add_parent_edge(
                &Entity::new("file", format!("/n{i}")),
                &Entity::new("file", format!("/n{}", i + 1)),
            );
        }
        graph.add_tuple(&tuple(
            Entity::user("alice").into(),
            "direct_viewer",
            Entity::file("/n32"),
        ));
        let namespaces = fs_namespaces();

        // Grant sits 32 hops up; traversal stops at depth 10 and denies.
        assert!(!check(
            &graph,
            &namespaces,
            &Entity::user("alice"),
            "read",
            &Entity::file("/n0")
        ));
        // Within the limit the same shape grants.
        assert!(check(
            &graph,
            &namespaces,
            &Entity::user("alice"),
            "read",
            &Entity::file("/n30")
        ));
    }

    #[test]
    fn memo_is_shared_across_checks() {
        let graph = TupleGraph::from_tuples(&[tuple(
            Entity::user("alice").into(),
            "direct_viewer",
            Entity::file("/a.txt"),
        )]);
        let namespaces = fs_namespaces();
        let memo = SharedMemo::default();

        for _ in 0..3 {
            assert!(compute(
                &Entity::user("alice"),
                "read",
                &Entity::file("/a.txt"),
                &graph,
                &namespaces,
                &memo,
                &mut AHashSet::new(),
                0,
                DEFAULT_MAX_DEPTH,
            ));
        }
        assert!(!memo.is_empty());
    }
}
