//! Permission computation via graph traversal over the live tuple store.
//!
//! The computer answers "may subject S perform permission P on object O in
//! zone Z" by expanding the object type's namespace config: declared
//! permissions first, then relation operators, then direct tuples. Depth
//! overruns and revisits produce explicit denials, never errors.

use ahash::AHashSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::conditions::AccessContext;
use crate::error::Result;
use crate::models::Entity;
use crate::repository::TupleStore;
use crate::schema::{NamespaceRegistry, RelationDef, UsersetRef};

/// Default traversal depth limit. Exceeding it denies; it never allows.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

type VisitKey = (String, String, String, String, String);

/// One node of an explanation tree: which branch was explored and why it
/// granted or denied.
#[derive(Debug, Clone, Serialize)]
pub struct PathNode {
    pub subject: String,
    pub permission: String,
    pub object: String,
    pub depth: u32,
    pub granted: bool,
    /// Branch kind: "direct", "permission", "union", "intersection",
    /// "exclusion", "tupleToUserset".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'static str>,
    /// Usersets or relations this node expanded into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_to: Option<Vec<String>>,
    /// The member that granted, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    /// The tuple that satisfied a direct check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuple_id: Option<Uuid>,
    /// Depth-limit or cycle diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_paths: Vec<PathNode>,
}

impl PathNode {
    fn new(subject: &Entity, permission: &str, object: &Entity, depth: u32) -> Self {
        Self {
            subject: subject.to_string(),
            permission: permission.to_string(),
            object: object.to_string(),
            depth,
            granted: false,
            branch: None,
            expanded_to: None,
            via: None,
            tuple_id: None,
            error: None,
            sub_paths: Vec::new(),
        }
    }
}

/// Result of `explain`: the decision plus the explored paths and a
/// human-readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub granted: bool,
    pub reason: String,
    pub paths: Vec<PathNode>,
}

impl Explanation {
    fn reason_for(subject: &Entity, permission: &str, object: &Entity, paths: &[PathNode]) -> String {
        let granting = paths.iter().find(|p| p.granted);
        match granting {
            Some(path) => {
                let mut reason = format!("{subject} has '{permission}' on {object}");
                if let Some(via) = &path.via {
                    reason.push_str(&format!(" via '{via}'"));
                }
                if let Some(branch) = path.branch {
                    reason.push_str(&format!(" ({branch})"));
                }
                reason
            }
            None => format!("{subject} does not have '{permission}' on {object}: no granting path"),
        }
    }
}

/// Zanzibar-style permission computer over a live tuple store.
pub struct PermissionComputer {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    max_depth: u32,
}

impl PermissionComputer {
    pub fn new(store: Arc<dyn TupleStore>, registry: Arc<NamespaceRegistry>) -> Self {
        Self {
            store,
            registry,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Entry point for a single check.
    pub async fn check(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
    ) -> Result<bool> {
        let mut visited = AHashSet::new();
        self.compute(subject, permission, object, zone_id, &mut visited, 0, context)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn compute(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        visited: &mut AHashSet<VisitKey>,
        depth: u32,
        context: Option<&AccessContext>,
    ) -> Result<bool> {
        Box::pin(async move {
            if depth > self.max_depth {
                debug!(
                    max_depth = self.max_depth,
                    %permission,
                    subject = %subject,
                    object = %object,
                    "depth limit exceeded, denying"
                );
                return Ok(false);
            }

            let visit_key = (
                subject.entity_type.clone(),
                subject.entity_id.clone(),
                permission.to_string(),
                object.entity_type.clone(),
                object.entity_id.clone(),
            );
            if visited.contains(&visit_key) {
                debug!(%permission, subject = %subject, object = %object, "cycle, denying");
                return Ok(false);
            }
            visited.insert(visit_key);

            let Some(namespace) = self.registry.get(&object.entity_type) else {
                return self
                    .has_direct_relation(subject, permission, object, zone_id, context, depth)
                    .await;
            };

            // Declared permissions take precedence over same-named relations.
            if let Some(usersets) = namespace.permission_usersets(permission) {
                for userset in usersets {
                    let granted = match userset {
                        UsersetRef::Relation(relation) => {
                            self.compute(
                                subject,
                                relation,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                context,
                            )
                            .await?
                        }
                        UsersetRef::Rewrite(def) => {
                            self.evaluate_rewrite(
                                subject, def, object, zone_id, visited, depth, context,
                            )
                            .await?
                        }
                    };
                    if granted {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }

            if let Some(def) = namespace.relation_config(permission) {
                return match def {
                    RelationDef::This {} => {
                        self.has_direct_relation(subject, permission, object, zone_id, context, depth)
                            .await
                    }
                    _ => {
                        self.evaluate_rewrite(subject, def, object, zone_id, visited, depth, context)
                            .await
                    }
                };
            }

            // Not declared at all: fall back to a direct tuple check.
            self.has_direct_relation(subject, permission, object, zone_id, context, depth)
                .await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_rewrite(
        &self,
        subject: &Entity,
        def: &RelationDef,
        object: &Entity,
        zone_id: &str,
        visited: &mut AHashSet<VisitKey>,
        depth: u32,
        context: Option<&AccessContext>,
    ) -> Result<bool> {
        Box::pin(async move {
            match def {
                RelationDef::This {} => Ok(false),
                RelationDef::Union(members) => {
                    for member in members {
                        if self
                            .compute(
                                subject,
                                member,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                context,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RelationDef::Intersection(members) => {
                    if members.is_empty() {
                        return Ok(false);
                    }
                    for member in members {
                        if !self
                            .compute(
                                subject,
                                member,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                context,
                            )
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RelationDef::Exclusion { include, exclude } => {
                    let included = self
                        .compute(
                            subject,
                            include,
                            object,
                            zone_id,
                            &mut visited.clone(),
                            depth + 1,
                            context,
                        )
                        .await?;
                    if !included {
                        return Ok(false);
                    }
                    let excluded = self
                        .compute(
                            subject,
                            exclude,
                            object,
                            zone_id,
                            &mut visited.clone(),
                            depth + 1,
                            context,
                        )
                        .await?;
                    Ok(!excluded)
                }
                RelationDef::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    // Parent pattern: objects reachable from `object` via the
                    // tupleset relation, plus the path-derived parent for the
                    // virtual filesystem hierarchy.
                    let mut related = self
                        .store
                        .find_related_objects(object, tupleset, zone_id)
                        .await?;
                    if let Some(parent) = crate::graph::virtual_parent(object, tupleset) {
                        if !related.contains(&parent) {
                            related.push(parent);
                        }
                    }
                    for next in &related {
                        if self
                            .compute(
                                subject,
                                computed_userset,
                                next,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                context,
                            )
                            .await?
                        {
                            debug!(%tupleset, via = %next, "granted via tupleToUserset (parent)");
                            return Ok(true);
                        }
                    }
                    // Group pattern: subjects holding the tupleset relation
                    // on `object`.
                    let holders = self
                        .store
                        .find_subjects_with_relation(object, tupleset, zone_id)
                        .await?;
                    for next in &holders {
                        if self
                            .compute(
                                subject,
                                computed_userset,
                                next,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                context,
                            )
                            .await?
                        {
                            debug!(%tupleset, via = %next, "granted via tupleToUserset (group)");
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        })
        .await
    }

    /// Direct check: the store's ladder (exact, wildcard, cross-zone
    /// wildcard, cross-zone share) plus userset-as-subject grants.
    pub async fn has_direct_relation(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
        depth: u32,
    ) -> Result<bool> {
        Ok(self
            .find_direct_relation_tuple(subject, relation, object, zone_id, context, depth)
            .await?
            .is_some())
    }

    /// Direct check returning the granting tuple id for explanations.
    #[allow(clippy::too_many_arguments)]
    async fn find_direct_relation_tuple(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
        depth: u32,
    ) -> Result<Option<Uuid>> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Ok(None);
            }

            if let Some(tuple) = self
                .store
                .find_direct_tuple(subject, relation, object, zone_id, context)
                .await?
            {
                return Ok(Some(tuple.tuple_id));
            }

            // Userset-as-subject grants, e.g. (group:eng#member, editor, f):
            // granted when the subject holds `member` on group:eng. The
            // userset tuple itself is the carrier cited in explanations.
            let subject_sets = self.store.find_subject_sets(relation, object, zone_id).await?;
            for set in subject_sets {
                if self
                    .find_direct_relation_tuple(
                        subject,
                        &set.relation,
                        &set.entity,
                        zone_id,
                        context,
                        depth + 1,
                    )
                    .await?
                    .is_some()
                {
                    return Ok(Some(set.tuple_id));
                }
            }

            Ok(None)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Explanation mode
    // ------------------------------------------------------------------

    /// Run the check while accumulating an explanation tree. The decision is
    /// identical to `check`.
    pub async fn explain(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> Result<Explanation> {
        let mut visited = AHashSet::new();
        let mut paths = Vec::new();
        let granted = self
            .explain_compute(subject, permission, object, zone_id, &mut visited, 0, &mut paths)
            .await?;
        let reason = Explanation::reason_for(subject, permission, object, &paths);
        Ok(Explanation {
            granted,
            reason,
            paths,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn explain_compute(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        visited: &mut AHashSet<VisitKey>,
        depth: u32,
        paths: &mut Vec<PathNode>,
    ) -> Result<bool> {
        Box::pin(async move {
            let mut node = PathNode::new(subject, permission, object, depth);

            if depth > self.max_depth {
                node.error = Some(format!("depth limit exceeded (max={})", self.max_depth));
                paths.push(node);
                return Ok(false);
            }

            let visit_key = (
                subject.entity_type.clone(),
                subject.entity_id.clone(),
                permission.to_string(),
                object.entity_type.clone(),
                object.entity_id.clone(),
            );
            if visited.contains(&visit_key) {
                node.error = Some("cycle detected".to_string());
                paths.push(node);
                return Ok(false);
            }
            visited.insert(visit_key);

            let namespace = self.registry.get(&object.entity_type);

            let Some(namespace) = namespace else {
                let tuple_id = self
                    .find_direct_relation_tuple(subject, permission, object, zone_id, None, depth)
                    .await?;
                node.branch = Some("direct");
                node.granted = tuple_id.is_some();
                node.tuple_id = tuple_id;
                paths.push(node);
                return Ok(tuple_id.is_some());
            };

            if let Some(usersets) = namespace.permission_usersets(permission) {
                node.branch = Some("permission");
                node.expanded_to = Some(
                    usersets
                        .iter()
                        .map(|u| match u {
                            UsersetRef::Relation(name) => name.clone(),
                            UsersetRef::Rewrite(def) => rewrite_label(def),
                        })
                        .collect(),
                );

                for userset in usersets {
                    let mut sub_paths = Vec::new();
                    let granted = match userset {
                        UsersetRef::Relation(relation) => {
                            self.explain_compute(
                                subject,
                                relation,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                &mut sub_paths,
                            )
                            .await?
                        }
                        UsersetRef::Rewrite(def) => {
                            self.explain_rewrite(
                                subject,
                                def,
                                object,
                                zone_id,
                                visited,
                                depth,
                                &mut sub_paths,
                            )
                            .await?
                        }
                    };
                    if granted {
                        node.granted = true;
                        node.via = Some(match userset {
                            UsersetRef::Relation(name) => name.clone(),
                            UsersetRef::Rewrite(def) => rewrite_label(def),
                        });
                        node.sub_paths = sub_paths;
                        paths.push(node);
                        return Ok(true);
                    }
                    node.sub_paths.extend(sub_paths);
                }
                paths.push(node);
                return Ok(false);
            }

            if let Some(def) = namespace.relation_config(permission) {
                if !matches!(def, RelationDef::This {}) {
                    let mut sub_paths = Vec::new();
                    let granted = self
                        .explain_rewrite(subject, def, object, zone_id, visited, depth, &mut sub_paths)
                        .await?;
                    node.branch = Some(rewrite_branch(def));
                    node.granted = granted;
                    node.sub_paths = sub_paths;
                    paths.push(node);
                    return Ok(granted);
                }
            }

            let tuple_id = self
                .find_direct_relation_tuple(subject, permission, object, zone_id, None, depth)
                .await?;
            node.branch = Some("direct");
            node.granted = tuple_id.is_some();
            node.tuple_id = tuple_id;
            paths.push(node);
            Ok(tuple_id.is_some())
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn explain_rewrite(
        &self,
        subject: &Entity,
        def: &RelationDef,
        object: &Entity,
        zone_id: &str,
        visited: &mut AHashSet<VisitKey>,
        depth: u32,
        paths: &mut Vec<PathNode>,
    ) -> Result<bool> {
        Box::pin(async move {
            match def {
                RelationDef::This {} => Ok(false),
                RelationDef::Union(members) => {
                    for member in members {
                        if self
                            .explain_compute(
                                subject,
                                member,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                paths,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RelationDef::Intersection(members) => {
                    if members.is_empty() {
                        return Ok(false);
                    }
                    for member in members {
                        if !self
                            .explain_compute(
                                subject,
                                member,
                                object,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                paths,
                            )
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RelationDef::Exclusion { include, exclude } => {
                    let included = self
                        .explain_compute(
                            subject,
                            include,
                            object,
                            zone_id,
                            &mut visited.clone(),
                            depth + 1,
                            paths,
                        )
                        .await?;
                    if !included {
                        return Ok(false);
                    }
                    let excluded = self
                        .explain_compute(
                            subject,
                            exclude,
                            object,
                            zone_id,
                            &mut visited.clone(),
                            depth + 1,
                            paths,
                        )
                        .await?;
                    Ok(!excluded)
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
                    for next in &related {
                        if self
                            .explain_compute(
                                subject,
                                computed_userset,
                                next,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                paths,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    let holders = self
                        .store
                        .find_subjects_with_relation(object, tupleset, zone_id)
                        .await?;
                    for next in &holders {
                        if self
                            .explain_compute(
                                subject,
                                computed_userset,
                                next,
                                zone_id,
                                &mut visited.clone(),
                                depth + 1,
                                paths,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        })
        .await
    }
}

fn rewrite_label(def: &RelationDef) -> String {
    match def {
        RelationDef::This {} => "this".to_string(),
        RelationDef::Union(members) => format!("union({})", members.join(", ")),
        RelationDef::Intersection(members) => format!("intersection({})", members.join(", ")),
        RelationDef::Exclusion { include, exclude } => format!("{include} minus {exclude}"),
        RelationDef::TupleToUserset {
            tupleset,
            computed_userset,
        } => format!("{tupleset}->{computed_userset}"),
    }
}

fn rewrite_branch(def: &RelationDef) -> &'static str {
    match def {
        RelationDef::This {} => "direct",
        RelationDef::Union(_) => "union",
        RelationDef::Intersection(_) => "intersection",
        RelationDef::Exclusion { .. } => "exclusion",
        RelationDef::TupleToUserset { .. } => "tupleToUserset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TupleSubject, TupleWrite, DEFAULT_ZONE};
    use crate::repository::MemoryTupleStore;

    fn computer(store: Arc<MemoryTupleStore>) -> PermissionComputer {
        let registry = Arc::new(NamespaceRegistry::with_filesystem_schema());
        PermissionComputer::new(store, registry)
    }

    #[tokio::test]
    async fn direct_grant_expands_through_permissions() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("alice"),
                "direct_viewer",
                Entity::file("/a.txt"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        let computer = computer(store);

        assert!(computer
            .check(&Entity::user("alice"), "read", &Entity::file("/a.txt"), DEFAULT_ZONE, None)
            .await
            .unwrap());
        assert!(!computer
            .check(&Entity::user("bob"), "read", &Entity::file("/a.txt"), DEFAULT_ZONE, None)
            .await
            .unwrap());
        assert!(!computer
            .check(&Entity::user("alice"), "write", &Entity::file("/a.txt"), DEFAULT_ZONE, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn parent_inheritance_grants_descendants() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("alice"),
                "direct_viewer",
                Entity::file("/proj"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        store
            .insert(TupleWrite::new(
                Entity::file("/proj/a.txt"),
                "parent",
                Entity::file("/proj"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        let computer = computer(store);

        assert!(computer
            .check(
                &Entity::user("alice"),
                "read",
                &Entity::file("/proj/a.txt"),
                DEFAULT_ZONE,
                None
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn group_membership_grants_through_userset_subject() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("carol"),
                "member",
                Entity::group("eng"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        store
            .insert(TupleWrite::new(
                TupleSubject::userset(Entity::group("eng"), "member"),
                "direct_editor",
                Entity::file("/src.txt"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        let computer = computer(store);

        assert!(computer
            .check(&Entity::user("carol"), "write", &Entity::file("/src.txt"), DEFAULT_ZONE, None)
            .await
            .unwrap());
        assert!(!computer
            .check(&Entity::user("dave"), "write", &Entity::file("/src.txt"), DEFAULT_ZONE, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zone_isolation_denies_other_zone() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("alice"),
                "direct_viewer",
                Entity::file("/x"),
                "z1",
            ))
            .await
            .unwrap();
        let computer = computer(store);

        assert!(computer
            .check(&Entity::user("alice"), "read", &Entity::file("/x"), "z1", None)
            .await
            .unwrap());
        assert!(!computer
            .check(&Entity::user("alice"), "read", &Entity::file("/x"), "z2", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cross_zone_share_visible_from_object_zone() {
        let store = Arc::new(MemoryTupleStore::new());
        store
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
        let computer = computer(store);

        assert!(computer
            .check(
                &Entity::user("alice@partner"),
                "read",
                &Entity::file("/doc"),
                "z_acme",
                None
            )
            .await
            .unwrap());
        // Visible from the recipient's zone too (shared-* rung).
        assert!(computer
            .check(
                &Entity::user("alice@partner"),
                "read",
                &Entity::file("/doc"),
                "z_partner",
                None
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn explain_matches_check_and_names_the_branch() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("alice"),
                "direct_viewer",
                Entity::file("/a.txt"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        let computer = computer(store);

        let explanation = computer
            .explain(&Entity::user("alice"), "read", &Entity::file("/a.txt"), DEFAULT_ZONE)
            .await
            .unwrap();
        assert!(explanation.granted);
        assert!(explanation.reason.contains("direct_viewer"));
        assert_eq!(explanation.paths.len(), 1);
        assert_eq!(explanation.paths[0].branch, Some("permission"));
        assert_eq!(explanation.paths[0].via.as_deref(), Some("direct_viewer"));

        let denial = computer
            .explain(&Entity::user("bob"), "read", &Entity::file("/a.txt"), DEFAULT_ZONE)
            .await
            .unwrap();
        assert!(!denial.granted);
        assert!(denial.reason.contains("no granting path"));

        // explain(x).result == check(x)
        for (user, expected) in [("alice", true), ("bob", false)] {
            let checked = computer
                .check(&Entity::user(user), "read", &Entity::file("/a.txt"), DEFAULT_ZONE, None)
                .await
                .unwrap();
            assert_eq!(checked, expected);
        }
    }

    #[tokio::test]
    async fn unknown_namespace_uses_direct_tuples_only() {
        let store = Arc::new(MemoryTupleStore::new());
        store
            .insert(TupleWrite::new(
                Entity::user("alice"),
                "custodian",
                Entity::new("vault", "v1"),
                DEFAULT_ZONE,
            ))
            .await
            .unwrap();
        let computer = computer(store);

        assert!(computer
            .check(
                &Entity::user("alice"),
                "custodian",
                &Entity::new("vault", "v1"),
                DEFAULT_ZONE,
                None
            )
            .await
            .unwrap());
        assert!(!computer
            .check(
                &Entity::user("alice"),
                "other",
                &Entity::new("vault", "v1"),
                DEFAULT_ZONE,
                None
            )
            .await
            .unwrap());
    }
}
