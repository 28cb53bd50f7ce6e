//! Namespace schema engine.
//!
//! Each object type has a namespace config: which relations exist, how they
//! rewrite (union / intersection / exclusion / tupleToUserset), and which
//! usersets satisfy each named permission. Schema documents (JSON or YAML)
//! are translated once into this internal representation; evaluation never
//! inspects raw documents.

use parking_lot::RwLock;
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RebacError, Result};

/// How a relation resolves. Exactly one variant per relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationDef {
    /// Granted directly by tuples carrying this relation.
    #[serde(rename = "this")]
    This {},
    /// OR of other relations.
    #[serde(rename = "union")]
    Union(Vec<String>),
    /// AND of other relations.
    #[serde(rename = "intersection")]
    Intersection(Vec<String>),
    /// `include` AND NOT `exclude`.
    #[serde(rename = "exclusion")]
    Exclusion { include: String, exclude: String },
    /// Follow `tupleset` edges, then check `computed_userset` on each target.
    #[serde(rename = "tupleToUserset")]
    TupleToUserset {
        tupleset: String,
        #[serde(rename = "computedUserset")]
        computed_userset: String,
    },
}

/// An entry in a permission's userset list: either a relation name or an
/// inline rewrite such as `{"tupleToUserset": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsersetRef {
    Relation(String),
    Rewrite(RelationDef),
}

impl From<&str> for UsersetRef {
    fn from(name: &str) -> Self {
        UsersetRef::Relation(name.to_string())
    }
}

/// Per-object-type schema: relations plus the permission → usersets map.
/// A permission is satisfied if any listed userset grants it; permissions
/// take precedence over same-named relations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub relations: HashMap<String, RelationDef>,
    #[serde(default)]
    pub permissions: HashMap<String, Vec<UsersetRef>>,
}

impl NamespaceConfig {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains_key(permission)
    }

    pub fn permission_usersets(&self, permission: &str) -> Option<&[UsersetRef]> {
        self.permissions.get(permission).map(Vec::as_slice)
    }

    pub fn relation_config(&self, relation: &str) -> Option<&RelationDef> {
        self.relations.get(relation)
    }

    pub fn has_union(&self, relation: &str) -> bool {
        matches!(self.relations.get(relation), Some(RelationDef::Union(_)))
    }

    pub fn has_intersection(&self, relation: &str) -> bool {
        matches!(
            self.relations.get(relation),
            Some(RelationDef::Intersection(_))
        )
    }

    pub fn has_exclusion(&self, relation: &str) -> bool {
        matches!(
            self.relations.get(relation),
            Some(RelationDef::Exclusion { .. })
        )
    }

    pub fn has_tuple_to_userset(&self, relation: &str) -> bool {
        matches!(
            self.relations.get(relation),
            Some(RelationDef::TupleToUserset { .. })
        )
    }

    pub fn union_members(&self, relation: &str) -> Option<&[String]> {
        match self.relations.get(relation) {
            Some(RelationDef::Union(members)) => Some(members.as_slice()),
            _ => None,
        }
    }

    pub fn intersection_members(&self, relation: &str) -> Option<&[String]> {
        match self.relations.get(relation) {
            Some(RelationDef::Intersection(members)) => Some(members.as_slice()),
            _ => None,
        }
    }

    pub fn exclusion(&self, relation: &str) -> Option<(&str, &str)> {
        match self.relations.get(relation) {
            Some(RelationDef::Exclusion { include, exclude }) => {
                Some((include.as_str(), exclude.as_str()))
            }
            _ => None,
        }
    }

    pub fn tuple_to_userset(&self, relation: &str) -> Option<(&str, &str)> {
        match self.relations.get(relation) {
            Some(RelationDef::TupleToUserset {
                tupleset,
                computed_userset,
            }) => Some((tupleset.as_str(), computed_userset.as_str())),
            _ => None,
        }
    }

    /// True if `name` is defined in this namespace, as relation or permission.
    fn defines(&self, name: &str) -> bool {
        self.relations.contains_key(name) || self.permissions.contains_key(name)
    }

    /// Validate internal references. Operator members and permission usersets
    /// must name something this namespace defines; a tupleToUserset's
    /// computed userset is resolved against the target object's type and is
    /// validated there at evaluation time.
    pub fn validate(&self, object_type: &str) -> Result<()> {
        let undefined = |kind: &str, relation: &str, referenced: &str| {
            RebacError::Namespace(format!(
                "namespace '{object_type}': {kind} '{relation}' references undefined \
                 relation '{referenced}'"
            ))
        };

        for (name, def) in &self.relations {
            match def {
                RelationDef::This {} | RelationDef::TupleToUserset { .. } => {}
                RelationDef::Union(members) | RelationDef::Intersection(members) => {
                    for member in members {
                        if !self.defines(member) {
                            return Err(undefined("relation", name, member));
                        }
                    }
                }
                RelationDef::Exclusion { include, exclude } => {
                    for referenced in [include, exclude] {
                        if !self.defines(referenced) {
                            return Err(undefined("relation", name, referenced));
                        }
                    }
                }
            }
        }

        for (permission, usersets) in &self.permissions {
            for userset in usersets {
                if let UsersetRef::Relation(referenced) = userset {
                    if !self.defines(referenced) {
                        return Err(undefined("permission", permission, referenced));
                    }
                }
            }
        }

        if self.has_reference_cycle() {
            warn!(
                object_type,
                "namespace definitions are cyclic; traversal will bottom out via its visited set"
            );
        }

        Ok(())
    }

    /// Detect cycles in the relation/permission reference graph.
    fn has_reference_cycle(&self) -> bool {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

        for (name, def) in &self.relations {
            match def {
                RelationDef::This {} | RelationDef::TupleToUserset { .. } => {}
                RelationDef::Union(members) | RelationDef::Intersection(members) => {
                    for member in members {
                        graph.add_edge(name.as_str(), member.as_str(), ());
                    }
                }
                RelationDef::Exclusion { include, exclude } => {
                    graph.add_edge(name.as_str(), include.as_str(), ());
                    graph.add_edge(name.as_str(), exclude.as_str(), ());
                }
            }
        }
        for (permission, usersets) in &self.permissions {
            for userset in usersets {
                if let UsersetRef::Relation(referenced) = userset {
                    graph.add_edge(permission.as_str(), referenced.as_str(), ());
                }
            }
        }

        is_cyclic_directed(&graph)
    }
}

/// Snapshot of all namespaces, shared immutably with readers.
pub type NamespaceSnapshot = Arc<HashMap<String, Arc<NamespaceConfig>>>;

/// Registry resolving `object_type -> NamespaceConfig`.
///
/// Read-heavy: readers take an `Arc` snapshot; reloads build a new map and
/// swap it in. Unknown object types resolve to `None` and the computer
/// degrades to direct tuple checks.
pub struct NamespaceRegistry {
    inner: RwLock<NamespaceSnapshot>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Registry preloaded with the virtual-filesystem schema.
    pub fn with_filesystem_schema() -> Self {
        let registry = Self::new();
        for (object_type, config) in filesystem_schema() {
            // Built-in schema is known-valid.
            let _ = registry.register(&object_type, config);
        }
        registry
    }

    pub fn snapshot(&self) -> NamespaceSnapshot {
        self.inner.read().clone()
    }

    pub fn get(&self, object_type: &str) -> Option<Arc<NamespaceConfig>> {
        self.inner.read().get(object_type).cloned()
    }

    pub fn object_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Register or replace one namespace. Validates before swapping.
    pub fn register(&self, object_type: &str, config: NamespaceConfig) -> Result<()> {
        config.validate(object_type)?;
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.insert(object_type.to_string(), Arc::new(config));
        *guard = Arc::new(next);
        debug!(object_type, "namespace registered");
        Ok(())
    }

    pub fn remove(&self, object_type: &str) -> bool {
        let mut guard = self.inner.write();
        if !guard.contains_key(object_type) {
            return false;
        }
        let mut next = (**guard).clone();
        next.remove(object_type);
        *guard = Arc::new(next);
        true
    }

    /// Replace the whole registry from a parsed document map.
    pub fn replace_all(&self, configs: HashMap<String, NamespaceConfig>) -> Result<()> {
        let mut next = HashMap::with_capacity(configs.len());
        for (object_type, config) in configs {
            config.validate(&object_type)?;
            next.insert(object_type, Arc::new(config));
        }
        let count = next.len();
        *self.inner.write() = Arc::new(next);
        info!(namespaces = count, "namespace registry reloaded");
        Ok(())
    }

    /// Load a `{object_type: config}` JSON document.
    pub fn load_json(&self, document: &str) -> Result<()> {
        let configs: HashMap<String, NamespaceConfig> = serde_json::from_str(document)
            .map_err(|e| RebacError::Namespace(format!("invalid schema JSON: {e}")))?;
        self.replace_all(configs)
    }

    /// Load a `{object_type: config}` YAML document.
    pub fn load_yaml(&self, document: &str) -> Result<()> {
        let configs: HashMap<String, NamespaceConfig> = serde_yaml::from_str(document)
            .map_err(|e| RebacError::Namespace(format!("invalid schema YAML: {e}")))?;
        self.replace_all(configs)
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::with_filesystem_schema()
    }
}

/// Built-in schema for the virtual filesystem: files inherit `read`/`write`
/// through `parent` edges, groups grant through membership, and the
/// `shared-*` family carries cross-zone shares.
pub fn filesystem_schema() -> HashMap<String, NamespaceConfig> {
    let mut namespaces = HashMap::new();

    let this = || RelationDef::This {};

    let mut file_relations = HashMap::new();
    for relation in [
        "direct_viewer",
        "direct_editor",
        "direct_owner",
        "parent",
        "shared-viewer",
        "shared-editor",
        "shared-owner",
    ] {
        file_relations.insert(relation.to_string(), this());
    }

    let parent_of = |computed: &str| {
        UsersetRef::Rewrite(RelationDef::TupleToUserset {
            tupleset: "parent".to_string(),
            computed_userset: computed.to_string(),
        })
    };

    let mut file_permissions = HashMap::new();
    file_permissions.insert(
        "read".to_string(),
        vec![
            "direct_viewer".into(),
            "direct_editor".into(),
            "direct_owner".into(),
            "shared-viewer".into(),
            "shared-editor".into(),
            "shared-owner".into(),
            parent_of("read"),
        ],
    );
    file_permissions.insert(
        "write".to_string(),
        vec![
            "direct_editor".into(),
            "direct_owner".into(),
            "shared-editor".into(),
            "shared-owner".into(),
            parent_of("write"),
        ],
    );
    file_permissions.insert(
        "manage".to_string(),
        vec!["direct_owner".into(), "shared-owner".into()],
    );

    namespaces.insert(
        "file".to_string(),
        NamespaceConfig {
            relations: file_relations,
            permissions: file_permissions,
        },
    );

    let mut group_relations = HashMap::new();
    group_relations.insert("member".to_string(), this());
    group_relations.insert("admin".to_string(), this());
    namespaces.insert(
        "group".to_string(),
        NamespaceConfig {
            relations: group_relations,
            permissions: HashMap::new(),
        },
    );

    namespaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_wire_format_parses_into_ir() {
        let json = r#"{
            "relations": {
                "owner": {"this": {}},
                "parent": {"this": {}},
                "editor": {"union": ["owner"]},
                "restricted": {"exclusion": {"include": "editor", "exclude": "owner"}},
                "both": {"intersection": ["owner", "editor"]},
                "inherited": {"tupleToUserset": {"tupleset": "parent", "computedUserset": "read"}}
            },
            "permissions": {
                "read": ["editor", "owner",
                         {"tupleToUserset": {"tupleset": "parent", "computedUserset": "read"}}]
            }
        }"#;

        let config: NamespaceConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(
            config.relation_config("owner"),
            Some(RelationDef::This {})
        ));
        assert_eq!(config.union_members("editor").unwrap(), ["owner"]);
        assert_eq!(config.exclusion("restricted").unwrap(), ("editor", "owner"));
        assert_eq!(
            config.intersection_members("both").unwrap(),
            ["owner", "editor"]
        );
        assert_eq!(
            config.tuple_to_userset("inherited").unwrap(),
            ("parent", "read")
        );

        let usersets = config.permission_usersets("read").unwrap();
        assert_eq!(usersets.len(), 3);
        assert!(matches!(
            &usersets[2],
            UsersetRef::Rewrite(RelationDef::TupleToUserset { tupleset, .. })
                if tupleset == "parent"
        ));
    }

    #[test]
    fn undefined_reference_is_a_namespace_error() {
        let mut relations = HashMap::new();
        relations.insert(
            "editor".to_string(),
            RelationDef::Union(vec!["ghost".to_string()]),
        );
        let config = NamespaceConfig {
            relations,
            permissions: HashMap::new(),
        };
        let err = config.validate("doc").unwrap_err();
        assert!(matches!(err, RebacError::Namespace(_)));
    }

    #[test]
    fn permission_referencing_undefined_relation_is_rejected() {
        let mut permissions = HashMap::new();
        permissions.insert("read".to_string(), vec![UsersetRef::from("ghost")]);
        let config = NamespaceConfig {
            relations: HashMap::new(),
            permissions,
        };
        assert!(config.validate("doc").is_err());
    }

    #[test]
    fn registry_copy_on_write_snapshots_are_stable() {
        let registry = NamespaceRegistry::new();
        let before = registry.snapshot();

        let mut relations = HashMap::new();
        relations.insert("viewer".to_string(), RelationDef::This {});
        registry
            .register(
                "doc",
                NamespaceConfig {
                    relations,
                    permissions: HashMap::new(),
                },
            )
            .unwrap();

        // The old snapshot does not observe the reload.
        assert!(before.get("doc").is_none());
        assert!(registry.get("doc").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn filesystem_schema_validates_and_covers_file_permissions() {
        let registry = NamespaceRegistry::with_filesystem_schema();
        let file = registry.get("file").unwrap();
        assert!(file.has_permission("read"));
        assert!(file.has_permission("write"));
        assert!(file.has_permission("manage"));
        assert!(matches!(
            file.relation_config("parent"),
            Some(RelationDef::This {})
        ));
        for (object_type, config) in filesystem_schema() {
            config.validate(&object_type).unwrap();
        }
    }

    #[test]
    fn yaml_schema_loads() {
        let registry = NamespaceRegistry::new();
        registry
            .load_yaml(
                r#"
doc:
  relations:
    owner:
      this: {}
    editor:
      union: [owner]
  permissions:
    read: [editor, owner]
"#,
            )
            .unwrap();
        let doc = registry.get("doc").unwrap();
        assert!(doc.has_union("editor"));
        assert_eq!(doc.permission_usersets("read").unwrap().len(), 2);
    }

    #[test]
    fn reference_cycles_are_detected() {
        let mut relations = HashMap::new();
        relations.insert("a".to_string(), RelationDef::Union(vec!["b".to_string()]));
        relations.insert("b".to_string(), RelationDef::Union(vec!["a".to_string()]));
        let config = NamespaceConfig {
            relations,
            permissions: HashMap::new(),
        };
        assert!(config.has_reference_cycle());
        // Cycles are diagnosed, not rejected; the traversal's visited set
        // keeps evaluation finite.
        assert!(config.validate("doc").is_ok());
    }
}
