use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::conditions::TupleConditions;

/// Wildcard marker used for public grants: the subject `(*, *)`.
pub const WILDCARD: &str = "*";

/// Zone used when a caller does not scope an operation explicitly.
pub const DEFAULT_ZONE: &str = "default";

/// Relations that may link entities in different zones. Cross-zone shares
/// are stored under the object's zone so they are visible when querying the
/// resource owner's zone.
pub const CROSS_ZONE_ALLOWED_RELATIONS: &[&str] =
    &["shared-viewer", "shared-editor", "shared-owner"];

/// Returns true if `relation` is allowed to cross zone boundaries.
pub fn is_cross_zone_relation(relation: &str) -> bool {
    CROSS_ZONE_ALLOWED_RELATIONS.contains(&relation)
}

/// A typed identifier for anything that can appear in a relationship tuple:
/// users, agents, groups, files, zones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "id")]
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn agent(agent_id: &str) -> Self {
        Self::new("agent", agent_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }

    pub fn file(path: &str) -> Self {
        Self::new("file", path)
    }

    /// The public-access subject `(*, *)`.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.entity_type == WILDCARD && self.entity_id == WILDCARD
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// The subject side of a tuple. A plain entity grants directly; an entity
/// with a `relation` is a userset-as-subject, e.g. `(group, eng, member)`
/// meaning "every member of group eng".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleSubject {
    #[serde(flatten)]
    pub entity: Entity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl TupleSubject {
    pub fn entity(entity: Entity) -> Self {
        Self {
            entity,
            relation: None,
        }
    }

    pub fn userset(entity: Entity, relation: impl Into<String>) -> Self {
        Self {
            entity,
            relation: Some(relation.into()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }
}

impl From<Entity> for TupleSubject {
    fn from(entity: Entity) -> Self {
        Self::entity(entity)
    }
}

impl fmt::Display for TupleSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "{}#{}", self.entity, rel),
            None => write!(f, "{}", self.entity),
        }
    }
}

/// A stored relationship tuple: "subject has relation to object", scoped to
/// a zone, optionally conditional and optionally expiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTuple {
    pub tuple_id: Uuid,
    pub subject: TupleSubject,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: String,
    pub object_zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<TupleConditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RelationshipTuple {
    /// Whether the tuple is visible at `now`. Expired tuples are invisible
    /// to every read path.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    /// The idempotency key: two writes with the same 4-key resolve to one
    /// stored tuple.
    pub fn unique_key(&self) -> (TupleSubject, String, Entity, String) {
        (
            self.subject.clone(),
            self.relation.clone(),
            self.object.clone(),
            self.zone_id.clone(),
        )
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {} (zone={})",
            self.subject, self.relation, self.object, self.zone_id
        )
    }
}

/// Request payload for creating a tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleWrite {
    pub subject: TupleSubject,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: Option<String>,
    pub object_zone_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<TupleConditions>,
}

impl TupleWrite {
    pub fn new(
        subject: impl Into<TupleSubject>,
        relation: impl Into<String>,
        object: Entity,
        zone_id: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation: relation.into(),
            object,
            zone_id: zone_id.into(),
            subject_zone_id: None,
            object_zone_id: None,
            expires_at: None,
            conditions: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_conditions(mut self, conditions: TupleConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Set the endpoint zones explicitly (cross-zone shares).
    pub fn between_zones(
        mut self,
        subject_zone_id: impl Into<String>,
        object_zone_id: impl Into<String>,
    ) -> Self {
        self.subject_zone_id = Some(subject_zone_id.into());
        self.object_zone_id = Some(object_zone_id.into());
        self
    }
}

/// One permission check, used as the unit of bulk evaluation and as a map
/// key for bulk results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckItem {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
}

impl CheckItem {
    pub fn new(subject: Entity, permission: impl Into<String>, object: Entity) -> Self {
        Self {
            subject,
            permission: permission.into(),
            object,
        }
    }
}

impl fmt::Display for CheckItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.permission, self.object)
    }
}

/// How much cache staleness a caller tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// All cache tiers are consulted.
    Eventual,
    /// L1 is allowed (revision-quantized keys bound the staleness window);
    /// the bitmap tier is skipped.
    Bounded,
    /// Bypass all caches and compute against live data.
    Strong,
}

/// Per-zone default consistency. Maps to the `ConsistencyLevel` used when a
/// caller does not pass one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneConsistencyMode {
    Strong,
    Eventual,
}

impl ZoneConsistencyMode {
    pub fn default_level(self) -> ConsistencyLevel {
        match self {
            ZoneConsistencyMode::Strong => ConsistencyLevel::Strong,
            ZoneConsistencyMode::Eventual => ConsistencyLevel::Eventual,
        }
    }
}

/// Kind of change recorded in the write-audit changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Delete => "DELETE",
        }
    }
}

/// Changelog row written in the same transaction as the tuple change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub change_type: ChangeType,
    pub tuple_id: Uuid,
    pub zone_id: String,
    pub subject: TupleSubject,
    pub relation: String,
    pub object: Entity,
    pub created_at: DateTime<Utc>,
}

/// Filter for tuple listings and bulk deletes. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TupleFilter {
    pub subject: Option<Entity>,
    pub relation: Option<String>,
    pub object: Option<Entity>,
    pub zone_id: Option<String>,
}

impl TupleFilter {
    pub fn matches(&self, tuple: &RelationshipTuple) -> bool {
        if let Some(subject) = &self.subject {
            if tuple.subject.entity != *subject {
                return false;
            }
        }
        if let Some(relation) = &self.relation {
            if tuple.relation != *relation {
                return false;
            }
        }
        if let Some(object) = &self.object {
            if tuple.object != *object {
                return false;
            }
        }
        if let Some(zone_id) = &self.zone_id {
            if tuple.zone_id != *zone_id {
                return false;
            }
        }
        true
    }
}

/// A userset-as-subject grant on an object, as returned by
/// `TupleStore::find_subject_sets`. Carries the granting tuple's id so
/// explanations can cite it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectSet {
    pub tuple_id: Uuid,
    pub entity: Entity,
    pub relation: String,
}
