//! Zone-aware ReBAC authorization engine for the Nexus virtual filesystem.
//!
//! A Google Zanzibar-inspired authorization core providing:
//! - Relationship-based access control over typed entity tuples
//! - Strict multi-tenant (zone) isolation with an allowlisted `shared-*`
//!   family for cross-zone shares
//! - Namespace schemas with union / intersection / exclusion /
//!   tupleToUserset rewrites
//! - ABAC conditions on tuples (time windows, CIDR allowlists, devices,
//!   attributes)
//! - An L1 result cache (tiered TTLs, XFetch early refresh,
//!   revision-quantized keys, targeted invalidation) and a roaring-bitmap
//!   cache for bulk filtering
//! - A multi-phase bulk checker that collapses N checks into one tuple
//!   fetch and an in-memory graph evaluation
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{AuthorizationEngine, Entity, MemoryTupleStore, TupleWrite};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::new(Arc::new(MemoryTupleStore::new()));
//!
//!     engine
//!         .write(TupleWrite::new(
//!             Entity::user("alice"),
//!             "direct_viewer",
//!             Entity::file("/workspace/doc.txt"),
//!             "org_acme",
//!         ))
//!         .await?;
//!
//!     let allowed = engine
//!         .check(
//!             &Entity::user("alice"),
//!             "read",
//!             &Entity::file("/workspace/doc.txt"),
//!             "org_acme",
//!         )
//!         .await?;
//!     assert!(allowed);
//!     Ok(())
//! }
//! ```

pub mod bitmap;
pub mod bulk;
pub mod cache;
pub mod check;
pub mod conditions;
pub mod engine;
pub mod error;
pub mod expand;
pub mod graph;
pub mod models;
pub mod repository;
pub mod schema;

pub use bitmap::{BitmapCache, BitmapKey, BitmapStore, MemoryBitmapStore, PostgresBitmapStore};
pub use bulk::{BulkOutcome, BulkPermissionChecker};
pub use cache::{
    CacheKey, CacheStats, InvalidationMode, PermissionCache, PermissionCacheConfig,
    RevisionTracker, TieredTtl,
};
pub use check::{Explanation, PathNode, PermissionComputer};
pub use conditions::{AccessContext, TimeWindow, TupleConditions};
pub use engine::{
    AuthorizationEngine, EngineBuilder, EngineConfig, InvalidationEvent, Invalidator,
};
pub use error::{RebacError, Result};
pub use expand::SubjectExpander;
pub use models::{
    is_cross_zone_relation, ChangeType, ChangelogEntry, CheckItem, ConsistencyLevel, Entity,
    RelationshipTuple, SubjectSet, TupleFilter, TupleSubject, TupleWrite, ZoneConsistencyMode,
    CROSS_ZONE_ALLOWED_RELATIONS, DEFAULT_ZONE, WILDCARD,
};
pub use repository::{postgres::PostgresTupleStore, MemoryTupleStore, TupleStore};
pub use schema::{NamespaceConfig, NamespaceRegistry, RelationDef, UsersetRef};
