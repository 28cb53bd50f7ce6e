//! Bitmap cache: compact per-(subject, permission, resource-type, zone)
//! bitsets over a dense resource-id space.
//!
//! Answers "can S do P on O?" in amortized O(1) for positives and filters
//! N resources in O(N/word) with zero tuple scans. Only positives are
//! recorded; a clear bit is advisory and callers fall through to compute.
//! Persistence matters only for the resource-id map; bitmaps rebuild
//! lazily through compute write-through.

use async_trait::async_trait;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{RebacError, Result};
use crate::models::CheckItem;

/// Identity of one bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitmapKey {
    pub subject_type: String,
    pub subject_id: String,
    pub permission: String,
    pub resource_type: String,
    pub zone_id: String,
}

impl BitmapKey {
    pub fn new(
        subject_type: &str,
        subject_id: &str,
        permission: &str,
        resource_type: &str,
        zone_id: &str,
    ) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            permission: permission.to_string(),
            resource_type: resource_type.to_string(),
            zone_id: zone_id.to_string(),
        }
    }
}

/// `(resource_type, resource_id, zone_id)` identifying a mapped resource.
pub type ResourceRef = (String, String, String);

/// Durable side of the bitmap cache. Only the id map must persist; bitmap
/// bytes are an optimization for warm restarts.
#[async_trait]
pub trait BitmapStore: Send + Sync {
    async fn save_resource_ids(&self, entries: &[(ResourceRef, u32)]) -> Result<()>;
    async fn load_resource_ids(&self) -> Result<Vec<(ResourceRef, u32)>>;
    async fn save_bitmap(&self, key: &BitmapKey, bytes: Vec<u8>) -> Result<()>;
}

/// In-memory `BitmapStore`, for tests and cache-only deployments.
#[derive(Default)]
pub struct MemoryBitmapStore {
    resource_ids: DashMap<ResourceRef, u32>,
    bitmaps: DashMap<BitmapKey, Vec<u8>>,
}

impl MemoryBitmapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bitmap_bytes(&self, key: &BitmapKey) -> Option<Vec<u8>> {
        self.bitmaps.get(key).map(|b| b.clone())
    }
}

#[async_trait]
impl BitmapStore for MemoryBitmapStore {
    async fn save_resource_ids(&self, entries: &[(ResourceRef, u32)]) -> Result<()> {
        for (resource, int_id) in entries {
            self.resource_ids.insert(resource.clone(), *int_id);
        }
        Ok(())
    }

    async fn load_resource_ids(&self) -> Result<Vec<(ResourceRef, u32)>> {
        Ok(self
            .resource_ids
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }

    async fn save_bitmap(&self, key: &BitmapKey, bytes: Vec<u8>) -> Result<()> {
        self.bitmaps.insert(key.clone(), bytes);
        Ok(())
    }
}

/// PostgreSQL-backed `BitmapStore`: one table for the id map, one for
/// serialized bitmaps.
pub struct PostgresBitmapStore {
    pool: sqlx::PgPool,
}

impl PostgresBitmapStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS rebac_resource_ids (
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                zone_id TEXT NOT NULL,
                int_id BIGINT NOT NULL,
                PRIMARY KEY (resource_type, resource_id, zone_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rebac_permission_bitmaps (
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                permission TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                zone_id TEXT NOT NULL,
                bitmap BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (subject_type, subject_id, permission, resource_type, zone_id)
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RebacError::Storage(format!("bitmap schema setup failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BitmapStore for PostgresBitmapStore {
    async fn save_resource_ids(&self, entries: &[(ResourceRef, u32)]) -> Result<()> {
        for ((resource_type, resource_id, zone_id), int_id) in entries {
            sqlx::query(
                r#"
                INSERT INTO rebac_resource_ids (resource_type, resource_id, zone_id, int_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (resource_type, resource_id, zone_id) DO NOTHING
                "#,
            )
            .bind(resource_type)
            .bind(resource_id)
            .bind(zone_id)
            .bind(*int_id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| RebacError::Storage(format!("save resource id: {e}")))?;
        }
        Ok(())
    }

    async fn load_resource_ids(&self) -> Result<Vec<(ResourceRef, u32)>> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT resource_type, resource_id, zone_id, int_id FROM rebac_resource_ids",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RebacError::Storage(format!("load resource ids: {e}")))?;

        rows.iter()
            .map(|row| {
                let int_id: i64 = row
                    .try_get("int_id")
                    .map_err(|e| RebacError::Storage(format!("decode int_id: {e}")))?;
                Ok((
                    (
                        row.try_get::<String, _>("resource_type")
                            .map_err(|e| RebacError::Storage(format!("decode resource: {e}")))?,
                        row.try_get::<String, _>("resource_id")
                            .map_err(|e| RebacError::Storage(format!("decode resource: {e}")))?,
                        row.try_get::<String, _>("zone_id")
                            .map_err(|e| RebacError::Storage(format!("decode resource: {e}")))?,
                    ),
                    int_id.max(0) as u32,
                ))
            })
            .collect()
    }

    async fn save_bitmap(&self, key: &BitmapKey, bytes: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rebac_permission_bitmaps
                (subject_type, subject_id, permission, resource_type, zone_id, bitmap, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (subject_type, subject_id, permission, resource_type, zone_id)
            DO UPDATE SET bitmap = EXCLUDED.bitmap, updated_at = NOW()
            "#,
        )
        .bind(&key.subject_type)
        .bind(&key.subject_id)
        .bind(&key.permission)
        .bind(&key.resource_type)
        .bind(&key.zone_id)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| RebacError::Storage(format!("save bitmap: {e}")))?;
        Ok(())
    }
}

/// Dense integer ids for `(resource_type, resource_id, zone_id)` triples.
/// Allocation is monotonic and race-free; ids start at 1.
pub struct ResourceIdMap {
    ids: DashMap<ResourceRef, u32>,
    next_id: AtomicU32,
}

impl ResourceIdMap {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn get(&self, resource_type: &str, resource_id: &str, zone_id: &str) -> Option<u32> {
        self.ids
            .get(&(
                resource_type.to_string(),
                resource_id.to_string(),
                zone_id.to_string(),
            ))
            .map(|id| *id)
    }

    pub fn get_or_create(&self, resource_type: &str, resource_id: &str, zone_id: &str) -> u32 {
        *self
            .ids
            .entry((
                resource_type.to_string(),
                resource_id.to_string(),
                zone_id.to_string(),
            ))
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Restore persisted mappings so ids stay stable across restarts.
    pub fn hydrate(&self, entries: Vec<(ResourceRef, u32)>) {
        let mut high_water = self.next_id.load(Ordering::Relaxed);
        for (resource, int_id) in entries {
            high_water = high_water.max(int_id + 1);
            self.ids.insert(resource, int_id);
        }
        self.next_id.fetch_max(high_water, Ordering::Relaxed);
    }
}

impl Default for ResourceIdMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The bitmap cache proper.
pub struct BitmapCache {
    bitmaps: DashMap<BitmapKey, RoaringBitmap>,
    resources: ResourceIdMap,
    store: Option<Arc<dyn BitmapStore>>,
}

impl BitmapCache {
    pub fn new() -> Self {
        Self {
            bitmaps: DashMap::new(),
            resources: ResourceIdMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BitmapStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load the persisted resource-id map. Failures are logged, not
    /// surfaced; the cache degrades to a cold start.
    pub async fn hydrate(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load_resource_ids().await {
            Ok(entries) => {
                let count = entries.len();
                self.resources.hydrate(entries);
                debug!(count, "bitmap resource map hydrated");
            }
            Err(error) => {
                warn!(%error, "bitmap resource map hydration failed; starting cold");
            }
        }
    }

    pub fn resources(&self) -> &ResourceIdMap {
        &self.resources
    }

    /// `Some(true)`: bit set. `Some(false)`: bitmap present, bit clear
    /// (advisory; callers still fall through). `None`: bitmap not populated.
    pub fn check(
        &self,
        subject_type: &str,
        subject_id: &str,
        permission: &str,
        resource_type: &str,
        resource_id: &str,
        zone_id: &str,
    ) -> Option<bool> {
        let int_id = self.resources.get(resource_type, resource_id, zone_id)?;
        let key = BitmapKey::new(subject_type, subject_id, permission, resource_type, zone_id);
        self.bitmaps.get(&key).map(|bitmap| bitmap.contains(int_id))
    }

    /// Bulk probe: one bitmap lookup per (subject, permission,
    /// resource-type) group.
    pub fn check_bulk(
        &self,
        checks: &[CheckItem],
        zone_id: &str,
    ) -> HashMap<CheckItem, Option<bool>> {
        let mut grouped: HashMap<BitmapKey, Vec<&CheckItem>> = HashMap::new();
        for check in checks {
            grouped
                .entry(BitmapKey::new(
                    &check.subject.entity_type,
                    &check.subject.entity_id,
                    &check.permission,
                    &check.object.entity_type,
                    zone_id,
                ))
                .or_default()
                .push(check);
        }

        let mut results = HashMap::with_capacity(checks.len());
        for (key, group) in grouped {
            let bitmap = self.bitmaps.get(&key);
            for check in group {
                let verdict = match &bitmap {
                    None => None,
                    Some(bitmap) => self
                        .resources
                        .get(&check.object.entity_type, &check.object.entity_id, zone_id)
                        .map(|int_id| bitmap.contains(int_id)),
                };
                results.insert(check.clone(), verdict);
            }
        }
        results
    }

    /// Record positive results in memory. Ids are allocated on demand.
    pub fn add_to_bitmap_bulk(&self, key: &BitmapKey, resource_ids: &[String]) {
        if resource_ids.is_empty() {
            return;
        }
        let mut bitmap = self.bitmaps.entry(key.clone()).or_default();
        for resource_id in resource_ids {
            let int_id =
                self.resources
                    .get_or_create(&key.resource_type, resource_id, &key.zone_id);
            bitmap.insert(int_id);
        }
    }

    /// Persist one bitmap and its id mappings in the background. Store
    /// failures are logged and swallowed: bitmaps are never authoritative.
    pub fn persist_bitmap_bulk(&self, key: &BitmapKey, resource_ids: Vec<String>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let bytes = match self.bitmaps.get(key) {
            Some(bitmap) => {
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                if let Err(error) = bitmap.serialize_into(&mut bytes) {
                    warn!(%error, "bitmap serialization failed; skipping persist");
                    return;
                }
                bytes
            }
            None => return,
        };
        let id_entries: Vec<(ResourceRef, u32)> = resource_ids
            .iter()
            .filter_map(|resource_id| {
                self.resources
                    .get(&key.resource_type, resource_id, &key.zone_id)
                    .map(|int_id| {
                        (
                            (
                                key.resource_type.clone(),
                                resource_id.clone(),
                                key.zone_id.clone(),
                            ),
                            int_id,
                        )
                    })
            })
            .collect();

        let key = key.clone();
        tokio::spawn(async move {
            if let Err(error) = store.save_resource_ids(&id_entries).await {
                warn!(%error, "resource id persist failed");
            }
            if let Err(error) = store.save_bitmap(&key, bytes).await {
                warn!(%error, "bitmap persist failed");
            }
        });
    }

    pub fn clear_zone(&self, zone_id: &str) {
        self.bitmaps.retain(|key, _| key.zone_id != zone_id);
    }

    pub fn clear(&self) {
        self.bitmaps.clear();
    }

    /// Drop every bitmap for a subject in a zone (grants changed).
    pub fn invalidate_subject(&self, subject_type: &str, subject_id: &str, zone_id: &str) {
        self.bitmaps.retain(|key, _| {
            !(key.zone_id == zone_id
                && key.subject_type == subject_type
                && key.subject_id == subject_id)
        });
    }

    /// Clear one resource's bit from every bitmap of its type in the zone
    /// (a grant on the object was revoked).
    pub fn invalidate_object(&self, resource_type: &str, resource_id: &str, zone_id: &str) {
        let Some(int_id) = self.resources.get(resource_type, resource_id, zone_id) else {
            return;
        };
        for mut entry in self.bitmaps.iter_mut() {
            if entry.key().zone_id == zone_id && entry.key().resource_type == resource_type {
                entry.value_mut().remove(int_id);
            }
        }
    }
}

impl Default for BitmapCache {
    fn default() -> Self {
        Self::new()
    }
}
