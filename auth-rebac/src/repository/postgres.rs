//! PostgreSQL-backed tuple store.
//!
//! Three tables: `rebac_tuples` (the graph), `rebac_changelog` (write
//! audit), `rebac_version_sequences` (per-zone revision counters). The
//! tuple row, its changelog row and the revision bump commit in one
//! transaction. Read queries retry transient faults with bounded backoff.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conditions::{self, AccessContext, TupleConditions};
use crate::error::{RebacError, Result};
use crate::models::{
    is_cross_zone_relation, ChangeType, Entity, RelationshipTuple, SubjectSet, TupleFilter,
    TupleSubject, TupleWrite, CROSS_ZONE_ALLOWED_RELATIONS,
};
use crate::repository::{resolve_zones, TupleStore, CYCLE_CHECK_MAX_DEPTH, PARENT_RELATION};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

const TUPLE_COLUMNS: &str = "tuple_id, zone_id, subject_type, subject_id, subject_relation, \
     subject_zone_id, relation, object_type, object_id, object_zone_id, \
     conditions, expires_at, created_at";

/// PostgreSQL tuple store.
pub struct PostgresTupleStore {
    pool: PgPool,
}

impl PostgresTupleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| RebacError::Storage(format!("failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Create the backing tables when embedding without external migrations.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS rebac_tuples (
                tuple_id UUID PRIMARY KEY,
                zone_id TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                subject_relation TEXT,
                subject_zone_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                object_zone_id TEXT NOT NULL,
                conditions TEXT,
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_rebac_tuples_four_key
            ON rebac_tuples (zone_id, subject_type, subject_id,
                             COALESCE(subject_relation, ''), relation,
                             object_type, object_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ix_rebac_tuples_object
            ON rebac_tuples (zone_id, object_type, object_id, relation)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ix_rebac_tuples_subject
            ON rebac_tuples (zone_id, subject_type, subject_id, relation)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rebac_changelog (
                change_id BIGSERIAL PRIMARY KEY,
                change_type TEXT NOT NULL,
                tuple_id UUID NOT NULL,
                zone_id TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rebac_version_sequences (
                zone_id TEXT PRIMARY KEY,
                current_version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RebacError::Storage(format!("schema setup failed: {e}")))?;
        }
        info!("rebac storage schema ensured");
        Ok(())
    }
}

fn is_retriable(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

fn storage_err(op: &str, error: sqlx::Error) -> RebacError {
    RebacError::Storage(format!("{op}: {error}"))
}

/// Run a read query with bounded retry on transient faults.
async fn retrying<T, F, Fut>(op: &str, mut run: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(error) if is_retriable(&error) && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(%op, %error, attempt, "retriable storage fault, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(storage_err(op, error)),
        }
    }
}

fn row_to_tuple(row: &PgRow) -> std::result::Result<RelationshipTuple, sqlx::Error> {
    let conditions: Option<String> = row.try_get("conditions")?;
    let conditions: Option<TupleConditions> = match conditions {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))
            .map(Some)?,
        None => None,
    };
    Ok(RelationshipTuple {
        tuple_id: row.try_get("tuple_id")?,
        subject: TupleSubject {
            entity: Entity::new(
                row.try_get::<String, _>("subject_type")?,
                row.try_get::<String, _>("subject_id")?,
            ),
            relation: row.try_get("subject_relation")?,
        },
        relation: row.try_get("relation")?,
        object: Entity::new(
            row.try_get::<String, _>("object_type")?,
            row.try_get::<String, _>("object_id")?,
        ),
        zone_id: row.try_get("zone_id")?,
        subject_zone_id: row.try_get("subject_zone_id")?,
        object_zone_id: row.try_get("object_zone_id")?,
        conditions,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Append `WHERE`-clause fragments for a tuple filter. Returns the SQL tail
/// and bind values in order.
fn filter_clauses(filter: &TupleFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    if let Some(subject) = &filter.subject {
        clauses.push(format!(
            "subject_type = ${} AND subject_id = ${}",
            binds.len() + 1,
            binds.len() + 2
        ));
        binds.push(subject.entity_type.clone());
        binds.push(subject.entity_id.clone());
    }
    if let Some(relation) = &filter.relation {
        clauses.push(format!("relation = ${}", binds.len() + 1));
        binds.push(relation.clone());
    }
    if let Some(object) = &filter.object {
        clauses.push(format!(
            "object_type = ${} AND object_id = ${}",
            binds.len() + 1,
            binds.len() + 2
        ));
        binds.push(object.entity_type.clone());
        binds.push(object.entity_id.clone());
    }
    if let Some(zone_id) = &filter.zone_id {
        clauses.push(format!("zone_id = ${}", binds.len() + 1));
        binds.push(zone_id.clone());
    }
    let tail = if clauses.is_empty() {
        "TRUE".to_string()
    } else {
        clauses.join(" AND ")
    };
    (tail, binds)
}

impl PostgresTupleStore {
    /// True if `needle` is an ancestor of `start` along parent edges.
    /// Single recursive CTE, bounded at the cycle-check depth.
    async fn is_ancestor(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        start: &Entity,
        needle: &Entity,
        zone_id: &str,
    ) -> std::result::Result<bool, sqlx::Error> {
        let row = sqlx::query(
            r#"
            WITH RECURSIVE ancestors AS (
                SELECT object_type AS ancestor_type,
                       object_id AS ancestor_id,
                       1 AS depth
                FROM rebac_tuples
                WHERE subject_type = $1
                  AND subject_id = $2
                  AND subject_relation IS NULL
                  AND relation = $3
                  AND zone_id = $4

                UNION ALL

                SELECT t.object_type, t.object_id, a.depth + 1
                FROM rebac_tuples t
                INNER JOIN ancestors a
                    ON t.subject_type = a.ancestor_type
                    AND t.subject_id = a.ancestor_id
                WHERE t.relation = $3
                  AND t.subject_relation IS NULL
                  AND t.zone_id = $4
                  AND a.depth < $5
            )
            SELECT 1 FROM ancestors
            WHERE ancestor_type = $6 AND ancestor_id = $7
            LIMIT 1
            "#,
        )
        .bind(&start.entity_type)
        .bind(&start.entity_id)
        .bind(PARENT_RELATION)
        .bind(zone_id)
        .bind(CYCLE_CHECK_MAX_DEPTH as i32)
        .bind(&needle.entity_type)
        .bind(&needle.entity_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    async fn bump_revision(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        zone_id: &str,
    ) -> std::result::Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO rebac_version_sequences (zone_id, current_version, updated_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (zone_id)
            DO UPDATE SET current_version = rebac_version_sequences.current_version + 1,
                          updated_at = NOW()
            RETURNING current_version
            "#,
        )
        .bind(zone_id)
        .fetch_one(&mut **tx)
        .await?;
        row.try_get(0)
    }

    async fn log_change(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        change_type: ChangeType,
        tuple: &RelationshipTuple,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rebac_changelog (
                change_type, tuple_id, zone_id, subject_type, subject_id,
                relation, object_type, object_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(change_type.as_str())
        .bind(tuple.tuple_id)
        .bind(&tuple.zone_id)
        .bind(&tuple.subject.entity.entity_type)
        .bind(&tuple.subject.entity.entity_id)
        .bind(&tuple.relation)
        .bind(&tuple.object.entity_type)
        .bind(&tuple.object.entity_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// One rung of the direct-check ladder. Fetches live candidates and
    /// returns the first whose conditions pass the context.
    async fn direct_rung(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: Option<&str>,
        context: Option<&AccessContext>,
    ) -> Result<Option<RelationshipTuple>> {
        let sql = if zone_id.is_some() {
            format!(
                "SELECT {TUPLE_COLUMNS} FROM rebac_tuples \
                 WHERE subject_type = $1 AND subject_id = $2 \
                   AND subject_relation IS NULL \
                   AND relation = $3 \
                   AND object_type = $4 AND object_id = $5 \
                   AND (expires_at IS NULL OR expires_at > NOW()) \
                   AND zone_id = $6"
            )
        } else {
            format!(
                "SELECT {TUPLE_COLUMNS} FROM rebac_tuples \
                 WHERE subject_type = $1 AND subject_id = $2 \
                   AND subject_relation IS NULL \
                   AND relation = $3 \
                   AND object_type = $4 AND object_id = $5 \
                   AND (expires_at IS NULL OR expires_at > NOW())"
            )
        };

        let rows = retrying("find_direct_tuple", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            let (subject, relation, object) =
                (subject.clone(), relation.to_string(), object.clone());
            let zone_id = zone_id.map(str::to_string);
            async move {
                let mut query = sqlx::query(&sql)
                    .bind(subject.entity_type)
                    .bind(subject.entity_id)
                    .bind(relation)
                    .bind(object.entity_type)
                    .bind(object.entity_id);
                if let Some(zone_id) = zone_id {
                    query = query.bind(zone_id);
                }
                query.fetch_all(&pool).await
            }
        })
        .await?;

        for row in &rows {
            let tuple = row_to_tuple(row).map_err(|e| storage_err("decode tuple", e))?;
            let satisfied = tuple
                .conditions
                .as_ref()
                .map_or(true, |c| conditions::evaluate(c, context));
            if satisfied {
                return Ok(Some(tuple));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TupleStore for PostgresTupleStore {
    async fn insert(&self, write: TupleWrite) -> Result<Uuid> {
        let (zone_id, subject_zone, object_zone) = resolve_zones(&write)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("begin transaction", e))?;

        if write.relation == PARENT_RELATION {
            if write.subject.entity == write.object {
                return Err(RebacError::Cycle(format!(
                    "parent relation from {} to itself",
                    write.object
                )));
            }
            let cyclic = self
                .is_ancestor(&mut tx, &write.object, &write.subject.entity, &zone_id)
                .await
                .map_err(|e| storage_err("cycle check", e))?;
            if cyclic {
                return Err(RebacError::Cycle(format!(
                    "{} is an ancestor of {}; parent edge would close a loop",
                    write.subject.entity, write.object
                )));
            }
        }

        // Idempotency on the 4-key.
        let existing = sqlx::query(
            r#"
            SELECT tuple_id FROM rebac_tuples
            WHERE zone_id = $1
              AND subject_type = $2 AND subject_id = $3
              AND subject_relation IS NOT DISTINCT FROM $4
              AND relation = $5
              AND object_type = $6 AND object_id = $7
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#,
        )
        .bind(&zone_id)
        .bind(&write.subject.entity.entity_type)
        .bind(&write.subject.entity.entity_id)
        .bind(&write.subject.relation)
        .bind(&write.relation)
        .bind(&write.object.entity_type)
        .bind(&write.object.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("idempotency probe", e))?;

        if let Some(row) = existing {
            let tuple_id: Uuid = row.try_get(0).map_err(|e| storage_err("decode id", e))?;
            debug!(%tuple_id, "tuple already present, returning existing id");
            return Ok(tuple_id);
        }

        let conditions_json = match &write.conditions {
            Some(conditions) => Some(
                serde_json::to_string(conditions)
                    .map_err(|e| RebacError::Validation(format!("unserializable conditions: {e}")))?,
            ),
            None => None,
        };

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
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO rebac_tuples (
                tuple_id, zone_id, subject_type, subject_id, subject_relation,
                subject_zone_id, relation, object_type, object_id, object_zone_id,
                conditions, expires_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(tuple.tuple_id)
        .bind(&tuple.zone_id)
        .bind(&tuple.subject.entity.entity_type)
        .bind(&tuple.subject.entity.entity_id)
        .bind(&tuple.subject.relation)
        .bind(&tuple.subject_zone_id)
        .bind(&tuple.relation)
        .bind(&tuple.object.entity_type)
        .bind(&tuple.object.entity_id)
        .bind(&tuple.object_zone_id)
        .bind(&conditions_json)
        .bind(tuple.expires_at)
        .bind(tuple.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("insert tuple", e))?;

        Self::log_change(&mut tx, ChangeType::Insert, &tuple)
            .await
            .map_err(|e| storage_err("insert changelog", e))?;
        Self::bump_revision(&mut tx, &zone_id)
            .await
            .map_err(|e| storage_err("bump revision", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert", e))?;
        Ok(tuple.tuple_id)
    }

    async fn delete(&self, tuple_id: Uuid) -> Result<Option<RelationshipTuple>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("begin transaction", e))?;

        let sql = format!("DELETE FROM rebac_tuples WHERE tuple_id = $1 RETURNING {TUPLE_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(tuple_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage_err("delete tuple", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tuple = row_to_tuple(&row).map_err(|e| storage_err("decode tuple", e))?;

        Self::log_change(&mut tx, ChangeType::Delete, &tuple)
            .await
            .map_err(|e| storage_err("insert changelog", e))?;
        Self::bump_revision(&mut tx, &tuple.zone_id)
            .await
            .map_err(|e| storage_err("bump revision", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("commit delete", e))?;
        Ok(Some(tuple))
    }

    async fn delete_where(&self, filter: &TupleFilter) -> Result<u64> {
        let (tail, binds) = filter_clauses(filter);
        let sql = format!("DELETE FROM rebac_tuples WHERE {tail} RETURNING zone_id");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("begin transaction", e))?;

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| storage_err("delete_where", e))?;

        let mut zones: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect();
        zones.sort();
        zones.dedup();
        for zone_id in &zones {
            Self::bump_revision(&mut tx, zone_id)
                .await
                .map_err(|e| storage_err("bump revision", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit delete_where", e))?;
        Ok(rows.len() as u64)
    }

    async fn find_direct_tuple(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&AccessContext>,
    ) -> Result<Option<RelationshipTuple>> {
        // Rung 1: exact concrete subject in-zone.
        if let Some(tuple) = self
            .direct_rung(subject, relation, object, Some(zone_id), context)
            .await?
        {
            return Ok(Some(tuple));
        }

        if !subject.is_wildcard() {
            let wildcard = Entity::wildcard();
            // Rung 2: in-zone public grant.
            if let Some(tuple) = self
                .direct_rung(&wildcard, relation, object, Some(zone_id), context)
                .await?
            {
                return Ok(Some(tuple));
            }
            // Rung 3: cross-zone public grant.
            if let Some(tuple) = self
                .direct_rung(&wildcard, relation, object, None, context)
                .await?
            {
                debug!(%relation, object = %object, "cross-zone wildcard grant");
                return Ok(Some(tuple));
            }
        }

        // Rung 4: cross-zone share, visible from the recipient's zone.
        if is_cross_zone_relation(relation) {
            if let Some(tuple) = self
                .direct_rung(subject, relation, object, None, context)
                .await?
            {
                debug!(subject = %subject, %relation, "cross-zone share grant");
                return Ok(Some(tuple));
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
        let rows = retrying("find_subject_sets", || {
            let pool = self.pool.clone();
            let (relation, object, zone_id) =
                (relation.to_string(), object.clone(), zone_id.to_string());
            async move {
                sqlx::query(
                    r#"
                    SELECT tuple_id, subject_type, subject_id, subject_relation
                    FROM rebac_tuples
                    WHERE zone_id = $1
                      AND relation = $2
                      AND object_type = $3 AND object_id = $4
                      AND subject_relation IS NOT NULL
                      AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(zone_id)
                .bind(relation)
                .bind(object.entity_type)
                .bind(object.entity_id)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SubjectSet {
                    tuple_id: row
                        .try_get("tuple_id")
                        .map_err(|e| storage_err("decode subject set", e))?,
                    entity: Entity::new(
                        row.try_get::<String, _>("subject_type")
                            .map_err(|e| storage_err("decode subject set", e))?,
                        row.try_get::<String, _>("subject_id")
                            .map_err(|e| storage_err("decode subject set", e))?,
                    ),
                    relation: row
                        .try_get::<Option<String>, _>("subject_relation")
                        .map_err(|e| storage_err("decode subject set", e))?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn find_related_objects(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        let rows = retrying("find_related_objects", || {
            let pool = self.pool.clone();
            let (obj, relation, zone_id) = (obj.clone(), relation.to_string(), zone_id.to_string());
            async move {
                sqlx::query(
                    r#"
                    SELECT object_type, object_id
                    FROM rebac_tuples
                    WHERE zone_id = $1
                      AND subject_type = $2 AND subject_id = $3
                      AND subject_relation IS NULL
                      AND relation = $4
                      AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(zone_id)
                .bind(obj.entity_type)
                .bind(obj.entity_id)
                .bind(relation)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Entity::new(
                    row.try_get::<String, _>("object_type")
                        .map_err(|e| storage_err("decode entity", e))?,
                    row.try_get::<String, _>("object_id")
                        .map_err(|e| storage_err("decode entity", e))?,
                ))
            })
            .collect()
    }

    async fn find_subjects_with_relation(
        &self,
        obj: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> Result<Vec<Entity>> {
        let rows = retrying("find_subjects_with_relation", || {
            let pool = self.pool.clone();
            let (obj, relation, zone_id) = (obj.clone(), relation.to_string(), zone_id.to_string());
            async move {
                sqlx::query(
                    r#"
                    SELECT subject_type, subject_id
                    FROM rebac_tuples
                    WHERE zone_id = $1
                      AND object_type = $2 AND object_id = $3
                      AND relation = $4
                      AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(zone_id)
                .bind(obj.entity_type)
                .bind(obj.entity_id)
                .bind(relation)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Entity::new(
                    row.try_get::<String, _>("subject_type")
                        .map_err(|e| storage_err("decode entity", e))?,
                    row.try_get::<String, _>("subject_id")
                        .map_err(|e| storage_err("decode entity", e))?,
                ))
            })
            .collect()
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>> {
        let (tail, binds) = filter_clauses(filter);
        let sql = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples \
             WHERE (expires_at IS NULL OR expires_at > NOW()) AND {tail}"
        );

        let rows = retrying("read_tuples", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            let binds = binds.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for bind in &binds {
                    query = query.bind(bind);
                }
                query.fetch_all(&pool).await
            }
        })
        .await?;

        rows.iter()
            .map(|row| row_to_tuple(row).map_err(|e| storage_err("decode tuple", e)))
            .collect()
    }

    async fn bulk_fetch(
        &self,
        entities: &[Entity],
        zone_id: &str,
    ) -> Result<Vec<RelationshipTuple>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let entity_types: Vec<String> = entities.iter().map(|e| e.entity_type.clone()).collect();
        let entity_ids: Vec<String> = entities.iter().map(|e| e.entity_id.clone()).collect();
        let cross_zone: Vec<String> = CROSS_ZONE_ALLOWED_RELATIONS
            .iter()
            .map(|r| r.to_string())
            .collect();

        // One UNNEST query covers the zone-scoped entity closure; cross-zone
        // shares whose subject is in the set ride along without zone filter.
        let sql = format!(
            r#"
            WITH entity_list AS (
                SELECT unnest($1::text[]) AS entity_type,
                       unnest($2::text[]) AS entity_id
            )
            SELECT DISTINCT {TUPLE_COLUMNS}
            FROM rebac_tuples t
            WHERE (t.expires_at IS NULL OR t.expires_at > NOW())
              AND (
                  (
                      t.zone_id = $3
                      AND (
                          EXISTS (SELECT 1 FROM entity_list e
                                  WHERE t.subject_type = e.entity_type
                                    AND t.subject_id = e.entity_id)
                          OR EXISTS (SELECT 1 FROM entity_list e
                                     WHERE t.object_type = e.entity_type
                                       AND t.object_id = e.entity_id)
                      )
                  )
                  OR (
                      t.relation = ANY($4::text[])
                      AND EXISTS (SELECT 1 FROM entity_list e
                                  WHERE t.subject_type = e.entity_type
                                    AND t.subject_id = e.entity_id)
                  )
              )
            "#
        );

        let rows = retrying("bulk_fetch", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            let entity_types = entity_types.clone();
            let entity_ids = entity_ids.clone();
            let cross_zone = cross_zone.clone();
            let zone_id = zone_id.to_string();
            async move {
                sqlx::query(&sql)
                    .bind(entity_types)
                    .bind(entity_ids)
                    .bind(zone_id)
                    .bind(cross_zone)
                    .fetch_all(&pool)
                    .await
            }
        })
        .await?;

        rows.iter()
            .map(|row| row_to_tuple(row).map_err(|e| storage_err("decode tuple", e)))
            .collect()
    }

    async fn zone_revision(&self, zone_id: &str) -> Result<u64> {
        let row = retrying("zone_revision", || {
            let pool = self.pool.clone();
            let zone_id = zone_id.to_string();
            async move {
                sqlx::query(
                    "SELECT current_version FROM rebac_version_sequences WHERE zone_id = $1",
                )
                .bind(zone_id)
                .fetch_optional(&pool)
                .await
            }
        })
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("current_version")
                    .map_err(|e| storage_err("decode revision", e))?;
                Ok(version.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rebac_tuples WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("cleanup_expired", e))?;
        Ok(result.rows_affected())
    }
}
