//! Postgres-backed [`LedgerRepository`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psfleet_id::{ProviderInstanceId, RegionId};
use psfleet_reconcile::{InstanceCounts, InstanceRef, InstanceStatus, Track};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{instrument, warn};

use super::ledger::{
    ClosedSessionInstance, InstanceKey, InstancePatch, LedgerRepository, NewInstance, Region,
};
use super::DbError;

struct RegionRow {
    id: String,
    name: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RegionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }
}

impl TryFrom<RegionRow> for Region {
    type Error = DbError;

    fn try_from(row: RegionRow) -> Result<Self, Self::Error> {
        Ok(Region {
            id: parse_column("regions.id", &row.id)?,
            name: row.name,
        })
    }
}

struct CountsRow {
    total: i64,
    free: i64,
    pending: i64,
    stopped: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CountsRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            total: row.try_get("total")?,
            free: row.try_get("free")?,
            pending: row.try_get("pending")?,
            stopped: row.try_get("stopped")?,
        })
    }
}

impl TryFrom<CountsRow> for InstanceCounts {
    type Error = DbError;

    fn try_from(row: CountsRow) -> Result<Self, Self::Error> {
        let count = |name: &str, value: i64| {
            u32::try_from(value)
                .map_err(|_| DbError::Integrity(format!("{name} count out of range: {value}")))
        };
        Ok(InstanceCounts {
            total: count("total", row.total)?,
            free: count("free", row.free)?,
            pending: count("pending", row.pending)?,
            stopped: count("stopped", row.stopped)?,
        })
    }
}

struct InstanceRow {
    id: String,
    provider_instance_id: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            provider_instance_id: row.try_get("provider_instance_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<InstanceRow> for InstanceRef {
    type Error = DbError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let provider_id = row
            .provider_instance_id
            .as_deref()
            .map(|raw| parse_column::<ProviderInstanceId>("provider_instance_id", raw))
            .transpose()?;
        Ok(InstanceRef {
            id: parse_column("streaming_instances.id", &row.id)?,
            provider_id,
            status: parse_column("streaming_instances.status", &row.status)?,
            created_at: row.created_at,
        })
    }
}

struct ClosedSessionRow {
    id: String,
    provider_instance_id: Option<String>,
    region_id: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClosedSessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            provider_instance_id: row.try_get("provider_instance_id")?,
            region_id: row.try_get("region_id")?,
        })
    }
}

impl TryFrom<ClosedSessionRow> for ClosedSessionInstance {
    type Error = DbError;

    fn try_from(row: ClosedSessionRow) -> Result<Self, Self::Error> {
        let raw_provider = row.provider_instance_id.ok_or_else(|| {
            DbError::Integrity(format!("instance {} has no provider id", row.id))
        })?;
        Ok(ClosedSessionInstance {
            instance_id: parse_column("streaming_instances.id", &row.id)?,
            provider_id: parse_column("provider_instance_id", &raw_provider)?,
            region_id: parse_column("streaming_instances.region_id", &row.region_id)?,
        })
    }
}

fn parse_column<T>(column: &str, raw: &str) -> Result<T, DbError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| DbError::Integrity(format!("{column} = {raw:?}: {e}")))
}

/// Decode rows one by one, skipping the ones that fail. Errors only when
/// there were rows and none of them decoded.
pub(crate) fn decode_rows<R, T>(
    query: &'static str,
    rows: Vec<R>,
    decode: impl Fn(R) -> Result<T, DbError>,
) -> Result<Vec<T>, DbError> {
    let total = rows.len();
    let mut decoded = Vec::with_capacity(total);

    for row in rows {
        match decode(row) {
            Ok(value) => decoded.push(value),
            Err(e) => warn!(query, error = %e, "Skipping undecodable ledger row"),
        }
    }

    if total > 0 && decoded.is_empty() {
        return Err(DbError::Integrity(format!(
            "{query}: none of {total} rows could be decoded"
        )));
    }
    Ok(decoded)
}

/// Ledger backed by the Postgres pool.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        query: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, DbError> {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result.map_err(DbError::Query),
            Err(_) => Err(DbError::Timeout {
                operation,
                limit: self.query_timeout,
            }),
        }
    }
}

#[async_trait]
impl LedgerRepository for PgLedger {
    #[instrument(skip(self))]
    async fn list_regions(&self) -> Result<Vec<Region>, DbError> {
        let rows = self
            .bounded(
                "list_regions",
                sqlx::query_as::<_, RegionRow>(
                    r#"
                    SELECT id, name
                    FROM regions
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;

        decode_rows("list_regions", rows, Region::try_from)
    }

    #[instrument(skip(self, region_id, track), fields(region_id = %region_id, track = %track))]
    async fn count_instances(
        &self,
        region_id: RegionId,
        track: Track,
    ) -> Result<InstanceCounts, DbError> {
        let row = self
            .bounded(
                "count_instances",
                sqlx::query_as::<_, CountsRow>(
                    r#"
                    SELECT
                        COUNT(*) FILTER (WHERE status IN ('free', 'pending', 'stopped')) AS total,
                        COUNT(*) FILTER (WHERE status = 'free') AS free,
                        COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                        COUNT(*) FILTER (WHERE status = 'stopped') AS stopped
                    FROM streaming_instances
                    WHERE region_id = $1 AND track = $2
                    "#,
                )
                .bind(region_id.to_string())
                .bind(track.as_str())
                .fetch_one(&self.pool),
            )
            .await?;

        InstanceCounts::try_from(row)
    }

    #[instrument(skip(self, region_id, track, statuses), fields(region_id = %region_id, track = %track))]
    async fn list_instance_identifiers(
        &self,
        region_id: RegionId,
        track: Track,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<InstanceRef>, DbError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = self
            .bounded(
                "list_instance_identifiers",
                sqlx::query_as::<_, InstanceRow>(
                    r#"
                    SELECT id, provider_instance_id, status, created_at
                    FROM streaming_instances
                    WHERE region_id = $1 AND track = $2 AND status = ANY($3)
                    ORDER BY created_at, id
                    "#,
                )
                .bind(region_id.to_string())
                .bind(track.as_str())
                .bind(statuses)
                .fetch_all(&self.pool),
            )
            .await?;

        decode_rows("list_instance_identifiers", rows, InstanceRef::try_from)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn insert_instance(&self, instance: &NewInstance) -> Result<(), DbError> {
        self.bounded(
            "insert_instance",
            sqlx::query(
                r#"
                INSERT INTO streaming_instances (id, region_id, track, port, status)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(instance.id.to_string())
            .bind(instance.region_id.to_string())
            .bind(instance.track.as_str())
            .bind(i32::from(instance.port))
            .bind(instance.status.as_str())
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update_instance(
        &self,
        key: &InstanceKey,
        patch: &InstancePatch,
    ) -> Result<u64, DbError> {
        let (ledger_id, provider_id) = match key {
            InstanceKey::Ledger(id) => (Some(id.to_string()), None),
            InstanceKey::Provider(id) => (None, Some(id.as_str().to_string())),
        };

        let result = self
            .bounded(
                "update_instance",
                sqlx::query(
                    r#"
                    UPDATE streaming_instances
                    SET provider_instance_id = COALESCE($1::text, provider_instance_id),
                        host = COALESCE($2::text, host),
                        port = COALESCE($3::int4, port),
                        status = COALESCE($4::text, status),
                        updated_at = now()
                    WHERE (id = $5::text
                           OR (provider_instance_id = $6::text AND status <> 'deleted'))
                      AND ($7::text IS NULL OR status = $7::text)
                    "#,
                )
                .bind(patch.provider_id.as_ref().map(|p| p.as_str().to_string()))
                .bind(patch.host.clone())
                .bind(patch.port.map(i32::from))
                .bind(patch.status.map(|s| s.as_str()))
                .bind(ledger_id)
                .bind(provider_id)
                .bind(patch.expected_status.map(|s| s.as_str()))
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, region_id), fields(region_id = %region_id))]
    async fn mark_occupied_from_running_sessions(
        &self,
        region_id: RegionId,
    ) -> Result<u64, DbError> {
        let result = self
            .bounded(
                "mark_occupied_from_running_sessions",
                sqlx::query(
                    r#"
                    UPDATE streaming_instances AS i
                    SET status = 'occupied', updated_at = now()
                    FROM streaming_sessions AS s
                    WHERE s.instance_id = i.id
                      AND s.status = 'running'
                      AND i.region_id = $1
                      AND i.status = 'free'
                    "#,
                )
                .bind(region_id.to_string())
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, region_id), fields(region_id = %region_id))]
    async fn list_instances_with_closed_sessions(
        &self,
        region_id: RegionId,
    ) -> Result<Vec<ClosedSessionInstance>, DbError> {
        let rows = self
            .bounded(
                "list_instances_with_closed_sessions",
                sqlx::query_as::<_, ClosedSessionRow>(
                    r#"
                    SELECT DISTINCT i.id, i.provider_instance_id, i.region_id, i.created_at
                    FROM streaming_sessions AS s
                    JOIN streaming_instances AS i ON i.id = s.instance_id
                    WHERE i.region_id = $1
                      AND s.status = 'closed'
                      AND i.status <> 'deleted'
                      AND i.provider_instance_id IS NOT NULL
                    ORDER BY i.created_at, i.id
                    "#,
                )
                .bind(region_id.to_string())
                .fetch_all(&self.pool),
            )
            .await?;

        decode_rows(
            "list_instances_with_closed_sessions",
            rows,
            ClosedSessionInstance::try_from,
        )
    }
}
