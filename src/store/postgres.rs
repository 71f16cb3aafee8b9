//! PostgreSQL slot store.
//!
//! Production storage backend. Every status change is a conditional
//! single-row update (`UPDATE .. WHERE id = $1 AND status = $2`), so the
//! store stays consistent even when several service replicas share it.
//! Queries are runtime-bound so the crate builds without a live database.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Result, WarmingError};
use crate::slot::{
    AnySlot, Claimed, Expired, Preparing, ProviderKind, Ready, Slot, SlotData, SlotId, SlotState,
    SlotStatus, UserId,
};

use super::SlotStore;

const ACTIVE_STATUSES: [&str; 2] = ["preparing", "ready"];

/// PostgreSQL implementation of the [`SlotStore`] trait.
#[derive(Clone)]
pub struct PostgresSlotStore {
    pool: PgPool,
}

impl PostgresSlotStore {
    /// Create a new store from an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WarmingError::Other(anyhow::anyhow!("migration failed: {e}")))?;
        Ok(())
    }
}

fn row_to_slot(row: &PgRow) -> Result<AnySlot> {
    let status: String = row.try_get("status")?;
    let status: SlotStatus = status
        .parse()
        .map_err(|e: String| WarmingError::Other(anyhow::anyhow!(e)))?;
    let provider: String = row.try_get("provider")?;
    let provider: ProviderKind = provider
        .parse()
        .map_err(|e: String| WarmingError::Other(anyhow::anyhow!(e)))?;

    let data = SlotData {
        id: row.try_get::<Uuid, _>("id")?,
        user_id: row.try_get::<Uuid, _>("user_id")?,
        template_id: row.try_get("template_id")?,
        provider,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    };

    let connection = |row: &PgRow| -> Result<(String, String, u16, DateTime<Utc>)> {
        let instance_id: Option<String> = row.try_get("provider_instance_id")?;
        let host: Option<String> = row.try_get("host")?;
        let port: Option<i32> = row.try_get("port")?;
        let ready_at: Option<DateTime<Utc>> = row.try_get("ready_at")?;
        match (instance_id, host, port, ready_at) {
            (Some(instance_id), Some(host), Some(port), Some(ready_at)) => {
                Ok((instance_id, host, port as u16, ready_at))
            }
            _ => Err(WarmingError::Other(anyhow::anyhow!(
                "slot {} is {} but is missing connection info",
                data.id,
                status
            ))),
        }
    };

    let slot = match status {
        SlotStatus::Preparing => AnySlot::Preparing(Slot {
            state: Preparing {},
            data,
        }),
        SlotStatus::Ready => {
            let (provider_instance_id, host, port, ready_at) = connection(row)?;
            AnySlot::Ready(Slot {
                state: Ready {
                    provider_instance_id,
                    host,
                    port,
                    ready_at,
                },
                data,
            })
        }
        SlotStatus::Claimed => {
            let (provider_instance_id, host, port, ready_at) = connection(row)?;
            let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
            let claimed_at = claimed_at.ok_or_else(|| {
                WarmingError::Other(anyhow::anyhow!("claimed slot {} has no claimed_at", data.id))
            })?;
            AnySlot::Claimed(Slot {
                state: Claimed {
                    provider_instance_id,
                    host,
                    port,
                    ready_at,
                    claimed_at,
                },
                data,
            })
        }
        SlotStatus::Expired => {
            let provider_instance_id: Option<String> = row.try_get("provider_instance_id")?;
            // Rows predating the expired_at column fall back to expires_at.
            let expired_at: Option<DateTime<Utc>> = row.try_get("expired_at")?;
            AnySlot::Expired(Slot {
                state: Expired {
                    provider_instance_id,
                    expired_at: expired_at.unwrap_or(data.expires_at),
                },
                data,
            })
        }
    };

    Ok(slot)
}

const SELECT_COLUMNS: &str = "id, user_id, template_id, provider, provider_instance_id, status, \
     host, port, created_at, ready_at, claimed_at, expired_at, expires_at";

impl SlotStore for PostgresSlotStore {
    async fn insert(&self, slot: Slot<Preparing>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO warm_slots (id, user_id, template_id, provider, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, 'preparing', $5, $6)
            "#,
        )
        .bind(slot.data.id)
        .bind(slot.data.user_id)
        .bind(&slot.data.template_id)
        .bind(slot.data.provider.as_str())
        .bind(slot.data.created_at)
        .bind(slot.data.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: SlotId) -> Result<AnySlot> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM warm_slots WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_slot(&row),
            None => Err(WarmingError::SlotNotFound(id)),
        }
    }

    async fn find_active(&self, user_id: UserId, template_id: &str) -> Result<Option<AnySlot>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM warm_slots
            WHERE user_id = $1 AND template_id = $2 AND status = ANY($3)
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(template_id)
        .bind(&ACTIVE_STATUSES[..])
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_slot).transpose()
    }

    async fn list_active(&self, user_id: UserId) -> Result<Vec<AnySlot>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM warm_slots
            WHERE user_id = $1 AND status = ANY($2)
            ORDER BY created_at ASC
            "#
        ))
        .bind(user_id)
        .bind(&ACTIVE_STATUSES[..])
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_slot).collect()
    }

    async fn count_active(&self, user_id: UserId) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warm_slots WHERE user_id = $1 AND status = ANY($2)",
        )
        .bind(user_id)
        .bind(&ACTIVE_STATUSES[..])
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }

    async fn find_ready(
        &self,
        user_id: UserId,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Slot<Ready>>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM warm_slots
            WHERE user_id = $1 AND template_id = $2 AND status = 'ready' AND expires_at > $3
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(template_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .as_ref()
            .map(row_to_slot)
            .transpose()?
            .and_then(AnySlot::into_ready))
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<AnySlot>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM warm_slots
            WHERE status = ANY($1) AND expires_at < $2
            "#
        ))
        .bind(&ACTIVE_STATUSES[..])
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_slot).collect()
    }

    async fn extend_expiry(
        &self,
        id: SlotId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        // GREATEST keeps extension monotonic even under concurrent triggers.
        let row = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE warm_slots
            SET expires_at = GREATEST(expires_at, $2)
            WHERE id = $1 AND status = ANY($3)
            RETURNING expires_at
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .bind(&ACTIVE_STATUSES[..])
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn transition<T: SlotState + Clone>(
        &self,
        expected: SlotStatus,
        slot: &Slot<T>,
    ) -> Result<bool>
    where
        AnySlot: From<Slot<T>>,
    {
        let rows_affected = match AnySlot::from(slot.clone()) {
            AnySlot::Preparing(s) => {
                sqlx::query(
                    r#"
                    UPDATE warm_slots
                    SET status = 'preparing', provider_instance_id = NULL,
                        host = NULL, port = NULL, ready_at = NULL
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(s.data.id)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnySlot::Ready(s) => {
                sqlx::query(
                    r#"
                    UPDATE warm_slots
                    SET status = 'ready', provider_instance_id = $3,
                        host = $4, port = $5, ready_at = $6
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(s.data.id)
                .bind(expected.as_str())
                .bind(&s.state.provider_instance_id)
                .bind(&s.state.host)
                .bind(s.state.port as i32)
                .bind(s.state.ready_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnySlot::Claimed(s) => {
                sqlx::query(
                    r#"
                    UPDATE warm_slots
                    SET status = 'claimed', claimed_at = $3
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(s.data.id)
                .bind(expected.as_str())
                .bind(s.state.claimed_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnySlot::Expired(s) => {
                sqlx::query(
                    r#"
                    UPDATE warm_slots
                    SET status = 'expired', expired_at = $3,
                        provider_instance_id = COALESCE($4, provider_instance_id),
                        host = NULL, port = NULL
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(s.data.id)
                .bind(expected.as_str())
                .bind(s.state.expired_at)
                .bind(&s.state.provider_instance_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        Ok(rows_affected > 0)
    }
}
