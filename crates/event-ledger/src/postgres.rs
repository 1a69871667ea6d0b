use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{EventLedgerError, EventLedgerRepository, GatewayEventRecord, GatewayEventStatus};

/// Expected schema. The unique primary key on `event_id` is what closes the
/// duplicate-delivery race; business checks are only the second line of
/// defense.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS gateway_events (
    event_id      TEXT PRIMARY KEY,
    event_type    TEXT NOT NULL,
    payload_hash  TEXT NOT NULL,
    status        TEXT NOT NULL,
    error_detail  TEXT,
    received_at   TIMESTAMPTZ NOT NULL,
    processed_at  TIMESTAMPTZ
);
";

#[derive(Debug, Clone)]
pub struct PostgresEventLedger {
    pool: PgPool,
}

impl PostgresEventLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), EventLedgerError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| EventLedgerError::Database(e.to_string()))?;
        Ok(())
    }
}

fn status_to_str(status: GatewayEventStatus) -> &'static str {
    match status {
        GatewayEventStatus::Received => "received",
        GatewayEventStatus::Processed => "processed",
        GatewayEventStatus::Error => "error",
    }
}

fn status_from_str(raw: &str) -> Result<GatewayEventStatus, EventLedgerError> {
    match raw {
        "received" => Ok(GatewayEventStatus::Received),
        "processed" => Ok(GatewayEventStatus::Processed),
        "error" => Ok(GatewayEventStatus::Error),
        other => Err(EventLedgerError::Database(format!(
            "unexpected gateway event status {other}"
        ))),
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<GatewayEventRecord, EventLedgerError> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| EventLedgerError::Database(e.to_string()))?;
    Ok(GatewayEventRecord {
        event_id: row
            .try_get("event_id")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
        event_type: row
            .try_get("event_type")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
        payload_hash: row
            .try_get("payload_hash")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
        status: status_from_str(&status_raw)?,
        error_detail: row
            .try_get("error_detail")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
        received_at: row
            .try_get("received_at")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| EventLedgerError::Database(e.to_string()))?,
    })
}

#[async_trait]
impl EventLedgerRepository for PostgresEventLedger {
    async fn insert_if_absent(
        &self,
        record: &GatewayEventRecord,
    ) -> Result<bool, EventLedgerError> {
        let result = sqlx::query(
            "INSERT INTO gateway_events \
             (event_id, event_type, payload_hash, status, error_detail, received_at, processed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(&record.payload_hash)
        .bind(status_to_str(record.status))
        .bind(&record.error_detail)
        .bind(record.received_at)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EventLedgerError::Database(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError> {
        let result = sqlx::query(
            "UPDATE gateway_events SET status = 'processed', processed_at = $2 \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EventLedgerError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EventLedgerError::UnknownEvent(event_id.to_string()));
        }
        Ok(())
    }

    async fn mark_error(
        &self,
        event_id: &str,
        detail: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError> {
        let result = sqlx::query(
            "UPDATE gateway_events SET status = 'error', error_detail = $2, processed_at = $3 \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(detail)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EventLedgerError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EventLedgerError::UnknownEvent(event_id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<GatewayEventRecord>, EventLedgerError> {
        let row = sqlx::query("SELECT * FROM gateway_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventLedgerError::Database(e.to_string()))?;
        row.as_ref().map(row_to_record).transpose()
    }
}
