use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_domain::{
    Amount, AppointmentId, ClientId, PaymentId, PaymentMethod, PaymentStatus, ProviderId,
    ReleaseStatus,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    PaymentInsertOutcome, PaymentRecord, PaymentRepository, StoreError, WalletBalanceRecord,
    WalletRepository,
};

/// Postgres backing for the two money-critical stores. The partial unique
/// index is the data-layer guard the business check cannot replace: two
/// handlers may both observe "no completed payment yet", only one insert
/// wins.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS payments (
    payment_id                 UUID PRIMARY KEY,
    appointment_id             UUID NOT NULL,
    provider_id                UUID NOT NULL,
    client_id                  UUID NOT NULL,
    amount                     BIGINT NOT NULL,
    tax_amount                 BIGINT NOT NULL,
    commission_amount          BIGINT NOT NULL,
    provider_amount            BIGINT NOT NULL,
    payment_method             TEXT NOT NULL,
    status                     TEXT NOT NULL,
    gateway_session_id         TEXT,
    gateway_payment_intent_id  TEXT,
    can_release                BOOLEAN NOT NULL,
    release_status             TEXT NOT NULL,
    paid_at                    TIMESTAMPTZ NOT NULL,
    released_at                TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_payments_appointment_completed
    ON payments (appointment_id) WHERE status = 'completed';

CREATE TABLE IF NOT EXISTS wallet_balances (
    provider_id      UUID PRIMARY KEY,
    balance          BIGINT NOT NULL DEFAULT 0,
    pending_balance  BIGINT NOT NULL DEFAULT 0,
    total_earned     BIGINT NOT NULL DEFAULT 0,
    total_withdrawn  BIGINT NOT NULL DEFAULT 0
);
";

#[derive(Debug, Clone)]
pub struct PostgresSettlementStore {
    pool: PgPool,
}

impl PostgresSettlementStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn method_to_str(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Card => "card",
        PaymentMethod::Cash => "cash",
    }
}

fn method_from_str(raw: &str) -> Result<PaymentMethod, StoreError> {
    match raw {
        "card" => Ok(PaymentMethod::Card),
        "cash" => Ok(PaymentMethod::Cash),
        other => Err(StoreError::Database(format!(
            "unexpected payment method {other}"
        ))),
    }
}

fn status_to_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Completed => "completed",
        PaymentStatus::Failed => "failed",
    }
}

fn status_from_str(raw: &str) -> Result<PaymentStatus, StoreError> {
    match raw {
        "completed" => Ok(PaymentStatus::Completed),
        "failed" => Ok(PaymentStatus::Failed),
        other => Err(StoreError::Database(format!(
            "unexpected payment status {other}"
        ))),
    }
}

fn release_to_str(status: ReleaseStatus) -> &'static str {
    match status {
        ReleaseStatus::Pending => "pending",
        ReleaseStatus::Eligible => "eligible",
        ReleaseStatus::Completed => "completed",
    }
}

fn release_from_str(raw: &str) -> Result<ReleaseStatus, StoreError> {
    match raw {
        "pending" => Ok(ReleaseStatus::Pending),
        "eligible" => Ok(ReleaseStatus::Eligible),
        "completed" => Ok(ReleaseStatus::Completed),
        other => Err(StoreError::Database(format!(
            "unexpected release status {other}"
        ))),
    }
}

fn amount_column(row: &sqlx::postgres::PgRow, column: &str) -> Result<Amount, StoreError> {
    let raw: i64 = row.try_get(column).map_err(db_err)?;
    u64::try_from(raw)
        .map(Amount)
        .map_err(|_| StoreError::Database(format!("negative amount in column {column}")))
}

fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<PaymentRecord, StoreError> {
    let method_raw: String = row.try_get("payment_method").map_err(db_err)?;
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let release_raw: String = row.try_get("release_status").map_err(db_err)?;
    Ok(PaymentRecord {
        payment_id: PaymentId(row.try_get::<Uuid, _>("payment_id").map_err(db_err)?),
        appointment_id: AppointmentId(row.try_get::<Uuid, _>("appointment_id").map_err(db_err)?),
        provider_id: ProviderId(row.try_get::<Uuid, _>("provider_id").map_err(db_err)?),
        client_id: ClientId(row.try_get::<Uuid, _>("client_id").map_err(db_err)?),
        amount: amount_column(row, "amount")?,
        tax_amount: amount_column(row, "tax_amount")?,
        commission_amount: amount_column(row, "commission_amount")?,
        provider_amount: amount_column(row, "provider_amount")?,
        payment_method: method_from_str(&method_raw)?,
        status: status_from_str(&status_raw)?,
        gateway_session_id: row.try_get("gateway_session_id").map_err(db_err)?,
        gateway_payment_intent_id: row.try_get("gateway_payment_intent_id").map_err(db_err)?,
        can_release: row.try_get("can_release").map_err(db_err)?,
        release_status: release_from_str(&release_raw)?,
        paid_at: row.try_get("paid_at").map_err(db_err)?,
        released_at: row.try_get("released_at").map_err(db_err)?,
    })
}

#[async_trait]
impl PaymentRepository for PostgresSettlementStore {
    async fn insert_completed(
        &self,
        record: &PaymentRecord,
    ) -> Result<PaymentInsertOutcome, StoreError> {
        let amount =
            i64::try_from(record.amount.0).map_err(|e| StoreError::Database(e.to_string()))?;
        let tax =
            i64::try_from(record.tax_amount.0).map_err(|e| StoreError::Database(e.to_string()))?;
        let commission = i64::try_from(record.commission_amount.0)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let provider_amount = i64::try_from(record.provider_amount.0)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO payments \
             (payment_id, appointment_id, provider_id, client_id, amount, tax_amount, \
              commission_amount, provider_amount, payment_method, status, gateway_session_id, \
              gateway_payment_intent_id, can_release, release_status, paid_at, released_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16) \
             ON CONFLICT (appointment_id) WHERE status = 'completed' DO NOTHING",
        )
        .bind(record.payment_id.0)
        .bind(record.appointment_id.0)
        .bind(record.provider_id.0)
        .bind(record.client_id.0)
        .bind(amount)
        .bind(tax)
        .bind(commission)
        .bind(provider_amount)
        .bind(method_to_str(record.payment_method))
        .bind(status_to_str(record.status))
        .bind(&record.gateway_session_id)
        .bind(&record.gateway_payment_intent_id)
        .bind(record.can_release)
        .bind(release_to_str(record.release_status))
        .bind(record.paid_at)
        .bind(record.released_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(PaymentInsertOutcome::Inserted);
        }
        let existing = self
            .get_completed_by_appointment(record.appointment_id)
            .await?
            .ok_or_else(|| {
                StoreError::Database("conflicting payment row disappeared".to_string())
            })?;
        Ok(PaymentInsertOutcome::Duplicate(existing))
    }

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM payments WHERE payment_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn get_completed_by_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM payments WHERE appointment_id = $1 AND status = 'completed'",
        )
        .bind(appointment_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn list_unreleased(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM payments WHERE status = 'completed' AND release_status <> 'completed'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_payment).collect()
    }

    async fn update_release(&self, update: &crate::ReleaseUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE payments SET can_release = $2, release_status = $3, released_at = $4 \
             WHERE payment_id = $1",
        )
        .bind(update.payment_id.0)
        .bind(update.can_release)
        .bind(release_to_str(update.release_status))
        .bind(update.released_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(crate::not_found("payment", update.payment_id));
        }
        Ok(())
    }

    async fn list_by_provider_between(
        &self,
        provider_id: ProviderId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM payments \
             WHERE provider_id = $1 AND paid_at >= $2 AND paid_at < $3 \
             ORDER BY paid_at",
        )
        .bind(provider_id.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_payment).collect()
    }
}

#[async_trait]
impl WalletRepository for PostgresSettlementStore {
    async fn credit_pending(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let delta = i64::try_from(amount.0).map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query(
            "INSERT INTO wallet_balances (provider_id, pending_balance) VALUES ($1, $2) \
             ON CONFLICT (provider_id) \
             DO UPDATE SET pending_balance = wallet_balances.pending_balance + $2",
        )
        .bind(provider_id.0)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn release_to_balance(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let delta = i64::try_from(amount.0).map_err(|e| StoreError::Database(e.to_string()))?;
        // One statement, one row: the guard in the WHERE clause makes the
        // read-check-write atomic without an explicit transaction.
        let result = sqlx::query(
            "UPDATE wallet_balances \
             SET pending_balance = pending_balance - $2, \
                 balance = balance + $2, \
                 total_earned = total_earned + $2 \
             WHERE provider_id = $1 AND pending_balance >= $2",
        )
        .bind(provider_id.0)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InsufficientPendingBalance(provider_id));
        }
        Ok(())
    }

    async fn record_earned(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let delta = i64::try_from(amount.0).map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query(
            "INSERT INTO wallet_balances (provider_id, total_earned) VALUES ($1, $2) \
             ON CONFLICT (provider_id) \
             DO UPDATE SET total_earned = wallet_balances.total_earned + $2",
        )
        .bind(provider_id.0)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<WalletBalanceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM wallet_balances WHERE provider_id = $1")
            .bind(provider_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(WalletBalanceRecord {
            provider_id: ProviderId(row.try_get::<Uuid, _>("provider_id").map_err(db_err)?),
            balance: amount_column(&row, "balance")?,
            pending_balance: amount_column(&row, "pending_balance")?,
            total_earned: amount_column(&row, "total_earned")?,
            total_withdrawn: amount_column(&row, "total_withdrawn")?,
        }))
    }
}
