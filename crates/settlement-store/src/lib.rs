//! Records and repository traits for the settlement core: appointments
//! (settlement-relevant fields only), payments, commission debts, wallet
//! balances and the append-only transaction ledger.
//!
//! Two invariants are enforced at this layer rather than in business logic,
//! because the business check alone cannot close the race window:
//! at most one completed payment per appointment (insert-if-absent), and
//! wallet mutations as single-row atomic arithmetic updates.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_domain::{
    Amount, AppointmentId, AppointmentStatus, ClientClosureAction, ClientId, ClosureNotes,
    ClosureState, DebtId, DebtStatus, PaymentId, PaymentMethod, PaymentStatus,
    ProviderClosureAction, ProviderId, ReleaseStatus, TraceId, TransactionId, TransactionKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemorySettlementStore;
pub use postgres::PostgresSettlementStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("insufficient pending balance for provider {0}")]
    InsufficientPendingBalance(ProviderId),
    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub appointment_id: AppointmentId,
    pub client_id: ClientId,
    pub provider_id: ProviderId,
    pub price: Amount,
    pub status: AppointmentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub verification_code: Option<String>,
    pub code_generated_at: Option<DateTime<Utc>>,
    pub verification_attempts: u8,
    pub service_verified_at: Option<DateTime<Utc>>,
    pub cash_verified_at: Option<DateTime<Utc>>,
    pub closure_state: ClosureState,
    pub closure_due_at: Option<DateTime<Utc>>,
    pub closure_provider_action: ProviderClosureAction,
    pub closure_client_action: ClientClosureAction,
    pub closure_notes: ClosureNotes,
}

impl AppointmentRecord {
    /// Fresh record the way the booking flow hands it over: confirmed, no
    /// payment path chosen yet.
    #[must_use]
    pub fn confirmed(
        appointment_id: AppointmentId,
        client_id: ClientId,
        provider_id: ProviderId,
        price: Amount,
    ) -> Self {
        Self {
            appointment_id,
            client_id,
            provider_id,
            price,
            status: AppointmentStatus::Confirmed,
            payment_method: None,
            verification_code: None,
            code_generated_at: None,
            verification_attempts: 0,
            service_verified_at: None,
            cash_verified_at: None,
            closure_state: ClosureState::None,
            closure_due_at: None,
            closure_provider_action: ProviderClosureAction::None,
            closure_client_action: ClientClosureAction::None,
            closure_notes: ClosureNotes::default(),
        }
    }
}

/// Full closure block written back after every closure action; the engine
/// computes the transition, the store persists it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureUpdate {
    pub appointment_id: AppointmentId,
    pub closure_state: ClosureState,
    pub closure_due_at: Option<DateTime<Utc>>,
    pub provider_action: ProviderClosureAction,
    pub client_action: ClientClosureAction,
    pub notes: ClosureNotes,
}

#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    async fn upsert(&self, record: &AppointmentRecord) -> Result<(), StoreError>;

    async fn get(&self, id: AppointmentId) -> Result<Option<AppointmentRecord>, StoreError>;

    async fn set_payment_method(
        &self,
        id: AppointmentId,
        method: PaymentMethod,
    ) -> Result<(), StoreError>;

    async fn set_verification_code(
        &self,
        id: AppointmentId,
        code: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns the counter value after the increment.
    async fn increment_verification_attempts(&self, id: AppointmentId)
        -> Result<u8, StoreError>;

    async fn reset_verification_attempts(&self, id: AppointmentId) -> Result<(), StoreError>;

    async fn mark_service_verified(
        &self,
        id: AppointmentId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_cash_verified(
        &self,
        id: AppointmentId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_closure(&self, update: &ClosureUpdate) -> Result<(), StoreError>;

    /// Cash appointments of the provider that block new cash actions:
    /// `pending_close` past due, or already escalated to `in_review`.
    async fn list_closure_blockers_for_provider(
        &self,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError>;

    async fn list_closure_blockers_for_client(
        &self,
        client_id: ClientId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError>;

    /// Every cash appointment still in `pending_close` past its due date,
    /// for the review sweep.
    async fn list_overdue_pending_close(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub appointment_id: AppointmentId,
    pub provider_id: ProviderId,
    pub client_id: ClientId,
    pub amount: Amount,
    pub tax_amount: Amount,
    pub commission_amount: Amount,
    pub provider_amount: Amount,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub gateway_session_id: Option<String>,
    pub gateway_payment_intent_id: Option<String>,
    pub can_release: bool,
    pub release_status: ReleaseStatus,
    pub paid_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Result of the insert-if-absent on `(appointment_id, completed)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentInsertOutcome {
    Inserted,
    /// Another completed payment already exists; the existing row is
    /// returned so redelivery can be answered as success.
    Duplicate(PaymentRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseUpdate {
    pub payment_id: PaymentId,
    pub can_release: bool,
    pub release_status: ReleaseStatus,
    pub released_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert_completed(
        &self,
        record: &PaymentRecord,
    ) -> Result<PaymentInsertOutcome, StoreError>;

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>, StoreError>;

    async fn get_completed_by_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Option<PaymentRecord>, StoreError>;

    /// Completed payments whose release has not finished.
    async fn list_unreleased(&self) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn update_release(&self, update: &ReleaseUpdate) -> Result<(), StoreError>;

    async fn list_by_provider_between(
        &self,
        provider_id: ProviderId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionDebtRecord {
    pub debt_id: DebtId,
    pub provider_id: ProviderId,
    pub appointment_id: AppointmentId,
    pub payment_id: PaymentId,
    pub commission_amount: Amount,
    pub status: DebtStatus,
    pub due_date: DateTime<Utc>,
    pub settled_amount: Amount,
    pub attempt_count: u32,
}

/// Appended whenever a partial or full charge against a debt succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtSettlementRecord {
    pub debt_id: DebtId,
    pub amount: Amount,
    pub charged_at: DateTime<Utc>,
    pub reference: Option<String>,
}

#[async_trait]
pub trait CommissionDebtRepository: Send + Sync {
    /// Insert-if-absent keyed by payment id; a payment accrues at most one
    /// debt.
    async fn insert_if_absent(&self, record: &CommissionDebtRecord) -> Result<bool, StoreError>;

    async fn get(&self, id: DebtId) -> Result<Option<CommissionDebtRecord>, StoreError>;

    async fn get_by_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<CommissionDebtRecord>, StoreError>;

    async fn list_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<CommissionDebtRecord>, StoreError>;

    /// Applies a successful charge: bumps `settled_amount` and
    /// `attempt_count`, flips the debt to `paid` once the commission is
    /// covered. Returns the updated debt.
    async fn append_settlement(
        &self,
        settlement: &DebtSettlementRecord,
    ) -> Result<CommissionDebtRecord, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalanceRecord {
    pub provider_id: ProviderId,
    pub balance: Amount,
    pub pending_balance: Amount,
    pub total_earned: Amount,
    pub total_withdrawn: Amount,
}

impl WalletBalanceRecord {
    #[must_use]
    pub fn empty(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            balance: Amount::ZERO,
            pending_balance: Amount::ZERO,
            total_earned: Amount::ZERO,
            total_withdrawn: Amount::ZERO,
        }
    }
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Holds a provider share in escrow. Creates the wallet row when absent.
    async fn credit_pending(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError>;

    /// Moves a held share into the spendable balance and counts it as
    /// earned, as one atomic single-row update.
    async fn release_to_balance(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError>;

    /// Bookkeeping for funds that never entered custody (cash): only
    /// `total_earned` advances.
    async fn record_earned(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError>;

    async fn get(&self, provider_id: ProviderId)
        -> Result<Option<WalletBalanceRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub provider_id: ProviderId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub payment_id: Option<PaymentId>,
    pub appointment_id: Option<AppointmentId>,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn append(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    async fn list_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<TransactionRecord>, StoreError>;
}

pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}
