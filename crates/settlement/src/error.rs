use marketplace_domain::{AppointmentId, Amount, MoneyError};
use platform_settings::SettingsError;
use settlement_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("{0}")]
    Validation(String),
    #[error("cash amount {amount} exceeds cap {cap}")]
    CashCapExceeded { amount: Amount, cap: Amount },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("verification code mismatch, {remaining_attempts} attempts remaining")]
    CodeMismatch { remaining_attempts: u8 },
    #[error("verification attempts exceeded, manual reset required")]
    AttemptsExceeded,
    #[error("appointment {0} has an overdue unresolved closure")]
    OverdueClosure(AppointmentId),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
}

impl SettlementError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
