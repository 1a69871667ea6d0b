use std::sync::Arc;

use chrono::Utc;
use marketplace_domain::{
    Amount, AppointmentId, DebtId, DebtStatus, PaymentId, PaymentMethod, PaymentStatus,
    ReleaseStatus, TraceId, TransactionId, TransactionKind,
};
use platform_settings::SettingsProvider;
use settlement_store::{
    AppointmentRecord, AppointmentRepository, CommissionDebtRecord, CommissionDebtRepository,
    PaymentInsertOutcome, PaymentRecord, PaymentRepository, TransactionRecord,
    TransactionRepository, WalletRepository,
};
use tracing::{info, warn};

use crate::error::SettlementError;
use crate::notify::{send_best_effort, Notice, NotificationSink, NotifyTarget};
use crate::split::CommissionPolicy;

/// Everything the engine needs from the relational store. The in-memory
/// store implements the whole set; production wiring may split the traits
/// across backends.
pub trait SettlementStore:
    AppointmentRepository
    + PaymentRepository
    + CommissionDebtRepository
    + WalletRepository
    + TransactionRepository
{
}

impl<T> SettlementStore for T where
    T: AppointmentRepository
        + PaymentRepository
        + CommissionDebtRepository
        + WalletRepository
        + TransactionRepository
{
}

/// Gateway identifiers carried onto the payment row. Both fields are absent
/// on the cash path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayRefs {
    pub session_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

pub struct SettlementEngine<S> {
    pub(crate) store: S,
    pub(crate) settings: Arc<dyn SettingsProvider>,
    pub(crate) notifications: Option<Arc<dyn NotificationSink>>,
}

impl<S: SettlementStore> SettlementEngine<S> {
    pub fn new(store: S, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            store,
            settings,
            notifications: None,
        }
    }

    #[must_use]
    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn notification_sink(&self) -> Option<&dyn NotificationSink> {
        self.notifications.as_deref()
    }

    pub(crate) async fn require_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<AppointmentRecord, SettlementError> {
        AppointmentRepository::get(&self.store, appointment_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("appointment", appointment_id))
    }

    /// Records a completed payment for an appointment, exactly once.
    ///
    /// Duplicate triggers (webhook redelivery, repeated cash declarations)
    /// resolve to the already-recorded payment and are treated as success,
    /// so at-least-once delivery upstream stays harmless.
    pub async fn record_payment(
        &self,
        appointment_id: AppointmentId,
        gross: Amount,
        method: PaymentMethod,
        gateway_refs: GatewayRefs,
        trace_id: TraceId,
    ) -> Result<PaymentRecord, SettlementError> {
        if gross.is_zero() {
            return Err(SettlementError::InvalidAmount(
                "gross amount must be positive".to_string(),
            ));
        }
        let appointment = self.require_appointment(appointment_id).await?;

        if let Some(existing) = self
            .store
            .get_completed_by_appointment(appointment_id)
            .await?
        {
            info!(
                appointment_id = %appointment_id,
                payment_id = %existing.payment_id,
                "payment already recorded, returning existing row"
            );
            return Ok(existing);
        }

        let settings = self.settings.current().await?;
        let split = CommissionPolicy::from_settings(&settings).split(gross)?;

        let now = Utc::now();
        let record = PaymentRecord {
            payment_id: PaymentId::new(),
            appointment_id,
            provider_id: appointment.provider_id,
            client_id: appointment.client_id,
            amount: split.gross,
            tax_amount: split.tax_amount,
            commission_amount: split.commission_amount,
            provider_amount: split.provider_amount,
            payment_method: method,
            status: PaymentStatus::Completed,
            gateway_session_id: gateway_refs.session_id,
            gateway_payment_intent_id: gateway_refs.payment_intent_id,
            can_release: true,
            release_status: match method {
                // The provider already physically holds cash; only the
                // bookkeeping completion is pending.
                PaymentMethod::Cash => ReleaseStatus::Eligible,
                PaymentMethod::Card => ReleaseStatus::Pending,
            },
            paid_at: now,
            released_at: None,
        };

        let record = match self.store.insert_completed(&record).await? {
            PaymentInsertOutcome::Inserted => record,
            PaymentInsertOutcome::Duplicate(existing) => {
                info!(
                    appointment_id = %appointment_id,
                    payment_id = %existing.payment_id,
                    "lost the payment insert race, returning winner"
                );
                return Ok(existing);
            }
        };

        if method == PaymentMethod::Card {
            self.store
                .credit_pending(record.provider_id, record.provider_amount)
                .await?;
            self.store
                .append(&TransactionRecord {
                    transaction_id: TransactionId::new(),
                    provider_id: record.provider_id,
                    kind: TransactionKind::PaymentHeld,
                    amount: record.provider_amount,
                    payment_id: Some(record.payment_id),
                    appointment_id: Some(appointment_id),
                    occurred_at: now,
                    trace_id,
                })
                .await?;
        }

        let code = self.ensure_verification_code(&appointment).await?;

        send_best_effort(
            self.notification_sink(),
            NotifyTarget::Client(record.client_id),
            Notice {
                title: "Payment received".to_string(),
                body: format!(
                    "Share code {code} with your provider once the service is complete."
                ),
                data: serde_json::json!({
                    "appointment_id": appointment_id,
                    "verification_code": code,
                }),
            },
        )
        .await;
        send_best_effort(
            self.notification_sink(),
            NotifyTarget::Provider(record.provider_id),
            Notice {
                title: "Payment received".to_string(),
                body: format!("Payment of {} recorded for your appointment.", record.amount),
                data: serde_json::json!({
                    "appointment_id": appointment_id,
                    "payment_id": record.payment_id,
                }),
            },
        )
        .await;

        info!(
            appointment_id = %appointment_id,
            payment_id = %record.payment_id,
            amount = %record.amount,
            commission = %record.commission_amount,
            tax = %record.tax_amount,
            provider_amount = %record.provider_amount,
            method = ?method,
            trace_id = %trace_id,
            "payment recorded"
        );
        Ok(record)
    }

    /// Issues the appointment's verification code once; later calls reuse
    /// the stored code.
    pub(crate) async fn ensure_verification_code(
        &self,
        appointment: &AppointmentRecord,
    ) -> Result<String, SettlementError> {
        if let Some(code) = &appointment.verification_code {
            return Ok(code.clone());
        }
        let code = verification_code::generate();
        self.store
            .set_verification_code(appointment.appointment_id, &code, Utc::now())
            .await?;
        Ok(code)
    }

    /// Cash settlement tail shared by direct collection, code-gated
    /// collection and positive closure resolution: record the payment, stamp
    /// cash verification, accrue the commission debt.
    pub(crate) async fn settle_cash(
        &self,
        appointment: &AppointmentRecord,
        trace_id: TraceId,
    ) -> Result<CashSettlement, SettlementError> {
        let payment = self
            .record_payment(
                appointment.appointment_id,
                appointment.price,
                PaymentMethod::Cash,
                GatewayRefs::default(),
                trace_id,
            )
            .await?;

        if appointment.cash_verified_at.is_none() {
            self.store
                .mark_cash_verified(appointment.appointment_id, Utc::now())
                .await?;
        }

        let debt = match self.accrue_commission_debt(&payment, trace_id).await {
            Ok(debt) => Some(debt),
            Err(err) => {
                // The payment is the higher-priority invariant; a failed
                // debt insert is operator-visible, not a rollback.
                warn!(
                    appointment_id = %appointment.appointment_id,
                    payment_id = %payment.payment_id,
                    error = %err,
                    "commission debt insert failed after cash payment"
                );
                None
            }
        };

        Ok(CashSettlement { payment, debt })
    }

    pub(crate) async fn accrue_commission_debt(
        &self,
        payment: &PaymentRecord,
        trace_id: TraceId,
    ) -> Result<CommissionDebtRecord, SettlementError> {
        if let Some(existing) = self.store.get_by_payment(payment.payment_id).await? {
            return Ok(existing);
        }
        let settings = self.settings.current().await?;
        let debt = CommissionDebtRecord {
            debt_id: DebtId::new(),
            provider_id: payment.provider_id,
            appointment_id: payment.appointment_id,
            payment_id: payment.payment_id,
            commission_amount: payment.commission_amount,
            status: DebtStatus::Pending,
            due_date: payment.paid_at + chrono::Duration::days(settings.cash_commission_due_days),
            settled_amount: Amount::ZERO,
            attempt_count: 0,
        };
        if CommissionDebtRepository::insert_if_absent(&self.store, &debt).await? {
            self.store
                .append(&TransactionRecord {
                    transaction_id: TransactionId::new(),
                    provider_id: payment.provider_id,
                    kind: TransactionKind::CommissionDebtAccrued,
                    amount: payment.commission_amount,
                    payment_id: Some(payment.payment_id),
                    appointment_id: Some(payment.appointment_id),
                    occurred_at: Utc::now(),
                    trace_id,
                })
                .await?;
            info!(
                payment_id = %payment.payment_id,
                debt_id = %debt.debt_id,
                commission = %debt.commission_amount,
                due_date = %debt.due_date,
                "commission debt accrued"
            );
            Ok(debt)
        } else {
            self.store
                .get_by_payment(payment.payment_id)
                .await?
                .ok_or_else(|| SettlementError::not_found("commission debt", payment.payment_id))
        }
    }
}

/// Outcome of a cash settlement. `debt` is absent when the debt insert
/// failed and was logged for operator follow-up.
#[derive(Debug, Clone)]
pub struct CashSettlement {
    pub payment: PaymentRecord,
    pub debt: Option<CommissionDebtRecord>,
}
