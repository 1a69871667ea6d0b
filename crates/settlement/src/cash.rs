use chrono::Utc;
use marketplace_domain::{
    AppointmentId, AppointmentStatus, ClientId, PaymentMethod, ProviderId, TraceId,
};
use settlement_store::{
    AppointmentRecord, AppointmentRepository, CommissionDebtRepository, PaymentRepository,
};
use tracing::info;
use verification_code::{AttemptPolicy, CodeError};

use crate::engine::{CashSettlement, SettlementEngine, SettlementStore};
use crate::error::SettlementError;
use crate::notify::{send_best_effort, Notice, NotifyTarget};

/// Party attempting a cash action; the closure gate is evaluated against
/// this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashActor {
    Provider(ProviderId),
    Client(ClientId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashSelection {
    pub appointment_id: AppointmentId,
    pub code_issued: bool,
}

impl<S: SettlementStore> SettlementEngine<S> {
    /// Cash closure gate: a party with any cash appointment stuck in
    /// `pending_close` past due (or escalated to review) may not start new
    /// cash actions until it resolves.
    pub(crate) async fn ensure_no_overdue_closure(
        &self,
        actor: CashActor,
    ) -> Result<(), SettlementError> {
        let now = Utc::now();
        let blockers = match actor {
            CashActor::Provider(id) => {
                self.store
                    .list_closure_blockers_for_provider(id, now)
                    .await?
            }
            CashActor::Client(id) => {
                self.store.list_closure_blockers_for_client(id, now).await?
            }
        };
        if let Some(blocked) = blockers.first() {
            return Err(SettlementError::OverdueClosure(blocked.appointment_id));
        }
        Ok(())
    }

    async fn ensure_under_cash_cap(
        &self,
        appointment: &AppointmentRecord,
    ) -> Result<(), SettlementError> {
        let settings = self.settings.current().await?;
        if appointment.price > settings.cash_max_amount {
            return Err(SettlementError::CashCapExceeded {
                amount: appointment.price,
                cap: settings.cash_max_amount,
            });
        }
        Ok(())
    }

    fn ensure_cash_actor(
        appointment: &AppointmentRecord,
        actor: CashActor,
    ) -> Result<(), SettlementError> {
        let authorized = match actor {
            CashActor::Provider(id) => appointment.provider_id == id,
            CashActor::Client(id) => appointment.client_id == id,
        };
        if authorized {
            Ok(())
        } else {
            Err(SettlementError::Unauthorized(
                "actor is not a party of this appointment".to_string(),
            ))
        }
    }

    fn ensure_cash_method(appointment: &AppointmentRecord) -> Result<(), SettlementError> {
        match appointment.payment_method {
            Some(PaymentMethod::Card) => Err(SettlementError::Conflict(
                "appointment is already on the card path".to_string(),
            )),
            Some(PaymentMethod::Cash) | None => Ok(()),
        }
    }

    /// Either party opts the appointment into cash. Pins the payment method
    /// and issues (or reuses) the verification code the client will hand to
    /// the provider at completion.
    pub async fn select_cash_payment(
        &self,
        appointment_id: AppointmentId,
        actor: CashActor,
    ) -> Result<CashSelection, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        Self::ensure_cash_actor(&appointment, actor)?;
        self.ensure_no_overdue_closure(actor).await?;
        self.ensure_under_cash_cap(&appointment).await?;
        Self::ensure_cash_method(&appointment)?;

        if appointment.payment_method.is_none() {
            self.store
                .set_payment_method(appointment_id, PaymentMethod::Cash)
                .await?;
        }

        let code_issued = appointment.verification_code.is_none();
        let code = self.ensure_verification_code(&appointment).await?;
        if code_issued {
            send_best_effort(
                self.notification_sink(),
                NotifyTarget::Client(appointment.client_id),
                Notice {
                    title: "Cash payment selected".to_string(),
                    body: format!(
                        "Share code {code} with your provider to confirm the cash payment."
                    ),
                    data: serde_json::json!({
                        "appointment_id": appointment_id,
                        "verification_code": code,
                    }),
                },
            )
            .await;
        }

        info!(
            appointment_id = %appointment_id,
            code_issued,
            "cash payment selected"
        );
        Ok(CashSelection {
            appointment_id,
            code_issued,
        })
    }

    /// Direct collection: the provider declares cash received for a
    /// confirmed appointment. Settles immediately and accrues the
    /// commission debt.
    pub async fn collect_cash(
        &self,
        appointment_id: AppointmentId,
        provider_id: ProviderId,
        trace_id: TraceId,
    ) -> Result<CashSettlement, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        Self::ensure_cash_actor(&appointment, CashActor::Provider(provider_id))?;
        self.ensure_no_overdue_closure(CashActor::Provider(provider_id))
            .await?;
        self.ensure_under_cash_cap(&appointment).await?;
        Self::ensure_cash_method(&appointment)?;
        if appointment.status != AppointmentStatus::Confirmed {
            return Err(SettlementError::Validation(
                "cash can only be collected for a confirmed appointment".to_string(),
            ));
        }

        if appointment.payment_method.is_none() {
            self.store
                .set_payment_method(appointment_id, PaymentMethod::Cash)
                .await?;
        }
        self.settle_cash(&appointment, trace_id).await
    }

    /// Code-gated collection: the provider submits the code obtained from
    /// the client; a match settles, a mismatch burns one shared attempt.
    pub async fn verify_cash_code(
        &self,
        appointment_id: AppointmentId,
        provider_id: ProviderId,
        code: &str,
        trace_id: TraceId,
    ) -> Result<CashSettlement, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        Self::ensure_cash_actor(&appointment, CashActor::Provider(provider_id))?;
        self.ensure_no_overdue_closure(CashActor::Provider(provider_id))
            .await?;
        self.ensure_under_cash_cap(&appointment).await?;

        if appointment.payment_method != Some(PaymentMethod::Cash) {
            return Err(SettlementError::Validation(
                "cash has not been selected for this appointment".to_string(),
            ));
        }

        if let Some(existing) = self
            .store
            .get_completed_by_appointment(appointment_id)
            .await?
        {
            let debt = self.store.get_by_payment(existing.payment_id).await?;
            return Ok(CashSettlement {
                payment: existing,
                debt,
            });
        }

        self.check_code_attempt(&appointment, code).await?;
        self.settle_cash(&appointment, trace_id).await
    }

    /// Shared attempt accounting for both code-gated endpoints: one code,
    /// one 3-attempt budget per appointment.
    pub(crate) async fn check_code_attempt(
        &self,
        appointment: &AppointmentRecord,
        input: &str,
    ) -> Result<(), SettlementError> {
        verification_code::validate_format(input).map_err(|e| match e {
            CodeError::InvalidFormat => {
                SettlementError::Validation("verification code must be four digits".to_string())
            }
            CodeError::AttemptsExceeded => SettlementError::AttemptsExceeded,
        })?;

        let Some(stored) = appointment.verification_code.as_deref() else {
            return Err(SettlementError::Conflict(
                "no verification code has been issued for this appointment".to_string(),
            ));
        };

        let policy = AttemptPolicy::default();
        if policy
            .ensure_attempt_allowed(appointment.verification_attempts)
            .is_err()
        {
            return Err(SettlementError::AttemptsExceeded);
        }

        if verification_code::codes_match(input, stored) {
            return Ok(());
        }

        let used = self
            .store
            .increment_verification_attempts(appointment.appointment_id)
            .await?;
        Err(SettlementError::CodeMismatch {
            remaining_attempts: policy.remaining_after_failure(used),
        })
    }
}
