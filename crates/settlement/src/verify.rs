use chrono::{DateTime, Utc};
use marketplace_domain::{AppointmentId, ClientId, ProviderId, TraceId};
use settlement_store::{AppointmentRepository, PaymentRepository};
use tracing::info;

use crate::engine::{SettlementEngine, SettlementStore};
use crate::error::SettlementError;
use crate::escrow::ReleaseOutcome;
use crate::notify::{send_best_effort, Notice, NotifyTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyServiceOutcome {
    pub verified_at: DateTime<Utc>,
    /// Release evaluation for the appointment's payment, when one exists.
    /// Verification before the holdback leaves the fund move to the sweep.
    pub release: Option<ReleaseOutcome>,
}

impl<S: SettlementStore> SettlementEngine<S> {
    /// The provider redeems the client-held code to confirm service
    /// completion. A match stamps the appointment verified and immediately
    /// re-checks the escrow gates.
    pub async fn verify_service_code(
        &self,
        appointment_id: AppointmentId,
        provider_id: ProviderId,
        code: &str,
        trace_id: TraceId,
    ) -> Result<VerifyServiceOutcome, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(SettlementError::Unauthorized(
                "actor is not this appointment's provider".to_string(),
            ));
        }
        if appointment.service_verified_at.is_some() {
            return Err(SettlementError::Conflict(
                "service completion is already verified".to_string(),
            ));
        }

        self.check_code_attempt(&appointment, code).await?;

        let now = Utc::now();
        self.store.mark_service_verified(appointment_id, now).await?;
        send_best_effort(
            self.notification_sink(),
            NotifyTarget::Client(appointment.client_id),
            Notice {
                title: "Service confirmed".to_string(),
                body: "Your provider confirmed the service as completed.".to_string(),
                data: serde_json::json!({ "appointment_id": appointment_id }),
            },
        )
        .await;
        info!(
            appointment_id = %appointment_id,
            trace_id = %trace_id,
            "service completion verified"
        );

        let release = match self
            .store
            .get_completed_by_appointment(appointment_id)
            .await?
        {
            Some(payment) => Some(self.evaluate_release(&payment, now, trace_id).await?),
            None => None,
        };

        Ok(VerifyServiceOutcome {
            verified_at: now,
            release,
        })
    }

    /// Client-only read of the appointment's code; the provider obtains it
    /// out of band.
    pub async fn get_verification_code(
        &self,
        appointment_id: AppointmentId,
        client_id: ClientId,
    ) -> Result<String, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        if appointment.client_id != client_id {
            return Err(SettlementError::Unauthorized(
                "only this appointment's client may read the code".to_string(),
            ));
        }
        appointment
            .verification_code
            .ok_or_else(|| SettlementError::not_found("verification code", appointment_id))
    }

    /// Support operation: clears the lockout after the 3-attempt budget is
    /// spent.
    pub async fn reset_verification_attempts(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<(), SettlementError> {
        self.require_appointment(appointment_id).await?;
        self.store.reset_verification_attempts(appointment_id).await?;
        info!(appointment_id = %appointment_id, "verification attempts reset");
        Ok(())
    }
}
