use chrono::{DateTime, Utc};
use marketplace_domain::{
    AppointmentId, ClientClosureAction, ClientId, ClosureNotes, ClosureState, PaymentMethod,
    ProviderClosureAction, ProviderId, TraceId,
};
use settlement_store::{AppointmentRecord, AppointmentRepository, ClosureUpdate, PaymentRepository};
use tracing::info;

use crate::engine::{SettlementEngine, SettlementStore};
use crate::error::SettlementError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureStatus {
    pub appointment_id: AppointmentId,
    pub state: ClosureState,
    pub provider_action: ProviderClosureAction,
    pub client_action: ClientClosureAction,
    pub due_at: Option<DateTime<Utc>>,
    pub notes: ClosureNotes,
}

impl ClosureStatus {
    fn from_record(record: &AppointmentRecord) -> Self {
        Self {
            appointment_id: record.appointment_id,
            state: record.closure_state,
            provider_action: record.closure_provider_action,
            client_action: record.closure_client_action,
            due_at: record.closure_due_at,
            notes: record.closure_notes.clone(),
        }
    }
}

enum ClosureReport {
    Provider(ProviderClosureAction),
    Client(ClientClosureAction),
}

impl<S: SettlementStore> SettlementEngine<S> {
    pub async fn get_closure_status(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<ClosureStatus, SettlementError> {
        let appointment = self.require_appointment(appointment_id).await?;
        Ok(ClosureStatus::from_record(&appointment))
    }

    pub async fn report_provider_closure_action(
        &self,
        appointment_id: AppointmentId,
        provider_id: ProviderId,
        action: ProviderClosureAction,
        note: Option<String>,
        trace_id: TraceId,
    ) -> Result<ClosureStatus, SettlementError> {
        if action == ProviderClosureAction::None {
            return Err(SettlementError::Validation(
                "a closure report must carry an action".to_string(),
            ));
        }
        let appointment = self.require_appointment(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(SettlementError::Unauthorized(
                "actor is not this appointment's provider".to_string(),
            ));
        }
        self.apply_closure_report(appointment, ClosureReport::Provider(action), note, trace_id)
            .await
    }

    pub async fn report_client_closure_action(
        &self,
        appointment_id: AppointmentId,
        client_id: ClientId,
        action: ClientClosureAction,
        note: Option<String>,
        trace_id: TraceId,
    ) -> Result<ClosureStatus, SettlementError> {
        if action == ClientClosureAction::None {
            return Err(SettlementError::Validation(
                "a closure report must carry an action".to_string(),
            ));
        }
        let appointment = self.require_appointment(appointment_id).await?;
        if appointment.client_id != client_id {
            return Err(SettlementError::Unauthorized(
                "actor is not this appointment's client".to_string(),
            ));
        }
        self.apply_closure_report(appointment, ClosureReport::Client(action), note, trace_id)
            .await
    }

    /// Writes one party's report, then re-evaluates the resolution matrix.
    async fn apply_closure_report(
        &self,
        appointment: AppointmentRecord,
        report: ClosureReport,
        note: Option<String>,
        trace_id: TraceId,
    ) -> Result<ClosureStatus, SettlementError> {
        if appointment.payment_method != Some(PaymentMethod::Cash) {
            return Err(SettlementError::Validation(
                "the closure protocol applies to cash appointments only".to_string(),
            ));
        }
        match appointment.closure_state {
            ClosureState::Resolved => {
                return Err(SettlementError::Conflict(
                    "closure is already resolved".to_string(),
                ));
            }
            ClosureState::InReview => {
                return Err(SettlementError::Conflict(
                    "closure is under manual review".to_string(),
                ));
            }
            ClosureState::None | ClosureState::PendingClose => {}
        }

        let mut updated = appointment.clone();
        match report {
            ClosureReport::Provider(action) => {
                updated.closure_provider_action = action;
                updated.closure_notes.merge_provider(note);
            }
            ClosureReport::Client(action) => {
                updated.closure_client_action = action;
                updated.closure_notes.merge_client(note);
            }
        }
        if updated.closure_state == ClosureState::None {
            let settings = self.settings.current().await?;
            updated.closure_state = ClosureState::PendingClose;
            updated.closure_due_at =
                Some(Utc::now() + chrono::Duration::days(settings.closure_window_days));
        }

        updated.closure_state = self.resolve_closure(&updated, trace_id).await?;

        self.store
            .update_closure(&ClosureUpdate {
                appointment_id: updated.appointment_id,
                closure_state: updated.closure_state,
                closure_due_at: updated.closure_due_at,
                provider_action: updated.closure_provider_action,
                client_action: updated.closure_client_action,
                notes: updated.closure_notes.clone(),
            })
            .await?;

        info!(
            appointment_id = %updated.appointment_id,
            state = ?updated.closure_state,
            provider_action = ?updated.closure_provider_action,
            client_action = ?updated.closure_client_action,
            "closure report applied"
        );
        Ok(ClosureStatus::from_record(&updated))
    }

    /// Resolution matrix, evaluated after every action write.
    async fn resolve_closure(
        &self,
        appointment: &AppointmentRecord,
        trace_id: TraceId,
    ) -> Result<ClosureState, SettlementError> {
        if self
            .store
            .get_completed_by_appointment(appointment.appointment_id)
            .await?
            .is_some()
        {
            return Ok(ClosureState::Resolved);
        }

        let provider = appointment.closure_provider_action;
        let client = appointment.closure_client_action;

        if provider == ProviderClosureAction::NoShow && client == ClientClosureAction::NoShow {
            // Both agree the service did not happen; nothing to settle.
            return Ok(ClosureState::Resolved);
        }

        if client == ClientClosureAction::Ok || provider == ProviderClosureAction::CodeEntered {
            self.settle_cash(appointment, trace_id).await?;
            return Ok(ClosureState::Resolved);
        }

        Ok(ClosureState::PendingClose)
    }
}
