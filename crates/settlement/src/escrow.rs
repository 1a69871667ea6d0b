use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use marketplace_domain::{
    ClientClosureAction, PaymentId, PaymentMethod, ProviderClosureAction, ReleaseStatus, TraceId,
    TransactionId, TransactionKind,
};
use settlement_store::{
    AppointmentRecord, AppointmentRepository, ClosureUpdate, PaymentRecord, PaymentRepository,
    ReleaseUpdate, TransactionRecord, TransactionRepository, WalletRepository,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::engine::{SettlementEngine, SettlementStore};
use crate::error::SettlementError;
use crate::notify::{send_best_effort, Notice, NotifyTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub payment_id: PaymentId,
    pub release_status: ReleaseStatus,
    pub funds_moved: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_eligible: usize,
    pub released: usize,
    pub closures_marked_for_review: usize,
}

impl<S: SettlementStore> SettlementEngine<S> {
    pub(crate) fn is_service_verified(appointment: &AppointmentRecord) -> bool {
        appointment.service_verified_at.is_some() || appointment.cash_verified_at.is_some()
    }

    /// Advances one payment through the release state machine.
    ///
    /// The time gate (`paid_at + holdback <= now`) and the verification gate
    /// are independent: time alone flips `pending` to `eligible`, and only
    /// both together move funds. The status guard makes the move idempotent
    /// under concurrent sweeps.
    pub async fn evaluate_release(
        &self,
        payment: &PaymentRecord,
        now: DateTime<Utc>,
        trace_id: TraceId,
    ) -> Result<ReleaseOutcome, SettlementError> {
        if payment.release_status == ReleaseStatus::Completed {
            return Ok(ReleaseOutcome {
                payment_id: payment.payment_id,
                release_status: ReleaseStatus::Completed,
                funds_moved: false,
            });
        }

        let settings = self.settings.current().await?;
        let holdback_passed =
            payment.paid_at + chrono::Duration::days(settings.release_holdback_days) <= now;

        let mut status = payment.release_status;
        if status == ReleaseStatus::Pending && holdback_passed {
            status = ReleaseStatus::Eligible;
        }

        let appointment = self.require_appointment(payment.appointment_id).await?;
        let verified = Self::is_service_verified(&appointment);

        if status == ReleaseStatus::Eligible && verified && payment.can_release {
            self.move_provider_share(payment, now, trace_id).await?;
            self.store
                .update_release(&ReleaseUpdate {
                    payment_id: payment.payment_id,
                    can_release: true,
                    release_status: ReleaseStatus::Completed,
                    released_at: Some(now),
                })
                .await?;
            send_best_effort(
                self.notification_sink(),
                NotifyTarget::Provider(payment.provider_id),
                Notice {
                    title: "Funds released".to_string(),
                    body: format!("{} is now available in your wallet.", payment.provider_amount),
                    data: serde_json::json!({ "payment_id": payment.payment_id }),
                },
            )
            .await;
            info!(
                payment_id = %payment.payment_id,
                provider_id = %payment.provider_id,
                amount = %payment.provider_amount,
                trace_id = %trace_id,
                "escrow release completed"
            );
            return Ok(ReleaseOutcome {
                payment_id: payment.payment_id,
                release_status: ReleaseStatus::Completed,
                funds_moved: true,
            });
        }

        if status != payment.release_status {
            self.store
                .update_release(&ReleaseUpdate {
                    payment_id: payment.payment_id,
                    can_release: payment.can_release,
                    release_status: status,
                    released_at: None,
                })
                .await?;
        }
        Ok(ReleaseOutcome {
            payment_id: payment.payment_id,
            release_status: status,
            funds_moved: false,
        })
    }

    async fn move_provider_share(
        &self,
        payment: &PaymentRecord,
        now: DateTime<Utc>,
        trace_id: TraceId,
    ) -> Result<(), SettlementError> {
        match payment.payment_method {
            PaymentMethod::Card => {
                self.store
                    .release_to_balance(payment.provider_id, payment.provider_amount)
                    .await?;
                self.store
                    .append(&TransactionRecord {
                        transaction_id: TransactionId::new(),
                        provider_id: payment.provider_id,
                        kind: TransactionKind::EscrowRelease,
                        amount: payment.provider_amount,
                        payment_id: Some(payment.payment_id),
                        appointment_id: Some(payment.appointment_id),
                        occurred_at: now,
                        trace_id,
                    })
                    .await?;
            }
            PaymentMethod::Cash => {
                // Cash never entered custody; completion is bookkeeping.
                self.store
                    .record_earned(payment.provider_id, payment.provider_amount)
                    .await?;
                self.store
                    .append(&TransactionRecord {
                        transaction_id: TransactionId::new(),
                        provider_id: payment.provider_id,
                        kind: TransactionKind::CashCollected,
                        amount: payment.provider_amount,
                        payment_id: Some(payment.payment_id),
                        appointment_id: Some(payment.appointment_id),
                        occurred_at: now,
                        trace_id,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Periodic reconciliation pass: advances time-based transitions,
    /// completes payments whose both gates are open, and escalates overdue
    /// two-sided closure disputes to manual review.
    pub async fn run_release_sweep_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, SettlementError> {
        let mut report = SweepReport::default();

        for payment in self.store.list_unreleased().await? {
            let before = payment.release_status;
            let outcome = self.evaluate_release(&payment, now, TraceId::new()).await?;
            if outcome.funds_moved {
                report.released += 1;
            } else if before == ReleaseStatus::Pending
                && outcome.release_status == ReleaseStatus::Eligible
            {
                report.marked_eligible += 1;
            }
        }

        report.closures_marked_for_review = self.mark_overdue_closures_for_review(now).await?;

        if report.released > 0 || report.marked_eligible > 0 || report.closures_marked_for_review > 0
        {
            info!(
                released = report.released,
                marked_eligible = report.marked_eligible,
                closures_marked_for_review = report.closures_marked_for_review,
                "release sweep pass finished"
            );
        }
        Ok(report)
    }

    /// Two-sided disagreements past their due date need a human; one-sided
    /// reports stay `pending_close` and keep tripping the cash gate.
    pub async fn mark_overdue_closures_for_review(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, SettlementError> {
        let mut marked = 0usize;
        for appointment in self.store.list_overdue_pending_close(now).await? {
            let both_reported = appointment.closure_provider_action != ProviderClosureAction::None
                && appointment.closure_client_action != ClientClosureAction::None;
            if !both_reported {
                continue;
            }
            self.store
                .update_closure(&ClosureUpdate {
                    appointment_id: appointment.appointment_id,
                    closure_state: marketplace_domain::ClosureState::InReview,
                    closure_due_at: appointment.closure_due_at,
                    provider_action: appointment.closure_provider_action,
                    client_action: appointment.closure_client_action,
                    notes: appointment.closure_notes.clone(),
                })
                .await?;
            info!(
                appointment_id = %appointment.appointment_id,
                "overdue closure dispute escalated to manual review"
            );
            marked += 1;
        }
        Ok(marked)
    }
}

/// Background reconciliation loop; ticks until the shutdown channel fires.
pub fn spawn_release_sweep_loop<S>(
    engine: Arc<SettlementEngine<S>>,
    poll_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()>
where
    S: SettlementStore + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = engine.run_release_sweep_once(Utc::now()).await {
                        warn!(error = %err, "release sweep iteration failed");
                    }
                }
            }
        }
    })
}
