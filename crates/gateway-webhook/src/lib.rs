//! Payment-gateway boundary: signature verification, the closed event-kind
//! set, and the ack-then-process webhook handler.
//!
//! The webhook acknowledges with a fixed 200 before business processing
//! runs, so the gateway's retry loop is driven purely by delivery failures.
//! Business failures land on the event-ledger row as `error` for operator
//! follow-up and are never surfaced to the sender.

mod event;
mod signature;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use chrono::Utc;
use event_ledger::{record_event, EventLedgerError, EventLedgerRepository};
use marketplace_domain::{PaymentMethod, TraceId};
use settlement::{GatewayRefs, SettlementEngine, SettlementError, SettlementStore};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use event::{
    AccountUpdatedPayload, CheckoutCompletedPayload, EventEnvelope, GatewayEvent,
    InvoicePaidPayload, PaymentIntentSucceededPayload,
};
pub use signature::{sign_payload, verify_signature, DEFAULT_TOLERANCE_SECS};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("event ledger error: {0}")]
    Ledger(#[from] EventLedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Event was new and its handler succeeded.
    Processed,
    /// Event id was already in the ledger; nothing ran.
    Duplicate,
    /// Event type is outside the settled set; recorded and skipped.
    Ignored,
    /// Handler failed; the ledger row carries the error detail.
    Failed,
}

/// Runs the ledger bracket around event dispatch.
pub struct WebhookProcessor<S, L> {
    engine: Arc<SettlementEngine<S>>,
    ledger: Arc<L>,
}

impl<S, L> WebhookProcessor<S, L>
where
    S: SettlementStore + Send + Sync,
    L: EventLedgerRepository,
{
    pub fn new(engine: Arc<SettlementEngine<S>>, ledger: Arc<L>) -> Self {
        Self { engine, ledger }
    }

    pub async fn process_envelope(
        &self,
        envelope: EventEnvelope,
    ) -> Result<ProcessOutcome, WebhookError> {
        let outcome = record_event(
            self.ledger.as_ref(),
            &envelope.id,
            &envelope.event_type,
            &envelope.data,
        )
        .await?;
        if !outcome.is_new {
            info!(event_id = %envelope.id, "duplicate delivery, skipping");
            return Ok(ProcessOutcome::Duplicate);
        }

        let parsed = match GatewayEvent::parse(&envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "unhandled event type"
                );
                self.ledger
                    .mark_processed(&envelope.id, Utc::now())
                    .await?;
                return Ok(ProcessOutcome::Ignored);
            }
            Err(err) => {
                self.ledger
                    .mark_error(&envelope.id, &err.to_string(), Utc::now())
                    .await?;
                return Err(err);
            }
        };

        match self.dispatch(parsed).await {
            Ok(()) => {
                self.ledger
                    .mark_processed(&envelope.id, Utc::now())
                    .await?;
                Ok(ProcessOutcome::Processed)
            }
            Err(err) => {
                error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "webhook event processing failed"
                );
                self.ledger
                    .mark_error(&envelope.id, &err.to_string(), Utc::now())
                    .await?;
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    async fn dispatch(&self, event: GatewayEvent) -> Result<(), SettlementError> {
        let trace_id = TraceId::new();
        match event {
            GatewayEvent::CheckoutCompleted(payload) => {
                self.engine
                    .record_payment(
                        payload.appointment_id,
                        payload.amount_total,
                        PaymentMethod::Card,
                        GatewayRefs {
                            session_id: Some(payload.session_id),
                            payment_intent_id: payload.payment_intent,
                        },
                        trace_id,
                    )
                    .await?;
            }
            GatewayEvent::InvoicePaid(payload) => {
                self.engine
                    .record_payment(
                        payload.appointment_id,
                        payload.amount_paid,
                        PaymentMethod::Card,
                        GatewayRefs {
                            session_id: None,
                            payment_intent_id: payload.payment_intent,
                        },
                        trace_id,
                    )
                    .await?;
            }
            GatewayEvent::PaymentIntentSucceeded(payload) => {
                self.engine
                    .record_payment(
                        payload.appointment_id,
                        payload.amount,
                        PaymentMethod::Card,
                        GatewayRefs {
                            session_id: None,
                            payment_intent_id: Some(payload.payment_intent_id),
                        },
                        trace_id,
                    )
                    .await?;
            }
            GatewayEvent::AccountUpdated(payload) => {
                // Gateway onboarding is out of scope; acknowledged for the
                // ledger and visible to operators through the log.
                info!(
                    account_id = %payload.account_id,
                    charges_enabled = payload.charges_enabled,
                    "gateway account updated"
                );
            }
        }
        Ok(())
    }
}

pub struct WebhookState<S, L> {
    pub processor: Arc<WebhookProcessor<S, L>>,
    pub secret: String,
    pub tolerance_secs: i64,
}

/// `POST /webhooks/gateway`: verify the signature, then acknowledge and
/// process in the background.
pub fn webhook_router<S, L>(state: Arc<WebhookState<S, L>>) -> Router
where
    S: SettlementStore + Send + Sync + 'static,
    L: EventLedgerRepository + 'static,
{
    Router::new()
        .route("/webhooks/gateway", post(handle_gateway_webhook::<S, L>))
        .with_state(state)
}

async fn handle_gateway_webhook<S, L>(
    State(state): State<Arc<WebhookState<S, L>>>,
    headers: HeaderMap,
    payload: Bytes,
) -> StatusCode
where
    S: SettlementStore + Send + Sync + 'static,
    L: EventLedgerRepository + 'static,
{
    let Some(signature) = headers
        .get("gateway-signature")
        .and_then(|value| value.to_str().ok())
    else {
        warn!("webhook delivery without signature header");
        return StatusCode::BAD_REQUEST;
    };
    if let Err(err) = verify_signature(
        &payload,
        signature,
        &state.secret,
        state.tolerance_secs,
        Utc::now().timestamp(),
    ) {
        warn!(error = %err, "webhook signature rejected");
        return StatusCode::BAD_REQUEST;
    }

    let envelope: EventEnvelope = match serde_json::from_slice(&payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "webhook body is not a valid event envelope");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Fixed 200 to the sender; the outcome of business processing is the
    // ledger's concern, not the gateway's.
    let processor = state.processor.clone();
    tokio::spawn(async move {
        if let Err(err) = processor.process_envelope(envelope).await {
            warn!(error = %err, "webhook processing task failed");
        }
    });
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use event_ledger::{GatewayEventStatus, InMemoryEventLedger};
    use marketplace_domain::{Amount, AppointmentId, ClientId, ProviderId};
    use platform_settings::{InMemorySettingsProvider, PlatformSettings};
    use settlement_store::{AppointmentRecord, AppointmentRepository, InMemorySettlementStore};
    use tower::ServiceExt;

    struct Fixture {
        processor: Arc<WebhookProcessor<InMemorySettlementStore, InMemoryEventLedger>>,
        store: InMemorySettlementStore,
        ledger: Arc<InMemoryEventLedger>,
        appointment_id: AppointmentId,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySettlementStore::new();
        let ledger = Arc::new(InMemoryEventLedger::new());
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            Arc::new(InMemorySettingsProvider::new(PlatformSettings::default())),
        ));
        let appointment_id = AppointmentId::new();
        store
            .upsert(&AppointmentRecord::confirmed(
                appointment_id,
                ClientId::new(),
                ProviderId::new(),
                Amount(100_000),
            ))
            .await
            .expect("seed");
        Fixture {
            processor: Arc::new(WebhookProcessor::new(engine, ledger.clone())),
            store,
            ledger,
            appointment_id,
        }
    }

    fn checkout_envelope(fixture: &Fixture, event_id: &str) -> EventEnvelope {
        EventEnvelope {
            id: event_id.to_string(),
            event_type: "checkout.session.completed".to_string(),
            data: serde_json::json!({
                "session_id": "cs_100",
                "appointment_id": fixture.appointment_id,
                "amount_total": 100_000,
            }),
        }
    }

    #[tokio::test]
    async fn redelivered_event_settles_exactly_once() {
        let f = fixture().await;
        let envelope = checkout_envelope(&f, "evt_dup");

        let first = f
            .processor
            .process_envelope(envelope.clone())
            .await
            .expect("first");
        assert_eq!(first, ProcessOutcome::Processed);
        let second = f
            .processor
            .process_envelope(envelope)
            .await
            .expect("second");
        assert_eq!(second, ProcessOutcome::Duplicate);

        assert_eq!(f.store.payments_snapshot().len(), 1);
        let record = f
            .ledger
            .get("evt_dup")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, GatewayEventStatus::Processed);
        assert_eq!(f.ledger.records_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn business_failure_is_recorded_on_the_ledger_row() {
        let f = fixture().await;
        let envelope = EventEnvelope {
            id: "evt_missing".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            data: serde_json::json!({
                "payment_intent_id": "pi_9",
                "appointment_id": AppointmentId::new(),
                "amount": 5_000,
            }),
        };
        let outcome = f
            .processor
            .process_envelope(envelope)
            .await
            .expect("handled");
        assert_eq!(outcome, ProcessOutcome::Failed);

        let record = f
            .ledger
            .get("evt_missing")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, GatewayEventStatus::Error);
        assert!(record.error_detail.expect("detail").contains("not found"));
        assert!(f.store.payments_snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged_and_ledgered() {
        let f = fixture().await;
        let envelope = EventEnvelope {
            id: "evt_other".to_string(),
            event_type: "customer.created".to_string(),
            data: serde_json::json!({}),
        };
        let outcome = f
            .processor
            .process_envelope(envelope)
            .await
            .expect("handled");
        assert_eq!(outcome, ProcessOutcome::Ignored);
        let record = f
            .ledger
            .get("evt_other")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, GatewayEventStatus::Processed);
    }

    #[tokio::test]
    async fn invoice_and_intent_events_share_the_recorder_idempotency() {
        let f = fixture().await;
        let invoice = EventEnvelope {
            id: "evt_inv".to_string(),
            event_type: "invoice.paid".to_string(),
            data: serde_json::json!({
                "invoice_id": "in_1",
                "appointment_id": f.appointment_id,
                "amount_paid": 100_000,
            }),
        };
        let intent = EventEnvelope {
            id: "evt_pi".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            data: serde_json::json!({
                "payment_intent_id": "pi_1",
                "appointment_id": f.appointment_id,
                "amount": 100_000,
            }),
        };

        assert_eq!(
            f.processor.process_envelope(invoice).await.expect("inv"),
            ProcessOutcome::Processed
        );
        assert_eq!(
            f.processor.process_envelope(intent).await.expect("pi"),
            ProcessOutcome::Processed
        );
        // Different event ids, same appointment: one payment row.
        assert_eq!(f.store.payments_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn webhook_route_acks_before_processing_and_rejects_bad_signatures() {
        let f = fixture().await;
        let state = Arc::new(WebhookState {
            processor: f.processor.clone(),
            secret: "whsec_test".to_string(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        });
        let router = webhook_router(state);

        let body = serde_json::to_vec(&checkout_envelope(&f, "evt_http")).expect("body");
        let signature = sign_payload(&body, "whsec_test", Utc::now().timestamp());
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/gateway")
                    .header("gateway-signature", signature)
                    .header("content-type", "application/json")
                    .body(Body::from(body.clone()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // Processing is fire-and-forget; give the spawned task a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let record = f
            .ledger
            .get("evt_http")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, GatewayEventStatus::Processed);
        assert_eq!(f.store.payments_snapshot().len(), 1);

        // A tampered signature never reaches the ledger.
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/gateway")
                    .header("gateway-signature", "t=1,v1=deadbeef")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let f = fixture().await;
        let state = Arc::new(WebhookState {
            processor: f.processor.clone(),
            secret: "whsec_test".to_string(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        });
        let router = webhook_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/gateway")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
