use marketplace_domain::{Amount, AppointmentId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WebhookError;

/// Raw webhook body: stable event id, type string and the object payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// The event kinds this core settles on, as a closed variant set. The
/// original switch-on-strings becomes an exhaustive match; new kinds have
/// to be added here and handled everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutCompletedPayload),
    InvoicePaid(InvoicePaidPayload),
    PaymentIntentSucceeded(PaymentIntentSucceededPayload),
    AccountUpdated(AccountUpdatedPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompletedPayload {
    pub session_id: String,
    pub appointment_id: AppointmentId,
    pub amount_total: Amount,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePaidPayload {
    pub invoice_id: String,
    pub appointment_id: AppointmentId,
    pub amount_paid: Amount,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentSucceededPayload {
    pub payment_intent_id: String,
    pub appointment_id: AppointmentId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdatedPayload {
    pub account_id: String,
    #[serde(default)]
    pub charges_enabled: bool,
}

impl GatewayEvent {
    /// Maps a delivery to a known event kind. Unknown types come back as
    /// `None` and are acknowledged without business processing.
    pub fn parse(envelope: &EventEnvelope) -> Result<Option<Self>, WebhookError> {
        let invalid = |e: serde_json::Error| WebhookError::InvalidPayload(e.to_string());
        let event = match envelope.event_type.as_str() {
            "checkout.session.completed" => Self::CheckoutCompleted(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            "invoice.paid" => {
                Self::InvoicePaid(serde_json::from_value(envelope.data.clone()).map_err(invalid)?)
            }
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            "account.updated" => Self::AccountUpdated(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_event_types_parse_into_variants() {
        let appointment_id = AppointmentId::new();
        let envelope = EventEnvelope {
            id: "evt_1".to_string(),
            event_type: "checkout.session.completed".to_string(),
            data: json!({
                "session_id": "cs_123",
                "appointment_id": appointment_id,
                "amount_total": 100_000,
            }),
        };
        match GatewayEvent::parse(&envelope).expect("parse").expect("known") {
            GatewayEvent::CheckoutCompleted(payload) => {
                assert_eq!(payload.session_id, "cs_123");
                assert_eq!(payload.appointment_id, appointment_id);
                assert_eq!(payload.amount_total, Amount(100_000));
                assert!(payload.payment_intent.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let envelope = EventEnvelope {
            id: "evt_2".to_string(),
            event_type: "customer.subscription.created".to_string(),
            data: json!({}),
        };
        assert!(GatewayEvent::parse(&envelope).expect("parse").is_none());
    }

    #[test]
    fn malformed_payload_for_a_known_type_is_an_error() {
        let envelope = EventEnvelope {
            id: "evt_3".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            data: json!({ "payment_intent_id": "pi_1" }),
        };
        let err = GatewayEvent::parse(&envelope).expect_err("missing fields");
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }

    #[test]
    fn account_updated_parses_with_defaults() {
        let envelope = EventEnvelope {
            id: "evt_4".to_string(),
            event_type: "account.updated".to_string(),
            data: json!({ "account_id": "acct_1" }),
        };
        match GatewayEvent::parse(&envelope).expect("parse").expect("known") {
            GatewayEvent::AccountUpdated(payload) => {
                assert_eq!(payload.account_id, "acct_1");
                assert!(!payload.charges_enabled);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
