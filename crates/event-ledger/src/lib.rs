//! Idempotent ledger for inbound payment-gateway events.
//!
//! Every delivery is recorded with an insert-if-absent keyed by the
//! gateway's stable event id; only the delivery that wins the insert runs
//! business processing. Redelivery is the gateway's retry mechanism, so a
//! record that landed in `error` stays there for operator follow-up and is
//! never retried from this side.

mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub use postgres::PostgresEventLedger;

#[derive(Debug, Error)]
pub enum EventLedgerError {
    #[error("ledger lock poisoned")]
    LockPoisoned,
    #[error("unknown event id {0}")]
    UnknownEvent(String),
    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventStatus {
    Received,
    Processed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload_hash: String,
    pub status: GatewayEventStatus,
    pub error_detail: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of [`record_event`]. Business logic runs only when `is_new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub is_new: bool,
}

#[must_use]
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
pub trait EventLedgerRepository: Send + Sync {
    /// Insert-if-absent on the unique event id. Returns false when another
    /// delivery already holds the row.
    async fn insert_if_absent(&self, record: &GatewayEventRecord)
        -> Result<bool, EventLedgerError>;

    async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError>;

    async fn mark_error(
        &self,
        event_id: &str,
        detail: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError>;

    async fn get(&self, event_id: &str) -> Result<Option<GatewayEventRecord>, EventLedgerError>;
}

/// Records a delivery and reports whether this caller won the insert.
pub async fn record_event<R: EventLedgerRepository + ?Sized>(
    repo: &R,
    event_id: &str,
    event_type: &str,
    payload: &Value,
) -> Result<RecordOutcome, EventLedgerError> {
    let record = GatewayEventRecord {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        payload_hash: hash_payload(payload),
        status: GatewayEventStatus::Received,
        error_detail: None,
        received_at: Utc::now(),
        processed_at: None,
    };
    let is_new = repo.insert_if_absent(&record).await?;
    Ok(RecordOutcome { is_new })
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryEventLedger {
    records: Arc<Mutex<HashMap<String, GatewayEventRecord>>>,
}

impl InMemoryEventLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_snapshot(&self) -> Vec<GatewayEventRecord> {
        self.records
            .lock()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLedgerRepository for InMemoryEventLedger {
    async fn insert_if_absent(
        &self,
        record: &GatewayEventRecord,
    ) -> Result<bool, EventLedgerError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| EventLedgerError::LockPoisoned)?;
        if guard.contains_key(&record.event_id) {
            return Ok(false);
        }
        guard.insert(record.event_id.clone(), record.clone());
        Ok(true)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| EventLedgerError::LockPoisoned)?;
        let record = guard
            .get_mut(event_id)
            .ok_or_else(|| EventLedgerError::UnknownEvent(event_id.to_string()))?;
        record.status = GatewayEventStatus::Processed;
        record.processed_at = Some(processed_at);
        Ok(())
    }

    async fn mark_error(
        &self,
        event_id: &str,
        detail: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), EventLedgerError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| EventLedgerError::LockPoisoned)?;
        let record = guard
            .get_mut(event_id)
            .ok_or_else(|| EventLedgerError::UnknownEvent(event_id.to_string()))?;
        record.status = GatewayEventStatus::Error;
        record.error_detail = Some(detail.to_string());
        record.processed_at = Some(processed_at);
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<GatewayEventRecord>, EventLedgerError> {
        let guard = self
            .records
            .lock()
            .map_err(|_| EventLedgerError::LockPoisoned)?;
        Ok(guard.get(event_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_delivery_wins_the_insert() {
        let ledger = InMemoryEventLedger::new();
        let payload = json!({"amount": 100_000});

        let first = record_event(&ledger, "evt_1", "checkout.session.completed", &payload)
            .await
            .expect("record");
        assert!(first.is_new);

        let second = record_event(&ledger, "evt_1", "checkout.session.completed", &payload)
            .await
            .expect("record");
        assert!(!second.is_new);

        assert_eq!(ledger.records_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn processed_and_error_transitions_stamp_the_record() {
        let ledger = InMemoryEventLedger::new();
        record_event(&ledger, "evt_ok", "invoice.paid", &json!({}))
            .await
            .expect("record");
        record_event(&ledger, "evt_bad", "invoice.paid", &json!({}))
            .await
            .expect("record");

        ledger
            .mark_processed("evt_ok", Utc::now())
            .await
            .expect("processed");
        ledger
            .mark_error("evt_bad", "appointment not found", Utc::now())
            .await
            .expect("error");

        let ok = ledger.get("evt_ok").await.expect("get").expect("row");
        assert_eq!(ok.status, GatewayEventStatus::Processed);
        assert!(ok.processed_at.is_some());

        let bad = ledger.get("evt_bad").await.expect("get").expect("row");
        assert_eq!(bad.status, GatewayEventStatus::Error);
        assert_eq!(bad.error_detail.as_deref(), Some("appointment not found"));
    }

    #[tokio::test]
    async fn marking_an_unknown_event_fails() {
        let ledger = InMemoryEventLedger::new();
        let err = ledger
            .mark_processed("missing", Utc::now())
            .await
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown event id"));
    }

    #[test]
    fn payload_hash_is_stable_and_content_sensitive() {
        let a = hash_payload(&json!({"amount": 1}));
        let b = hash_payload(&json!({"amount": 1}));
        let c = hash_payload(&json!({"amount": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
