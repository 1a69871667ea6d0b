use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_domain::{
    Amount, AppointmentId, ClientId, ClosureState, DebtId, DebtStatus, PaymentId, PaymentMethod,
    ProviderId,
};

use crate::{
    not_found, AppointmentRecord, AppointmentRepository, ClosureUpdate, CommissionDebtRecord,
    CommissionDebtRepository, DebtSettlementRecord, PaymentInsertOutcome, PaymentRecord,
    PaymentRepository, ReleaseUpdate, StoreError, TransactionRecord, TransactionRepository,
    WalletBalanceRecord, WalletRepository,
};

/// Single in-memory store backing every repository trait. Uniqueness and
/// atomicity guarantees match the Postgres implementation: completed
/// payments are keyed by appointment, wallet rows mutate under one lock.
#[derive(Debug, Default, Clone)]
pub struct InMemorySettlementStore {
    appointments: Arc<Mutex<HashMap<AppointmentId, AppointmentRecord>>>,
    payments: Arc<Mutex<HashMap<PaymentId, PaymentRecord>>>,
    payment_by_appointment: Arc<Mutex<HashMap<AppointmentId, PaymentId>>>,
    debts: Arc<Mutex<HashMap<DebtId, CommissionDebtRecord>>>,
    debt_by_payment: Arc<Mutex<HashMap<PaymentId, DebtId>>>,
    debt_settlements: Arc<Mutex<Vec<DebtSettlementRecord>>>,
    wallets: Arc<Mutex<HashMap<ProviderId, WalletBalanceRecord>>>,
    transactions: Arc<Mutex<Vec<TransactionRecord>>>,
}

impl InMemorySettlementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debt_settlements_snapshot(&self) -> Vec<DebtSettlementRecord> {
        self.debt_settlements
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn transactions_snapshot(&self) -> Vec<TransactionRecord> {
        self.transactions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn payments_snapshot(&self) -> Vec<PaymentRecord> {
        self.payments
            .lock()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_appointment<T>(
        &self,
        id: AppointmentId,
        apply: impl FnOnce(&mut AppointmentRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let record = guard
            .get_mut(&id)
            .ok_or_else(|| not_found("appointment", id))?;
        Ok(apply(record))
    }

    fn is_closure_blocker(record: &AppointmentRecord, now: DateTime<Utc>) -> bool {
        if record.payment_method != Some(PaymentMethod::Cash) {
            return false;
        }
        match record.closure_state {
            ClosureState::InReview => true,
            ClosureState::PendingClose => record
                .closure_due_at
                .is_some_and(|due| due < now),
            ClosureState::None | ClosureState::Resolved => false,
        }
    }
}

#[async_trait]
impl AppointmentRepository for InMemorySettlementStore {
    async fn upsert(&self, record: &AppointmentRecord) -> Result<(), StoreError> {
        self.appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(record.appointment_id, record.clone());
        Ok(())
    }

    async fn get(&self, id: AppointmentId) -> Result<Option<AppointmentRecord>, StoreError> {
        Ok(self
            .appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(&id)
            .cloned())
    }

    async fn set_payment_method(
        &self,
        id: AppointmentId,
        method: PaymentMethod,
    ) -> Result<(), StoreError> {
        self.with_appointment(id, |record| record.payment_method = Some(method))
    }

    async fn set_verification_code(
        &self,
        id: AppointmentId,
        code: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_appointment(id, |record| {
            record.verification_code = Some(code.to_string());
            record.code_generated_at = Some(generated_at);
        })
    }

    async fn increment_verification_attempts(
        &self,
        id: AppointmentId,
    ) -> Result<u8, StoreError> {
        self.with_appointment(id, |record| {
            record.verification_attempts = record.verification_attempts.saturating_add(1);
            record.verification_attempts
        })
    }

    async fn reset_verification_attempts(&self, id: AppointmentId) -> Result<(), StoreError> {
        self.with_appointment(id, |record| record.verification_attempts = 0)
    }

    async fn mark_service_verified(
        &self,
        id: AppointmentId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_appointment(id, |record| record.service_verified_at = Some(at))
    }

    async fn mark_cash_verified(
        &self,
        id: AppointmentId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_appointment(id, |record| record.cash_verified_at = Some(at))
    }

    async fn update_closure(&self, update: &ClosureUpdate) -> Result<(), StoreError> {
        self.with_appointment(update.appointment_id, |record| {
            record.closure_state = update.closure_state;
            record.closure_due_at = update.closure_due_at;
            record.closure_provider_action = update.provider_action;
            record.closure_client_action = update.client_action;
            record.closure_notes = update.notes.clone();
        })
    }

    async fn list_closure_blockers_for_provider(
        &self,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        let guard = self
            .appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard
            .values()
            .filter(|r| r.provider_id == provider_id && Self::is_closure_blocker(r, now))
            .cloned()
            .collect())
    }

    async fn list_closure_blockers_for_client(
        &self,
        client_id: ClientId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        let guard = self
            .appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard
            .values()
            .filter(|r| r.client_id == client_id && Self::is_closure_blocker(r, now))
            .cloned()
            .collect())
    }

    async fn list_overdue_pending_close(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        let guard = self
            .appointments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard
            .values()
            .filter(|r| {
                r.payment_method == Some(PaymentMethod::Cash)
                    && r.closure_state == ClosureState::PendingClose
                    && r.closure_due_at.is_some_and(|due| due < now)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentRepository for InMemorySettlementStore {
    async fn insert_completed(
        &self,
        record: &PaymentRecord,
    ) -> Result<PaymentInsertOutcome, StoreError> {
        let mut by_appointment = self
            .payment_by_appointment
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut payments = self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;

        if let Some(existing_id) = by_appointment.get(&record.appointment_id) {
            let existing = payments
                .get(existing_id)
                .cloned()
                .ok_or_else(|| not_found("payment", existing_id))?;
            return Ok(PaymentInsertOutcome::Duplicate(existing));
        }

        by_appointment.insert(record.appointment_id, record.payment_id);
        payments.insert(record.payment_id, record.clone());
        Ok(PaymentInsertOutcome::Inserted)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(&id)
            .cloned())
    }

    async fn get_completed_by_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let by_appointment = self
            .payment_by_appointment
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let payments = self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(by_appointment
            .get(&appointment_id)
            .and_then(|id| payments.get(id))
            .cloned())
    }

    async fn list_unreleased(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        let payments = self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(payments
            .values()
            .filter(|p| p.release_status != marketplace_domain::ReleaseStatus::Completed)
            .cloned()
            .collect())
    }

    async fn update_release(&self, update: &ReleaseUpdate) -> Result<(), StoreError> {
        let mut payments = self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let record = payments
            .get_mut(&update.payment_id)
            .ok_or_else(|| not_found("payment", update.payment_id))?;
        record.can_release = update.can_release;
        record.release_status = update.release_status;
        record.released_at = update.released_at;
        Ok(())
    }

    async fn list_by_provider_between(
        &self,
        provider_id: ProviderId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let payments = self
            .payments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(payments
            .values()
            .filter(|p| p.provider_id == provider_id && p.paid_at >= from && p.paid_at < to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommissionDebtRepository for InMemorySettlementStore {
    async fn insert_if_absent(&self, record: &CommissionDebtRecord) -> Result<bool, StoreError> {
        let mut by_payment = self
            .debt_by_payment
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        if by_payment.contains_key(&record.payment_id) {
            return Ok(false);
        }
        by_payment.insert(record.payment_id, record.debt_id);
        self.debts
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(record.debt_id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: DebtId) -> Result<Option<CommissionDebtRecord>, StoreError> {
        Ok(self
            .debts
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(&id)
            .cloned())
    }

    async fn get_by_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<CommissionDebtRecord>, StoreError> {
        let by_payment = self
            .debt_by_payment
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let debts = self.debts.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(by_payment
            .get(&payment_id)
            .and_then(|id| debts.get(id))
            .cloned())
    }

    async fn list_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<CommissionDebtRecord>, StoreError> {
        let debts = self.debts.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(debts
            .values()
            .filter(|d| d.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn append_settlement(
        &self,
        settlement: &DebtSettlementRecord,
    ) -> Result<CommissionDebtRecord, StoreError> {
        let mut debts = self.debts.lock().map_err(|_| StoreError::LockPoisoned)?;
        let debt = debts
            .get_mut(&settlement.debt_id)
            .ok_or_else(|| not_found("commission debt", settlement.debt_id))?;

        debt.settled_amount = debt
            .settled_amount
            .checked_add(settlement.amount)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        debt.attempt_count = debt.attempt_count.saturating_add(1);
        if debt.settled_amount >= debt.commission_amount {
            debt.status = DebtStatus::Paid;
        }
        let updated = debt.clone();
        drop(debts);

        self.debt_settlements
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(settlement.clone());
        Ok(updated)
    }
}

#[async_trait]
impl WalletRepository for InMemorySettlementStore {
    async fn credit_pending(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let mut wallets = self.wallets.lock().map_err(|_| StoreError::LockPoisoned)?;
        let wallet = wallets
            .entry(provider_id)
            .or_insert_with(|| WalletBalanceRecord::empty(provider_id));
        wallet.pending_balance = wallet
            .pending_balance
            .checked_add(amount)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn release_to_balance(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let mut wallets = self.wallets.lock().map_err(|_| StoreError::LockPoisoned)?;
        let wallet = wallets
            .get_mut(&provider_id)
            .ok_or_else(|| not_found("wallet", provider_id))?;
        let pending = wallet
            .pending_balance
            .checked_sub(amount)
            .map_err(|_| StoreError::InsufficientPendingBalance(provider_id))?;
        wallet.pending_balance = pending;
        wallet.balance = wallet
            .balance
            .checked_add(amount)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        wallet.total_earned = wallet
            .total_earned
            .checked_add(amount)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_earned(
        &self,
        provider_id: ProviderId,
        amount: Amount,
    ) -> Result<(), StoreError> {
        let mut wallets = self.wallets.lock().map_err(|_| StoreError::LockPoisoned)?;
        let wallet = wallets
            .entry(provider_id)
            .or_insert_with(|| WalletBalanceRecord::empty(provider_id));
        wallet.total_earned = wallet
            .total_earned
            .checked_add(amount)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<WalletBalanceRecord>, StoreError> {
        Ok(self
            .wallets
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(&provider_id)
            .copied())
    }
}

#[async_trait]
impl TransactionRepository for InMemorySettlementStore {
    async fn append(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        self.transactions
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }

    async fn list_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self
            .transactions
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .iter()
            .filter(|t| t.provider_id == provider_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_domain::{
        PaymentStatus, ReleaseStatus, TraceId, TransactionId, TransactionKind,
    };

    fn sample_payment(appointment_id: AppointmentId) -> PaymentRecord {
        PaymentRecord {
            payment_id: PaymentId::new(),
            appointment_id,
            provider_id: ProviderId::new(),
            client_id: ClientId::new(),
            amount: Amount(50_000),
            tax_amount: Amount::ZERO,
            commission_amount: Amount(7_500),
            provider_amount: Amount(42_500),
            payment_method: PaymentMethod::Cash,
            status: PaymentStatus::Completed,
            gateway_session_id: None,
            gateway_payment_intent_id: None,
            can_release: true,
            release_status: ReleaseStatus::Eligible,
            paid_at: Utc::now(),
            released_at: None,
        }
    }

    #[tokio::test]
    async fn second_completed_payment_for_same_appointment_is_a_duplicate() {
        let store = InMemorySettlementStore::new();
        let appointment_id = AppointmentId::new();
        let first = sample_payment(appointment_id);
        let second = sample_payment(appointment_id);

        assert_eq!(
            store.insert_completed(&first).await.expect("insert"),
            PaymentInsertOutcome::Inserted
        );
        match store.insert_completed(&second).await.expect("insert") {
            PaymentInsertOutcome::Duplicate(existing) => {
                assert_eq!(existing.payment_id, first.payment_id);
            }
            PaymentInsertOutcome::Inserted => panic!("duplicate insert must not win"),
        }
        assert_eq!(store.payments_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn wallet_release_moves_pending_into_balance_once() {
        let store = InMemorySettlementStore::new();
        let provider_id = ProviderId::new();
        store
            .credit_pending(provider_id, Amount(42_500))
            .await
            .expect("credit");

        store
            .release_to_balance(provider_id, Amount(42_500))
            .await
            .expect("release");
        let wallet = WalletRepository::get(&store, provider_id)
            .await
            .expect("get")
            .expect("wallet");
        assert_eq!(wallet.pending_balance, Amount::ZERO);
        assert_eq!(wallet.balance, Amount(42_500));
        assert_eq!(wallet.total_earned, Amount(42_500));

        let err = store
            .release_to_balance(provider_id, Amount(1))
            .await
            .expect_err("pending exhausted");
        assert!(matches!(err, StoreError::InsufficientPendingBalance(_)));
    }

    #[tokio::test]
    async fn debt_settlements_accumulate_and_close_the_debt() {
        let store = InMemorySettlementStore::new();
        let debt = CommissionDebtRecord {
            debt_id: DebtId::new(),
            provider_id: ProviderId::new(),
            appointment_id: AppointmentId::new(),
            payment_id: PaymentId::new(),
            commission_amount: Amount(7_500),
            status: DebtStatus::Pending,
            due_date: Utc::now(),
            settled_amount: Amount::ZERO,
            attempt_count: 0,
        };
        assert!(store.insert_if_absent(&debt).await.expect("insert"));
        assert!(!store.insert_if_absent(&debt).await.expect("insert"));

        let updated = store
            .append_settlement(&DebtSettlementRecord {
                debt_id: debt.debt_id,
                amount: Amount(4_000),
                charged_at: Utc::now(),
                reference: Some("charge-1".to_string()),
            })
            .await
            .expect("settle");
        assert_eq!(updated.status, DebtStatus::Pending);
        assert_eq!(updated.settled_amount, Amount(4_000));

        let closed = store
            .append_settlement(&DebtSettlementRecord {
                debt_id: debt.debt_id,
                amount: Amount(3_500),
                charged_at: Utc::now(),
                reference: Some("charge-2".to_string()),
            })
            .await
            .expect("settle");
        assert_eq!(closed.status, DebtStatus::Paid);
        assert_eq!(closed.attempt_count, 2);
    }

    #[tokio::test]
    async fn closure_blockers_require_cash_and_overdue_or_review() {
        let store = InMemorySettlementStore::new();
        let provider_id = ProviderId::new();
        let now = Utc::now();

        let mut overdue = AppointmentRecord::confirmed(
            AppointmentId::new(),
            ClientId::new(),
            provider_id,
            Amount(10_000),
        );
        overdue.payment_method = Some(PaymentMethod::Cash);
        overdue.closure_state = ClosureState::PendingClose;
        overdue.closure_due_at = Some(now - chrono::Duration::hours(1));
        store.upsert(&overdue).await.expect("upsert");

        let mut fresh = AppointmentRecord::confirmed(
            AppointmentId::new(),
            ClientId::new(),
            provider_id,
            Amount(10_000),
        );
        fresh.payment_method = Some(PaymentMethod::Cash);
        fresh.closure_state = ClosureState::PendingClose;
        fresh.closure_due_at = Some(now + chrono::Duration::hours(1));
        store.upsert(&fresh).await.expect("upsert");

        let blockers = store
            .list_closure_blockers_for_provider(provider_id, now)
            .await
            .expect("list");
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].appointment_id, overdue.appointment_id);
    }

    #[tokio::test]
    async fn transactions_are_append_only_and_filtered_by_provider() {
        let store = InMemorySettlementStore::new();
        let provider_id = ProviderId::new();
        store
            .append(&TransactionRecord {
                transaction_id: TransactionId::new(),
                provider_id,
                kind: TransactionKind::PaymentHeld,
                amount: Amount(100),
                payment_id: None,
                appointment_id: None,
                occurred_at: Utc::now(),
                trace_id: TraceId::new(),
            })
            .await
            .expect("append");
        store
            .append(&TransactionRecord {
                transaction_id: TransactionId::new(),
                provider_id: ProviderId::new(),
                kind: TransactionKind::EscrowRelease,
                amount: Amount(50),
                payment_id: None,
                appointment_id: None,
                occurred_at: Utc::now(),
                trace_id: TraceId::new(),
            })
            .await
            .expect("append");

        let mine = TransactionRepository::list_by_provider(&store, provider_id)
            .await
            .expect("list");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].kind, TransactionKind::PaymentHeld);
    }
}
