use chrono::{DateTime, TimeZone, Utc};
use marketplace_domain::{Amount, ProviderId, ReleaseStatus};
use serde::{Deserialize, Serialize};
use settlement_store::{PaymentRepository, WalletBalanceRecord, WalletRepository};

use crate::engine::{SettlementEngine, SettlementStore};
use crate::error::SettlementError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub provider_id: ProviderId,
    pub month: String,
    pub payments_count: usize,
    pub gross_total: Amount,
    pub tax_total: Amount,
    pub commission_total: Amount,
    pub provider_total: Amount,
    pub released_total: Amount,
    pub wallet: Option<WalletBalanceRecord>,
}

fn month_bounds(month: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), SettlementError> {
    let invalid =
        || SettlementError::Validation(format!("month must be formatted YYYY-MM, got {month}"));
    let (year_raw, month_raw) = month.split_once('-').ok_or_else(invalid)?;
    let year: i32 = year_raw.parse().map_err(|_| invalid())?;
    let month_no: u32 = month_raw.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month_no) || year_raw.len() != 4 {
        return Err(invalid());
    }

    let start = Utc
        .with_ymd_and_hms(year, month_no, 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;
    let (next_year, next_month) = if month_no == 12 {
        (year + 1, 1)
    } else {
        (year, month_no + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;
    Ok((start, end))
}

impl<S: SettlementStore> SettlementEngine<S> {
    /// Monthly earnings roll-up from the payment ledger plus the current
    /// wallet snapshot. `month` is `YYYY-MM`.
    pub async fn earnings_summary(
        &self,
        provider_id: ProviderId,
        month: &str,
    ) -> Result<EarningsSummary, SettlementError> {
        let (from, to) = month_bounds(month)?;
        let payments = self
            .store
            .list_by_provider_between(provider_id, from, to)
            .await?;

        let mut summary = EarningsSummary {
            provider_id,
            month: month.to_string(),
            payments_count: payments.len(),
            gross_total: Amount::ZERO,
            tax_total: Amount::ZERO,
            commission_total: Amount::ZERO,
            provider_total: Amount::ZERO,
            released_total: Amount::ZERO,
            wallet: WalletRepository::get(&self.store, provider_id).await?,
        };
        for payment in &payments {
            summary.gross_total = summary.gross_total.checked_add(payment.amount)?;
            summary.tax_total = summary.tax_total.checked_add(payment.tax_amount)?;
            summary.commission_total = summary
                .commission_total
                .checked_add(payment.commission_amount)?;
            summary.provider_total = summary
                .provider_total
                .checked_add(payment.provider_amount)?;
            if payment.release_status == ReleaseStatus::Completed {
                summary.released_total =
                    summary.released_total.checked_add(payment.provider_amount)?;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_bounds_cover_exactly_one_month() {
        let (from, to) = month_bounds("2026-07").expect("bounds");
        assert_eq!(from.to_rfc3339(), "2026-07-01T00:00:00+00:00");
        assert_eq!(to.to_rfc3339(), "2026-08-01T00:00:00+00:00");

        let (from, to) = month_bounds("2025-12").expect("bounds");
        assert_eq!(from.to_rfc3339(), "2025-12-01T00:00:00+00:00");
        assert_eq!(to.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn month_bounds_reject_malformed_input() {
        for raw in ["2026", "2026-13", "2026-0", "26-01", "abcd-ef"] {
            assert!(month_bounds(raw).is_err(), "{raw} should be rejected");
        }
    }
}
