use marketplace_domain::Amount;
use platform_settings::PlatformSettings;
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// Commission and VAT rates in basis points. Card and cash settlements run
/// through the same [`CommissionPolicy::split`]; there is deliberately no
/// second formula anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionPolicy {
    pub commission_bps: u16,
    pub vat_bps: u16,
}

impl CommissionPolicy {
    #[must_use]
    pub fn zero() -> Self {
        Self {
            commission_bps: 0,
            vat_bps: 0,
        }
    }

    #[must_use]
    pub fn fifteen_percent() -> Self {
        Self {
            commission_bps: 1_500,
            vat_bps: 0,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &PlatformSettings) -> Self {
        Self {
            commission_bps: settings.commission_rate_bps,
            vat_bps: settings.vat_rate_bps,
        }
    }

    /// Splits a tax-inclusive gross into tax, commission and provider share.
    /// Amounts are integer minor units, divisions round down and the
    /// provider share absorbs the remainder, so
    /// `tax + commission + provider == gross` always holds.
    pub fn split(&self, gross: Amount) -> Result<PaymentSplit, SettlementError> {
        if self.commission_bps > 10_000 {
            return Err(SettlementError::Validation(format!(
                "commission_bps={} exceeds 10000",
                self.commission_bps
            )));
        }
        if self.vat_bps > 10_000 {
            return Err(SettlementError::Validation(format!(
                "vat_bps={} exceeds 10000",
                self.vat_bps
            )));
        }

        let gross_u128 = u128::from(gross.as_u64());
        // Gross is tax inclusive: tax = gross * vat / (10000 + vat).
        let tax = if self.vat_bps == 0 {
            0
        } else {
            gross_u128.saturating_mul(u128::from(self.vat_bps))
                / (10_000 + u128::from(self.vat_bps))
        };
        let net_base = gross_u128 - tax;
        let commission = net_base.saturating_mul(u128::from(self.commission_bps)) / 10_000;
        let provider = gross_u128 - tax - commission;

        Ok(PaymentSplit {
            gross,
            tax_amount: Amount(tax as u64),
            commission_amount: Amount(commission as u64),
            provider_amount: Amount(provider as u64),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub gross: Amount,
    pub tax_amount: Amount,
    pub commission_amount: Amount,
    pub provider_amount: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rates_take_fifteen_percent_commission() {
        let split = CommissionPolicy::fifteen_percent()
            .split(Amount(50_000))
            .expect("split");
        assert_eq!(split.tax_amount, Amount::ZERO);
        assert_eq!(split.commission_amount, Amount(7_500));
        assert_eq!(split.provider_amount, Amount(42_500));
    }

    #[test]
    fn vat_is_extracted_from_a_tax_inclusive_gross() {
        // 20% VAT on a 12000 gross: tax = 12000 * 2000 / 12000 = 2000.
        let policy = CommissionPolicy {
            commission_bps: 1_500,
            vat_bps: 2_000,
        };
        let split = policy.split(Amount(12_000)).expect("split");
        assert_eq!(split.tax_amount, Amount(2_000));
        assert_eq!(split.commission_amount, Amount(1_500));
        assert_eq!(split.provider_amount, Amount(8_500));
    }

    #[test]
    fn split_conserves_the_gross_for_awkward_amounts() {
        let policy = CommissionPolicy {
            commission_bps: 1_337,
            vat_bps: 777,
        };
        for gross in [1_u64, 3, 99, 101, 49_999, 150_000, 999_999_937] {
            let split = policy.split(Amount(gross)).expect("split");
            let sum = split.tax_amount.as_u64()
                + split.commission_amount.as_u64()
                + split.provider_amount.as_u64();
            assert_eq!(sum, gross, "conservation failed for gross={gross}");
        }
    }

    #[test]
    fn commission_rounds_down_to_the_minor_unit() {
        let policy = CommissionPolicy {
            commission_bps: 300,
            vat_bps: 0,
        };
        assert_eq!(
            policy.split(Amount(33)).expect("split").commission_amount,
            Amount(0)
        );
        assert_eq!(
            policy.split(Amount(34)).expect("split").commission_amount,
            Amount(1)
        );
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        let policy = CommissionPolicy {
            commission_bps: 10_001,
            vat_bps: 0,
        };
        let err = policy.split(Amount(100)).expect_err("invalid policy");
        assert!(err.to_string().contains("commission_bps"));
    }

    #[test]
    fn zero_policy_passes_everything_to_the_provider() {
        let split = CommissionPolicy::zero().split(Amount(777)).expect("split");
        assert_eq!(split.provider_amount, Amount(777));
        assert_eq!(split.commission_amount, Amount::ZERO);
    }
}
