//! Human verification codes: short numeric secrets proving the client
//! authorized or witnessed service completion.

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CODE_LEN: usize = 4;
pub const MAX_ATTEMPTS: u8 = 3;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodeError {
    #[error("verification code must be exactly {CODE_LEN} digits")]
    InvalidFormat,
    #[error("verification attempts exceeded")]
    AttemptsExceeded,
}

/// Draws a 4-digit code uniformly from 1000..=9999. The leading digit is
/// never zero so the code survives numeric round-trips in clients.
#[must_use]
pub fn generate() -> String {
    OsRng.gen_range(1000_u16..=9999).to_string()
}

pub fn validate_format(code: &str) -> Result<(), CodeError> {
    let trimmed = code.trim();
    if trimmed.len() == CODE_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(CodeError::InvalidFormat)
    }
}

#[must_use]
pub fn codes_match(input: &str, stored: &str) -> bool {
    input.trim() == stored.trim()
}

/// Per-appointment attempt budget. A mismatch consumes an attempt; once the
/// budget is spent every further attempt is rejected regardless of
/// correctness and only support can reset the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptPolicy {
    pub max_attempts: u8,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl AttemptPolicy {
    /// Budget check before a new attempt is evaluated. `used` is the number
    /// of failed attempts already recorded.
    pub fn ensure_attempt_allowed(&self, used: u8) -> Result<(), CodeError> {
        if used >= self.max_attempts {
            Err(CodeError::AttemptsExceeded)
        } else {
            Ok(())
        }
    }

    /// Attempts left after a failure that brought the counter to `used`.
    #[must_use]
    pub fn remaining_after_failure(&self, used: u8) -> u8 {
        self.max_attempts.saturating_sub(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_four_digits_in_range() {
        for _ in 0..64 {
            let code = generate();
            assert_eq!(code.len(), CODE_LEN);
            let value: u16 = code.parse().expect("numeric");
            assert!((1000..=9999).contains(&value));
            assert!(validate_format(&code).is_ok());
        }
    }

    #[test]
    fn format_rejects_short_long_and_non_numeric() {
        assert_eq!(validate_format("123").expect_err("short"), CodeError::InvalidFormat);
        assert_eq!(
            validate_format("12345").expect_err("long"),
            CodeError::InvalidFormat
        );
        assert_eq!(
            validate_format("12a4").expect_err("alpha"),
            CodeError::InvalidFormat
        );
        assert!(validate_format(" 1234 ").is_ok());
    }

    #[test]
    fn comparison_trims_both_sides() {
        assert!(codes_match(" 4321", "4321 "));
        assert!(!codes_match("4321", "4322"));
    }

    #[test]
    fn attempt_policy_reports_monotone_remaining() {
        let policy = AttemptPolicy::default();
        assert_eq!(policy.remaining_after_failure(1), 2);
        assert_eq!(policy.remaining_after_failure(2), 1);
        assert_eq!(policy.remaining_after_failure(3), 0);
    }

    #[test]
    fn fourth_attempt_is_rejected() {
        let policy = AttemptPolicy::default();
        assert!(policy.ensure_attempt_allowed(0).is_ok());
        assert!(policy.ensure_attempt_allowed(2).is_ok());
        assert_eq!(
            policy.ensure_attempt_allowed(3).expect_err("locked"),
            CodeError::AttemptsExceeded
        );
    }
}
