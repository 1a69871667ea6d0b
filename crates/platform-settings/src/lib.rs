//! Operator-tunable settlement settings. Providers are injected and read on
//! every settlement call so operator changes take effect live; nothing here
//! caches across requests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marketplace_domain::Amount;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings lock poisoned")]
    LockPoisoned,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Platform commission in basis points of the net (tax-excluded) amount.
    pub commission_rate_bps: u16,
    /// VAT in basis points; gross amounts are treated as tax inclusive.
    pub vat_rate_bps: u16,
    /// Largest amount a cash settlement may declare.
    pub cash_max_amount: Amount,
    /// Days until a cash commission debt falls due.
    pub cash_commission_due_days: i64,
    /// Minimum days between payment and escrow release.
    pub release_holdback_days: i64,
    /// Days a party has to answer an open closure report.
    pub closure_window_days: i64,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            commission_rate_bps: 1_500,
            vat_rate_bps: 0,
            cash_max_amount: Amount(150_000),
            cash_commission_due_days: 30,
            release_holdback_days: 7,
            closure_window_days: 3,
        }
    }
}

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Current settings snapshot. Called once per settlement operation.
    async fn current(&self) -> Result<PlatformSettings, SettingsError>;
}

/// Fixed settings, mainly for wiring tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsProvider {
    settings: PlatformSettings,
}

impl StaticSettingsProvider {
    #[must_use]
    pub fn new(settings: PlatformSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn current(&self) -> Result<PlatformSettings, SettingsError> {
        Ok(self.settings)
    }
}

/// Mutable settings store; `set` takes effect for the next read, which is
/// how live operator changes behave against the settings table.
#[derive(Debug, Clone, Default)]
pub struct InMemorySettingsProvider {
    settings: Arc<Mutex<PlatformSettings>>,
}

impl InMemorySettingsProvider {
    #[must_use]
    pub fn new(settings: PlatformSettings) -> Self {
        Self {
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn set(&self, settings: PlatformSettings) -> Result<(), SettingsError> {
        *self
            .settings
            .lock()
            .map_err(|_| SettingsError::LockPoisoned)? = settings;
        Ok(())
    }

    pub fn update(
        &self,
        apply: impl FnOnce(&mut PlatformSettings),
    ) -> Result<(), SettingsError> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| SettingsError::LockPoisoned)?;
        apply(&mut guard);
        Ok(())
    }
}

#[async_trait]
impl SettingsProvider for InMemorySettingsProvider {
    async fn current(&self) -> Result<PlatformSettings, SettingsError> {
        Ok(*self
            .settings
            .lock()
            .map_err(|_| SettingsError::LockPoisoned)?)
    }
}

/// Key/value settings table reader. Missing keys fall back to the defaults
/// so a half-populated table stays usable.
#[derive(Debug, Clone)]
pub struct PostgresSettingsProvider {
    pool: PgPool,
}

impl PostgresSettingsProvider {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_u16(key: &'static str, value: &str) -> Result<u16, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

fn parse_i64(key: &'static str, value: &str) -> Result<i64, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

#[async_trait]
impl SettingsProvider for PostgresSettingsProvider {
    async fn current(&self) -> Result<PlatformSettings, SettingsError> {
        let rows = sqlx::query("SELECT key, value FROM platform_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SettingsError::Database(e.to_string()))?;

        let mut settings = PlatformSettings::default();
        for row in rows {
            let key: String = row
                .try_get("key")
                .map_err(|e| SettingsError::Database(e.to_string()))?;
            let value: String = row
                .try_get("value")
                .map_err(|e| SettingsError::Database(e.to_string()))?;
            match key.as_str() {
                "commission_rate_bps" => {
                    settings.commission_rate_bps = parse_u16("commission_rate_bps", &value)?;
                }
                "vat_rate_bps" => {
                    settings.vat_rate_bps = parse_u16("vat_rate_bps", &value)?;
                }
                "cash_max_amount" => {
                    settings.cash_max_amount =
                        Amount(parse_i64("cash_max_amount", &value)?.unsigned_abs());
                }
                "cash_commission_due_days" => {
                    settings.cash_commission_due_days =
                        parse_i64("cash_commission_due_days", &value)?;
                }
                "release_holdback_days" => {
                    settings.release_holdback_days = parse_i64("release_holdback_days", &value)?;
                }
                "closure_window_days" => {
                    settings.closure_window_days = parse_i64("closure_window_days", &value)?;
                }
                other => {
                    tracing::debug!(key = other, "ignoring unknown platform setting");
                }
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_match_operator_documentation() {
        let provider = StaticSettingsProvider::default();
        let settings = provider.current().await.expect("settings");
        assert_eq!(settings.commission_rate_bps, 1_500);
        assert_eq!(settings.vat_rate_bps, 0);
        assert_eq!(settings.cash_max_amount, Amount(150_000));
        assert_eq!(settings.cash_commission_due_days, 30);
    }

    #[tokio::test]
    async fn in_memory_updates_are_visible_on_next_read() {
        let provider = InMemorySettingsProvider::default();
        provider
            .update(|s| s.commission_rate_bps = 1_000)
            .expect("update");
        let settings = provider.current().await.expect("settings");
        assert_eq!(settings.commission_rate_bps, 1_000);

        provider
            .update(|s| s.cash_max_amount = Amount(80_000))
            .expect("update");
        assert_eq!(
            provider.current().await.expect("settings").cash_max_amount,
            Amount(80_000)
        );
    }
}
