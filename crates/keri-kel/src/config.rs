//! Dispatcher and escrow settings

use crate::error::{KelError, Result};
use crate::escrow::EscrowCategory;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest retention bound representable as a duration
const MAX_TIMEOUT_SECS: u64 = i64::MAX as u64 / 1000;

/// Escrow retention bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Retry passes before an entry is dropped
    pub max_retries: u32,
    /// Seconds an out-of-order event is kept
    pub out_of_order_timeout_secs: u64,
    /// Seconds a partially signed event is kept
    pub partially_signed_timeout_secs: u64,
    /// Seconds a partially witnessed event is tracked
    pub partially_witnessed_timeout_secs: u64,
    /// Seconds a delegated event waits for its anchor
    pub partially_delegated_timeout_secs: u64,
    /// Seconds a receipt waits for its receipted event
    pub unverified_receipt_timeout_secs: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,
            out_of_order_timeout_secs: 1200,
            partially_signed_timeout_secs: 3600,
            partially_witnessed_timeout_secs: 3600,
            partially_delegated_timeout_secs: 3600,
            unverified_receipt_timeout_secs: 3600,
        }
    }
}

impl EscrowConfig {
    /// Retention bound for a category
    pub fn timeout(&self, category: EscrowCategory) -> chrono::Duration {
        let secs = match category {
            EscrowCategory::OutOfOrder => self.out_of_order_timeout_secs,
            EscrowCategory::PartiallySigned => self.partially_signed_timeout_secs,
            EscrowCategory::PartiallyWitnessed => self.partially_witnessed_timeout_secs,
            EscrowCategory::PartiallyDelegated => self.partially_delegated_timeout_secs,
            EscrowCategory::UnverifiedReceipt | EscrowCategory::UnverifiedTransReceipt => {
                self.unverified_receipt_timeout_secs
            }
        };
        let bounded = secs.min(MAX_TIMEOUT_SECS);
        chrono::Duration::seconds(bounded as i64)
    }
}

/// Settings for a [`crate::Kevery`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KelConfig {
    /// Escrow retention
    pub escrow: EscrowConfig,
    /// Record first-seen datetimes attached to replayed events instead of the local clock
    pub trust_replay_timestamps: bool,
    /// Milliseconds between escrow passes when driven by [`crate::EscrowDriver`]
    pub escrow_tick_ms: u64,
}

impl Default for KelConfig {
    fn default() -> Self {
        Self {
            escrow: EscrowConfig::default(),
            trust_replay_timestamps: false,
            escrow_tick_ms: 1000,
        }
    }
}

impl KelConfig {
    /// Parse settings from TOML; absent keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| KelError::Settings(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.escrow_tick_ms == 0 {
            return Err(KelError::Settings("escrow_tick_ms must be positive".into()));
        }
        if self.escrow.max_retries == 0 {
            return Err(KelError::Settings("escrow.max_retries must be positive".into()));
        }
        Ok(())
    }

    /// Interval between escrow passes
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.escrow_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = KelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KelConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = KelConfig::from_toml_str(
            r#"
            trust_replay_timestamps = true

            [escrow]
            max_retries = 3
            out_of_order_timeout_secs = 10
            "#,
        )
        .unwrap();
        assert!(config.trust_replay_timestamps);
        assert_eq!(config.escrow.max_retries, 3);
        assert_eq!(
            config.escrow.timeout(EscrowCategory::OutOfOrder),
            chrono::Duration::seconds(10)
        );
        assert_eq!(
            config.escrow.timeout(EscrowCategory::PartiallySigned),
            chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn test_invalid_settings() {
        assert!(KelConfig::from_toml_str("escrow_tick_ms = 0").is_err());
        assert!(KelConfig::from_toml_str("escrow_tick_ms = \"fast\"").is_err());
    }
}
