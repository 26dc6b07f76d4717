use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Hard cap on a single history/summary page regardless of configuration.
pub const MAX_PAGE_LIMIT: u32 = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path of the SQLite ledger database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// USD micros one credit is worth. 10_000 = $0.01.
    #[serde(default = "default_one_credit_usd_micros")]
    pub one_credit_usd_micros: u64,
    /// System-default margin multiplier in basis points (10_000 = 1.0x),
    /// applied when no pricing configuration matches.
    #[serde(default = "default_multiplier_bps")]
    pub default_multiplier_bps: u32,
    /// Safety margin added to pre-flight estimates, in percent.
    #[serde(default = "default_estimate_margin_pct")]
    pub estimate_margin_pct: u32,
    /// Bounded wait for the balance writer lock before aborting.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Total budget for one ledger transaction end to end.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Default page size for history and summary reads.
    #[serde(default = "default_history_page_limit")]
    pub history_page_limit: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ledger.sqlite")
}

fn default_one_credit_usd_micros() -> u64 {
    10_000
}

fn default_multiplier_bps() -> u32 {
    15_000
}

fn default_estimate_margin_pct() -> u32 {
    10
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_transaction_timeout_ms() -> u64 {
    10_000
}

fn default_history_page_limit() -> u32 {
    50
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            one_credit_usd_micros: default_one_credit_usd_micros(),
            default_multiplier_bps: default_multiplier_bps(),
            estimate_margin_pct: default_estimate_margin_pct(),
            busy_timeout_ms: default_busy_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            history_page_limit: default_history_page_limit(),
        }
    }
}

impl LedgerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: LedgerConfig =
            toml::from_str(raw).map_err(|err| LedgerError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.one_credit_usd_micros == 0 {
            return Err(LedgerError::InvalidConfig(
                "one_credit_usd_micros must be positive".to_string(),
            ));
        }
        if self.default_multiplier_bps == 0 {
            return Err(LedgerError::InvalidConfig(
                "default_multiplier_bps must be positive".to_string(),
            ));
        }
        if self.history_page_limit == 0 || self.history_page_limit > MAX_PAGE_LIMIT {
            return Err(LedgerError::InvalidConfig(format!(
                "history_page_limit must be in 1..={MAX_PAGE_LIMIT}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::default();
        config.validate().expect("defaults");
        assert_eq!(config.one_credit_usd_micros, 10_000);
        assert_eq!(config.default_multiplier_bps, 15_000);
        assert_eq!(config.estimate_margin_pct, 10);
    }

    #[test]
    fn parses_partial_toml() {
        let config = LedgerConfig::from_toml_str(
            r#"
            db_path = "/tmp/ledger.sqlite"
            one_credit_usd_micros = 20000
            "#,
        )
        .expect("config");
        assert_eq!(config.one_credit_usd_micros, 20_000);
        assert_eq!(config.default_multiplier_bps, 15_000);
    }

    #[test]
    fn rejects_zero_credit_value() {
        let err = LedgerConfig::from_toml_str("one_credit_usd_micros = 0");
        assert!(matches!(err, Err(LedgerError::InvalidConfig(_))));
    }
}
