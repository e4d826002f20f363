//! Runtime configuration.

use crate::error::{LedgerError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// SQLite database file. The in-memory store is used when unset.
    pub database_path: Option<PathBuf>,

    /// Commit attempts per operation before a storage conflict is reported
    /// as unavailability. At least 1.
    pub max_attempts: u32,

    /// Linear backoff step between attempts.
    pub retry_backoff: Duration,
}

/// Upper bound for `retry_backoff`.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl LedgerConfig {
    /// Load from environment variables
    ///
    /// - `POINTS_LEDGER_DB`
    /// - `POINTS_LEDGER_MAX_ATTEMPTS`
    /// - `POINTS_LEDGER_RETRY_BACKOFF_MS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = LedgerConfig::default();

        if let Some(path) = lookup("POINTS_LEDGER_DB").filter(|p| !p.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = lookup("POINTS_LEDGER_MAX_ATTEMPTS") {
            config.max_attempts = raw.trim().parse().map_err(|e| {
                LedgerError::Config(format!("POINTS_LEDGER_MAX_ATTEMPTS={:?}: {}", raw, e))
            })?;
        }

        if let Some(raw) = lookup("POINTS_LEDGER_RETRY_BACKOFF_MS") {
            let millis: u64 = raw.trim().parse().map_err(|e| {
                LedgerError::Config(format!("POINTS_LEDGER_RETRY_BACKOFF_MS={:?}: {}", raw, e))
            })?;
            config.retry_backoff = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LedgerError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff > MAX_RETRY_BACKOFF {
            return Err(LedgerError::Config(format!(
                "retry_backoff must be at most {}ms",
                MAX_RETRY_BACKOFF.as_millis()
            )));
        }
        Ok(())
    }
}
