use std::path::PathBuf;
use std::time::Duration;

use clientmerge_storage::StoreConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://server/data/blossom-and-bough.db";
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub database_url: String,
    pub transaction_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            transaction_timeout_secs: lookup("CLIENTMERGE_TX_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_TX_TIMEOUT_SECS),
            reports_dir: lookup("CLIENTMERGE_REPORTS_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            transaction_timeout: Duration::from_secs(self.transaction_timeout_secs),
            ..StoreConfig::default()
        }
    }
}
