//! Upstream location directory (`directory.*`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay between directory connection attempts.
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 10;

/// Directory client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Directory address, `host:port` (`directory.addr`).
    pub addr: String,

    /// Seconds between connection attempts (`directory.retry_interval_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_secs: Option<u64>,
}

impl DirectoryConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            retry_interval_secs: None,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS))
    }
}
