//! dns-transmit configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::DEFAULT_CONCURRENCY;
use crate::domain::{Domain, MAX_LABEL_LEN, MAX_NAME_LEN};
use crate::manager::DEFAULT_TRANSMIT_TIMEOUT;
use crate::query::QueryOptions;
use crate::session::{CONTINUE_LABEL, DEFAULT_QUERY_TIMEOUT};

/// Wire octets a chunk needs on top of the root: the continue label, the
/// longest possible transmission id, a 20-digit sequence number and one
/// payload character
const CHUNK_OVERHEAD: usize = (CONTINUE_LABEL.len() + 1) + (MAX_LABEL_LEN + 1) + 21 + 2;

/// Transmission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitConfig {
    /// Domain delegated to the tunnel server
    pub root_domain: String,

    /// Chunk queries in flight, shared by all transmissions of a manager
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Send chunks one at a time, in order
    #[serde(default)]
    pub sequential: bool,

    /// Deadline for a single query
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Deadline for a whole begin/transfer/end sequence
    #[serde(default = "default_transmit_timeout", with = "humantime_serde")]
    pub transmit_timeout: Duration,

    /// Options passed to the query executor
    #[serde(default)]
    pub query: QueryOptions,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_transmit_timeout() -> Duration {
    DEFAULT_TRANSMIT_TIMEOUT
}

impl TransmitConfig {
    /// Defaults for the given root domain
    pub fn new(root_domain: impl Into<String>) -> Self {
        Self {
            root_domain: root_domain.into(),
            max_concurrency: DEFAULT_CONCURRENCY,
            sequential: false,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            query: QueryOptions::default(),
        }
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let root: Domain = self
            .root_domain
            .parse()
            .map_err(|e| format!("Invalid root domain {:?}: {}", self.root_domain, e))?;

        if root.wire_len() + CHUNK_OVERHEAD > MAX_NAME_LEN {
            return Err(format!(
                "Root domain {} is too long to leave room for payload",
                self.root_domain
            ));
        }

        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }

        if self.query_timeout.is_zero() || self.transmit_timeout.is_zero() {
            return Err("Timeouts must be non-zero".to_string());
        }

        Ok(())
    }
}
