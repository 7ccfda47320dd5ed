//! DNS query seam
//!
//! The transmission engine never touches sockets. It hands each packed
//! domain to a [`QueryExecutor`], which owns message construction, transport
//! selection and TXT answer extraction, and gets back the TXT RDATA of the
//! answer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::attributes::{parse_txt_attributes, AttributeMap};
use crate::domain::Domain;
use crate::error::{QueryError, TransmitError};

/// Record class IN (RFC 1035)
pub const CLASS_IN: u16 = 1;

/// Record type TXT (RFC 1035)
pub const TYPE_TXT: u16 = 16;

/// Per-query parameters, passed to the executor verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Record class of the question
    pub record_class: u16,

    /// Record type of the question
    pub record_type: u16,

    /// Ask the executor to use a stream transport
    pub use_tcp: bool,

    /// Receive buffer size (EDNS0 payload size for UDP)
    pub buffer_size: u16,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            record_class: CLASS_IN,
            record_type: TYPE_TXT,
            use_tcp: false,
            buffer_size: 4096,
        }
    }
}

/// Executes one DNS query and returns the TXT RDATA of its answer
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Resolve `domain`.
    ///
    /// # Errors
    ///
    /// Transport failures, malformed DNS responses and resolver timeouts.
    async fn execute(&self, domain: &Domain, options: &QueryOptions) -> Result<Vec<u8>, QueryError>;
}

/// Run one query under `limit` and parse the answer into attributes
pub async fn query_attributes(
    executor: &dyn QueryExecutor,
    domain: &Domain,
    options: &QueryOptions,
    limit: Duration,
) -> Result<AttributeMap, TransmitError> {
    log::debug!("Querying {} ({} octets)", domain, domain.wire_len());

    let raw = timeout(limit, executor.execute(domain, options))
        .await
        .map_err(|_| QueryError::Timeout(limit))??;

    let attributes = parse_txt_attributes(&raw)?;
    log::debug!("{} answered with {} attributes", domain, attributes.len());
    Ok(attributes)
}
