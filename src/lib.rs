//! dns-transmit: payload transmission over DNS queries
//!
//! Sends an arbitrary payload to a cooperating authoritative DNS server by
//! packing it into the labels of query names, and reads the server's reply
//! back out of TXT answers.
//!
//! ## Protocol
//!
//! ```text
//! <nonce>.begin.<root>                      -> success=True transmission_id=<tid>
//! <payload>.<seq>.<tid>.continue.<root>     -> success=True           (per chunk)
//! <count>.<tid>.end.<root>                  -> success=True contents=<base64>
//! ```
//!
//! Chunks are packed with DNS-safe base32 so that case-folding resolvers
//! cannot corrupt them, and sent concurrently through a [`Dispatcher`]. The
//! end query is only sent after every chunk has been acknowledged.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dns_transmit::{TransmissionManager, TransmitConfig};
//! # use dns_transmit::{Domain, QueryExecutor, QueryOptions, QueryError};
//! # struct Resolver;
//! # #[async_trait::async_trait]
//! # impl QueryExecutor for Resolver {
//! #     async fn execute(&self, _: &Domain, _: &QueryOptions) -> Result<Vec<u8>, QueryError> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     dns_transmit::logging::init(false);
//!
//!     let config = TransmitConfig::new("t.example.com");
//!     config.validate()?;
//!
//!     let manager = TransmissionManager::from_config(&config, Arc::new(Resolver))?;
//!     let reply = manager.send(b"hello over dns").await?;
//!     println!("{} bytes back", reply.len());
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manager;
pub mod packer;
pub mod query;
pub mod session;

pub use attributes::{parse_txt_attributes, AttributeMap};
pub use config::TransmitConfig;
pub use dispatch::{CancelToken, Dispatcher};
pub use domain::{Domain, DomainError, MAX_LABEL_LEN, MAX_NAME_LEN};
pub use error::{QueryError, Result, TransmitError};
pub use manager::{TransmissionManager, TransmitHandle};
pub use packer::{pack_bytes, pack_text, packed_len, unpack_labels, PackError, PackedDomains};
pub use query::{query_attributes, QueryExecutor, QueryOptions};
pub use session::{Session, SessionState};
