//! Transmission session protocol
//!
//! One transmission is three strictly ordered phases against the root
//! domain of the tunnel server:
//!
//! ```text
//! begin:     <nonce>.begin.<root>              -> success=True, transmission_id=<tid>
//! continue:  <payload...>.<seq>.<tid>.continue.<root>   (one per chunk, concurrent)
//! end:       <count>.<tid>.end.<root>          -> success=True, contents=<base64>
//! ```
//!
//! The server reassembles chunks by their `<seq>` label, so chunks may be
//! sent and answered in any order. `end` carries the number of chunks sent.

use std::sync::Arc;
use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use log::{debug, info, warn};

use crate::attributes::{AttributeMap, CONTENTS, TRANSMISSION_ID};
use crate::dispatch::{CancelToken, Dispatcher};
use crate::domain::{validate_label, Domain};
use crate::error::{Result, TransmitError};
use crate::packer::{pack_bytes, PackError};
use crate::query::{query_attributes, QueryExecutor, QueryOptions};

/// Label that marks the begin query
pub const BEGIN_LABEL: &str = "begin";
/// Label that marks chunk queries
pub const CONTINUE_LABEL: &str = "continue";
/// Label that marks the end query
pub const END_LABEL: &str = "end";

/// Default per-query timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Standard alphabet, padding optional: servers differ on trailing `=`
const CONTENTS_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Begun,
    Transferring,
    Ended,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Begun => "begun",
            SessionState::Transferring => "transferring",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        }
    }
}

/// State machine for a single transmission. Not reusable: once `end`
/// returns, or any phase fails, the session is finished.
pub struct Session {
    executor: Arc<dyn QueryExecutor>,
    root: Domain,
    dispatcher: Dispatcher,
    options: QueryOptions,
    query_timeout: Duration,
    cancel: CancelToken,
    state: SessionState,
    transmission_id: Option<String>,
}

impl Session {
    pub fn new(executor: Arc<dyn QueryExecutor>, root: Domain, dispatcher: Dispatcher) -> Self {
        Self {
            executor,
            root,
            dispatcher,
            options: QueryOptions::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            cancel: CancelToken::new(),
            state: SessionState::Idle,
            transmission_id: None,
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_query_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = limit;
        self
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token issued by the server, once `begin` succeeded
    pub fn transmission_id(&self) -> Option<&str> {
        self.transmission_id.as_deref()
    }

    /// Open the transmission and return the server's transmission id
    pub async fn begin(&mut self) -> Result<String> {
        self.expect(SessionState::Idle)?;
        let result = self.begin_inner().await;
        self.settle(result, SessionState::Begun)
    }

    async fn begin_inner(&mut self) -> Result<String> {
        let domain = self.root.prepend(BEGIN_LABEL)?.prepend(fresh_nonce())?;
        let attributes = self.query(&domain).await?;
        attributes.check_success()?;

        let id = attributes.require(TRANSMISSION_ID)?;
        if validate_label(id).is_err() || !matches!(self.chunk_room(id), Ok(room) if room > 0) {
            return Err(TransmitError::unexpected(TRANSMISSION_ID, id));
        }

        debug!("Transmission {} opened on {}", id, self.root);
        self.transmission_id = Some(id.to_string());
        Ok(id.to_string())
    }

    /// Pack `payload` into chunk queries, send them all and wait for every
    /// answer. Returns the number of chunks sent.
    pub async fn transfer_all(&mut self, payload: &[u8]) -> Result<u64> {
        self.expect(SessionState::Begun)?;
        self.state = SessionState::Transferring;
        let result = self.transfer_inner(payload).await;
        self.settle(result, SessionState::Transferring)
    }

    async fn transfer_inner(&mut self, payload: &[u8]) -> Result<u64> {
        let continue_domain = self.continue_domain(self.id()?)?;
        let chunks = pack_bytes(payload, move |seq| continue_domain.prepend(seq.to_string()))?;

        let executor = Arc::clone(&self.executor);
        let options = self.options;
        let limit = self.query_timeout;

        let jobs = chunks.map(move |chunk| -> Result<_> {
            let chunk = chunk?;
            let executor = Arc::clone(&executor);
            Ok(async move {
                let attributes = query_attributes(executor.as_ref(), &chunk, &options, limit).await?;
                attributes.check_success()
            })
        });

        let count = self.dispatcher.run_all(jobs, &self.cancel).await?;
        debug!("Transmission {}: {} chunks acknowledged", self.id()?, count);
        Ok(count)
    }

    /// Close the transmission after `count` chunks and decode the server's
    /// response
    pub async fn end(&mut self, count: u64) -> Result<Vec<u8>> {
        self.expect(SessionState::Transferring)?;
        let result = self.end_inner(count).await;
        self.settle(result, SessionState::Ended)
    }

    async fn end_inner(&mut self, count: u64) -> Result<Vec<u8>> {
        let domain = self
            .root
            .prepend(END_LABEL)?
            .prepend(self.id()?)?
            .prepend(count.to_string())?;

        let attributes = self.query(&domain).await?;
        attributes.check_success()?;

        let contents = attributes.require(CONTENTS)?;
        CONTENTS_BASE64
            .decode(contents)
            .map_err(|_| TransmitError::unexpected(CONTENTS, contents))
    }

    /// Run begin, transfer and end back to back
    pub async fn run(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(PackError::EmptyInput.into());
        }

        let id = self.begin().await?;
        info!("Transmission {} started ({} bytes)", id, payload.len());

        let count = self.transfer_all(payload).await?;
        let response = self.end(count).await?;

        info!(
            "Transmission {} finished: {} chunks sent, {} bytes received",
            id,
            count,
            response.len()
        );
        Ok(response)
    }

    async fn query(&self, domain: &Domain) -> Result<AttributeMap> {
        tokio::select! {
            result = query_attributes(self.executor.as_ref(), domain, &self.options, self.query_timeout) => result,
            _ = self.cancel.cancelled() => Err(TransmitError::Cancelled),
        }
    }

    fn continue_domain(&self, id: &str) -> Result<Domain> {
        Ok(self.root.prepend(CONTINUE_LABEL)?.prepend(id)?)
    }

    /// Payload room left in the first chunk name for transmission `id`
    fn chunk_room(&self, id: &str) -> Result<usize> {
        Ok(self.continue_domain(id)?.prepend("0")?.max_next_label_length())
    }

    fn id(&self) -> Result<&str> {
        self.transmission_id
            .as_deref()
            .ok_or(TransmitError::InvalidState {
                expected: SessionState::Begun.as_str(),
                actual: self.state.as_str(),
            })
    }

    fn expect(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(TransmitError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T>, next: SessionState) -> Result<T> {
        match &result {
            Ok(_) => self.state = next,
            Err(e) => {
                warn!("Transmission failed in {} phase: {}", self.state.as_str(), e);
                self.state = SessionState::Failed;
            }
        }
        result
    }
}

/// Random RFC 4122 version 4 identifier, used to keep begin queries out of
/// resolver caches
fn fresh_nonce() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let h = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{SUCCESS, ERROR};
    use crate::error::QueryError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers from a fixed script keyed by the phase label of the query
    struct Scripted {
        begin: AttributeMap,
        chunk: AttributeMap,
        end: AttributeMap,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(begin: &[(&str, &str)], chunk: &[(&str, &str)], end: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                begin: begin.iter().copied().collect(),
                chunk: chunk.iter().copied().collect(),
                end: end.iter().copied().collect(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for Scripted {
        async fn execute(&self, domain: &Domain, _options: &QueryOptions) -> std::result::Result<Vec<u8>, QueryError> {
            self.seen.lock().unwrap().push(domain.to_string());
            let labels = domain.labels();
            let answer = if labels.iter().any(|l| l == BEGIN_LABEL) {
                &self.begin
            } else if labels.iter().any(|l| l == CONTINUE_LABEL) {
                &self.chunk
            } else {
                &self.end
            };
            answer.to_txt_rdata()
        }
    }

    fn session(executor: Arc<Scripted>) -> Session {
        Session::new(executor, "t.example.com".parse().unwrap(), Dispatcher::sequential())
    }

    #[test]
    fn test_nonce_is_uuid_label() {
        let nonce = fresh_nonce();
        assert_eq!(nonce.len(), 36);
        assert_eq!(&nonce[14..15], "4");
        validate_label(&nonce).unwrap();
        assert_ne!(nonce, fresh_nonce());
    }

    #[tokio::test]
    async fn test_begin_returns_transmission_id() {
        let executor = Scripted::new(&[(SUCCESS, "True"), (TRANSMISSION_ID, "abc123")], &[], &[]);
        let mut session = session(Arc::clone(&executor));

        assert_eq!(session.begin().await.unwrap(), "abc123");
        assert_eq!(session.state(), SessionState::Begun);
        assert_eq!(session.transmission_id(), Some("abc123"));

        let seen = executor.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].ends_with(".begin.t.example.com"));
    }

    #[tokio::test]
    async fn test_begin_failures() {
        let cases: Vec<&[(&str, &str)]> = vec![
            &[(TRANSMISSION_ID, "abc")],
            &[(SUCCESS, "True")],
            &[(SUCCESS, "True"), (TRANSMISSION_ID, "not a label")],
            &[(SUCCESS, "Perhaps"), (TRANSMISSION_ID, "abc")],
        ];
        for begin in cases {
            let mut session = session(Scripted::new(begin, &[], &[]));
            assert!(matches!(
                session.begin().await,
                Err(TransmitError::UnexpectedServerResponse { .. })
            ));
            assert_eq!(session.state(), SessionState::Failed);
        }

        let mut session = session(Scripted::new(&[(SUCCESS, "False"), (ERROR, "quota exceeded")], &[], &[]));
        match session.begin().await {
            Err(TransmitError::ServerErrorResponse { reason }) => {
                assert_eq!(reason.as_deref(), Some("quota exceeded"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transmission_id_must_leave_room_for_payload() {
        // <tid>.continue.<root> plus a sequence label fills 254 octets
        let root: Domain = format!("{}.{}.{}", "a".repeat(63), "b".repeat(63), "c".repeat(49))
            .parse()
            .unwrap();
        let tid = "t".repeat(63);
        let executor = Scripted::new(&[(SUCCESS, "True"), (TRANSMISSION_ID, tid.as_str())], &[], &[]);
        let mut session = Session::new(executor.clone(), root, Dispatcher::sequential());

        match session.begin().await {
            Err(TransmitError::UnexpectedServerResponse { key, value }) => {
                assert_eq!(key, TRANSMISSION_ID);
                assert_eq!(value.as_deref(), Some(tid.as_str()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(executor.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_phases_must_run_in_order() {
        let executor = Scripted::new(&[(SUCCESS, "True"), (TRANSMISSION_ID, "abc")], &[], &[]);
        let mut session = session(executor);

        assert!(matches!(
            session.transfer_all(b"data").await,
            Err(TransmitError::InvalidState { expected: "begun", actual: "idle" })
        ));
        assert!(matches!(session.end(0).await, Err(TransmitError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_full_run_query_layout() {
        let executor = Scripted::new(
            &[(SUCCESS, "True"), (TRANSMISSION_ID, "tid42")],
            &[(SUCCESS, "True")],
            &[(SUCCESS, "True"), (CONTENTS, "cmVwbHk=")],
        );
        let mut session = session(Arc::clone(&executor));

        let response = session.run(&[7u8; 300]).await.unwrap();
        assert_eq!(response, b"reply");
        assert_eq!(session.state(), SessionState::Ended);

        let seen = executor.seen();
        let chunks: Vec<&String> = seen.iter().filter(|d| d.contains(".continue.")).collect();
        assert!(chunks.len() > 1);
        for (seq, chunk) in chunks.iter().enumerate() {
            assert!(chunk.ends_with(&format!(".{}.tid42.continue.t.example.com", seq)));
        }
        assert_eq!(
            seen.last().unwrap(),
            &format!("{}.tid42.end.t.example.com", chunks.len())
        );
    }

    #[tokio::test]
    async fn test_empty_payload_sends_nothing() {
        let executor = Scripted::new(&[(SUCCESS, "True"), (TRANSMISSION_ID, "tid")], &[], &[]);
        let mut session = session(Arc::clone(&executor));

        assert!(matches!(
            session.run(b"").await,
            Err(TransmitError::Pack(PackError::EmptyInput))
        ));
        assert!(executor.seen().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_unpadded_contents_accepted() {
        let executor = Scripted::new(
            &[(SUCCESS, "True"), (TRANSMISSION_ID, "tid")],
            &[(SUCCESS, "True")],
            &[(SUCCESS, "True"), (CONTENTS, "cmVwbHk")],
        );
        assert_eq!(session(executor).run(b"x").await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn test_end_failures() {
        let begin: &[(&str, &str)] = &[(SUCCESS, "True"), (TRANSMISSION_ID, "tid")];
        let ok: &[(&str, &str)] = &[(SUCCESS, "True")];

        let mut missing = session(Scripted::new(begin, ok, &[(SUCCESS, "True")]));
        match missing.run(b"x").await {
            Err(TransmitError::UnexpectedServerResponse { key, value: None }) => assert_eq!(key, CONTENTS),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut garbage = session(Scripted::new(begin, ok, &[(SUCCESS, "True"), (CONTENTS, "***")]));
        match garbage.run(b"x").await {
            Err(TransmitError::UnexpectedServerResponse { key, value: Some(v) }) => {
                assert_eq!(key, CONTENTS);
                assert_eq!(v, "***");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut refused = session(Scripted::new(begin, ok, &[(SUCCESS, "False")]));
        assert!(matches!(
            refused.run(b"x").await,
            Err(TransmitError::ServerErrorResponse { reason: None })
        ));
        assert_eq!(refused.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_chunk_failure_skips_end() {
        let executor = Scripted::new(
            &[(SUCCESS, "True"), (TRANSMISSION_ID, "tid")],
            &[(SUCCESS, "False"), (ERROR, "bad chunk")],
            &[(SUCCESS, "True"), (CONTENTS, "")],
        );
        let mut session = session(Arc::clone(&executor));

        let err = session.run(&[1u8; 500]).await.unwrap_err();
        match err {
            TransmitError::ChunkFailed { sequence, source } => {
                assert_eq!(sequence, 0);
                assert!(matches!(*source, TransmitError::ServerErrorResponse { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!executor.seen().iter().any(|d| d.contains(".end.")));
    }
}
