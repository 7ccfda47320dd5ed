//! In-process tunnel server used by the integration tests
//!
//! Implements the server half of the begin/continue/end protocol on top of
//! the `QueryExecutor` seam: chunks are stored by sequence number and the
//! payload is reassembled and echoed back when `end` arrives.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dns_transmit::attributes::{AttributeMap, CONTENTS, ERROR, SUCCESS, TRANSMISSION_ID};
use dns_transmit::{unpack_labels, Domain, QueryError, QueryExecutor, QueryOptions};

pub const ROOT: &str = "t.example.com";

type DelayFn = Box<dyn Fn(u64) -> Duration + Send + Sync>;

pub struct StubServer {
    root: Domain,
    next_id: AtomicU64,
    open: Mutex<HashMap<String, BTreeMap<u64, Vec<String>>>>,
    queries: Mutex<Vec<String>>,
    received: Mutex<Vec<Vec<u8>>>,
    begin_answer: Option<AttributeMap>,
    failing_chunk: Option<u64>,
    chunk_delay: Option<DelayFn>,
    stalled_phase: Option<&'static str>,
}

impl StubServer {
    pub fn new() -> Self {
        Self::with_root(ROOT)
    }

    /// Serve a different zone
    pub fn with_root(root: &str) -> Self {
        Self {
            root: root.parse().unwrap(),
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            begin_answer: None,
            failing_chunk: None,
            chunk_delay: None,
            stalled_phase: None,
        }
    }

    /// Answer every begin query with `attributes`
    pub fn with_begin_answer(mut self, attributes: &[(&str, &str)]) -> Self {
        self.begin_answer = Some(attributes.iter().copied().collect());
        self
    }

    /// Refuse the chunk with this sequence number
    pub fn failing_chunk(mut self, sequence: u64) -> Self {
        self.failing_chunk = Some(sequence);
        self
    }

    /// Hold each chunk answer back for `delay(sequence)`
    pub fn with_chunk_delay(mut self, delay: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.chunk_delay = Some(Box::new(delay));
        self
    }

    /// Never answer queries of this phase
    pub fn stalling(mut self, phase: &'static str) -> Self {
        self.stalled_phase = Some(phase);
        self
    }

    /// Every name queried, in arrival order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn queries_of(&self, phase: &str) -> usize {
        let marker = format!(".{}.{}", phase, self.root);
        self.queries().iter().filter(|q| q.ends_with(&marker)).count()
    }

    /// Payloads reassembled by completed transmissions
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    fn begin(&self) -> AttributeMap {
        if let Some(answer) = &self.begin_answer {
            return answer.clone();
        }

        let id = format!("tx{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.open.lock().unwrap().insert(id.clone(), BTreeMap::new());
        [(SUCCESS, "True"), (TRANSMISSION_ID, id.as_str())].into_iter().collect()
    }

    async fn chunk(&self, rest: &[String]) -> AttributeMap {
        let [payload @ .., seq, id] = rest else {
            return refusal("short chunk name");
        };
        let Ok(seq) = seq.parse::<u64>() else {
            return refusal("bad sequence number");
        };

        if let Some(delay) = &self.chunk_delay {
            tokio::time::sleep(delay(seq)).await;
        }
        if self.failing_chunk == Some(seq) {
            return refusal("chunk rejected");
        }

        let mut open = self.open.lock().unwrap();
        match open.get_mut(id) {
            Some(chunks) => {
                chunks.insert(seq, payload.to_vec());
                [(SUCCESS, "True")].into_iter().collect()
            }
            None => refusal("unknown transmission"),
        }
    }

    fn end(&self, rest: &[String]) -> AttributeMap {
        let [count, id] = rest else {
            return refusal("bad end name");
        };
        let Some(chunks) = self.open.lock().unwrap().remove(id) else {
            return refusal("unknown transmission");
        };

        let complete = count.parse::<usize>().ok() == Some(chunks.len())
            && chunks.keys().copied().eq(0..chunks.len() as u64);
        if !complete {
            return refusal("missing chunks");
        }

        let payload = match unpack_labels(chunks.values().flatten()) {
            Ok(payload) => payload,
            Err(_) => return refusal("undecodable payload"),
        };
        let contents = STANDARD.encode(&payload);
        self.received.lock().unwrap().push(payload);

        [(SUCCESS, "True"), (CONTENTS, contents.as_str())].into_iter().collect()
    }
}

fn refusal(reason: &str) -> AttributeMap {
    [(SUCCESS, "False"), (ERROR, reason)].into_iter().collect()
}

#[async_trait]
impl QueryExecutor for StubServer {
    async fn execute(&self, domain: &Domain, _options: &QueryOptions) -> Result<Vec<u8>, QueryError> {
        self.queries.lock().unwrap().push(domain.to_string());

        if !domain.ends_with(&self.root) {
            return Err(QueryError::Other(format!("{} is outside the served zone", domain)));
        }
        let labels = &domain.labels()[..domain.level() - self.root.level()];
        let Some((phase, rest)) = labels.split_last() else {
            return Err(QueryError::Other("query for the zone apex".into()));
        };

        if self.stalled_phase == Some(phase.as_str()) {
            std::future::pending::<()>().await;
        }

        let answer = match phase.as_str() {
            "begin" => self.begin(),
            "continue" => self.chunk(rest).await,
            "end" => self.end(rest),
            other => refusal(&format!("unknown phase {}", other)),
        };
        answer.to_txt_rdata()
    }
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
