//! Chunk dispatch
//!
//! A [`Dispatcher`] fans chunk queries out and waits for all of them. It is
//! an explicit value handed to the transmission manager rather than global
//! state: clones share one permit pool, so concurrent transmissions built
//! from the same dispatcher together never run more than `limit` chunk
//! queries at a time.
//!
//! The sequential dispatcher runs chunks inline in sequence order, which
//! makes transmissions fully deterministic in tests.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::error::TransmitError;

/// Default number of chunk queries in flight
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Cooperative cancellation flag shared between a caller and a transmission
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // unreachable while `self` holds the sender
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Concurrent { permits: Arc<Semaphore>, limit: usize },
    Sequential,
}

/// Runs chunk jobs and acts as the barrier of the transfer phase
#[derive(Debug, Clone)]
pub struct Dispatcher {
    mode: Mode,
}

type Outcome = (u64, Result<(), TransmitError>);

impl Dispatcher {
    /// Run up to `limit` jobs at once on the tokio runtime
    pub fn concurrent(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            mode: Mode::Concurrent {
                permits: Arc::new(Semaphore::new(limit)),
                limit,
            },
        }
    }

    /// Run jobs one at a time, in order, on the calling task
    pub fn sequential() -> Self {
        Self { mode: Mode::Sequential }
    }

    /// Maximum number of jobs in flight
    pub fn limit(&self) -> usize {
        match &self.mode {
            Mode::Concurrent { limit, .. } => *limit,
            Mode::Sequential => 1,
        }
    }

    /// Run every job produced by `jobs` and wait for all of them.
    ///
    /// Jobs are numbered in the order the iterator yields them. Returns the
    /// number of jobs dispatched once each of them has completed. The first
    /// failing job (or iterator error, or cancellation) aborts the jobs still
    /// in flight and is returned; a failing job is reported as
    /// [`TransmitError::ChunkFailed`].
    pub async fn run_all<I, Fut>(&self, jobs: I, cancel: &CancelToken) -> Result<u64, TransmitError>
    where
        I: IntoIterator<Item = Result<Fut, TransmitError>>,
        Fut: Future<Output = Result<(), TransmitError>> + Send + 'static,
    {
        match &self.mode {
            Mode::Concurrent { permits, .. } => run_concurrent(permits, jobs, cancel).await,
            Mode::Sequential => run_sequential(jobs, cancel).await,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::concurrent(DEFAULT_CONCURRENCY)
    }
}

async fn run_sequential<I, Fut>(jobs: I, cancel: &CancelToken) -> Result<u64, TransmitError>
where
    I: IntoIterator<Item = Result<Fut, TransmitError>>,
    Fut: Future<Output = Result<(), TransmitError>>,
{
    let mut dispatched = 0u64;

    for job in jobs {
        let job = job?;
        let sequence = dispatched;
        dispatched += 1;

        tokio::select! {
            result = job => result.map_err(|e| chunk_failed(sequence, e))?,
            _ = cancel.cancelled() => return Err(TransmitError::Cancelled),
        }
    }

    Ok(dispatched)
}

async fn run_concurrent<I, Fut>(permits: &Arc<Semaphore>, jobs: I, cancel: &CancelToken) -> Result<u64, TransmitError>
where
    I: IntoIterator<Item = Result<Fut, TransmitError>>,
    Fut: Future<Output = Result<(), TransmitError>> + Send + 'static,
{
    // dropping the set aborts every task still in it, so chunks never outlive
    // this call, even when the caller stops polling it
    let mut in_flight: JoinSet<Outcome> = JoinSet::new();
    let mut dispatched = 0u64;
    let mut completed = 0u64;
    let mut failure: Option<TransmitError> = None;

    'dispatch: for job in jobs {
        let job = match job {
            Ok(job) => job,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };

        // wait for a free slot, but notice failures and cancellation meanwhile
        let permit = loop {
            tokio::select! {
                permit = Arc::clone(permits).acquire_owned() => match permit {
                    Ok(permit) => break permit,
                    Err(_) => {
                        failure = Some(TransmitError::Runtime("dispatch pool closed".into()));
                        break 'dispatch;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    completed += 1;
                    if let Err(e) = outcome(joined) {
                        failure = Some(e);
                        break 'dispatch;
                    }
                }
                _ = cancel.cancelled() => {
                    failure = Some(TransmitError::Cancelled);
                    break 'dispatch;
                }
            }
        };

        let sequence = dispatched;
        in_flight.spawn(async move {
            let _permit = permit;
            (sequence, job.await)
        });
        dispatched += 1;
    }

    // barrier
    while failure.is_none() && !in_flight.is_empty() {
        tokio::select! {
            Some(joined) = in_flight.join_next() => {
                completed += 1;
                if let Err(e) = outcome(joined) {
                    failure = Some(e);
                }
            }
            _ = cancel.cancelled() => failure = Some(TransmitError::Cancelled),
        }
    }

    if let Some(err) = failure {
        log::debug!(
            "Aborting {} in-flight chunks after {} of {} completed",
            in_flight.len(),
            completed,
            dispatched
        );
        in_flight.shutdown().await;
        return Err(err);
    }

    debug_assert_eq!(completed, dispatched);
    Ok(dispatched)
}

fn outcome(joined: Result<Outcome, JoinError>) -> Result<(), TransmitError> {
    match joined {
        Ok((_, Ok(()))) => Ok(()),
        Ok((sequence, Err(e))) => Err(chunk_failed(sequence, e)),
        Err(e) => Err(TransmitError::Runtime(format!("chunk task failed: {}", e))),
    }
}

fn chunk_failed(sequence: u64, source: TransmitError) -> TransmitError {
    TransmitError::ChunkFailed {
        sequence,
        source: Box::new(source),
    }
}
