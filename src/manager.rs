//! Transmission manager
//!
//! Public entry point: binds a root domain, a query executor and a
//! dispatcher together and runs one [`Session`] per payload.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::TransmitConfig;
use crate::dispatch::{CancelToken, Dispatcher};
use crate::domain::Domain;
use crate::error::{Result, TransmitError};
use crate::query::{QueryExecutor, QueryOptions};
use crate::session::{Session, DEFAULT_QUERY_TIMEOUT};

/// Default deadline for a whole transmission
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends payloads through a DNS tunnel server
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use dns_transmit::{Dispatcher, TransmissionManager};
/// # use dns_transmit::{Domain, QueryExecutor, QueryOptions, QueryError};
/// # struct Resolver;
/// # #[async_trait::async_trait]
/// # impl QueryExecutor for Resolver {
/// #     async fn execute(&self, _: &Domain, _: &QueryOptions) -> Result<Vec<u8>, QueryError> {
/// #         Ok(Vec::new())
/// #     }
/// # }
///
/// # async fn example() -> Result<(), dns_transmit::TransmitError> {
/// let manager = TransmissionManager::new(
///     "t.example.com".parse()?,
///     Arc::new(Resolver),
///     Dispatcher::concurrent(8),
/// );
///
/// let handle = manager.transmit(b"hello".to_vec(), |result| match result {
///     Ok(response) => println!("server replied with {} bytes", response.len()),
///     Err(e) => eprintln!("transmission failed: {}", e),
/// })?;
/// handle.join().await?;
/// # Ok(())
/// # }
/// ```
pub struct TransmissionManager {
    root: Domain,
    executor: Arc<dyn QueryExecutor>,
    dispatcher: Dispatcher,
    options: QueryOptions,
    query_timeout: Duration,
    transmit_timeout: Duration,
    runtime: Option<Handle>,
}

impl TransmissionManager {
    /// Create a manager for `root`. Picks up the current tokio runtime if
    /// there is one; see [`with_runtime`](Self::with_runtime).
    pub fn new(root: Domain, executor: Arc<dyn QueryExecutor>, dispatcher: Dispatcher) -> Self {
        Self {
            root,
            executor,
            dispatcher,
            options: QueryOptions::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            runtime: Handle::try_current().ok(),
        }
    }

    /// Create a manager from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configured root domain is not a valid name
    pub fn from_config(config: &TransmitConfig, executor: Arc<dyn QueryExecutor>) -> Result<Self> {
        let root: Domain = config.root_domain.parse()?;
        let dispatcher = if config.sequential {
            Dispatcher::sequential()
        } else {
            Dispatcher::concurrent(config.max_concurrency)
        };

        Ok(Self::new(root, executor, dispatcher)
            .with_options(config.query)
            .with_query_timeout(config.query_timeout)
            .with_transmit_timeout(config.transmit_timeout))
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_query_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = limit;
        self
    }

    pub fn with_transmit_timeout(mut self, limit: Duration) -> Self {
        self.transmit_timeout = limit;
        self
    }

    /// Runtime that `transmit` spawns onto
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn root(&self) -> &Domain {
        &self.root
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send `payload` and invoke `completion` with the server's response.
    ///
    /// The transmission runs as a task on the runtime; `completion` is called
    /// exactly once, from that task, with either the decoded response or the
    /// error that ended the transmission.
    ///
    /// # Errors
    ///
    /// Only fails, without calling `completion`, when no runtime is available
    pub fn transmit<F>(&self, payload: Vec<u8>, completion: F) -> Result<TransmitHandle>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current()
                .map_err(|e| TransmitError::Runtime(format!("no tokio runtime: {}", e)))?,
        };

        let cancel = CancelToken::new();
        let session = self.session(cancel.clone());
        let deadline = self.transmit_timeout;

        log::debug!("Scheduling transmission of {} bytes to {}", payload.len(), self.root);
        let task = runtime.spawn(async move {
            let result = run_with_deadline(session, &payload, deadline).await;
            completion(result);
        });

        Ok(TransmitHandle { cancel, task })
    }

    /// Send `payload` from the current task and return the server's response
    pub async fn send(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_with_cancel(payload, CancelToken::new()).await
    }

    /// Like [`send`](Self::send), stopping early once `cancel` fires
    pub async fn send_with_cancel(&self, payload: &[u8], cancel: CancelToken) -> Result<Vec<u8>> {
        run_with_deadline(self.session(cancel), payload, self.transmit_timeout).await
    }

    fn session(&self, cancel: CancelToken) -> Session {
        Session::new(Arc::clone(&self.executor), self.root.clone(), self.dispatcher.clone())
            .with_options(self.options)
            .with_query_timeout(self.query_timeout)
            .with_cancel_token(cancel)
    }
}

async fn run_with_deadline(mut session: Session, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let outcome = timeout(deadline, session.run(payload)).await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            log::warn!(
                "Transmission {} timed out after {}",
                session.transmission_id().unwrap_or("<unopened>"),
                humantime::format_duration(deadline)
            );
            Err(TransmitError::Timeout(deadline))
        }
    }
}

/// Handle to a transmission started with [`TransmissionManager::transmit`]
pub struct TransmitHandle {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl TransmitHandle {
    /// Stop the transmission. Its completion receives
    /// [`TransmitError::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the completion has run
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| TransmitError::Runtime(format!("transmission task failed: {}", e)))
    }
}
