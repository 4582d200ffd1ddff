//! Caller: the public API for requesting work from a topic.
//!
//! A caller owns one private response channel. Requests are registered in
//! the correlation table, pushed onto the topic queue together with an
//! expiry refresh and a wakeup publish, and then raced against a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationTable, PendingGuard};
use crate::envelope::RequestEnvelope;
use crate::error::{Error, Result};
use crate::id::{self, RequestId};
use crate::model::{self, AwaitingState};
use crate::store::{Store, Transaction, check_channel};
use crate::telemetry::metrics;
use crate::worker::{ServeOptions, Worker};

/// Default time a request waits for its response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct CallerOptions {
    /// Prefix for the caller id, so callers of one application can be told
    /// apart on a shared store.
    pub namespace: Option<String>,
}

impl CallerOptions {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub timeout: Duration,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout_ms(ms: u64) -> Self {
        Self::timeout(Duration::from_millis(ms))
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Handle to a caller. Cloning shares the same caller.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<CallerInner>,
}

struct CallerInner {
    id: String,
    store: Arc<dyn Store>,
    pending: Arc<CorrelationTable>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<Worker>>,
    destroyed: AtomicBool,
}

impl Caller {
    /// Create a caller and subscribe to its response channel. Returns only
    /// once the subscription is live, so no response can be missed.
    pub async fn connect(store: Arc<dyn Store>, options: CallerOptions) -> Result<Self> {
        let id = id::caller_id(options.namespace.as_deref());
        let channel = model::response_channel(&id);
        check_channel(store.as_ref(), &channel)?;
        let mut subscription = store.subscribe(&channel).await?;

        let pending = Arc::new(CorrelationTable::new());
        let table = Arc::clone(&pending);
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                table.dispatch(&message);
            }
            debug!(channel = %subscription.channel(), "response subscription closed");
        });

        info!(caller_id = %id, "caller connected");
        Ok(Self {
            inner: Arc::new(CallerInner {
                id,
                store,
                pending,
                dispatcher: Mutex::new(Some(dispatcher)),
                workers: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// The id workers publish responses for this caller under.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `method` on whichever worker serves `topic` and wait for its result.
    pub async fn request(
        &self,
        topic: &str,
        method: &str,
        args: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        if topic.is_empty() {
            return Err(Error::InvalidArgument("topic must not be empty".to_string()));
        }
        if method.is_empty() {
            return Err(Error::InvalidArgument("method must not be empty".to_string()));
        }
        if options.timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be positive".to_string()));
        }
        check_channel(self.inner.store.as_ref(), &model::request_channel(topic))?;
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }

        let started = Instant::now();
        let result = self.submit_and_wait(topic, method, args, options.timeout).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(Error::Rejected { .. }) => "rejected",
            Err(Error::UnknownMethod { .. }) => "unknown_method",
            Err(Error::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        let topic_label = KeyValue::new("topic", topic.to_string());
        metrics::request_outcomes().add(
            1,
            &[topic_label.clone(), KeyValue::new("outcome", outcome)],
        );
        metrics::request_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[topic_label],
        );
        result
    }

    async fn submit_and_wait(
        &self,
        topic: &str,
        method: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = RequestId::generate();
        let key = request_id.to_hex();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let envelope = RequestEnvelope {
            caller_id: self.inner.id.clone(),
            request_id,
            expires_at: model::now_ms().saturating_add(timeout_ms),
            method: method.to_string(),
            args: args.clone(),
        };
        let payload = envelope.encode()?;

        let mut rx = self
            .inner
            .pending
            .register(&key, AwaitingState::new(topic, method, args))?;
        let _guard = PendingGuard::new(Arc::clone(&self.inner.pending), key.clone());
        // destroy() may have cleared the table before this entry went in.
        if self.inner.destroyed.load(Ordering::SeqCst) {
            self.inner.pending.cancel(&key);
            return Err(Error::Destroyed);
        }

        // The timeout covers submission too.
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let queue = model::queue_key(topic);
        let tx = Transaction::new()
            .rpush(&queue, payload)
            .pexpire(&queue, timeout)
            .publish(model::request_channel(topic), Vec::new());

        let topic_label = KeyValue::new("topic", topic.to_string());
        let submitted = tokio::select! {
            submitted = self.inner.store.exec(tx) => submitted,
            _ = &mut deadline => {
                let state = self.inner.pending.cancel(&key);
                metrics::requests_submitted()
                    .add(1, &[topic_label, KeyValue::new("result", "timeout")]);
                debug!(topic, method, request_id = %key, "request timed out during submission");
                return match state {
                    Some(state) => Err(Error::Timeout { state }),
                    None => Err(Error::Destroyed),
                };
            }
        };
        if let Err(e) = submitted {
            self.inner.pending.cancel(&key);
            metrics::requests_submitted().add(1, &[topic_label, KeyValue::new("result", "error")]);
            warn!(topic, method, request_id = %key, error = %e, "request submission failed");
            return Err(Error::Submission(Box::new(e)));
        }
        metrics::requests_submitted().add(1, &[topic_label, KeyValue::new("result", "ok")]);
        debug!(topic, method, request_id = %key, "request submitted");

        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or(Err(Error::Destroyed)),
            _ = &mut deadline => match self.inner.pending.cancel(&key) {
                Some(state) => {
                    debug!(topic, method, request_id = %key, "request timed out");
                    Err(Error::Timeout { state })
                }
                // The response was dispatched between the timer firing and
                // the cancel; it owns the outcome.
                None => rx.await.unwrap_or(Err(Error::Destroyed)),
            },
        }
    }

    /// Start a worker for `topic` on this caller's store. The worker is
    /// destroyed together with the caller.
    pub async fn serve(&self, topic: &str, options: ServeOptions) -> Result<Worker> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        let worker = Worker::start(Arc::clone(&self.inner.store), topic, options).await?;
        self.inner.workers.lock().push(worker.clone());
        Ok(worker)
    }

    /// Unsubscribe, fail every pending request with [`Error::Destroyed`], and
    /// destroy every worker created through [`Caller::serve`]. The store
    /// itself is left open. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }

        let dropped = self.inner.pending.clear();
        if dropped > 0 {
            debug!(caller_id = %self.inner.id, dropped, "dropped pending requests");
        }

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            worker.destroy().await;
        }
        info!(caller_id = %self.inner.id, "caller destroyed");
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
