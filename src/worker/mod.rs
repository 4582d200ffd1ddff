//! Worker: serves one topic with a method table and a bounded scheduler.

pub mod handlers;
pub mod scheduler;

pub use handlers::{Handler, HandlerFuture, Handlers};
pub use scheduler::{Scheduler, SchedulerState};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model;
use crate::store::{Store, check_channel};

/// Receives store failures that end a scheduler cycle.
pub type ErrorReporter = Arc<dyn Fn(&Error) + Send + Sync>;

/// Options for [`Worker::start`] / [`crate::Caller::serve`].
#[derive(Clone)]
pub struct ServeOptions {
    pub concurrency: usize,
    pub handlers: Handlers,
    /// Store used only for the notification subscription. Never closed by
    /// the worker.
    pub subscriber: Option<Arc<dyn Store>>,
    pub on_error: Option<ErrorReporter>,
}

impl ServeOptions {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            concurrency: 1,
            handlers,
            subscriber: None,
            on_error: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn subscriber(mut self, store: Arc<dyn Store>) -> Self {
        self.subscriber = Some(store);
        self
    }

    pub fn on_error(mut self, reporter: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(reporter));
        self
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self::new(Handlers::default())
    }
}

/// Handle to a running worker. Cloning shares the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    scheduler: Arc<Scheduler>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Subscribe to `topic`'s request channel and start draining its queue.
    ///
    /// Returns once the subscription is live. One cycle runs immediately so
    /// tasks queued before the worker existed are picked up.
    pub async fn start(store: Arc<dyn Store>, topic: &str, options: ServeOptions) -> Result<Self> {
        if topic.is_empty() {
            return Err(Error::InvalidArgument("topic must not be empty".to_string()));
        }
        if options.concurrency == 0 {
            return Err(Error::InvalidArgument(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let channel = model::request_channel(topic);
        let subscriber = options.subscriber.unwrap_or_else(|| Arc::clone(&store));
        check_channel(store.as_ref(), &channel)?;
        check_channel(subscriber.as_ref(), &channel)?;
        let mut subscription = subscriber.subscribe(&channel).await?;

        let scheduler = Arc::new(Scheduler::new(
            store,
            topic,
            options.concurrency,
            options.handlers,
            options.on_error,
        ));

        let notified = Arc::clone(&scheduler);
        let listener = tokio::spawn(async move {
            while subscription.recv().await.is_some() {
                notified.notify();
            }
            warn!(channel = %subscription.channel(), "request subscription closed");
        });

        info!(topic, concurrency = options.concurrency, "worker started");
        scheduler.schedule(false);

        Ok(Self {
            inner: Arc::new(WorkerInner {
                scheduler,
                listener: Mutex::new(Some(listener)),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        self.inner.scheduler.topic()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.scheduler.active_max()
    }

    /// Current scheduler counters.
    pub fn state(&self) -> SchedulerState {
        self.inner.scheduler.snapshot()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.listener.lock().is_none()
    }

    /// Unsubscribe and stop starting new cycles. Tasks already running finish
    /// and publish their responses. Idempotent.
    pub async fn destroy(&self) {
        let listener = self.inner.listener.lock().take();
        let Some(listener) = listener else {
            return;
        };
        self.inner.scheduler.stop();
        listener.abort();
        // Dropping the listener task drops its subscription.
        let _ = listener.await;
        debug!(topic = %self.topic(), "worker destroyed");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("topic", &self.topic())
            .field("state", &self.state())
            .finish()
    }
}
