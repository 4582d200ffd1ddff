//! Bounded-concurrency drain loop for one topic.
//!
//! Each cycle pops at most one task. A cycle that popped something, or that
//! finishes while a notification is waiting, re-arms the loop as a fresh
//! tokio task. Notifications that arrive while all `active_max` slots are
//! busy collapse into a single `pending_wakeup` flag, which the next
//! finishing cycle picks up, so no wakeup is lost and no more than
//! `active_max` cycles ever run at once.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{Instrument, debug, error, warn};

use super::ErrorReporter;
use super::handlers::Handlers;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::Result;
use crate::model::{self, Status};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_task_status, start_task_span};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    /// Cycles currently between their slot check and their decrement.
    pub active: usize,
    /// A notification arrived while every slot was busy.
    pub pending_wakeup: bool,
    /// Set by [`Scheduler::stop`]; no new cycle starts afterwards.
    pub stopped: bool,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    topic: String,
    queue_key: String,
    handlers: Handlers,
    active_max: usize,
    state: Mutex<SchedulerState>,
    reporter: Option<ErrorReporter>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        topic: &str,
        active_max: usize,
        handlers: Handlers,
        reporter: Option<ErrorReporter>,
    ) -> Self {
        Self {
            store,
            topic: topic.to_string(),
            queue_key: model::queue_key(topic),
            handlers,
            active_max: active_max.max(1),
            state: Mutex::new(SchedulerState::default()),
            reporter,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn active_max(&self) -> usize {
        self.active_max
    }

    pub fn snapshot(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// A publish arrived on the topic's request channel.
    pub fn notify(self: &Arc<Self>) {
        self.schedule(true);
    }

    /// Start a cycle on a fresh task.
    pub fn schedule(self: &Arc<Self>, by_notification: bool) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.try_run(by_notification).await });
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    async fn try_run(self: Arc<Self>, by_notification: bool) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if state.active >= self.active_max {
                if by_notification {
                    state.pending_wakeup = true;
                    metrics::scheduler_bounces()
                        .add(1, &[KeyValue::new("topic", self.topic.clone())]);
                }
                return;
            }
            state.active += 1;
            if by_notification {
                state.pending_wakeup = false;
            }
        }

        let cycle = self.run_cycle().await;

        // Decrement and read the flag under one lock so a notification that
        // bounced during this cycle is always seen here or by its own cycle.
        let rearm = {
            let mut state = self.state.lock();
            state.active -= 1;
            match cycle {
                Ok(has_task) if !state.stopped && (has_task || state.pending_wakeup) => {
                    Some(state.pending_wakeup)
                }
                _ => None,
            }
        };

        if let Err(e) = cycle {
            error!(topic = %self.topic, error = %e, "scheduler cycle failed");
            if let Some(report) = &self.reporter {
                report(&e);
            }
        }

        if let Some(by_notification) = rearm {
            self.schedule(by_notification);
        }
    }

    /// Pop and handle at most one task. Returns whether anything was popped.
    async fn run_cycle(&self) -> Result<bool> {
        let Some(payload) = self.store.lpop(&self.queue_key).await? else {
            debug!(topic = %self.topic, "queue empty");
            return Ok(false);
        };

        let request = match RequestEnvelope::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "dropping malformed request");
                return Ok(true);
            }
        };

        if model::now_ms() >= request.expires_at {
            debug!(
                topic = %self.topic,
                method = %request.method,
                request_id = %request.request_id,
                "task expired before pickup"
            );
            metrics::tasks_expired().add(1, &[KeyValue::new("topic", self.topic.clone())]);
            return Ok(true);
        }

        let span = start_task_span(&self.topic, &request.method, &request.request_id);
        let channel = model::response_channel(&request.caller_id);
        let response = self.execute(request).instrument(span).await;
        let bytes = response.encode()?;
        self.store.publish(&channel, &bytes).await?;
        Ok(true)
    }

    async fn execute(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let started = Instant::now();
        let RequestEnvelope {
            request_id,
            method,
            args,
            ..
        } = request;

        let response = match self.handlers.resolve(&method) {
            None => {
                warn!(topic = %self.topic, %method, "no handler for method");
                ResponseEnvelope::unknown_method(request_id)
            }
            // Invoke the handler inside its own task so a panic, even one
            // raised before the first await, is contained like an error.
            Some(handler) => {
                let name = method.clone();
                let task = tokio::spawn(async move { handler.call(&name, args).await });
                match task.await {
                    Ok(Ok(value)) => ResponseEnvelope::success(request_id, value),
                    Ok(Err(e)) => {
                        warn!(topic = %self.topic, %method, error = %e, "handler failed");
                        ResponseEnvelope::rejected(request_id)
                    }
                    Err(e) => {
                        error!(topic = %self.topic, %method, error = %e, "handler panicked");
                        ResponseEnvelope::rejected(request_id)
                    }
                }
            }
        };

        let status = response.status().unwrap_or(Status::Rejected);
        record_task_status(
            &tracing::Span::current(),
            status,
            started.elapsed().as_millis() as u64,
        );
        metrics::tasks_executed().add(
            1,
            &[
                KeyValue::new("topic", self.topic.clone()),
                KeyValue::new("status", status.as_str()),
            ],
        );
        response
    }
}
