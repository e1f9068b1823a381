//! Worker loop for one scope: pull, decide, dispatch, account.

use std::sync::Arc;

use chrono::Utc;
use kew_core::QueueItem;
use kew_kubehub::ObjectCache;
use kew_queue::WorkQueue;
use kew_sinks::Dispatcher;
use metrics::counter;
use tracing::{debug, error, warn};

use crate::{Decision, DecisionEngine, ProcessError, Renderer};

/// Requeues allowed before an item is dropped.
pub const MAX_RETRIES: usize = 5;

pub struct Controller {
    scope: String,
    queue: WorkQueue<QueueItem>,
    cache: Arc<dyn ObjectCache>,
    engine: DecisionEngine,
    renderer: Arc<Renderer>,
    dispatcher: Dispatcher,
    max_retries: usize,
}

impl Controller {
    pub fn new(
        scope: impl Into<String>,
        queue: WorkQueue<QueueItem>,
        cache: Arc<dyn ObjectCache>,
        engine: DecisionEngine,
        renderer: Arc<Renderer>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self { scope: scope.into(), queue, cache, engine, renderer, dispatcher, max_retries: MAX_RETRIES }
    }

    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.max_retries = n;
        self
    }

    pub fn scope(&self) -> &str { &self.scope }

    pub fn queue(&self) -> &WorkQueue<QueueItem> { &self.queue }

    /// Run until the queue shuts down.
    pub async fn run_worker(&self) {
        while self.process_next_item().await {}
        debug!(scope = %self.scope, "worker exiting");
    }

    /// Handle one item. Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(item) = self.queue.get().await else { return false };
        let res = self.process_item(&item).await;
        self.handle_err(res, &item);
        self.queue.done(&item);
        true
    }

    pub async fn process_item(&self, item: &QueueItem) -> Result<(), ProcessError> {
        let now = Utc::now();
        match self.engine.decide(item, self.cache.as_ref(), now)? {
            Decision::Suppress(why) => {
                debug!(scope = %self.scope, key = %item.key, change = %item.change, reason = why.as_str(), "suppressed");
                counter!("kew_suppressed_total", 1u64, "scope" => self.scope.clone(), "reason" => why.as_str());
                Ok(())
            }
            Decision::Deliver { action, event } => {
                debug!(scope = %self.scope, key = %item.key, change = %item.change, "send notify");
                let payload = self.renderer.payload(&item.key, action, event, now);
                self.dispatcher.dispatch(&payload).await?;
                counter!("kew_delivered_total", 1u64, "scope" => self.scope.clone(), "action" => action.as_str());
                Ok(())
            }
        }
    }

    fn handle_err(&self, res: Result<(), ProcessError>, item: &QueueItem) {
        let Err(e) = res else {
            self.queue.forget(item);
            return;
        };
        if self.queue.num_requeues(item) < self.max_retries {
            warn!(scope = %self.scope, item = %item, error = %e, "error syncing event; requeueing");
            self.queue.add_rate_limited(item.clone());
            return;
        }
        self.queue.forget(item);
        counter!("kew_queue_drops_total", 1u64, "queue" => self.scope.clone());
        error!(scope = %self.scope, item = %item, error = %e, "dropping event out of the queue");
    }
}
