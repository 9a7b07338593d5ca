//! Worker loop and retry bookkeeping shared by both queues.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use meridian_core::ObjectKey;
use meridian_queue::WorkQueue;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{error_chain, Error, Result};
use crate::sink::{ErrorSink, GiveUp};

/// Processes one key taken from a queue.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, key: &ObjectKey) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 5 } }
}

/// Pull keys until the queue is shut down and drained.
pub async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    handler: Arc<dyn Handler>,
    policy: RetryPolicy,
    sink: Arc<dyn ErrorSink>,
) {
    debug!(queue = queue.name(), worker = id, "worker started");
    while process_next(&queue, handler.as_ref(), policy, sink.as_ref()).await {}
    debug!(queue = queue.name(), worker = id, "worker stopped");
}

/// Handle a single key. Returns false once the queue is closed.
pub async fn process_next(
    queue: &WorkQueue<ObjectKey>,
    handler: &dyn Handler,
    policy: RetryPolicy,
    sink: &dyn ErrorSink,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let res = match AssertUnwindSafe(handler.handle(&key)).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => Err(Error::Panicked(panic_message(panic.as_ref()))),
    };
    handle_result(queue, &key, res, policy, sink);
    // Always release the key, whatever the outcome.
    queue.done(&key);
    true
}

/// Forget on success, requeue with backoff on failure, give up once the budget is spent.
pub fn handle_result(
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    res: Result<()>,
    policy: RetryPolicy,
    sink: &dyn ErrorSink,
) {
    let err = match res {
        Ok(()) => {
            queue.forget(key);
            return;
        }
        Err(e) => e,
    };

    let requeues = queue.num_requeues(key);
    let message = error_chain(&err);
    if requeues < policy.max_retries {
        warn!(queue = queue.name(), key = %key, attempt = requeues + 1, error = %message, "error processing key, retrying");
        queue.add_rate_limited(key.clone());
        return;
    }

    queue.forget(key);
    counter!("controller_giveups_total", 1u64, "queue" => queue.name());
    info!(queue = queue.name(), key = %key, error = %message, "dropping key after failed retries");
    sink.report(GiveUp {
        queue: queue.name(),
        key: key.clone(),
        attempts: requeues + 1,
        error: message,
        at: Utc::now(),
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
