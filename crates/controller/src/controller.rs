use std::sync::Arc;

use meridian_core::{ObjectKey, Reconcilable};
use meridian_queue::WorkQueue;
use meridian_store::Cache;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::EventBridge;
use crate::config::ControllerConfig;
use crate::rebalance::RebalanceDriver;
use crate::reconcile::{Persistence, Reconcile, ReconcileDriver};
use crate::sink::{ErrorSink, TracingSink};
use crate::worker::{run_worker, Handler, RetryPolicy};

pub const PRIMARY_QUEUE: &str = "primary";
pub const TOPOLOGY_QUEUE: &str = "topology";

/// Two queues, two worker groups, one shutdown signal.
///
/// Primary keys go to [`ReconcileDriver`]; topology-site keys go to
/// [`RebalanceDriver`], which feeds roots back into the primary queue.
pub struct Controller<T> {
    config: ControllerConfig,
    primary: Arc<WorkQueue<ObjectKey>>,
    topology: Arc<WorkQueue<ObjectKey>>,
    reconcile: Arc<ReconcileDriver<T>>,
    rebalance: Arc<RebalanceDriver<T>>,
    sink: Arc<dyn ErrorSink>,
    shutdown: CancellationToken,
}

impl<T: Reconcilable> Controller<T> {
    /// `shutdown` stops the workers and is also the cancellation handed to every reconcile pass.
    pub fn new(
        config: ControllerConfig,
        cache: Arc<dyn Cache<T>>,
        reconciler: Arc<dyn Reconcile<T>>,
        persistence: Arc<dyn Persistence<T>>,
        shutdown: CancellationToken,
    ) -> Self {
        let primary: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::with_rate_limiter(PRIMARY_QUEUE, config.rate_limiter()));
        let topology: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::with_rate_limiter(TOPOLOGY_QUEUE, config.rate_limiter()));
        let reconcile = Arc::new(ReconcileDriver::new(Arc::clone(&cache), reconciler, persistence, shutdown.clone()));
        let rebalance = Arc::new(RebalanceDriver::new(
            cache,
            EventBridge::new(Arc::clone(&primary)),
            config.owned_by_label.clone(),
        ));
        Self { config, primary, topology, reconcile, rebalance, sink: Arc::new(TracingSink), shutdown }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Bridge for primary-resource notifications.
    pub fn primary_bridge(&self) -> EventBridge { EventBridge::new(Arc::clone(&self.primary)) }

    /// Bridge for topology-site notifications.
    pub fn topology_bridge(&self) -> EventBridge { EventBridge::new(Arc::clone(&self.topology)) }

    pub fn primary_queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.primary }

    pub fn topology_queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.topology }

    /// Run `workers` workers per queue until shutdown, then drain both queues
    /// and return once every worker has exited.
    pub async fn start(&self, workers: usize) {
        let workers = workers.max(1);
        let policy = RetryPolicy { max_retries: self.config.max_retries };
        let mut set = JoinSet::new();
        for id in 0..workers {
            let reconcile: Arc<dyn Handler> = self.reconcile.clone();
            set.spawn(run_worker(id, Arc::clone(&self.primary), reconcile, policy, Arc::clone(&self.sink)));
            let rebalance: Arc<dyn Handler> = self.rebalance.clone();
            set.spawn(run_worker(id, Arc::clone(&self.topology), rebalance, policy, Arc::clone(&self.sink)));
        }
        info!(workers, "starting workers");

        self.shutdown.cancelled().await;

        info!("stopping workers");
        self.primary.shut_down();
        self.topology.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("workers stopped");
    }
}
