//! Meridian controller: the dual-queue reconciliation core.
//!
//! Cache notifications flow through an [`EventBridge`] into one of two
//! [`WorkQueue`](meridian_queue::WorkQueue)s. Workers hand primary keys to the
//! [`ReconcileDriver`] and topology-site keys to the [`RebalanceDriver`], which
//! re-enqueues every root resource so it is reconciled against the new topology.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod rebalance;
pub mod reconcile;
pub mod sink;
pub mod worker;

pub use bridge::EventBridge;
pub use config::ControllerConfig;
pub use controller::{Controller, PRIMARY_QUEUE, TOPOLOGY_QUEUE};
pub use error::{Error, Result};
pub use rebalance::RebalanceDriver;
pub use reconcile::{Change, Persistence, Reconcile, ReconcileDriver};
pub use sink::{CollectingSink, ErrorSink, GiveUp, TracingSink};
pub use worker::{Handler, RetryPolicy};

pub use tokio_util::sync::CancellationToken;
