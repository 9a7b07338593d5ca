//! Where keys go when the retry budget runs out.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meridian_core::ObjectKey;
use tracing::error;

/// A key abandoned after exhausting its retries.
#[derive(Debug, Clone)]
pub struct GiveUp {
    pub queue: &'static str,
    pub key: ObjectKey,
    /// Handler invocations, including the first one.
    pub attempts: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Process-wide failure reporting. Reports are non-fatal.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: GiveUp);
}

/// Logs give-ups at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, f: GiveUp) {
        error!(queue = f.queue, key = %f.key, attempts = f.attempts, at = %f.at.to_rfc3339(), error = %f.error, "giving up on key");
    }
}

/// Keeps every report in memory; handy for hosts that surface failures elsewhere.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<GiveUp>>,
}

impl CollectingSink {
    pub fn new() -> Self { Self::default() }

    pub fn reports(&self) -> Vec<GiveUp> {
        self.reports.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, failure: GiveUp) {
        self.reports.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(failure);
    }
}
