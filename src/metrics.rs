//! Reconciliation metrics.
//!
//! A [`MetricsSink`] is constructed once at process start and handed to the
//! [`crate::pipeline::Reconciler`]; nothing in the crate keeps metric state
//! in globals. Exporting is up to the host.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::object::ObjectKey;

pub trait MetricsSink: Send + Sync {
    /// One reconciliation finished, successfully or not.
    fn reconcile_finished(&self, object: &ObjectKey, ready: bool, duration: Duration);

    /// A new artifact was written to the store.
    fn artifact_published(&self, object: &ObjectKey);

    fn artifacts_collected(&self, object: &ObjectKey, count: usize);

    fn suspended(&self, object: &ObjectKey, suspended: bool);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn reconcile_finished(&self, _object: &ObjectKey, _ready: bool, _duration: Duration) {}
    fn artifact_published(&self, _object: &ObjectKey) {}
    fn artifacts_collected(&self, _object: &ObjectKey, _count: usize) {}
    fn suspended(&self, _object: &ObjectKey, _suspended: bool) {}
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub reconciles: u64,
    pub failures: u64,
    pub artifacts_published: u64,
    pub artifacts_collected: u64,
    /// Last readiness per object.
    pub ready: BTreeMap<String, bool>,
    pub suspended: BTreeMap<String, bool>,
    /// Duration of the last reconciliation per object, in milliseconds.
    pub last_duration_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with(|m| m.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn reconcile_finished(&self, object: &ObjectKey, ready: bool, duration: Duration) {
        self.with(|m| {
            m.reconciles += 1;
            if !ready {
                m.failures += 1;
            }
            m.ready.insert(object.to_string(), ready);
            m.last_duration_ms
                .insert(object.to_string(), duration.as_millis() as u64);
        });
    }

    fn artifact_published(&self, _object: &ObjectKey) {
        self.with(|m| m.artifacts_published += 1);
    }

    fn artifacts_collected(&self, _object: &ObjectKey, count: usize) {
        self.with(|m| m.artifacts_collected += count as u64);
    }

    fn suspended(&self, object: &ObjectKey, suspended: bool) {
        self.with(|m| {
            m.suspended.insert(object.to_string(), suspended);
        });
    }
}
