//! Stage results and the merge rule across stages.

use std::time::Duration;

/// Outcome of one stage or of a whole reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    RequeueImmediate,
    RequeueAfter(Duration),
}

impl ReconcileResult {
    /// Combine two results: immediate requeue beats any delay, and the
    /// lowest non-zero delay beats success.
    pub fn merge(self, other: ReconcileResult) -> ReconcileResult {
        use ReconcileResult::*;
        match (self.normalize(), other.normalize()) {
            (RequeueImmediate, _) | (_, RequeueImmediate) => RequeueImmediate,
            (RequeueAfter(a), RequeueAfter(b)) => RequeueAfter(a.min(b)),
            (RequeueAfter(d), Success) | (Success, RequeueAfter(d)) => RequeueAfter(d),
            (Success, Success) => Success,
        }
    }

    /// A zero delay carries no requeue request.
    fn normalize(self) -> ReconcileResult {
        match self {
            ReconcileResult::RequeueAfter(d) if d.is_zero() => ReconcileResult::Success,
            other => other,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileResult::RequeueAfter(d) if !d.is_zero() => Some(*d),
            _ => None,
        }
    }
}

/// Merge lazily produced stage results.
///
/// Consumption stops at the first error or `RequeueImmediate`, so stages
/// after that point never run. Otherwise the lowest non-zero
/// `RequeueAfter` wins, falling back to `Success`.
pub fn fold_results<I, E>(results: I) -> Result<ReconcileResult, E>
where
    I: IntoIterator<Item = Result<ReconcileResult, E>>,
{
    let mut merged = ReconcileResult::Success;
    for result in results {
        match result? {
            ReconcileResult::RequeueImmediate => return Ok(ReconcileResult::RequeueImmediate),
            other => merged = merged.merge(other),
        }
    }
    Ok(merged)
}
