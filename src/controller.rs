//! Batch reconciliation of many objects.
//!
//! Objects are processed in dependency waves. Within a wave, distinct
//! objects run on a bounded pool of scoped worker threads; an object whose
//! dependencies are missing or not ready is left waiting instead of being
//! reconciled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, info};

use crate::cancel::Context;
use crate::fanout::{dependency_waves, unready_dependencies, FanoutError};
use crate::object::status::{self, ConditionStatus, READY};
use crate::object::{ObjectKey, Reconcilable};
use crate::pipeline::{reason, PipelineError, ReconcileResult, Reconciler};

/// What happened to one object in a batch.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub key: ObjectKey,
    pub result: Result<ReconcileResult, PipelineError>,
}

impl ReconcileOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Controller<O: Reconcilable> {
    reconciler: Reconciler<O>,
    max_concurrent: usize,
}

impl<O: Reconcilable> Controller<O> {
    pub fn new(reconciler: Reconciler<O>, max_concurrent: usize) -> Self {
        Self {
            reconciler,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn reconciler(&self) -> &Reconciler<O> {
        &self.reconciler
    }

    /// Reconcile every object once, prerequisites first.
    ///
    /// Outcomes are returned in processing order. A dependency cycle fails
    /// the batch before any object is touched.
    pub fn reconcile_all(
        &self,
        ctx: &Context,
        objects: &mut [O],
    ) -> Result<Vec<ReconcileOutcome>, FanoutError> {
        let graph: BTreeMap<ObjectKey, BTreeSet<ObjectKey>> = objects
            .iter()
            .map(|o| (o.key(), o.depends_on().into_iter().collect()))
            .collect();
        let waves = dependency_waves(&graph)?;
        info!(objects = objects.len(), waves = waves.len(), "reconciling batch");

        let mut outcomes = Vec::with_capacity(objects.len());
        for wave in waves {
            let members: BTreeSet<ObjectKey> = wave.into_iter().collect();

            let all: &[O] = objects;
            let waiting: BTreeMap<ObjectKey, Vec<ObjectKey>> = all
                .iter()
                .filter(|o| members.contains(&o.key()) && !o.is_deleting())
                .map(|o| (o.key(), unready_dependencies(o, all)))
                .filter(|(_, deps)| !deps.is_empty())
                .collect();

            let mut work = Vec::new();
            for object in objects.iter_mut().filter(|o| members.contains(&o.key())) {
                match waiting.get(&object.key()) {
                    Some(deps) => outcomes.push(hold(object, deps)),
                    None => work.push(object),
                }
            }
            outcomes.extend(self.run_pool(ctx, work));
        }
        Ok(outcomes)
    }

    fn run_pool(&self, ctx: &Context, work: Vec<&mut O>) -> Vec<ReconcileOutcome> {
        let workers = self.max_concurrent.min(work.len());
        let queue = Mutex::new(work.into_iter().enumerate());
        let done = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                    let Some((index, object)) = next else {
                        break;
                    };
                    let key = object.key();
                    let result = self.reconciler.reconcile(ctx, object);
                    debug!(object = %key, ok = result.is_ok(), "object finished");
                    done.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((index, ReconcileOutcome { key, result }));
                });
            }
        });

        let mut done = done.into_inner().unwrap_or_else(PoisonError::into_inner);
        done.sort_by_key(|(index, _)| *index);
        done.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Mark an object as waiting on its dependencies.
fn hold<O: Reconcilable>(object: &mut O, deps: &[ObjectKey]) -> ReconcileOutcome {
    let key = object.key();
    let names: Vec<String> = deps.iter().map(ObjectKey::to_string).collect();
    let message = format!("dependencies not ready: {}", names.join(", "));
    info!(object = %key, %message, "waiting for dependencies");

    let generation = object.generation();
    status::set_condition(
        object.conditions_mut(),
        READY,
        ConditionStatus::Unknown,
        reason::DEPENDENCY_NOT_READY,
        &message,
        generation,
    );
    ReconcileOutcome {
        key,
        result: Ok(ReconcileResult::RequeueAfter(object.retry_interval())),
    }
}
