//! Dependency-ordered fan-out of source revision changes.
//!
//! When an upstream source produces a new revision, every object deploying
//! from it that has not yet attempted that revision must be requeued, and
//! prerequisites must be requeued before the objects depending on them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::object::{status, ObjectKey, Reconcilable, SourceKey};

/// Request to reconcile one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

impl From<&ObjectKey> for ReconcileRequest {
    fn from(key: &ObjectKey) -> Self {
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("dependency cycle between {}", members.join(", "))]
    Cycle { members: Vec<String> },
}

/// Requests for every candidate affected by `new_revision` of `changed`,
/// in dependency order.
///
/// A candidate is affected only when its source matches on kind as well as
/// namespace and name. Only edges between affected candidates are considered. Objects at the
/// same depth are ordered by `namespace/name`. A cycle fails the whole call.
pub fn affected_dependents<O: Reconcilable>(
    changed: &SourceKey,
    new_revision: &str,
    candidates: &[O],
) -> Result<Vec<ReconcileRequest>, FanoutError> {
    let graph: BTreeMap<ObjectKey, BTreeSet<ObjectKey>> = candidates
        .iter()
        .filter(|o| o.source_ref().source_key(&o.key().namespace) == *changed)
        .filter(|o| o.project_status().last_attempted_revision.as_deref() != Some(new_revision))
        .map(|o| (o.key(), o.depends_on().into_iter().collect()))
        .collect();

    let waves = dependency_waves(&graph)?;
    Ok(waves.iter().flatten().map(ReconcileRequest::from).collect())
}

/// Group objects into waves: every object's in-graph dependencies sit in an
/// earlier wave. Edges to objects outside the graph are ignored.
pub fn dependency_waves(
    graph: &BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,
) -> Result<Vec<Vec<ObjectKey>>, FanoutError> {
    let mut in_degree: BTreeMap<&ObjectKey, usize> = graph.keys().map(|k| (k, 0)).collect();
    let mut dependents: BTreeMap<&ObjectKey, Vec<&ObjectKey>> = BTreeMap::new();

    for (key, deps) in graph {
        for dep in deps.iter().filter(|d| graph.contains_key(*d)) {
            *in_degree.entry(key).or_default() += 1;
            dependents.entry(dep).or_default().push(key);
        }
    }

    let mut wave: Vec<&ObjectKey> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut waves = Vec::new();
    let mut placed = 0;

    while !wave.is_empty() {
        let mut next = BTreeSet::new();
        for key in &wave {
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        placed += wave.len();
        waves.push(wave.into_iter().cloned().collect());
        wave = next.into_iter().collect();
    }

    if placed != graph.len() {
        let members = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(key, _)| key.to_string())
            .collect();
        return Err(FanoutError::Cycle { members });
    }
    Ok(waves)
}

/// Dependencies of `object` that are missing from `all` or not ready.
pub fn unready_dependencies<O: Reconcilable>(object: &O, all: &[O]) -> Vec<ObjectKey> {
    object
        .depends_on()
        .into_iter()
        .filter(|dep| {
            !all.iter()
                .find(|o| o.key() == *dep)
                .is_some_and(|o| status::is_condition_true(o.conditions(), status::READY))
        })
        .collect()
}
