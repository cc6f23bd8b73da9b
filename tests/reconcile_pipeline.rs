//! Integration tests for single-object reconciliation.
//!
//! Drives the full stage list (storage, archive, publish, deploy) against a
//! real artifact store in a temp dir, a local source directory and the fake
//! engine.

mod common;

use std::fs;
use std::time::Duration;

use chrono::Utc;
use common::{default_settings, deployment, Harness};
use driftgate::engine::{CommandResult, ObjectRef, ResourceIssue};
use driftgate::events::EventType;
use driftgate::mock::{EngineOp, FailureConfig};
use driftgate::object::status::{find_condition, ARTIFACT_IN_STORAGE, READY, RECONCILING, STALLED};
use driftgate::object::{ConditionStatus, TimingSpec, FINALIZER};
use driftgate::pipeline::reason;
use driftgate::{Context, Reconcilable, ReconcileResult};

fn condition_reason(d: &driftgate::Deployment, type_: &str) -> Option<(ConditionStatus, String)> {
    find_condition(&d.status.conditions, type_).map(|c| (c.status, c.reason.clone()))
}

fn web_ref() -> ObjectRef {
    ObjectRef {
        group: "apps".to_string(),
        kind: "Deployment".to_string(),
        namespace: Some("apps".to_string()),
        name: "web".to_string(),
    }
}

// === Happy path ===

#[test]
fn test_first_reconcile_stores_artifact_and_becomes_ready() {
    let h = Harness::new();
    h.write_source("platform", "manifests/web.yaml", "replicas: 2\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");

    let result = reconciler.reconcile(&Context::background(), &mut web).unwrap();

    assert_eq!(result, ReconcileResult::RequeueAfter(web.interval()));
    assert!(web.status.is_ready());
    assert_eq!(
        condition_reason(&web, ARTIFACT_IN_STORAGE),
        Some((ConditionStatus::True, reason::ARTIFACT_STORED.to_string()))
    );
    assert!(find_condition(&web.status.conditions, RECONCILING).is_none());
    assert!(web.metadata.finalizers.contains(&FINALIZER.to_string()));
    assert_eq!(web.status.observed_generation, web.metadata.generation);

    let artifact = web.status.artifact.clone().unwrap();
    assert!(h.storage.exists(&artifact));
    assert!(artifact.url.starts_with("http://artifacts.test/"));
    assert!(artifact.checksum.is_some());
    assert_eq!(Some(artifact.revision.clone()), web.status.archive_revision());
    assert!(web
        .status
        .last_attempted_revision
        .as_deref()
        .unwrap()
        .starts_with("local/"));

    let ops: Vec<EngineOp> = h.engine.calls().iter().map(|c| c.op).collect();
    assert_eq!(ops, vec![EngineOp::Archive, EngineOp::Deploy, EngineOp::Validate]);

    let deploy = web.status.last_deploy_result.as_ref().unwrap();
    assert_eq!(deploy.revision, artifact.revision);
    assert!(deploy.succeeded());

    let succeeded = h.events.with_reason(reason::SUCCEEDED);
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].revision.as_deref(), Some(artifact.revision.as_str()));

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.artifacts_published, 1);
    assert_eq!(metrics.reconciles, 1);
    assert_eq!(metrics.ready.get("apps/web"), Some(&true));
}

#[test]
fn test_stored_artifact_unpacks_to_materialized_tree() {
    let h = Harness::new();
    h.write_source("platform", "manifests/web.yaml", "replicas: 2\n");
    h.engine.set_file("rendered/extra.yaml", "kind: ConfigMap\n");
    let mut web = deployment("web", "platform");

    h.reconciler().reconcile(&Context::background(), &mut web).unwrap();

    let out = tempfile::TempDir::new().unwrap();
    h.storage
        .unpack(web.status.artifact.as_ref().unwrap(), out.path())
        .unwrap();
    assert_eq!(
        fs::read_to_string(out.path().join("manifests/web.yaml")).unwrap(),
        "replicas: 2\n"
    );
    assert_eq!(
        fs::read_to_string(out.path().join("rendered/extra.yaml")).unwrap(),
        "kind: ConfigMap\n"
    );
}

#[test]
fn test_unchanged_source_is_idempotent() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    let first = web.status.artifact.clone().unwrap();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    let second = web.status.artifact.clone().unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(first.checksum, second.checksum);
    assert_eq!(h.metrics.snapshot().artifacts_published, 1);
    assert_eq!(h.events.with_reason(reason::SUCCEEDED).len(), 1);
    assert_eq!(h.engine.call_count(EngineOp::Deploy), 1);
    assert!(web.status.is_ready());
}

#[test]
fn test_changed_source_publishes_and_notifies() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    let first = web.status.artifact.clone().unwrap();
    let first_path = h.storage.local_path(&first);

    h.write_source("platform", "app.yaml", "a: 2\n");
    reconciler.reconcile(&ctx, &mut web).unwrap();
    let second = web.status.artifact.clone().unwrap();

    assert_ne!(first.revision, second.revision);
    assert_ne!(first.checksum, second.checksum);
    assert_eq!(h.engine.call_count(EngineOp::Deploy), 2);

    let succeeded = h.events.with_reason(reason::SUCCEEDED);
    assert_eq!(succeeded.len(), 2);
    assert_eq!(succeeded[1].revision.as_deref(), Some(second.revision.as_str()));

    // Zero grace: the superseded artifact is collected right away.
    assert!(!first_path.exists());
    assert!(h.storage.exists(&second));
    assert_eq!(h.metrics.snapshot().artifacts_collected, 1);
    assert_eq!(h.events.with_reason(reason::GC_SUCCEEDED).len(), 1);
}

#[test]
fn test_generation_change_redeploys_same_revision() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    web.metadata.generation += 1;
    reconciler.reconcile(&ctx, &mut web).unwrap();

    assert_eq!(h.engine.call_count(EngineOp::Deploy), 2);
    assert_eq!(h.metrics.snapshot().artifacts_published, 1);
    assert_eq!(web.status.observed_generation, 2);
}

#[test]
fn test_missing_artifact_is_republished() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    let path = h.artifact_on_disk(&web).unwrap();
    fs::remove_file(&path).unwrap();

    reconciler.reconcile(&ctx, &mut web).unwrap();

    assert!(path.exists());
    assert!(web.status.is_ready());
    assert_eq!(
        condition_reason(&web, ARTIFACT_IN_STORAGE).map(|(s, _)| s),
        Some(ConditionStatus::True)
    );
    assert_eq!(h.metrics.snapshot().artifacts_published, 2);
}

#[test]
fn test_suspended_object_is_skipped() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let mut web = deployment("web", "platform");
    web.spec.suspend = true;

    let result = h.reconciler().reconcile(&Context::background(), &mut web).unwrap();

    assert_eq!(result, ReconcileResult::Success);
    assert!(h.engine.calls().is_empty());
    assert!(web.status.artifact.is_none());
    assert_eq!(h.metrics.snapshot().suspended.get("apps/web"), Some(&true));
}

// === Windows ===

#[test]
fn test_outside_deploy_window_defers_deploy() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let mut web = deployment("web", "platform");
    web.spec.timing = Some(TimingSpec {
        deploy: Some("never".to_string()),
        prune: None,
    });

    let result = h.reconciler().reconcile(&Context::background(), &mut web).unwrap();

    assert_eq!(result, ReconcileResult::RequeueAfter(Duration::from_secs(60)));
    assert_eq!(
        condition_reason(&web, READY),
        Some((ConditionStatus::Unknown, reason::OUTSIDE_WINDOW.to_string()))
    );
    assert_eq!(h.engine.call_count(EngineOp::Deploy), 0);
    assert!(web.status.last_deploy_result.is_none());
    // The artifact is still published.
    assert!(web.status.artifact.is_some());
}

#[test]
fn test_prune_window_gates_prune_only() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let mut web = deployment("web", "platform");
    web.spec.prune = true;
    web.spec.timing = Some(TimingSpec {
        deploy: Some("always".to_string()),
        prune: Some("never".to_string()),
    });

    h.reconciler().reconcile(&Context::background(), &mut web).unwrap();

    assert!(web.status.is_ready());
    assert_eq!(h.engine.call_count(EngineOp::Deploy), 1);
    assert_eq!(h.engine.call_count(EngineOp::Prune), 0);
    assert!(web.status.last_prune_result.is_none());
}

#[test]
fn test_invalid_window_is_terminal() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let mut web = deployment("web", "platform");
    web.spec.timing = Some(TimingSpec {
        deploy: Some("Mon-Fry 09:00-17:00 UTC".to_string()),
        prune: None,
    });

    let err = h
        .reconciler()
        .reconcile(&Context::background(), &mut web)
        .unwrap_err();

    assert!(err.is_terminal());
    assert_eq!(err.reason(), reason::INVALID_SPEC);
    assert_eq!(err.retry_after, None);
    assert_eq!(
        condition_reason(&web, STALLED),
        Some((ConditionStatus::True, reason::INVALID_SPEC.to_string()))
    );
    assert!(h.engine.calls().is_empty());
}

// === Failures ===

#[test]
fn test_source_not_available_waits() {
    let h = Harness::new();
    let mut web = deployment("web", "not-yet-there");

    let result = h.reconciler().reconcile(&Context::background(), &mut web).unwrap();

    assert_eq!(result, ReconcileResult::RequeueAfter(web.retry_interval()));
    assert_eq!(
        condition_reason(&web, READY),
        Some((ConditionStatus::Unknown, reason::SOURCE_NOT_READY.to_string()))
    );
    assert_eq!(
        condition_reason(&web, RECONCILING),
        Some((ConditionStatus::True, reason::SOURCE_NOT_READY.to_string()))
    );
    assert!(h.engine.calls().is_empty());
    assert!(h.events.warnings().is_empty());
}

#[test]
fn test_archive_failure_is_retried() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.engine.inject_error(EngineOp::Archive, "chart repository unreachable");
    let mut web = deployment("web", "platform");

    let err = h
        .reconciler()
        .reconcile(&Context::background(), &mut web)
        .unwrap_err();

    assert_eq!(err.stage, "archive");
    assert_eq!(err.reason(), reason::ARCHIVE_FAILED);
    assert!(!err.is_terminal());
    assert_eq!(err.retry_after, Some(web.retry_interval()));
    assert_eq!(
        condition_reason(&web, READY),
        Some((ConditionStatus::False, reason::ARCHIVE_FAILED.to_string()))
    );
    assert!(find_condition(&web.status.conditions, STALLED).is_none());
    assert!(web.status.last_failure_at.is_some());

    let warnings = h.events.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("chart repository unreachable"));
}

#[test]
fn test_partial_deploy_failure_keeps_detail_then_recovers() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.engine.set_result(
        EngineOp::Deploy,
        CommandResult {
            changed_objects: vec![web_ref()],
            errors: vec![ResourceIssue {
                reference: web_ref(),
                message: "admission webhook denied the request".to_string(),
            }],
            ..Default::default()
        },
    );
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    let err = reconciler.reconcile(&ctx, &mut web).unwrap_err();
    assert_eq!(err.reason(), reason::DEPLOY_FAILED);
    let ready = find_condition(&web.status.conditions, READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert!(ready.message.contains("admission webhook denied"));
    assert!(ready.message.contains("1 changed"));

    let deploy = web.status.last_deploy_result.clone().unwrap();
    assert!(!deploy.succeeded());
    assert_eq!(deploy.result.unwrap().changed_objects, vec![web_ref()]);
    assert!(h.events.with_reason(reason::SUCCEEDED).is_empty());

    h.engine.set_result(EngineOp::Deploy, CommandResult::default());
    reconciler.reconcile(&ctx, &mut web).unwrap();

    assert!(web.status.is_ready());
    assert_eq!(h.engine.call_count(EngineOp::Deploy), 2);
    // Recovery notifies even though the artifact did not change.
    let succeeded = h.events.with_reason(reason::SUCCEEDED);
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].event_type, EventType::Normal);
}

#[test]
fn test_validate_failure_fails_reconcile() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.engine.inject_error(EngineOp::Validate, "deployment web not ready");
    let mut web = deployment("web", "platform");

    let err = h
        .reconciler()
        .reconcile(&Context::background(), &mut web)
        .unwrap_err();

    assert_eq!(err.reason(), reason::VALIDATE_FAILED);
    let validate = web.status.last_validate_result.as_ref().unwrap();
    assert!(validate.result.is_none());
    assert!(validate
        .error
        .as_deref()
        .unwrap()
        .contains("deployment web not ready"));
}

#[test]
fn test_cancelled_context_stops_before_any_stage() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let mut web = deployment("web", "platform");
    let ctx = Context::background();
    ctx.cancel();

    let err = h.reconciler().reconcile(&ctx, &mut web).unwrap_err();

    assert_eq!(err.stage, "storage");
    assert_eq!(err.reason(), reason::CANCELLED);
    assert!(!err.is_terminal());
    assert!(h.engine.calls().is_empty());
}

#[test]
fn test_object_timeout_aborts_slow_engine() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.engine
        .inject_failure(EngineOp::Deploy, FailureConfig::delay(Duration::from_secs(10)));
    let mut web = deployment("web", "platform");
    web.spec.timeout_seconds = Some(1);

    let err = h
        .reconciler()
        .reconcile(&Context::background(), &mut web)
        .unwrap_err();

    assert_eq!(err.reason(), reason::CANCELLED);
    assert!(web.status.last_deploy_result.is_none());
}

#[test]
fn test_zero_object_timeout_disables_deadline() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.engine
        .inject_failure(EngineOp::Deploy, FailureConfig::delay(Duration::from_millis(200)));
    let mut settings = default_settings();
    settings.default_timeout = Some(Duration::from_millis(50));
    let reconciler = h.reconciler_with(settings);
    let mut web = deployment("web", "platform");
    web.spec.timeout_seconds = Some(0);

    for _ in 0..2 {
        let result = reconciler
            .reconcile(&Context::background(), &mut web)
            .unwrap();
        assert_eq!(result, ReconcileResult::RequeueAfter(web.interval()));
        assert!(web.status.is_ready());
    }
}

// === Deletion ===

#[test]
fn test_deletion_removes_artifacts_and_finalizer() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    web.spec.delete_on_removal = true;
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    let path = h.artifact_on_disk(&web).unwrap();
    let owner_dir = path.parent().unwrap().to_path_buf();

    web.metadata.deletion_timestamp = Some(Utc::now());
    let result = reconciler.reconcile(&ctx, &mut web).unwrap();

    assert_eq!(result, ReconcileResult::Success);
    assert!(!owner_dir.exists());
    assert!(web.status.artifact.is_none());
    assert!(web.metadata.finalizers.is_empty());

    let delete = h
        .engine
        .calls()
        .into_iter()
        .find(|c| c.op == EngineOp::Delete)
        .unwrap();
    // The engine works on the unpacked artifact, not the live source.
    assert!(!delete.project_dir.starts_with(h.sources_dir()));

    // Without the finalizer there is nothing left to do.
    reconciler.reconcile(&ctx, &mut web).unwrap();
    assert_eq!(h.engine.call_count(EngineOp::Delete), 1);
}

#[test]
fn test_deletion_without_engine_delete() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    web.metadata.deletion_timestamp = Some(Utc::now());
    reconciler.reconcile(&ctx, &mut web).unwrap();

    assert_eq!(h.engine.call_count(EngineOp::Delete), 0);
    assert!(web.metadata.finalizers.is_empty());
    assert!(h.artifact_on_disk(&web).is_none());
}

#[test]
fn test_failed_engine_delete_keeps_finalizer() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    let reconciler = h.reconciler();
    let mut web = deployment("web", "platform");
    web.spec.delete_on_removal = true;
    let ctx = Context::background();

    reconciler.reconcile(&ctx, &mut web).unwrap();
    h.engine.inject_error(EngineOp::Delete, "cluster unreachable");
    web.metadata.deletion_timestamp = Some(Utc::now());

    let err = reconciler.reconcile(&ctx, &mut web).unwrap_err();

    assert_eq!(err.reason(), reason::DELETE_FAILED);
    assert!(web.has_finalizer(FINALIZER));
    assert!(h.storage.exists(web.status.artifact.as_ref().unwrap()));
}

#[test]
fn test_custom_settings_apply_global_ignore() {
    let h = Harness::new();
    h.write_source("platform", "app.yaml", "a: 1\n");
    h.write_source("platform", "README.md", "docs\n");
    let mut settings = default_settings();
    settings.ignore = vec!["*.md".to_string()];
    let mut web = deployment("web", "platform");

    h.reconciler_with(settings)
        .reconcile(&Context::background(), &mut web)
        .unwrap();

    let out = tempfile::TempDir::new().unwrap();
    h.storage
        .unpack(web.status.artifact.as_ref().unwrap(), out.path())
        .unwrap();
    assert!(out.path().join("app.yaml").exists());
    assert!(!out.path().join("README.md").exists());
}
