//! Shared harness for pipeline and controller tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use driftgate::events::EventRecorder;
use driftgate::metrics::InMemoryMetrics;
use driftgate::mock::{FakeEngine, MemoryRecorder};
use driftgate::object::{DependencyRef, SourceRef};
use driftgate::pipeline::PipelineSettings;
use driftgate::source::{LocalSource, StaticCredentials};
use driftgate::{Deployment, DeploymentSpec, Reconciler, Services};
use driftgate_store::Storage;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub engine: FakeEngine,
    pub events: Arc<MemoryRecorder>,
    pub metrics: Arc<InMemoryMetrics>,
    pub storage: Storage,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sources")).unwrap();
        let storage = Storage::new(dir.path().join("artifacts"), "artifacts.test").unwrap();
        Self {
            dir,
            engine: FakeEngine::new(),
            events: Arc::new(MemoryRecorder::new()),
            metrics: Arc::new(InMemoryMetrics::new()),
            storage,
        }
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.dir.path().join("sources")
    }

    /// Write a file into the named source directory.
    pub fn write_source(&self, source: &str, path: &str, contents: &str) {
        let dest = self.sources_dir().join(source).join(path);
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(dest, contents).unwrap();
    }

    pub fn services(&self, settings: PipelineSettings) -> Services {
        let events: Arc<dyn EventRecorder> = self.events.clone();
        Services {
            storage: self.storage.clone(),
            engine: Arc::new(self.engine.clone()),
            sources: Arc::new(LocalSource::with_base_dir(self.sources_dir())),
            credentials: Arc::new(StaticCredentials::new()),
            events,
            metrics: self.metrics.clone(),
            settings,
        }
    }

    pub fn reconciler(&self) -> Reconciler<Deployment> {
        self.reconciler_with(default_settings())
    }

    pub fn reconciler_with(&self, settings: PipelineSettings) -> Reconciler<Deployment> {
        Reconciler::new(self.services(settings))
    }

    pub fn artifact_on_disk(&self, deployment: &Deployment) -> Option<PathBuf> {
        let artifact = deployment.status.artifact.as_ref()?;
        Some(self.storage.local_path(artifact))
    }
}

pub fn default_settings() -> PipelineSettings {
    PipelineSettings {
        gc_grace: Duration::ZERO,
        window_recheck: Duration::from_secs(60),
        default_timeout: Some(Duration::from_secs(30)),
        ignore: Vec::new(),
    }
}

pub fn deployment(name: &str, source: &str) -> Deployment {
    let spec = DeploymentSpec::new(SourceRef {
        kind: "GitRepository".to_string(),
        name: source.to_string(),
        namespace: None,
        path: Some(source.to_string()),
    });
    Deployment::new("apps", name, spec)
}

pub fn depending_on(mut deployment: Deployment, deps: &[&str]) -> Deployment {
    deployment.spec.depends_on = deps
        .iter()
        .map(|d| DependencyRef {
            name: d.to_string(),
            namespace: None,
        })
        .collect();
    deployment
}
