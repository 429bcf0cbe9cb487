//! Testing utilities for the scriptgate workspace
//!
//! Scripted generators, policy fixtures and throwaway pipelines.

#![allow(missing_docs)]

use async_trait::async_trait;
use scriptgate_audit::{AuditEvent, AuditEventKind, AuditFilter, AuditLog};
use scriptgate_core::{CodeGenerator, GateConfig, GenerationError, GenerationRequest, Pipeline};
use scriptgate_model::Fingerprint;
use scriptgate_policy::PolicyDocument;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Always replies with the same text and counts calls
#[derive(Debug)]
pub struct StaticGenerator {
    reply: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Hold every reply for `delay`, widening race windows
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for StaticGenerator {
    fn name(&self) -> String {
        "static".to_string()
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }
}

/// Always fails with a clone of the same error
#[derive(Debug)]
pub struct FailingGenerator {
    error: GenerationError,
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn transient() -> Self {
        Self::with(GenerationError::transient("failing", "upstream timed out"))
    }

    pub fn fatal() -> Self {
        Self::with(GenerationError::fatal("failing", "invalid credentials"))
    }

    pub fn with(error: GenerationError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for FailingGenerator {
    fn name(&self) -> String {
        "failing".to_string()
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Python snippet every built-in policy accepts
pub const BENIGN_PYTHON: &str = "total = sum(range(10))\nprint(total)\n";

/// Python snippet that calls `os.system`
pub const SHELL_PYTHON: &str = "import os\nos.system('ls /')\n";

/// Markdown-wrapped reply the way chat models answer
pub fn fenced(language: &str, code: &str) -> String {
    format!("Here is the script:\n\n```{language}\n{code}```\n\nIt prints the result.\n")
}

/// Custom policy deriving from `base`
pub fn derived_policy(name: &str, base: &str) -> PolicyDocument {
    PolicyDocument::named(name).with_base(base)
}

/// Write `doc` as `<dir>/<name>.yaml`
pub fn write_policy(dir: &Path, doc: &PolicyDocument) {
    let text = doc.to_yaml().expect("policy serializes");
    std::fs::write(dir.join(format!("{}.yaml", doc.name)), text).expect("policy written");
}

/// Pipeline over temp storage, an in-memory audit log and memory cache
#[derive(Debug)]
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub audit: Arc<AuditLog>,
    pub dir: TempDir,
}

impl TestPipeline {
    /// Events correlated with `fingerprint`
    pub fn events_for(&self, fingerprint: Fingerprint) -> Vec<AuditEvent> {
        self.audit
            .query(AuditFilter::all().correlation(fingerprint))
            .collect()
            .expect("audit readable")
    }

    /// Kinds of every event, in order
    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.audit
            .query(AuditFilter::all())
            .collect()
            .expect("audit readable")
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

pub fn test_config(dir: &Path) -> GateConfig {
    GateConfig::default()
        .with_data_dir(dir)
        .with_ephemeral_cache()
        .with_default_policy("moderate")
}

pub async fn test_pipeline(generator: Arc<dyn CodeGenerator>) -> TestPipeline {
    let dir = tempfile::tempdir().expect("temp dir");
    test_pipeline_with(generator, test_config(dir.path()), dir).await
}

pub async fn test_pipeline_with(generator: Arc<dyn CodeGenerator>, config: GateConfig, dir: TempDir) -> TestPipeline {
    let audit = Arc::new(AuditLog::in_memory());
    let pipeline = Pipeline::builder(config)
        .audit(Arc::clone(&audit))
        .generator(generator)
        .build()
        .await
        .expect("pipeline builds");
    TestPipeline { pipeline, audit, dir }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|path| std::env::split_paths(&path).any(|dir| dir.join(program).is_file()))
}

pub fn python_available() -> bool {
    on_path("python3")
}

pub fn node_available() -> bool {
    on_path("node")
}
