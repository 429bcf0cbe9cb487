//! End-to-end pipeline tests over scripted generators

use pretty_assertions::assert_eq;
use scriptgate_audit::AuditEventKind;
use scriptgate_cache::Origin;
use scriptgate_core::{ClearTarget, GenerateRequest, ListFilter, PipelineError, PipelineOutcome};
use scriptgate_model::{Language, Severity, TerminationReason, Verdict};
use scriptgate_runner::ExecutionBindings;
use scriptgate_test_utils::{
    derived_policy, fenced, python_available, test_config, test_pipeline, test_pipeline_with,
    write_policy, FailingGenerator, StaticGenerator, BENIGN_PYTHON, SHELL_PYTHON,
};
use std::sync::Arc;
use std::time::Duration;

fn request(prompt: &str) -> GenerateRequest {
    GenerateRequest::new(prompt, Language::Python)
}

/// `None` when this host cannot build the sandbox
fn sandboxed(result: Result<PipelineOutcome, PipelineError>) -> Option<PipelineOutcome> {
    match result {
        Err(PipelineError::Execution { isolation: true, message }) => {
            eprintln!("skipping: {message}");
            None
        }
        other => Some(other.unwrap()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_generate_once() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON).with_delay(Duration::from_millis(150)));
    let t = test_pipeline(generator.clone()).await;
    let pipeline = Arc::new(t.pipeline);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.generate_and_maybe_execute(request("sum to ten")).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(generator.calls(), 1);
    let first = &outcomes[0];
    assert!(outcomes.iter().all(|o| o.script_id == first.script_id && o.code == first.code));
    assert_eq!(outcomes.iter().filter(|o| o.origin == Origin::Generated).count(), 1);
    assert!(outcomes.iter().filter(|o| o.origin != Origin::Generated).all(|o| o.origin.is_hit()));
}

#[tokio::test]
async fn strict_rejects_blocked_call_with_findings() {
    let generator = Arc::new(StaticGenerator::new(SHELL_PYTHON));
    let t = test_pipeline(generator).await;

    let err = t
        .pipeline
        .generate_and_maybe_execute(request("list the root directory").with_policy("strict"))
        .await
        .unwrap_err();

    let PipelineError::ScanRejected { script_id, policy, findings } = &err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(policy, "strict");
    assert!(findings.iter().any(|f| f.matched.contains("os.system") && f.severity >= Severity::Low));
    assert!(!err.is_retryable());

    let kinds: Vec<_> = t.events_for(*script_id).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![AuditEventKind::CacheMiss, AuditEventKind::ScanRejected]);
    // rejected code is never cached
    assert!(t.pipeline.list_cached(&ListFilter::default()).is_empty());
}

#[tokio::test]
async fn permissive_pass_is_cached_and_served_again() {
    let generator = Arc::new(StaticGenerator::new(fenced("python", SHELL_PYTHON)));
    let t = test_pipeline(generator.clone()).await;
    let req = request("list the root directory").with_policy("permissive");

    let first = t.pipeline.generate_and_maybe_execute(req.clone()).await.unwrap();
    assert_eq!(first.origin, Origin::Generated);
    assert_eq!(first.scan_result.verdict(), Verdict::Passed);
    assert!(first.scan_result.findings().is_empty());
    assert_eq!(first.code, SHELL_PYTHON);

    let second = t.pipeline.generate_and_maybe_execute(req).await.unwrap();
    assert_eq!(second.origin, Origin::Cached);
    assert_eq!(second.code, first.code);
    assert_eq!(second.scan_result, first.scan_result);
    assert_eq!(generator.calls(), 1);

    let kinds: Vec<_> = t.events_for(first.script_id).into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![AuditEventKind::CacheMiss, AuditEventKind::ScanPassed, AuditEventKind::CacheHit]
    );

    let rows = t.pipeline.list_cached(&ListFilter {
        language: Some(Language::Python),
        policy: Some("permissive".into()),
    });
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].script_id, first.script_id);
    assert!(t
        .pipeline
        .list_cached(&ListFilter {
            language: Some(Language::JavaScript),
            policy: None
        })
        .is_empty());
}

#[tokio::test]
async fn policies_get_separate_fingerprints() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let t = test_pipeline(generator.clone()).await;

    let strict = t.pipeline.generate_and_maybe_execute(request("sum").with_policy("strict")).await.unwrap();
    let moderate = t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();
    assert_ne!(strict.script_id, moderate.script_id);
    assert_eq!(moderate.scan_result.policy().name, "moderate");
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn inspect_and_clear() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let t = test_pipeline(generator).await;
    let outcome = t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();
    let id = outcome.script_id.to_string();

    let entry = t.pipeline.inspect(&id).await.unwrap();
    assert_eq!(entry.source, BENIGN_PYTHON);
    assert_eq!(entry.prompt, "sum");
    assert_eq!(entry.generator.as_deref(), Some("static"));

    assert!(matches!(
        t.pipeline.inspect("not-a-fingerprint").await,
        Err(PipelineError::InvalidScriptId(_))
    ));

    assert_eq!(t.pipeline.clear(ClearTarget::One(id.clone())).await.unwrap(), 1);
    assert!(matches!(t.pipeline.inspect(&id).await, Err(PipelineError::NotFound(_))));
    // clearing again is a no-op
    assert_eq!(t.pipeline.clear(ClearTarget::One(id)).await.unwrap(), 0);

    t.pipeline.generate_and_maybe_execute(request("a")).await.unwrap();
    t.pipeline.generate_and_maybe_execute(request("b")).await.unwrap();
    assert_eq!(t.pipeline.clear(ClearTarget::All).await.unwrap(), 2);
    assert!(t.pipeline.list_cached(&ListFilter::default()).is_empty());
}

#[tokio::test]
async fn unknown_policy_is_not_retried() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let t = test_pipeline(generator.clone()).await;
    let err = t
        .pipeline
        .generate_and_maybe_execute(request("sum").with_policy("paranoid"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::PolicyNotFound(ref name) if name == "paranoid"));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn generation_failure_is_audited_and_not_cached() {
    let generator = Arc::new(FailingGenerator::transient());
    let t = test_pipeline(generator.clone()).await;

    let err = t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(t.kinds().contains(&AuditEventKind::GenerationFailed));

    // a retry starts a fresh flight
    t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap_err();
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn uncached_pipeline_still_scans_and_audits() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).without_cache();
    let t = test_pipeline_with(generator.clone(), config, dir).await;
    assert!(!t.pipeline.caching());

    let first = t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();
    let second = t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();
    assert_eq!(first.origin, Origin::Generated);
    assert_eq!(second.origin, Origin::Generated);
    assert_eq!(generator.calls(), 2);
    assert_eq!(t.kinds(), vec![AuditEventKind::ScanPassed, AuditEventKind::ScanPassed]);
    assert!(matches!(
        t.pipeline.inspect(&first.script_id.to_string()).await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn policy_reload_is_audited_and_changes_fingerprints() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let dir = tempfile::tempdir().unwrap();
    let policies = dir.path().join("policies");
    std::fs::create_dir_all(&policies).unwrap();
    write_policy(&policies, &derived_policy("team", "moderate"));
    let config = test_config(dir.path()).with_policies_dir(&policies);
    let t = test_pipeline_with(generator, config, dir).await;

    let before = t.pipeline.generate_and_maybe_execute(request("sum").with_policy("team")).await.unwrap();

    let mut changed = derived_policy("team", "moderate");
    changed.blocked_callables.push(scriptgate_policy::NameRule::new("print", Severity::High));
    write_policy(&policies, &changed);
    let report = t.pipeline.reload_policies().unwrap();
    assert_eq!(report.changed, vec!["team".to_string()]);
    assert!(t.kinds().contains(&AuditEventKind::PolicyReloaded));

    let err = t
        .pipeline
        .generate_and_maybe_execute(request("sum").with_policy("team"))
        .await
        .unwrap_err();
    let PipelineError::ScanRejected { script_id, .. } = err else {
        panic!("expected rejection under the reloaded policy");
    };
    assert_ne!(script_id, before.script_id);
}

#[tokio::test]
async fn input_values_share_a_cached_script() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let t = test_pipeline(generator.clone()).await;
    let with_inputs = |inputs: serde_json::Value| {
        request("add the inputs")
            .with_context("environment", serde_json::json!("batch job"))
            .with_context("inputs", inputs)
    };

    let first = t
        .pipeline
        .generate_and_maybe_execute(with_inputs(serde_json::json!([1, 2])))
        .await
        .unwrap();
    let second = t
        .pipeline
        .generate_and_maybe_execute(with_inputs(serde_json::json!(["30", 4.5])))
        .await
        .unwrap();
    assert_eq!(second.script_id, first.script_id);
    assert_eq!(second.origin, Origin::Cached);
    assert_eq!(generator.calls(), 1);

    let third = t
        .pipeline
        .generate_and_maybe_execute(with_inputs(serde_json::json!([1, 2, 3])))
        .await
        .unwrap();
    assert_ne!(third.script_id, first.script_id);
    let plain = t.pipeline.generate_and_maybe_execute(request("add the inputs")).await.unwrap();
    assert_ne!(plain.script_id, first.script_id);
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn stats_report_cache_and_audit() {
    let generator = Arc::new(StaticGenerator::new(BENIGN_PYTHON));
    let t = test_pipeline(generator).await;
    t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();
    t.pipeline.generate_and_maybe_execute(request("sum")).await.unwrap();

    let stats = t.pipeline.stats().await.unwrap();
    let cache = stats.cache.unwrap();
    assert_eq!((cache.hits, cache.misses), (1, 1));
    assert_eq!(stats.generator, "static");
    assert!(stats.policies.contains(&"strict".to_string()));
    assert_eq!(stats.audit.by_kind[&AuditEventKind::CacheHit], 1);
    assert_eq!(t.pipeline.verify_audit().unwrap(), stats.audit.total);
}

#[tokio::test]
async fn executes_approved_code_and_records_the_run() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let generator = Arc::new(StaticGenerator::new(
        "import sys\nprint('hello', sys.argv[1])\n",
    ));
    let t = test_pipeline(generator).await;

    let Some(outcome) = sandboxed(
        t.pipeline
            .generate_and_maybe_execute(
                request("greet").with_policy("permissive").executing(ExecutionBindings::new().with_arg("world")),
            )
            .await,
    ) else {
        return;
    };
    let result = outcome.execution_result.expect("executed");
    assert_eq!(result.termination, TerminationReason::Normal);
    assert_eq!(result.stdout, "hello world\n");

    let entry = t.pipeline.inspect(&outcome.script_id.to_string()).await.unwrap();
    assert_eq!(entry.last_execution.map(|e| e.execution_id), Some(result.execution_id));
    let kinds: Vec<_> = t.events_for(outcome.script_id).into_iter().map(|e| e.kind).collect();
    assert!(kinds.ends_with(&[AuditEventKind::ExecutionStarted, AuditEventKind::ExecutionFinished]));
}

#[tokio::test]
async fn shutdown_kills_running_executions() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let generator = Arc::new(StaticGenerator::new("import time\ntime.sleep(30)\n"));
    let t = test_pipeline(generator).await;
    let pipeline = Arc::new(t.pipeline);

    let running = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .generate_and_maybe_execute(request("wait").executing(ExecutionBindings::new()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.shutdown();

    let joined = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("execution torn down promptly")
        .unwrap();
    let Some(outcome) = sandboxed(joined) else {
        return;
    };
    let result = outcome.execution_result.unwrap();
    assert_eq!(result.termination, TerminationReason::Killed);
    assert!(result.wall_time_ms < 10_000);
}
