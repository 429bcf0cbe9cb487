//! Execution tests against real interpreters
//!
//! Each test returns early when its interpreter is not installed.

use pretty_assertions::assert_eq;
use scriptgate_audit::{AuditError, AuditEvent, AuditEventKind, AuditFilter, AuditLog, AuditSink, EventIter};
use scriptgate_model::{
    ExecutionState, Fingerprint, Language, ResourceKind, ScanResult, SourceDigest, TerminationReason,
};
use scriptgate_policy::{CeilingsDocument, PolicyDocument, PolicyMode, SecurityPolicy};
use scriptgate_runner::{ApprovedSource, ExecutionBindings, Runner, RunnerConfig, RunnerError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn policy(ceilings: CeilingsDocument) -> SecurityPolicy {
    let mut doc = PolicyDocument::named("runner-test");
    doc.mode = Some(PolicyMode::Permissive);
    doc.network_allowed = Some(true);
    doc.filesystem_writable = Some(true);
    doc.ceilings = ceilings;
    SecurityPolicy::compile(&doc).unwrap()
}

fn default_policy() -> SecurityPolicy {
    policy(CeilingsDocument {
        wall_timeout_secs: Some(20),
        ..CeilingsDocument::default()
    })
}

fn approve(policy: &SecurityPolicy, language: Language, source: &str) -> ApprovedSource {
    let scan = ScanResult::evaluate(
        Vec::new(),
        policy.id().clone(),
        language,
        policy.reject_threshold(),
        SourceDigest::of(source),
    );
    ApprovedSource::new(Fingerprint::new([0xab; 32]), language, source.to_string(), scan)
}

fn runner() -> (Runner, Arc<AuditLog>) {
    let audit = Arc::new(AuditLog::in_memory());
    (Runner::new(RunnerConfig::default(), Arc::clone(&audit)), audit)
}

fn kinds(audit: &AuditLog) -> Vec<AuditEventKind> {
    audit
        .query(AuditFilter::all())
        .collect()
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

macro_rules! require {
    ($runner:expr, $language:expr) => {
        if !$runner.runtime_available($language) {
            eprintln!("skipping: no {} interpreter", $language);
            return;
        }
    };
}

/// Unwrap a run, returning early where the host cannot build the sandbox
macro_rules! isolated {
    ($result:expr) => {
        match $result {
            Ok(result) => result,
            Err(RunnerError::IsolationSetup(reason)) => {
                eprintln!("skipping: sandbox unavailable: {reason}");
                return;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    };
}

#[tokio::test]
async fn python_runs_to_completion() {
    let (runner, audit) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(&policy, Language::Python, "print('hello from the sandbox')\n");

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Normal);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello from the sandbox\n");
    assert!(result.succeeded());
    assert_eq!(
        kinds(&audit),
        vec![AuditEventKind::ExecutionStarted, AuditEventKind::ExecutionFinished]
    );
}

#[tokio::test]
async fn failing_exit_is_still_normal_termination() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::Python,
        "import sys\nsys.stderr.write('boom\\n')\nsys.exit(3)\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Normal);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr, "boom\n");
    assert!(!result.succeeded());
}

#[tokio::test]
async fn wall_clock_timeout_kills_the_workload() {
    let (runner, audit) = runner();
    require!(runner, Language::Python);
    let policy = policy(CeilingsDocument {
        wall_timeout_secs: Some(2),
        ..CeilingsDocument::default()
    });
    let approved = approve(&policy, Language::Python, "import time\ntime.sleep(10)\n");

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Timeout);
    assert_eq!(result.state(), ExecutionState::TimedOut);
    assert!(result.wall_time_ms >= 2000, "wall time {}", result.wall_time_ms);
    assert!(result.wall_time_ms < 5000, "wall time {}", result.wall_time_ms);
    assert_eq!(
        kinds(&audit),
        vec![AuditEventKind::ExecutionStarted, AuditEventKind::ExecutionKilled]
    );
}

#[tokio::test]
async fn cancellation_tears_down_like_a_timeout() {
    let (runner, audit) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(&policy, Language::Python, "import time\ntime.sleep(30)\n");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), cancel)
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Killed);
    assert_eq!(result.state(), ExecutionState::Cancelled);
    assert!(result.wall_time_ms < 5000);
    assert_eq!(kinds(&audit).last(), Some(&AuditEventKind::ExecutionKilled));
}

#[tokio::test]
async fn memory_ceiling_is_enforced() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = policy(CeilingsDocument {
        memory_mb: Some(128),
        wall_timeout_secs: Some(20),
        ..CeilingsDocument::default()
    });
    let approved = approve(&policy, Language::Python, "block = bytearray(1024 * 1024 * 1024)\nprint(len(block))\n");

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::ResourceLimit(ResourceKind::Memory));
    assert_eq!(result.state(), ExecutionState::ResourceKilled);
    assert!(result.stdout.is_empty());
}

#[tokio::test]
async fn cpu_ceiling_is_enforced() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = policy(CeilingsDocument {
        cpu_time_secs: Some(1),
        wall_timeout_secs: Some(30),
        ..CeilingsDocument::default()
    });
    let approved = approve(&policy, Language::Python, "while True:\n    pass\n");

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::ResourceLimit(ResourceKind::Cpu));
    assert!(result.wall_time_ms < 15_000);
}

#[tokio::test]
async fn output_is_capped_with_a_marker() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = policy(CeilingsDocument {
        max_output_bytes: Some(1024),
        wall_timeout_secs: Some(20),
        ..CeilingsDocument::default()
    });
    let approved = approve(&policy, Language::Python, "print('x' * 10000)\n");

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Normal);
    assert!(result.stdout_truncated);
    assert!(result.truncated());
    assert!(result.stdout.starts_with(&"x".repeat(1024)));
    assert!(result.stdout.ends_with("[... 8977 bytes truncated]"));
}

#[tokio::test]
async fn bindings_reach_the_workload() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let source = "import os, sys\n\
                  data = sys.stdin.read().strip()\n\
                  with open('inputs/name.txt') as f:\n    name = f.read().strip()\n\
                  print(data, sys.argv[1], os.environ['GREETING'], name)\n\
                  print(os.environ.get('HOME') == os.getcwd())\n";
    let approved = approve(&policy, Language::Python, source);
    let bindings = ExecutionBindings::new()
        .with_stdin("from-stdin")
        .with_arg("from-args")
        .with_env("GREETING", "hello")
        .with_file("inputs/name.txt", "scriptgate\n");

    let result = runner
        .execute(&approved, &policy, &bindings, CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.stderr, "");
    assert_eq!(result.stdout, "from-stdin from-args hello scriptgate\nTrue\n");
}

#[tokio::test]
async fn environment_is_scrubbed() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::Python,
        "import os\nprint(sorted(k for k in os.environ if k not in ('LC_CTYPE',)))\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.stdout, "['HOME', 'LANG', 'PATH', 'TMPDIR']\n");
}

#[tokio::test]
async fn leftover_processes_are_killed() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::Python,
        "import subprocess\np = subprocess.Popen(['sleep', '30'])\nprint(p.pid)\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    let pid: u32 = result.stdout.trim().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let alive = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| !stat.contains(") Z"))
        .unwrap_or(false);
    assert!(!alive, "grandchild {pid} survived the run");
}

#[tokio::test]
async fn unscanned_code_never_starts() {
    let (runner, audit) = runner();
    let policy = default_policy();
    let mut approved = approve(&policy, Language::Python, "print(1)\n");
    approved.source.push_str("import socket\n");

    let err = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::UnscannedCode(_)));
    assert!(kinds(&audit).is_empty());
}

#[tokio::test]
async fn escaping_binding_never_starts() {
    let (runner, audit) = runner();
    let policy = default_policy();
    let approved = approve(&policy, Language::Python, "print(1)\n");
    let bindings = ExecutionBindings::new().with_file("../../etc/cron.d/x", "* * * * * root true");

    let err = runner
        .execute(&approved, &policy, &bindings, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::InvalidBinding(_)));
    assert!(kinds(&audit).is_empty());
}

#[derive(Debug)]
struct RefusingSink;

impl AuditSink for RefusingSink {
    fn write(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::sink("disk full"))
    }

    fn read(&self) -> Result<EventIter<'_>, AuditError> {
        Ok(Box::new(std::iter::empty()))
    }
}

#[tokio::test]
async fn unauditable_execution_never_starts() {
    let audit = Arc::new(AuditLog::open(Arc::new(RefusingSink)).unwrap());
    let runner = Runner::new(RunnerConfig::default(), audit);
    require!(runner, Language::Python);
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("ran");
    let policy = default_policy();
    let source = format!("open({:?}, 'w').write('x')\n", marker.display().to_string());
    let approved = approve(&policy, Language::Python, &source);

    let err = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Audit(_)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn denied_network_is_isolated_or_refused() {
    let (runner, audit) = runner();
    require!(runner, Language::Python);
    let mut doc = PolicyDocument::named("offline");
    doc.mode = Some(PolicyMode::Permissive);
    doc.network_allowed = Some(false);
    let policy = SecurityPolicy::compile(&doc).unwrap();
    let source = "import socket\n\
                  try:\n    socket.create_connection(('127.0.0.1', 9), timeout=2)\n    print('connected')\n\
                  except OSError as e:\n    print(type(e).__name__, e.errno)\n";
    let approved = approve(&policy, Language::Python, source);

    match runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await
    {
        Ok(result) => {
            // Loopback is down in a fresh network namespace.
            assert!(!result.stdout.contains("connected"), "{}", result.stdout);
            assert!(!result.stdout.contains("ConnectionRefusedError"), "{}", result.stdout);
        }
        Err(RunnerError::IsolationSetup(_)) => {
            let events = audit.query(AuditFilter::all()).collect().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[1].kind, AuditEventKind::ExecutionFinished);
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn root_filesystem_is_read_only() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let mut doc = PolicyDocument::named("sealed");
    doc.mode = Some(PolicyMode::Permissive);
    doc.filesystem_writable = Some(false);
    let policy = SecurityPolicy::compile(&doc).unwrap();
    let outside = tempfile::tempdir_in("/tmp").unwrap();
    let target = outside.path().join("escaped");
    let source = format!(
        "import os\n\
         for path in ({:?}, os.path.join(os.getcwd(), 'local')):\n    \
         try:\n        open(path, 'w').write('x')\n        print('wrote')\n    \
         except OSError as e:\n        print(e.errno)\n",
        target.display().to_string()
    );
    let approved = approve(&policy, Language::Python, &source);

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.stderr, "");
    assert!(!result.stdout.contains("wrote"), "{}", result.stdout);
    assert!(!target.exists());
}

#[tokio::test]
async fn writable_policy_keeps_scratch_writable() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::Python,
        "open('out.txt', 'w').write('x')\nprint(open('out.txt').read())\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.stderr, "");
    assert_eq!(result.stdout, "x\n");
}

#[tokio::test]
async fn self_inflicted_signal_is_reported_as_killed() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::Python,
        "import os, signal\nos.kill(os.getpid(), signal.SIGSEGV)\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Killed);
    assert_eq!(result.signal, Some(11));
    assert_eq!(result.state(), ExecutionState::Cancelled);
}

#[tokio::test]
async fn offline_policy_cannot_open_sockets() {
    let (runner, _) = runner();
    require!(runner, Language::Python);
    let mut doc = PolicyDocument::named("offline");
    doc.mode = Some(PolicyMode::Permissive);
    doc.network_allowed = Some(false);
    let policy = SecurityPolicy::compile(&doc).unwrap();
    let source = "import socket\n\
                  try:\n    socket.socket(socket.AF_INET, socket.SOCK_STREAM)\n    print('opened')\n\
                  except OSError as e:\n    print(e.errno)\n";
    let approved = approve(&policy, Language::Python, source);

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.stdout, "1\n");
}

#[tokio::test]
async fn javascript_runs_with_heap_cap() {
    let (runner, _) = runner();
    require!(runner, Language::JavaScript);
    let policy = default_policy();
    let approved = approve(
        &policy,
        Language::JavaScript,
        "console.log(process.execArgv.join(' '));\n",
    );

    let result = runner
        .execute(&approved, &policy, &ExecutionBindings::new(), CancellationToken::new())
        .await;
    let result = isolated!(result);

    assert_eq!(result.termination, TerminationReason::Normal);
    assert_eq!(result.stdout, "--max-old-space-size=256\n");
}
