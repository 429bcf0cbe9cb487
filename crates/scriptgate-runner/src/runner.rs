//! Launch, supervise and classify one sandboxed execution

use crate::bindings::{ApprovedSource, ExecutionBindings};
use crate::capture::{self, CappedBuffer};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::isolation::{IsolationPlan, SandboxIdentity};
use crate::process::{self, KillSignal, ProcSample, ProcessGroupGuard};
use crate::scratch::Scratch;
use chrono::{DateTime, Utc};
use scriptgate_audit::{AuditEventKind, AuditLog, AuditPayload, NewEvent};
use scriptgate_model::{ExecutionResult, Language, ResourceKind, TerminationReason};
use scriptgate_policy::{ResourceCeilings, SecurityPolicy};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Smallest heap node is given, whatever the memory ceiling
const MIN_NODE_HEAP_MB: u64 = 16;

/// stderr markers the runtimes print when they run out of memory
const OOM_MARKERS: [&str; 3] = [
    "MemoryError",
    "JavaScript heap out of memory",
    "Cannot allocate memory",
];

/// stderr marker for a write past `RLIMIT_FSIZE` when SIGXFSZ is ignored
const FILE_SIZE_MARKER: &str = "File too large";

/// Why supervision stopped the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Breach {
    Timeout(Duration),
    Memory { rss_bytes: u64 },
    Cpu { cpu_ms: u64 },
    Cancelled,
}

/// Highest usage seen across samples
#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    peak_rss: Option<u64>,
    cpu_ms: Option<u64>,
}

impl Usage {
    fn observe(&mut self, sample: ProcSample) {
        self.peak_rss = Some(self.peak_rss.unwrap_or(0).max(sample.rss_peak_bytes));
        self.cpu_ms = Some(self.cpu_ms.unwrap_or(0).max(sample.cpu_ms));
    }
}

struct Supervised {
    status: ExitStatus,
    breach: Option<Breach>,
    usage: Usage,
}

/// Runs scanner-approved code inside an isolated, resource-capped context
///
/// Every call to [`execute`](Self::execute) that gets past validation
/// appends exactly two audit events: `execution_started` before launch and
/// one terminal event afterwards.
#[derive(Debug, Clone)]
pub struct Runner {
    config: RunnerConfig,
    audit: Arc<AuditLog>,
}

impl Runner {
    /// Runner recording to `audit`
    #[must_use]
    pub fn new(config: RunnerConfig, audit: Arc<AuditLog>) -> Self {
        Self { config, audit }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Whether the interpreter for `language` can be found
    #[must_use]
    pub fn runtime_available(&self, language: Language) -> bool {
        resolve_program(&self.config.runtime(language).program, &self.config.path_env).is_ok()
    }

    /// Execute `approved` under `policy`
    ///
    /// Cancelling `cancel` tears the workload down exactly as a timeout
    /// would, and the result reports [`TerminationReason::Killed`].
    ///
    /// # Errors
    /// - [`RunnerError::UnscannedCode`] or [`RunnerError::InvalidBinding`]
    ///   before anything happens
    /// - [`RunnerError::Audit`] if an audit event cannot be recorded; when the
    ///   start event fails nothing is launched
    /// - [`RunnerError::IsolationSetup`] if the sandbox cannot be built; the
    ///   failure is still audited as a terminal event
    #[tracing::instrument(
        skip_all,
        fields(
            script_id = %approved.fingerprint.short(),
            policy = %policy.name(),
            language = %approved.language,
        )
    )]
    pub async fn execute(
        &self,
        approved: &ApprovedSource,
        policy: &SecurityPolicy,
        bindings: &ExecutionBindings,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RunnerError> {
        approved.verify(policy)?;
        bindings.validate(RunnerConfig::script_name(approved.language))?;
        let runtime = self.config.runtime(approved.language);
        let program = resolve_program(&runtime.program, &self.config.path_env)?;

        let execution_id = Uuid::new_v4();
        self.audit.append(
            NewEvent::new(
                AuditEventKind::ExecutionStarted,
                AuditPayload::ExecutionStarted {
                    execution_id,
                    language: approved.language,
                },
            )
            .correlated(approved.fingerprint)
            .under(policy.id().clone()),
        )?;

        let started_at = Utc::now();
        let (result, failure) = match self
            .run(execution_id, &program, approved, policy, bindings, &cancel)
            .await
        {
            Ok(result) => (result, None),
            Err(err) => {
                tracing::error!(error = %err, "execution failed");
                (errored(execution_id, started_at, &err), Some(err))
            }
        };

        self.audit.append(
            NewEvent::execution(result.clone())
                .correlated(approved.fingerprint)
                .under(policy.id().clone()),
        )?;

        metrics::counter!(
            "scriptgate_executions_total",
            "termination" => result.termination.to_string()
        )
        .increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::histogram!("scriptgate_execution_wall_ms").record(result.wall_time_ms as f64);

        match failure {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    async fn run(
        &self,
        execution_id: Uuid,
        program: &Path,
        approved: &ApprovedSource,
        policy: &SecurityPolicy,
        bindings: &ExecutionBindings,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, RunnerError> {
        let identity = nix::unistd::Uid::effective().is_root().then_some(SandboxIdentity {
            uid: self.config.sandbox_uid,
            gid: self.config.sandbox_gid,
        });
        let scratch = Scratch::prepare(
            self.config.scratch_root.as_deref(),
            RunnerConfig::script_name(approved.language),
            &approved.source,
            bindings,
            !policy.filesystem_writable(),
            identity,
        )?;
        let plan = IsolationPlan::new(policy, approved.language, identity, scratch.path())?;

        let ceilings = policy.ceilings();
        let mut command = self.command(program, approved.language, ceilings, &scratch, bindings);
        plan.install(&mut command);

        let started = Instant::now();
        let started_at = Utc::now();
        let mut child = command.spawn().map_err(|e| {
            RunnerError::IsolationSetup(format!("could not launch {} in the sandbox: {e}", program.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| RunnerError::Io("workload was reaped before it could be tracked".into()))?;
        let mut group = ProcessGroupGuard::new(pid);
        tracing::debug!(%execution_id, pid, "workload launched");

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), bindings.stdin.clone()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    tracing::debug!(error = %e, "workload closed stdin early");
                }
            });
        }
        let limit = usize::try_from(ceilings.max_output_bytes).unwrap_or(usize::MAX);
        let stdout = child.stdout.take().map(|out| tokio::spawn(capture::drain(out, limit)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(capture::drain(err, limit)));

        let supervised = self.supervise(&mut child, pid, ceilings, cancel).await;
        // Sweep whatever the workload left running in its group.
        group.kill_now();
        let supervised = supervised?;

        let wall_time = started.elapsed();
        let wait = self.config.kill_grace.max(Duration::from_secs(1));
        let (stdout, stdout_truncated) = collect(stdout, wait).await;
        let (stderr, stderr_truncated) = collect(stderr, wait).await;

        let (termination, detail) = classify(
            supervised.status,
            supervised.breach,
            &stderr,
            supervised.usage.cpu_ms,
            ceilings,
        );
        tracing::debug!(%execution_id, state = ?termination.terminal_state(), "workload settled");
        drop(scratch);

        Ok(ExecutionResult {
            execution_id,
            exit_code: supervised.status.code(),
            signal: supervised.status.signal(),
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            wall_time_ms: u64::try_from(wall_time.as_millis()).unwrap_or(u64::MAX),
            cpu_time_ms: supervised.usage.cpu_ms,
            peak_memory_bytes: supervised.usage.peak_rss,
            termination,
            started_at,
            finished_at: Utc::now(),
            detail,
        })
    }

    fn command(
        &self,
        program: &Path,
        language: Language,
        ceilings: &ResourceCeilings,
        scratch: &Scratch,
        bindings: &ExecutionBindings,
    ) -> Command {
        let mut command = Command::new(program);
        command.args(&self.config.runtime(language).args);
        if language == Language::JavaScript {
            let heap_mb = (ceilings.memory_bytes / MIB).max(MIN_NODE_HEAP_MB);
            command.arg(format!("--max-old-space-size={heap_mb}"));
        }
        command
            .arg(scratch.script())
            .args(&bindings.args)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", &self.config.path_env)
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("LANG", "C.UTF-8")
            .envs(&bindings.env)
            .stdin(if bindings.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn supervise(
        &self,
        child: &mut Child,
        pid: u32,
        ceilings: &ResourceCeilings,
        cancel: &CancellationToken,
    ) -> Result<Supervised, RunnerError> {
        let deadline = tokio::time::sleep(ceilings.wall_timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(self.config.sample_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cpu_budget_ms =
            u64::try_from((ceilings.cpu_time + self.config.cpu_slack).as_millis()).unwrap_or(u64::MAX);
        let mut usage = Usage::default();

        let breach = loop {
            tokio::select! {
                biased;
                status = child.wait() => {
                    let status = status.map_err(|e| RunnerError::io("wait for workload", &e))?;
                    return Ok(Supervised { status, breach: None, usage });
                }
                () = &mut deadline => break Breach::Timeout(ceilings.wall_timeout),
                () = cancel.cancelled() => break Breach::Cancelled,
                _ = tick.tick() => {
                    let Some(sample) = process::sample(pid) else { continue };
                    usage.observe(sample);
                    if sample.rss_bytes > ceilings.memory_bytes {
                        break Breach::Memory { rss_bytes: sample.rss_bytes };
                    }
                    if sample.cpu_ms > cpu_budget_ms {
                        break Breach::Cpu { cpu_ms: sample.cpu_ms };
                    }
                }
            }
        };

        tracing::info!(?breach, pid, "terminating workload");
        let status = self.terminate(child, pid).await?;
        Ok(Supervised {
            status,
            breach: Some(breach),
            usage,
        })
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL and reap
    async fn terminate(&self, child: &mut Child, pgid: u32) -> Result<ExitStatus, RunnerError> {
        if let Err(e) = process::signal_group(pgid, KillSignal::Term) {
            tracing::warn!(pgid, error = %e, "SIGTERM to workload group failed");
        }
        if let Ok(status) = tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            return status.map_err(|e| RunnerError::io("reap workload", &e));
        }
        if let Err(e) = process::signal_group(pgid, KillSignal::Kill) {
            tracing::warn!(pgid, error = %e, "SIGKILL to workload group failed");
        }
        child.wait().await.map_err(|e| RunnerError::io("reap workload", &e))
    }
}

async fn collect(task: Option<JoinHandle<CappedBuffer>>, wait: Duration) -> (String, bool) {
    let Some(mut task) = task else {
        return (String::new(), false);
    };
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(buffer)) => buffer.into_text(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output capture task failed");
            (String::new(), false)
        }
        Err(_) => {
            task.abort();
            tracing::warn!("output pipe still open after teardown; capture abandoned");
            (String::new(), false)
        }
    }
}

/// Map how the workload ended to a termination reason and detail
pub(crate) fn classify(
    status: ExitStatus,
    breach: Option<Breach>,
    stderr: &str,
    cpu_ms: Option<u64>,
    ceilings: &ResourceCeilings,
) -> (TerminationReason, Option<String>) {
    match breach {
        Some(Breach::Timeout(limit)) => (
            TerminationReason::Timeout,
            Some(format!("wall-clock limit of {}ms reached", limit.as_millis())),
        ),
        Some(Breach::Cancelled) => (TerminationReason::Killed, Some("cancelled".into())),
        Some(Breach::Memory { rss_bytes }) => (
            TerminationReason::ResourceLimit(ResourceKind::Memory),
            Some(format!(
                "resident memory {} MiB exceeded the {} MiB ceiling",
                rss_bytes / MIB,
                ceilings.memory_bytes / MIB
            )),
        ),
        Some(Breach::Cpu { cpu_ms }) => (
            TerminationReason::ResourceLimit(ResourceKind::Cpu),
            Some(format!(
                "{cpu_ms}ms of CPU exceeded the {}ms ceiling",
                ceilings.cpu_time.as_millis()
            )),
        ),
        None => classify_exit(status, stderr, cpu_ms, ceilings),
    }
}

fn classify_exit(
    status: ExitStatus,
    stderr: &str,
    cpu_ms: Option<u64>,
    ceilings: &ResourceCeilings,
) -> (TerminationReason, Option<String>) {
    let cpu_spent = cpu_ms
        .is_some_and(|ms| u128::from(ms) + 100 >= ceilings.cpu_time.as_millis());
    match status.signal() {
        Some(libc::SIGXCPU) => {
            return (
                TerminationReason::ResourceLimit(ResourceKind::Cpu),
                Some("CPU time limit reached".into()),
            )
        }
        Some(libc::SIGKILL) if cpu_spent => {
            return (
                TerminationReason::ResourceLimit(ResourceKind::Cpu),
                Some("hard CPU time limit reached".into()),
            )
        }
        Some(libc::SIGXFSZ) => {
            return (
                TerminationReason::ResourceLimit(ResourceKind::FileSize),
                Some("file size limit reached".into()),
            )
        }
        _ => {}
    }

    if !status.success() {
        if OOM_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            return (
                TerminationReason::ResourceLimit(ResourceKind::Memory),
                Some(format!(
                    "runtime ran out of memory under the {} MiB ceiling",
                    ceilings.memory_bytes / MIB
                )),
            );
        }
        if stderr.contains(FILE_SIZE_MARKER) {
            return (
                TerminationReason::ResourceLimit(ResourceKind::FileSize),
                Some("file size limit reached".into()),
            );
        }
    }

    match status.signal() {
        Some(sig) => (TerminationReason::Killed, Some(format!("terminated by signal {sig}"))),
        None => (TerminationReason::Normal, None),
    }
}

fn errored(execution_id: Uuid, started_at: DateTime<Utc>, err: &RunnerError) -> ExecutionResult {
    let finished_at = Utc::now();
    ExecutionResult {
        execution_id,
        exit_code: None,
        signal: None,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        wall_time_ms: u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or(0),
        cpu_time_ms: None,
        peak_memory_bytes: None,
        termination: TerminationReason::Error,
        started_at,
        finished_at,
        detail: Some(err.to_string()),
    }
}

/// Locate `program` the way `execvp` would, using `path_env`
fn resolve_program(program: &str, path_env: &str) -> Result<PathBuf, RunnerError> {
    let unavailable = |message: &str| RunnerError::RuntimeUnavailable {
        program: program.to_string(),
        message: message.to_string(),
    };
    let is_executable = |path: &Path| {
        std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(unavailable("not an executable file"))
        };
    }
    std::env::split_paths(path_env)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| unavailable("not found on PATH"))
}
