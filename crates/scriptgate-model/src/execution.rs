//! Execution outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Resource whose ceiling was breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Resident or address-space memory
    Memory,
    /// CPU time
    Cpu,
    /// Size of a file written by the workload
    FileSize,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::FileSize => "file_size",
        })
    }
}

/// Why an execution ended
///
/// Timeouts and resource kills are successful enforcement outcomes, not
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "resource")]
pub enum TerminationReason {
    /// Workload exited on its own
    Normal,
    /// Wall-clock ceiling reached
    Timeout,
    /// A resource ceiling was breached
    ResourceLimit(ResourceKind),
    /// Terminated by cancellation, or by a signal the runner did not send
    Killed,
    /// The runner failed internally
    Error,
}

impl TerminationReason {
    /// Whether the workload was forcibly stopped
    #[inline]
    #[must_use]
    pub fn is_forced(self) -> bool {
        matches!(self, Self::Timeout | Self::ResourceLimit(_) | Self::Killed)
    }

    /// Terminal state matching this reason
    #[inline]
    #[must_use]
    pub fn terminal_state(self) -> ExecutionState {
        match self {
            Self::Normal => ExecutionState::Completed,
            Self::Timeout => ExecutionState::TimedOut,
            Self::ResourceLimit(_) => ExecutionState::ResourceKilled,
            Self::Killed => ExecutionState::Cancelled,
            Self::Error => ExecutionState::Errored,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Timeout => f.write_str("timeout"),
            Self::ResourceLimit(kind) => write!(f, "resource-limit({kind})"),
            Self::Killed => f.write_str("killed"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Context prepared, workload not launched
    Created,
    /// Workload running
    Running,
    /// Exited on its own
    Completed,
    /// Wall-clock ceiling reached
    TimedOut,
    /// Resource ceiling breached
    ResourceKilled,
    /// Cancelled by the caller or killed from outside
    Cancelled,
    /// Runner failure
    Errored,
}

impl ExecutionState {
    /// Whether this state is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        match self {
            Self::Created => matches!(next, Self::Running | Self::Errored),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Finalized outcome of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique id of this run
    pub execution_id: Uuid,
    /// Exit code when the workload exited normally
    pub exit_code: Option<i32>,
    /// Signal that terminated the workload, if any
    pub signal: Option<i32>,
    /// Captured standard output (size-capped)
    pub stdout: String,
    /// Captured standard error (size-capped)
    pub stderr: String,
    /// Whether stdout was truncated
    pub stdout_truncated: bool,
    /// Whether stderr was truncated
    pub stderr_truncated: bool,
    /// Wall-clock duration in milliseconds
    pub wall_time_ms: u64,
    /// CPU time consumed, when it could be sampled
    pub cpu_time_ms: Option<u64>,
    /// Peak resident memory, when it could be sampled
    pub peak_memory_bytes: Option<u64>,
    /// Why the execution ended
    pub termination: TerminationReason,
    /// Launch time
    pub started_at: DateTime<Utc>,
    /// Finalization time
    pub finished_at: DateTime<Utc>,
    /// Extra context (breach description, runner error)
    pub detail: Option<String>,
}

impl ExecutionResult {
    /// Terminal state of this run
    #[inline]
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.termination.terminal_state()
    }

    /// Whether the workload completed normally with exit code 0
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.termination == TerminationReason::Normal && self.exit_code == Some(0)
    }

    /// Whether any output was truncated
    #[inline]
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}
