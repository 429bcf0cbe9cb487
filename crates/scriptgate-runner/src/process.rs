//! Process-group control and `/proc` sampling
//!
//! Every workload leads its own session, so its pid doubles as the process
//! group id and one `killpg` reaches every descendant that did not start a
//! session of its own.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Signal used when tearing a workload down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM, lets the runtime flush and exit
    Term,
    /// SIGKILL
    Kill,
}

impl KillSignal {
    fn as_signal(self) -> Signal {
        match self {
            Self::Term => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

/// Send `signal` to process group `pgid`; a vanished group is not an error
pub(crate) fn signal_group(pgid: u32, signal: KillSignal) -> Result<(), Errno> {
    let Ok(raw) = i32::try_from(pgid) else {
        return Err(Errno::EINVAL);
    };
    match killpg(Pid::from_raw(raw), signal.as_signal()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// SIGKILLs a process group when dropped
///
/// Covers every exit path out of an execution, including the caller
/// dropping the future mid-run.
#[derive(Debug)]
pub(crate) struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    pub(crate) fn new(pgid: u32) -> Self {
        Self { pgid: Some(pgid) }
    }

    pub(crate) fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Kill the group now; later calls and the drop become no-ops
    pub(crate) fn kill_now(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            if let Err(e) = signal_group(pgid, KillSignal::Kill) {
                tracing::warn!(pgid, error = %e, "failed to kill workload process group");
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill_now();
    }
}

/// Resource usage of one process at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcSample {
    /// Current resident set size in bytes
    pub rss_bytes: u64,
    /// Resident high-water mark in bytes
    pub rss_peak_bytes: u64,
    /// User plus system CPU time in milliseconds
    pub cpu_ms: u64,
}

/// Read the current usage of `pid`, `None` once it is gone
pub(crate) fn sample(pid: u32) -> Option<ProcSample> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (rss_bytes, rss_peak_bytes) = parse_status(&status);
    Some(ProcSample {
        rss_bytes,
        rss_peak_bytes: rss_peak_bytes.max(rss_bytes),
        cpu_ms: parse_stat_cpu_ticks(&stat).map_or(0, |ticks| ticks * 1000 / clock_ticks()),
    })
}

/// `VmRSS` and `VmHWM` in bytes
fn parse_status(status: &str) -> (u64, u64) {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map_or(0, |kb| kb * 1024)
    };
    (field("VmRSS:"), field("VmHWM:"))
}

/// `utime + stime` from `/proc/<pid>/stat`
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .and_then(|t| u64::try_from(t).ok())
        .filter(|t| *t > 0)
        .unwrap_or(100)
}
