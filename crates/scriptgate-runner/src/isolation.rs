//! Sandbox setup applied in the child between `fork` and `exec`
//!
//! Everything a plan needs is computed in the parent. The closure installed
//! with `pre_exec` only reads that plan and issues async-signal-safe
//! syscalls: no allocation, no locks, no logging.

#![allow(unsafe_code)]

use crate::error::RunnerError;
#[cfg(target_os = "linux")]
use crate::mounts::{self, ReadOnlyMount};
#[cfg(target_os = "linux")]
use crate::syscalls::SyscallFilter;
use scriptgate_model::Language;
use scriptgate_policy::SecurityPolicy;
use std::ffi::CString;
use std::io;
use std::path::Path;

/// Resource limits the plan may set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Limit {
    Cpu,
    AddressSpace,
    FileSize,
    Core,
    Processes,
}

/// One `setrlimit` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RlimitSpec {
    pub(crate) limit: Limit,
    pub(crate) soft: u64,
    pub(crate) hard: u64,
}

/// Identity a root runner drops the workload to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SandboxIdentity {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

/// Mount namespace layout: everything read-only except, optionally, scratch
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilesystemPlan {
    root: CString,
    #[cfg(target_os = "linux")]
    read_only: Vec<ReadOnlyMount>,
    writable: Option<CString>,
}

impl FilesystemPlan {
    /// Scratch directory bound read-write, if any
    #[cfg(test)]
    pub(crate) fn writable(&self) -> Option<&CString> {
        self.writable.as_ref()
    }
}

/// Isolation steps for one workload
#[derive(Debug)]
pub(crate) struct IsolationPlan {
    rlimits: Vec<RlimitSpec>,
    isolate_network: bool,
    identity: Option<SandboxIdentity>,
    parent_pid: u32,
    filesystem: FilesystemPlan,
    #[cfg(target_os = "linux")]
    syscalls: SyscallFilter,
}

impl IsolationPlan {
    /// Plan for `policy` running `language` out of `scratch`
    ///
    /// `identity` is `Some` only when the runner is root and can switch
    /// users. `scratch` stays writable only if the policy allows writes.
    ///
    /// # Errors
    /// Returns [`RunnerError::IsolationSetup`] when the platform cannot
    /// provide what the policy demands
    pub(crate) fn new(
        policy: &SecurityPolicy,
        language: Language,
        identity: Option<SandboxIdentity>,
        scratch: &Path,
    ) -> Result<Self, RunnerError> {
        let ceilings = policy.ceilings();
        let cpu_secs = ceilings.cpu_time.as_secs().max(1)
            + u64::from(ceilings.cpu_time.subsec_nanos() > 0);
        let mut rlimits = vec![
            RlimitSpec {
                limit: Limit::Cpu,
                soft: cpu_secs,
                hard: cpu_secs + 1,
            },
            RlimitSpec {
                limit: Limit::FileSize,
                soft: ceilings.max_file_size_bytes,
                hard: ceilings.max_file_size_bytes,
            },
            RlimitSpec {
                limit: Limit::Core,
                soft: 0,
                hard: 0,
            },
        ];
        // V8 reserves far more address space than it touches; node is held
        // to its heap flag and RSS sampling instead.
        if language == Language::Python {
            rlimits.push(RlimitSpec {
                limit: Limit::AddressSpace,
                soft: ceilings.memory_bytes,
                hard: ceilings.memory_bytes,
            });
        }
        if identity.is_some() {
            rlimits.push(RlimitSpec {
                limit: Limit::Processes,
                soft: ceilings.max_processes,
                hard: ceilings.max_processes,
            });
        }

        if !cfg!(target_os = "linux") {
            return Err(RunnerError::IsolationSetup(
                "sandboxing needs Linux namespaces and seccomp".into(),
            ));
        }
        let writable = if policy.filesystem_writable() {
            Some(c_path(scratch)?)
        } else {
            None
        };

        Ok(Self {
            rlimits,
            isolate_network: !policy.network_allowed(),
            identity,
            parent_pid: std::process::id(),
            filesystem: FilesystemPlan {
                root: c_path(Path::new("/"))?,
                #[cfg(target_os = "linux")]
                read_only: mounts::snapshot()?,
                writable,
            },
            #[cfg(target_os = "linux")]
            syscalls: SyscallFilter::compile(policy.network_allowed())?,
        })
    }

    /// Planned resource limits
    #[cfg(test)]
    pub(crate) fn rlimits(&self) -> &[RlimitSpec] {
        &self.rlimits
    }

    /// Whether the workload gets its own network namespace
    #[cfg(test)]
    pub(crate) fn isolates_network(&self) -> bool {
        self.isolate_network
    }

    /// Planned mount namespace layout
    #[cfg(test)]
    pub(crate) fn filesystem(&self) -> &FilesystemPlan {
        &self.filesystem
    }

    /// Install this plan on `command`
    pub(crate) fn install(self, command: &mut tokio::process::Command) {
        // SAFETY: `apply` only reads the moved-in plan and makes
        // async-signal-safe libc calls.
        unsafe {
            command.pre_exec(move || self.apply());
        }
    }

    fn apply(&self) -> io::Result<()> {
        new_session()?;
        set_parent_death_signal(self.parent_pid)?;
        for spec in &self.rlimits {
            set_rlimit(*spec)?;
        }
        unshare_namespaces(self.isolate_network, self.identity.is_some())?;
        isolate_filesystem(&self.filesystem)?;
        if let Some(identity) = self.identity {
            drop_identity(identity)?;
        }
        lock_down()?;
        // Last: the filter denies the mount and namespace calls made above.
        #[cfg(target_os = "linux")]
        self.syscalls.install()?;
        Ok(())
    }
}

fn c_path(path: &Path) -> Result<CString, RunnerError> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RunnerError::IsolationSetup(format!("path {} contains a NUL byte", path.display())))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// New session so the workload leads its own process group
fn new_session() -> io::Result<()> {
    // SAFETY: plain syscall, no memory arguments.
    if unsafe { libc::setsid() } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            // SAFETY: as above.
            return check(unsafe { libc::setpgid(0, 0) });
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal(parent_pid: u32) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) })?;
    // The parent may have exited between fork and prctl.
    // SAFETY: plain syscall.
    if i64::from(unsafe { libc::getppid() }) != i64::from(parent_pid) {
        // SAFETY: terminates the child before exec.
        unsafe { libc::_exit(1) };
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal(_parent_pid: u32) -> io::Result<()> {
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::useless_conversion)]
fn set_rlimit(spec: RlimitSpec) -> io::Result<()> {
    let resource = match spec.limit {
        Limit::Cpu => libc::RLIMIT_CPU,
        Limit::AddressSpace => libc::RLIMIT_AS,
        Limit::FileSize => libc::RLIMIT_FSIZE,
        Limit::Core => libc::RLIMIT_CORE,
        Limit::Processes => libc::RLIMIT_NPROC,
    };
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit.
    check(unsafe { libc::getrlimit(resource, &mut current) })?;
    // Unprivileged processes cannot raise a hard limit, only lower it.
    let hard = (spec.hard as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: (spec.soft as libc::rlim_t).min(hard),
        rlim_max: hard,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    check(unsafe { libc::setrlimit(resource, &limit) })
}

/// Private mount namespace, plus network when denied
///
/// Without root the namespaces hang off a fresh user namespace, which is
/// what grants the mount rights.
#[cfg(target_os = "linux")]
fn unshare_namespaces(network: bool, as_root: bool) -> io::Result<()> {
    let mut flags = libc::CLONE_NEWNS;
    if network {
        flags |= libc::CLONE_NEWNET;
    }
    if !as_root {
        flags |= libc::CLONE_NEWUSER;
    }
    // SAFETY: unshare with flag arguments only; the child is single-threaded.
    check(unsafe { libc::unshare(flags) })
}

#[cfg(not(target_os = "linux"))]
fn unshare_namespaces(_network: bool, _as_root: bool) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Detach propagation, bind scratch read-write, remount the rest read-only
#[cfg(target_os = "linux")]
fn isolate_filesystem(plan: &FilesystemPlan) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::mount::{mount, MsFlags};
    use std::ffi::CStr;

    const NONE: Option<&CStr> = None;
    mount(NONE, plan.root.as_c_str(), NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)?;
    if let Some(scratch) = &plan.writable {
        // The bind is a mount of its own, untouched by the remounts below.
        mount(Some(scratch.as_c_str()), scratch.as_c_str(), NONE, MsFlags::MS_BIND, NONE)?;
    }
    for entry in &plan.read_only {
        match mount(NONE, entry.target.as_c_str(), NONE, entry.flags, NONE) {
            // Mounts these credentials cannot reach, the workload cannot either.
            Ok(()) | Err(Errno::ENOENT | Errno::EACCES) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn isolate_filesystem(_plan: &FilesystemPlan) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn drop_identity(identity: SandboxIdentity) -> io::Result<()> {
    // SAFETY: zero-length group list, null pointer is permitted.
    check(unsafe { libc::setgroups(0, std::ptr::null()) })?;
    // SAFETY: plain syscalls with integer arguments.
    check(unsafe { libc::setgid(identity.gid) })?;
    check(unsafe { libc::setuid(identity.uid) })
}

#[cfg(target_os = "linux")]
fn lock_down() -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    check(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })?;
    check(unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) })
}

#[cfg(not(target_os = "linux"))]
fn lock_down() -> io::Result<()> {
    Ok(())
}
