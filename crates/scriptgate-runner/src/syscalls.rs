//! Seccomp filter narrowing the workload's system-call surface
//!
//! The BPF program is compiled in the parent; the child only hands it to the
//! kernel. Denied calls fail with `EPERM` so interpreters raise an ordinary
//! error instead of dying on SIGSYS.

use crate::error::RunnerError;
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use std::collections::BTreeMap;
use std::io;

/// Debugging, kernel, mount and namespace calls no script needs
const ALWAYS_DENIED: [libc::c_long; 24] = [
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_reboot,
    libc::SYS_kexec_load,
    libc::SYS_kexec_file_load,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_keyctl,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_acct,
    libc::SYS_open_by_handle_at,
];

/// Socket creation and connection setup, denied when the policy is offline
const NETWORK: [libc::c_long; 6] = [
    libc::SYS_socket,
    libc::SYS_connect,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_accept,
    libc::SYS_accept4,
];

/// Syscall numbers a workload may not make
pub(crate) fn denied_syscalls(network_allowed: bool) -> Vec<i64> {
    let mut denied: Vec<i64> = ALWAYS_DENIED.iter().map(|&nr| i64::from(nr)).collect();
    if !network_allowed {
        denied.extend(NETWORK.iter().map(|&nr| i64::from(nr)));
    }
    denied
}

fn target_arch() -> Result<TargetArch, RunnerError> {
    if cfg!(target_arch = "x86_64") {
        Ok(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(TargetArch::aarch64)
    } else {
        Err(RunnerError::IsolationSetup(format!(
            "no seccomp filter for architecture {}",
            std::env::consts::ARCH
        )))
    }
}

/// Compiled deny-list filter
pub(crate) struct SyscallFilter {
    program: BpfProgram,
    denied: usize,
}

impl SyscallFilter {
    /// Filter for a workload whose policy does or does not allow network
    ///
    /// # Errors
    /// Returns [`RunnerError::IsolationSetup`] if the architecture is not
    /// supported or the program does not compile
    pub(crate) fn compile(network_allowed: bool) -> Result<Self, RunnerError> {
        let denied = denied_syscalls(network_allowed);
        let count = denied.len();
        let rules: BTreeMap<i64, Vec<SeccompRule>> =
            denied.into_iter().map(|nr| (nr, Vec::new())).collect();
        #[allow(clippy::cast_sign_loss)]
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EPERM as u32),
            target_arch()?,
        )
        .map_err(|e| RunnerError::IsolationSetup(format!("seccomp filter: {e}")))?;
        let program: BpfProgram = filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| RunnerError::IsolationSetup(format!("seccomp program: {e}")))?;
        Ok(Self {
            program,
            denied: count,
        })
    }

    /// Number of denied syscalls
    pub(crate) fn denied(&self) -> usize {
        self.denied
    }

    /// Load the filter into the calling process; irreversible
    pub(crate) fn install(&self) -> io::Result<()> {
        seccompiler::apply_filter(&self.program).map_err(|_| io::Error::last_os_error())
    }
}

impl std::fmt::Debug for SyscallFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallFilter")
            .field("denied", &self.denied)
            .field("instructions", &self.program.len())
            .finish()
    }
}
