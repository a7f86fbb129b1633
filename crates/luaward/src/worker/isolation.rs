//! OS-level sandbox setup applied inside the worker child immediately
//! after `fork`, before any untrusted script is loaded. Each step is
//! logged and, except for the seccomp lockdown, best-effort: a failure
//! is recorded and isolation continues, matching the posture that a
//! script-level sandbox escape should not also need a perfectly
//! provisioned host to be contained.

use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{setgid, setuid, Gid, Uid};
use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompFilter, SeccompRule,
};
use tracing::{error, info, warn};

use crate::types::HostOptions;

/// Syscalls the worker's steady-state command loop needs once isolated:
/// reading/writing its two pipe descriptors, memory management for the
/// Lua allocator, clock queries, and process exit. Anything else (every
/// filesystem open, every socket, `execve`, `ptrace`, ...) is denied.
fn allowed_syscalls() -> Vec<libc::c_long> {
    vec![
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_close,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_brk,
        libc::SYS_rt_sigreturn,
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_clock_gettime,
        libc::SYS_gettimeofday,
        libc::SYS_futex,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_madvise,
        libc::SYS_sigaltstack,
    ]
}

/// Applies the full isolation sequence in the order the data model
/// requires: network detach, resource limits, credential drop (gid
/// before uid), then lockdown. Returns `Err` only for the lockdown step,
/// which has no soft-fail fallback when `full_isolation` is requested.
pub fn apply(options: &HostOptions) -> Result<(), String> {
    detach_network(options);
    apply_cpu_limit(options);
    drop_credentials(options);
    lockdown(options)
}

fn detach_network(options: &HostOptions) {
    if !options.full_isolation {
        return;
    }
    info!("detaching network namespace");
    if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
        warn!(error = %e, "unshare(CLONE_NEWNET) failed");
    }
}

fn apply_cpu_limit(options: &HostOptions) {
    let Some(seconds) = options.cpu_limit else {
        return;
    };
    info!(seconds, "setting CPU rlimit");
    if let Err(e) = setrlimit(Resource::RLIMIT_CPU, seconds, seconds) {
        error!(error = %e, "failed to set CPU rlimit");
    }
}

fn drop_credentials(options: &HostOptions) {
    // gid must be set before uid: once uid drops from root, the process
    // no longer has permission to change gid.
    if let Some(gid) = options.gid {
        info!(gid, "dropping to gid");
        if let Err(e) = setgid(Gid::from_raw(gid)) {
            error!(error = %e, "failed to set gid");
        }
    }
    if let Some(uid) = options.uid {
        info!(uid, "dropping to uid");
        if let Err(e) = setuid(Uid::from_raw(uid)) {
            error!(error = %e, "failed to set uid");
        }
    }
}

fn lockdown(options: &HostOptions) -> Result<(), String> {
    if !options.full_isolation {
        return Ok(());
    }
    info!("applying seccomp-bpf lockdown");
    let filter = build_filter().map_err(|e| format!("failed to build seccomp filter: {e}"))?;
    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| format!("failed to compile seccomp filter: {e}"))?;
    apply_filter(&program).map_err(|e| {
        let msg = format!("failed to apply seccomp filter: {e}");
        error!(error = %e, "seccomp lockdown failed");
        msg
    })
}

fn build_filter() -> Result<SeccompFilter, seccompiler::Error> {
    let mut rules = std::collections::BTreeMap::new();
    for syscall in allowed_syscalls() {
        rules.insert(syscall, Vec::<SeccompRule>::new());
    }
    SeccompFilter::new(
        rules,
        SeccompAction::Kill,
        SeccompAction::Allow,
        std::env::consts::ARCH.try_into()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filter_succeeds_on_this_target() {
        build_filter().expect("seccomp filter should build on supported architectures");
    }

    #[test]
    fn no_op_when_isolation_not_requested() {
        let options = HostOptions::default();
        apply(&options).expect("no-op isolation should never fail");
    }
}
