//! The namespace launcher (C5): the fork/unshare/idmap/mount/exec state
//! machine described in spec §4.5.
//!
//! Grounded on the `vibesrc-coop` sandbox namespace module's fork-plus-pipe
//! synchronization, adapted from a single fork into the double-fork needed
//! to make the container's init process PID 1 of its own pid namespace.
//! Three pipes carry the handshake: the outer child requests id mapping,
//! the launcher acks once `/proc/<pid>/{uid,gid}_map` are written, and the
//! outer child relays the inner child's host-visible pid back up.

mod idmap;
mod pre_exec;

pub use idmap::{IdRange, build_map, read_subid_ranges};

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, User, chdir, execvp, fork, getgid, getuid, pipe, read, write};

use crate::config::{ContainerConfig, NamespacesConfig};
use crate::error::{Error, Result};
use crate::mount::{self, MountPlan};
use crate::store::LayerStore;

/// The outcome of a successful `start`: the container init's pid as seen
/// from the caller's (host) pid namespace — this is what gets persisted to
/// `init.pid` by the lifecycle tracker.
#[derive(Debug, Clone, Copy)]
pub struct LaunchOutcome {
    /// Host-visible pid of the container's PID 1.
    pub host_pid: u32,
}

fn nsfail(e: impl std::fmt::Display) -> Error {
    Error::NamespaceSetupFailed(e.to_string())
}

/// Runs the launch state machine for `name` and records the resulting pid
/// in `store`. Fails with [`Error::AlreadyRunning`] if the layer has a live
/// `init.pid` already.
pub fn start(store: &LayerStore, name: &str) -> Result<LaunchOutcome> {
    if store.is_running(name)?.is_some() {
        return Err(Error::AlreadyRunning(name.to_owned()));
    }

    let chain = store.chain(name)?;
    let config = store.effective_config(name)?;
    let container = config.container()?;
    let namespaces = config.namespaces()?;
    let storage = config.storage()?;
    let plan = MountPlan::build(&chain, &storage)?;

    let outcome = launch(&plan, &container, &namespaces)?;
    store.set_running(name, outcome.host_pid)?;
    tracing::info!(layer = name, pid = outcome.host_pid, "started");
    Ok(outcome)
}

fn launch(
    plan: &MountPlan,
    container: &ContainerConfig,
    namespaces: &NamespacesConfig,
) -> Result<LaunchOutcome> {
    let (idmap_req_r, idmap_req_w) = pipe().map_err(nsfail)?;
    let (idmap_ack_r, idmap_ack_w) = pipe().map_err(nsfail)?;
    let (pid_r, pid_w) = pipe().map_err(nsfail)?;

    let owner_uid = getuid();
    let owner_gid = getgid();

    // Safety: until the outer child either exec's or exits, it calls only
    // async-signal-safe functions (nix syscall wrappers and plain
    // std::fs/std::env calls that don't allocate across a shared lock).
    match unsafe { fork() }.map_err(nsfail)? {
        ForkResult::Parent { child } => {
            drop(idmap_req_w);
            drop(idmap_ack_r);
            drop(pid_w);

            let mut ready = [0u8; 1];
            read(&idmap_req_r, &mut ready).map_err(nsfail)?;

            write_id_maps(child, owner_uid.as_raw(), owner_gid.as_raw())?;

            write(&idmap_ack_w, &[1]).map_err(nsfail)?;
            drop(idmap_ack_w);

            let mut pid_buf = [0u8; 4];
            read(&pid_r, &mut pid_buf).map_err(nsfail)?;
            let host_pid = u32::from_ne_bytes(pid_buf);
            if host_pid == 0 {
                return Err(Error::NamespaceSetupFailed(
                    "container launch failed before init pid was assigned".to_owned(),
                ));
            }
            Ok(LaunchOutcome { host_pid })
        }
        ForkResult::Child => {
            drop(idmap_req_r);
            drop(idmap_ack_w);
            drop(pid_r);
            outer_child(plan, container, namespaces, idmap_req_w, idmap_ack_r, pid_w)
        }
    }
}

/// Writes `/proc/<pid>/{setgroups,uid_map,gid_map}` for the outer child,
/// concatenating every subordinate range owned by the caller. Shared with
/// [`crate::import`]'s extraction namespace, which needs the same
/// subordinate-range mapping to preserve non-root tar entry ownership.
pub(crate) fn write_id_maps(child: Pid, owner_uid: u32, owner_gid: u32) -> Result<()> {
    let name = User::from_uid(nix::unistd::Uid::from_raw(owner_uid))
        .map_err(nsfail)?
        .map(|u| u.name)
        .unwrap_or_default();

    let uid_ranges = read_subid_ranges(Path::new("/etc/subuid"), &name, owner_uid)?;
    let gid_ranges = read_subid_ranges(Path::new("/etc/subgid"), &name, owner_uid)?;

    std::fs::write(format!("/proc/{}/setgroups", child.as_raw()), b"deny")?;
    std::fs::write(
        format!("/proc/{}/uid_map", child.as_raw()),
        build_map(owner_uid, &uid_ranges),
    )?;
    std::fs::write(
        format!("/proc/{}/gid_map", child.as_raw()),
        build_map(owner_gid, &gid_ranges),
    )?;
    Ok(())
}

/// The outer child: owns the new user/mount/uts/ipc/pid(/net) namespaces,
/// performs the mount plan and `pivot_root`, then forks the real init
/// process and waits for it. Never returns — every path ends the process.
fn outer_child(
    plan: &MountPlan,
    container: &ContainerConfig,
    namespaces: &NamespacesConfig,
    req_w: OwnedFd,
    ack_r: OwnedFd,
    pid_w: OwnedFd,
) -> ! {
    match outer_child_inner(plan, container, namespaces, &req_w, &ack_r, &pid_w) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "container launch failed");
            let _ = write(&pid_w, &0u32.to_ne_bytes());
            std::process::exit(1);
        }
    }
}

fn outer_child_inner(
    plan: &MountPlan,
    container: &ContainerConfig,
    namespaces: &NamespacesConfig,
    req_w: &OwnedFd,
    ack_r: &OwnedFd,
    pid_w: &OwnedFd,
) -> Result<()> {
    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID;
    if !namespaces.net_host {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    unshare(flags).map_err(nsfail)?;

    write(req_w, &[1]).map_err(nsfail)?;
    let mut ack = [0u8; 1];
    read(ack_r, &mut ack).map_err(nsfail)?;

    // Keep this process tied to the launcher: if the launcher dies before
    // the init process exists, this intermediate process (and the pid
    // namespace it owns) should not linger.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
    }

    mount::make_private()?;
    mount::mount_overlay(plan)?;
    mount::pivot_root(&plan.merged)?;
    mount::mount_aux(plan.ephemeral_tmpfs.as_deref())?;
    mount::unmount_old_root()?;

    if let Some(hostname) = &container.hostname {
        nix::unistd::sethostname(hostname).map_err(nsfail)?;
    }

    // Safety: forking here is sound for the same reason as the outer fork
    // above — the child immediately either execs or exits.
    match unsafe { fork() }.map_err(nsfail)? {
        ForkResult::Parent { child } => {
            write(pid_w, &(child.as_raw() as u32).to_ne_bytes()).map_err(nsfail)?;
            let _ = waitpid(child, None);
            Ok(())
        }
        ForkResult::Child => init_process(container),
    }
}

/// The container's PID 1. Drops capabilities, closes inherited descriptors,
/// applies environment/workdir/user, then `execve`s the configured command.
/// Never returns on success (the process image is replaced); on any setup
/// failure it exits with 127, matching the shell convention for "command
/// could not be invoked".
fn init_process(container: &ContainerConfig) -> ! {
    pre_exec::close_inherited_fds(pre_exec::MAX_PROBE_FD);
    pre_exec::drop_all_capabilities();

    if let Some(dir) = &container.workdir {
        if chdir(dir.as_str()).is_err() {
            std::process::exit(127);
        }
    }

    if let Some((uid, gid)) = container.user {
        let gid = nix::unistd::Gid::from_raw(gid.unwrap_or(uid));
        let uid = nix::unistd::Uid::from_raw(uid);
        if nix::unistd::setresgid(gid, gid, gid).is_err()
            || nix::unistd::setresuid(uid, uid, uid).is_err()
        {
            std::process::exit(127);
        }
    }

    for entry in &container.env {
        if let Some((k, v)) = entry.split_once('=') {
            // Safety: single-threaded child process, before execve.
            unsafe { std::env::set_var(k, v) };
        }
    }

    let Ok(argv): std::result::Result<Vec<CString>, _> = container
        .command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect()
    else {
        std::process::exit(127);
    };
    let Some(prog) = argv.first() else {
        std::process::exit(127);
    };

    let _ = execvp(prog, &argv);
    std::process::exit(127);
}
