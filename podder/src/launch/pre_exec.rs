//! Pre-`execve` hardening for the container's init process (spec §4.5,
//! final step).
//!
//! Adapted from the teacher's `bux::jail::pre_exec`: close every inherited
//! file descriptor above stderr so the container's init never leaks a pipe
//! or socket from the launcher, then drop the full bounding capability set
//! since an unprivileged launch has nothing to retain.

use std::os::fd::RawFd;

use nix::unistd::close;

/// Highest fd number worth probing when closing inherited descriptors.
/// `/proc/self/fd` isn't available this early — nothing is mounted on
/// `/proc` yet — so a fixed ceiling well above any plausible launcher fd
/// count is used instead.
pub const MAX_PROBE_FD: RawFd = 256;

/// Closes every open file descriptor in `3..max_fd`. Errors are ignored: an
/// already-closed descriptor is not a failure.
pub fn close_inherited_fds(max_fd: RawFd) {
    for fd in 3..max_fd {
        let _ = close(fd);
    }
}

/// Drops every capability from the bounding set. Unlike [`close_inherited_fds`]
/// this can legitimately fail only if the kernel doesn't recognise a given
/// capability number, which is expected on older kernels and is not an
/// error worth propagating.
pub fn drop_all_capabilities() {
    for cap in 0..=63i32 {
        unsafe {
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }
}
