//! podder: a minimal, unprivileged, layer-based container runtime for
//! Linux.
//!
//! This crate implements the layer store (C1), mount planner (C4),
//! namespace launcher (C5), and lifecycle tracking (C6, folded into the
//! store — see `DESIGN.md`) in-process; registry access (C2) lives in
//! `podder-oci`, and image import (C3) bridges the two in [`import`].

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod import;
#[cfg(unix)]
pub mod launch;
#[cfg(unix)]
pub mod mount;
#[cfg(unix)]
pub mod net;
pub mod store;

pub use error::{Error, Result};
pub use store::{Layer, LayerStore, LayerSummary};

/// Status of one layer, as reported by [`status`].
#[derive(Debug, Clone)]
pub struct Status {
    /// The layer's name.
    pub name: String,
    /// Its immediate parent, if any.
    pub parent: Option<String>,
    /// The host-visible pid of its container init, if currently running.
    pub running_pid: Option<u32>,
}

/// Creates a new layer, optionally stacked on `parent`.
pub fn create(store: &LayerStore, name: &str, parent: Option<&str>) -> Result<Layer> {
    store.create(name, parent, None)
}

/// Removes a layer. Fails if it is running or has children.
pub fn rm(store: &LayerStore, name: &str) -> Result<()> {
    store.remove(name)
}

/// Lists every layer in the store.
pub fn list(store: &LayerStore) -> Result<Vec<LayerSummary>> {
    store.list()
}

/// Reports a single layer's status.
pub fn status(store: &LayerStore, name: &str) -> Result<Status> {
    let layer = store.resolve(name)?;
    Ok(Status {
        name: layer.name().to_owned(),
        parent: layer.parent_name()?,
        running_pid: store.is_running(name)?,
    })
}

/// Pulls an OCI image reference into the store under `name`.
#[cfg(unix)]
pub async fn pull(
    store: &LayerStore,
    client: &podder_oci::Client,
    reference: &str,
    name: &str,
) -> Result<Layer> {
    import::pull(store, client, reference, name).await
}

/// Starts `name`'s container: builds the mount plan, launches the
/// namespace pipeline, records the resulting pid, and attaches any
/// configured macvlan interface.
#[cfg(unix)]
pub fn start(store: &LayerStore, name: &str) -> Result<launch::LaunchOutcome> {
    let outcome = launch::start(store, name)?;
    let config = store.effective_config(name)?;
    net::attach(&config.network(), outcome.host_pid)?;
    Ok(outcome)
}

/// Default grace period `stop` waits for `signal` to take effect before
/// escalating to `SIGKILL` (spec §4.6).
#[cfg(unix)]
pub const DEFAULT_STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Interval between liveness polls while waiting out a `stop` timeout.
#[cfg(unix)]
const STOP_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Stops `name`'s running container: sends `signal` (default `SIGTERM`) to
/// the init PID, polls for exit until `timeout` elapses, escalates to
/// `SIGKILL` and waits again, then clears `init.pid` — only once the
/// process is confirmed gone, so a concurrent `status` never sees an empty
/// pid file for a container that is still alive (spec §4.6).
#[cfg(unix)]
pub fn stop(
    store: &LayerStore,
    name: &str,
    signal: nix::sys::signal::Signal,
    timeout: std::time::Duration,
) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = store.is_running(name)? else {
        return store.clear_running(name);
    };
    let raw_pid = Pid::from_raw(pid as libc::pid_t);

    kill(raw_pid, signal).ok();
    if wait_for_exit(store, name, timeout)? {
        return store.clear_running(name);
    }

    tracing::warn!(layer = name, pid, "did not exit within timeout, sending SIGKILL");
    kill(raw_pid, Signal::SIGKILL).ok();
    wait_for_exit(store, name, DEFAULT_STOP_TIMEOUT)?;
    store.clear_running(name)
}

/// Polls `store.is_running` until it reports the layer stopped or
/// `timeout` elapses. Returns whether the process exited.
#[cfg(unix)]
fn wait_for_exit(store: &LayerStore, name: &str, timeout: std::time::Duration) -> Result<bool> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if store.is_running(name)?.is_none() {
            return Ok(true);
        }
        if std::time::Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
}
