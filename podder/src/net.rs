//! Macvlan helper invocation (spec §4.4/§6 "network").
//!
//! podder never manipulates network interfaces itself — that needs
//! `CAP_NET_ADMIN` in the host's network namespace, which an unprivileged
//! launcher doesn't have. Instead it shells out to an external helper
//! binary that is expected to already carry that capability (or run under
//! sudo/polkit), following the same "external collaborator" pattern the
//! spec uses for the CLI boundary.

use std::path::PathBuf;
use std::process::Command;

use crate::config::NetworkConfig;
use crate::error::Result;

/// Environment variable naming the macvlan helper binary, overriding the
/// built-in default path.
pub const HELPER_ENV: &str = "PODDER_MACVLAN_HELPER";

/// Default helper binary name, resolved via `PATH`.
const DEFAULT_HELPER: &str = "podder-macvlan-helper";

fn helper_path() -> PathBuf {
    std::env::var_os(HELPER_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER))
}

/// Invokes the macvlan helper for `pid`'s network namespace, if
/// `network.macvlan` names an interface. A non-zero helper exit is logged
/// and swallowed, not propagated: per spec, a failed network attachment
/// leaves the container running without that interface rather than
/// tearing the whole launch down.
pub fn attach(network: &NetworkConfig, pid: u32) -> Result<()> {
    let Some(interface) = &network.macvlan else {
        return Ok(());
    };

    let mut cmd = Command::new(helper_path());
    cmd.arg(interface).arg(pid.to_string());
    if let Some(mac) = &network.macvlan_mac {
        cmd.arg(mac);
    }

    match cmd.status() {
        Ok(status) if status.success() => {
            tracing::info!(interface, pid, "attached macvlan interface");
        }
        Ok(status) => {
            tracing::warn!(
                interface,
                pid,
                code = status.code(),
                "macvlan helper exited non-zero"
            );
        }
        Err(e) => {
            tracing::warn!(interface, pid, error = %e, "failed to run macvlan helper");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_is_a_no_op_without_a_configured_interface() {
        let network = NetworkConfig::default();
        attach(&network, 1234).unwrap();
    }

    #[test]
    fn helper_path_honors_env_override() {
        unsafe { std::env::set_var(HELPER_ENV, "/usr/local/bin/custom-helper") };
        assert_eq!(helper_path(), PathBuf::from("/usr/local/bin/custom-helper"));
        unsafe { std::env::remove_var(HELPER_ENV) };
    }
}
