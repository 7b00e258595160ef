//! Host capability probing
//!
//! Read-only detection of the isolation primitives available on this host.
//! Absence of a tool is a valid, expected result, never an error. The set is
//! computed once at startup and frozen for the process lifetime.

use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Isolation primitives detected on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    /// `docker` on the search path
    pub docker: bool,
    /// `podman` on the search path
    pub podman: bool,
    /// `firejail` on the search path
    pub firejail: bool,
    /// `bwrap` (bubblewrap) on the search path
    pub bubblewrap: bool,
    /// `systemd-run` on the search path
    pub systemd_run: bool,
    /// The server itself appears to run inside a container
    pub in_container: bool,
    /// Passwordless sudo works (privileged no-op succeeds)
    pub can_sudo: bool,
}

impl CapabilitySet {
    /// Probe the host. Pure reads: PATH lookups, marker files, one
    /// privileged no-op.
    pub fn probe() -> Self {
        let caps = CapabilitySet {
            docker: tool_available("docker"),
            podman: tool_available("podman"),
            firejail: tool_available("firejail"),
            bubblewrap: tool_available("bwrap"),
            systemd_run: tool_available("systemd-run"),
            in_container: running_in_container(),
            can_sudo: sudo_noop(),
        };
        debug!(?caps, "Probed host capabilities");
        caps
    }

    /// Any container runtime present
    pub fn has_container_runtime(&self) -> bool {
        self.docker || self.podman
    }

    /// Any namespace-sandbox tool present
    pub fn has_namespace_sandbox(&self) -> bool {
        self.firejail || self.bubblewrap
    }

    /// Runtime binary to drive the container tier with (docker preferred)
    pub fn container_runtime(&self) -> Option<&'static str> {
        if self.docker {
            Some("docker")
        } else if self.podman {
            Some("podman")
        } else {
            None
        }
    }
}

fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

fn running_in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }

    match std::fs::read_to_string("/proc/1/cgroup") {
        Ok(content) => cgroup_mentions_container(&content),
        Err(_) => false,
    }
}

/// Whether a cgroup listing names a container runtime.
pub(crate) fn cgroup_mentions_container(content: &str) -> bool {
    ["docker", "kubepods", "containerd"]
        .iter()
        .any(|marker| content.contains(marker))
}

fn sudo_noop() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_never_fails() {
        // Probing is side-effect free and must succeed on any host,
        // whatever is or is not installed.
        let caps = CapabilitySet::probe();
        if caps.docker {
            assert_eq!(caps.container_runtime(), Some("docker"));
        }
    }

    #[test]
    fn test_cgroup_detection() {
        assert!(cgroup_mentions_container(
            "12:pids:/docker/6f9a1c\n11:memory:/docker/6f9a1c"
        ));
        assert!(cgroup_mentions_container("1:name=systemd:/kubepods/pod42"));
        assert!(!cgroup_mentions_container("1:name=systemd:/init.scope"));
    }

    #[test]
    fn test_runtime_preference() {
        let caps = CapabilitySet {
            docker: true,
            podman: true,
            ..Default::default()
        };
        assert_eq!(caps.container_runtime(), Some("docker"));

        let caps = CapabilitySet {
            podman: true,
            ..Default::default()
        };
        assert_eq!(caps.container_runtime(), Some("podman"));
        assert_eq!(CapabilitySet::default().container_runtime(), None);
    }
}
