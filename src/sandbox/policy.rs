//! Isolation tier selection
//!
//! Maps the probed capability set to an isolation tier, once, at startup.
//! The policy is fail-closed: with no suitable tool the server must not
//! start. The only sanctioned relaxation is an explicit interactive
//! operator confirmation, which yields the unconfined fallback tier.

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::sandbox::capabilities::CapabilitySet;
use tracing::{info, warn};

/// Strength class of sandboxing guaranteed for this server run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationTier {
    /// Container-based isolation (docker/podman)
    Maximum,
    /// Namespace-sandbox isolation (firejail/bubblewrap)
    Strict,
    /// No isolation. Never selected automatically; reachable only via an
    /// explicit operator override at startup.
    Unconfined,
}

impl std::fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationTier::Maximum => write!(f, "maximum"),
            IsolationTier::Strict => write!(f, "strict"),
            IsolationTier::Unconfined => write!(f, "unconfined"),
        }
    }
}

/// Interactive confirmation seam for the reduced-guarantee override.
/// The binary wires this to a terminal prompt; tests use a double.
pub trait OverridePrompt {
    /// Ask the operator whether to run without any sandbox. Must only be
    /// called once, at startup.
    fn confirm_unsandboxed(&self) -> bool;
}

/// Select the strongest tier the host can guarantee.
pub fn select_tier(caps: &CapabilitySet) -> Result<IsolationTier> {
    if caps.has_container_runtime() {
        return Ok(IsolationTier::Maximum);
    }

    if caps.in_container {
        // Namespace tools are rarely usable inside a container; the
        // expected escape hatch is a mounted host runtime socket.
        return Err(Error::Config(
            "running inside a container but no container runtime is reachable; \
             mount the host runtime socket (e.g. /var/run/docker.sock) to enable sandboxing"
                .to_string(),
        ));
    }

    if caps.has_namespace_sandbox() {
        return Ok(IsolationTier::Strict);
    }

    Err(Error::Config(
        "no suitable sandboxing tool found (docker, podman, firejail, or bwrap); \
         the server cannot start securely"
            .to_string(),
    ))
}

/// Select a tier, falling back to an interactive operator override when no
/// tier can be guaranteed. A declined override is fatal.
pub fn select_tier_or_prompt(
    caps: &CapabilitySet,
    prompt: &dyn OverridePrompt,
) -> Result<IsolationTier> {
    match select_tier(caps) {
        Ok(tier) => {
            info!(%tier, "Isolation tier selected");
            Ok(tier)
        }
        Err(err) => {
            warn!("{err}");
            if prompt.confirm_unsandboxed() {
                warn!("Operator accepted reduced-guarantee mode: running UNSANDBOXED");
                Ok(IsolationTier::Unconfined)
            } else {
                Err(err)
            }
        }
    }
}

/// Frozen process-wide sandbox policy: tier, capabilities, and resource
/// caps, computed once at startup and passed explicitly to consumers.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub tier: IsolationTier,
    pub caps: CapabilitySet,
    pub limits: SandboxConfig,
}

impl SandboxPolicy {
    pub fn new(tier: IsolationTier, caps: CapabilitySet, limits: SandboxConfig) -> Self {
        SandboxPolicy { tier, caps, limits }
    }

    /// Human-readable startup report of the security posture.
    pub fn report(&self) -> String {
        format!(
            "tier={} docker={} podman={} firejail={} bwrap={} in_container={}",
            self.tier,
            self.caps.docker,
            self.caps.podman,
            self.caps.firejail,
            self.caps.bubblewrap,
            self.caps.in_container
        )
    }
}
