//! Sandbox module - Tiered isolation for untrusted student code
//!
//! Provides two guaranteed tiers of sandboxing:
//! - Maximum: ephemeral containers (docker/podman), fully isolated
//! - Strict: namespace sandbox (firejail/bubblewrap) invocations
//!
//! A third, unconfined fallback exists only behind an explicit operator
//! override at startup. Tier selection is fail-closed and frozen for the
//! process lifetime.

mod capabilities;
mod container;
mod ns_sandbox;
mod policy;

pub use capabilities::CapabilitySet;
pub use policy::{
    select_tier, select_tier_or_prompt, IsolationTier, OverridePrompt, SandboxPolicy,
};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// One compile or run invocation: workspace, access mode, and resource
/// caps. Created per invocation and discarded after teardown.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    /// Staged workspace directory on the host
    pub workspace: PathBuf,
    /// Mount/copy the workspace read-only (run sessions)
    pub read_only: bool,
    /// Resource caps for this invocation
    pub limits: SandboxConfig,
    /// Wall-clock deadline for the invocation
    pub deadline: Duration,
    /// Attach a terminal to the invocation (PTY-backed runs)
    pub interactive: bool,
}

impl SandboxSession {
    /// Writable session for a compile step.
    pub fn compile(workspace: &Path, limits: &SandboxConfig) -> Self {
        SandboxSession {
            workspace: workspace.to_path_buf(),
            read_only: false,
            limits: limits.clone(),
            deadline: limits.compile_timeout,
            interactive: false,
        }
    }

    /// Read+execute-only session for a run step.
    pub fn run(workspace: &Path, limits: &SandboxConfig, deadline: Duration) -> Self {
        SandboxSession {
            workspace: workspace.to_path_buf(),
            read_only: true,
            limits: limits.clone(),
            deadline,
            interactive: false,
        }
    }

    /// Request a terminal for the invocation. Under the container tier
    /// this makes the exec allocate a TTY so line-buffered stdio and
    /// window resizes behave like a real terminal.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

/// An assembled, not-yet-started isolated invocation. The builder never
/// executes the target; the caller starts, times out, and reaps it, then
/// runs the teardown exactly once.
#[derive(Debug)]
pub struct SandboxedCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    /// Post-invocation cleanup handle
    pub teardown: Teardown,
}

impl SandboxedCommand {
    /// Spawnable `tokio` command for batch execution.
    pub fn tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawnable PTY command for interactive execution.
    pub fn pty_command(&self) -> portable_pty::CommandBuilder {
        let mut cmd = portable_pty::CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        cmd
    }

    #[cfg(test)]
    pub(crate) fn argv(&self) -> (&str, &[String]) {
        (&self.program, &self.args)
    }
}

/// Cleanup for a sandboxed invocation. Running it is unconditional,
/// idempotent, and required on every exit path, including cancellation.
#[derive(Debug)]
pub struct Teardown {
    kind: TeardownKind,
    done: bool,
}

#[derive(Debug)]
enum TeardownKind {
    /// Namespace sandbox and unconfined invocations leave nothing behind
    None,
    /// Container tier: copy the workspace back out (rw sessions only),
    /// then force-remove the container
    Container {
        runtime: &'static str,
        name: String,
        workspace: PathBuf,
        copy_back: bool,
    },
}

impl Teardown {
    fn none() -> Self {
        Teardown {
            kind: TeardownKind::None,
            done: false,
        }
    }

    fn container(runtime: &'static str, name: String, workspace: PathBuf, copy_back: bool) -> Self {
        Teardown {
            kind: TeardownKind::Container {
                runtime,
                name,
                workspace,
                copy_back,
            },
            done: false,
        }
    }

    /// Run the cleanup. Subsequent calls are no-ops.
    pub async fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let TeardownKind::Container {
            runtime,
            name,
            workspace,
            copy_back,
        } = &self.kind
        {
            if *copy_back {
                if let Err(err) = container::copy_back(runtime, name, workspace).await {
                    warn!(container = %name, "Workspace copy-back failed: {err}");
                }
            }
            if let Err(err) = container::remove(runtime, name).await {
                warn!(container = %name, "Container removal failed: {err}");
            }
        }
    }
}

/// Build an isolated command for the frozen tier. For the container tier
/// this provisions a fresh uniquely-named container (one per invocation,
/// never reused) before returning the exec description.
pub async fn build_command(
    policy: &SandboxPolicy,
    session: &SandboxSession,
    executable: &str,
    args: &[String],
) -> Result<SandboxedCommand> {
    match policy.tier {
        IsolationTier::Maximum => {
            let runtime = policy.caps.container_runtime().ok_or_else(|| {
                Error::Provision("container tier selected but no runtime available".to_string())
            })?;
            let name = container::provision(runtime, session).await?;
            let exec = container::exec_args(
                &name,
                &session.workspace,
                session.interactive,
                executable,
                args,
            );
            Ok(SandboxedCommand {
                program: runtime.to_string(),
                args: exec,
                cwd: None,
                teardown: Teardown::container(
                    runtime,
                    name,
                    session.workspace.clone(),
                    !session.read_only,
                ),
            })
        }
        IsolationTier::Strict => {
            let (program, args) = if policy.caps.firejail {
                ("firejail", ns_sandbox::firejail_args(session, executable, args))
            } else if policy.caps.bubblewrap {
                ("bwrap", ns_sandbox::bwrap_args(session, executable, args))
            } else {
                return Err(Error::Provision(
                    "strict tier selected but no namespace sandbox tool available".to_string(),
                ));
            };
            Ok(SandboxedCommand {
                program: program.to_string(),
                args,
                cwd: Some(session.workspace.clone()),
                teardown: Teardown::none(),
            })
        }
        IsolationTier::Unconfined => Ok(SandboxedCommand {
            program: executable.to_string(),
            args: args.to_vec(),
            cwd: Some(session.workspace.clone()),
            teardown: Teardown::none(),
        }),
    }
}
