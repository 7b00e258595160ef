//! Container-based isolation (Maximum tier)
//!
//! Drives docker or podman through its CLI so the same flow works with a
//! mounted host socket from inside a container. Each invocation gets a
//! fresh, uniquely-named container: create with a long-lived placeholder
//! process, copy the workspace in, lock permissions, then exec the target
//! as an unprivileged numeric user. The container identifier lives for
//! exactly one invocation and is never reused.

use crate::error::{Error, Result};
use crate::sandbox::SandboxSession;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Unprivileged numeric user the target runs as (nobody)
const SANDBOX_USER: &str = "65534:65534";

/// Placeholder keeps the container alive between create and exec; it is
/// force-removed on teardown long before this expires.
const PLACEHOLDER_CMD: [&str; 2] = ["sleep", "86400"];

/// Arguments for creating the invocation's container.
pub(super) fn create_args(name: &str, session: &SandboxSession) -> Vec<String> {
    let limits = &session.limits;
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network=none".to_string(),
        format!("--memory={}m", limits.max_memory_mb),
        format!("--cpus={:.2}", f64::from(limits.max_cpu_percent) / 100.0),
        "--security-opt=no-new-privileges".to_string(),
        "--cap-drop=ALL".to_string(),
        format!("--pids-limit={}", limits.max_processes),
        limits.container_image.clone(),
    ];
    args.extend(PLACEHOLDER_CMD.iter().map(|s| s.to_string()));
    args
}

/// Arguments for executing the target inside the provisioned container.
pub(super) fn exec_args(
    name: &str,
    workspace: &Path,
    interactive: bool,
    executable: &str,
    args: &[String],
) -> Vec<String> {
    let mut exec = vec!["exec".to_string(), "-i".to_string()];
    // PTY-backed runs need a TTY inside the container too, or the target
    // sees a pipe and block-buffers its stdio.
    if interactive {
        exec.push("-t".to_string());
    }
    exec.extend([
        "-u".to_string(),
        SANDBOX_USER.to_string(),
        "-w".to_string(),
        workspace.display().to_string(),
        name.to_string(),
        executable.to_string(),
    ]);
    exec.extend_from_slice(args);
    exec
}

/// Start a fresh container and stage the session workspace inside it.
/// Any failure removes the partially-provisioned container before
/// returning.
pub(super) async fn provision(runtime: &'static str, session: &SandboxSession) -> Result<String> {
    let name = format!("clabd-sandbox-{}", uuid::Uuid::new_v4());
    let workspace = session.workspace.display().to_string();

    run_runtime(runtime, &create_args(&name, session))
        .await
        .map_err(|e| Error::Provision(format!("failed to start sandbox container: {e}")))?;
    debug!(container = %name, "Created sandbox container");

    let staged = stage_workspace(runtime, &name, session, &workspace).await;
    if let Err(err) = staged {
        let _ = remove(runtime, &name).await;
        return Err(err);
    }

    Ok(name)
}

async fn stage_workspace(
    runtime: &str,
    name: &str,
    session: &SandboxSession,
    workspace: &str,
) -> Result<()> {
    // Placeholder runs unprivileged; root is needed to create the
    // workspace path and set its mode.
    run_runtime(
        runtime,
        &[
            "exec".into(),
            "-u".into(),
            "root".into(),
            name.into(),
            "mkdir".into(),
            "-p".into(),
            workspace.into(),
        ],
    )
    .await
    .map_err(|e| Error::Provision(format!("failed to create workspace dir: {e}")))?;

    run_runtime(
        runtime,
        &[
            "cp".into(),
            format!("{workspace}/."),
            format!("{name}:{workspace}"),
        ],
    )
    .await
    .map_err(|e| Error::Provision(format!("failed to copy workspace: {e}")))?;

    // 777 lets the compiler write its artifact; 555 locks a run session to
    // read+execute so the program cannot modify or create files.
    let perms = if session.read_only { "555" } else { "777" };
    run_runtime(
        runtime,
        &[
            "exec".into(),
            "-u".into(),
            "root".into(),
            name.into(),
            "chmod".into(),
            "-R".into(),
            perms.into(),
            workspace.into(),
        ],
    )
    .await
    .map_err(|e| Error::Provision(format!("failed to set workspace permissions: {e}")))?;

    Ok(())
}

/// Copy the workspace back to the host to preserve compiler artifacts.
pub(super) async fn copy_back(runtime: &str, name: &str, workspace: &Path) -> Result<()> {
    let workspace = workspace.display().to_string();
    run_runtime(
        runtime,
        &[
            "cp".into(),
            "-a".into(),
            format!("{name}:{workspace}/."),
            workspace,
        ],
    )
    .await
}

/// Forcibly remove the invocation's container.
pub(super) async fn remove(runtime: &str, name: &str) -> Result<()> {
    run_runtime(runtime, &["rm".into(), "-f".into(), name.into()]).await?;
    debug!(container = %name, "Removed sandbox container");
    Ok(())
}

async fn run_runtime(runtime: &str, args: &[String]) -> Result<()> {
    let output = Command::new(runtime)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Provision(format!("{runtime} not runnable: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Provision(format!(
            "{runtime} {} exited with {}: {}",
            args.first().map(String::as_str).unwrap_or(""),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::path::PathBuf;

    fn session(read_only: bool) -> SandboxSession {
        SandboxSession {
            workspace: PathBuf::from("/tmp/clabd-ws"),
            read_only,
            limits: SandboxConfig::default(),
            deadline: std::time::Duration::from_secs(10),
            interactive: false,
        }
    }

    #[test]
    fn test_create_args_enforce_isolation() {
        let args = create_args("clabd-sandbox-test", &session(false));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--security-opt=no-new-privileges".to_string()));
        assert!(args.contains(&"--memory=128m".to_string()));
        assert!(args.contains(&"--pids-limit=64".to_string()));
        assert!(args.contains(&"--cpus=0.50".to_string()));
        // Placeholder process keeps the container alive for the exec
        assert_eq!(args.last().unwrap(), "86400");
    }

    #[test]
    fn test_exec_runs_as_nobody_in_workspace() {
        let args = exec_args(
            "clabd-sandbox-test",
            Path::new("/tmp/clabd-ws"),
            false,
            "./program",
            &[],
        );
        assert_eq!(
            args,
            vec![
                "exec",
                "-i",
                "-u",
                "65534:65534",
                "-w",
                "/tmp/clabd-ws",
                "clabd-sandbox-test",
                "./program"
            ]
        );
    }

    #[test]
    fn test_exec_appends_target_args() {
        let args = exec_args(
            "c1",
            Path::new("/w"),
            false,
            "gcc",
            &["main.c".to_string(), "-o".to_string(), "program".to_string()],
        );
        assert_eq!(&args[args.len() - 3..], ["main.c", "-o", "program"]);
    }

    #[test]
    fn test_interactive_exec_allocates_a_tty() {
        let args = exec_args("c1", Path::new("/w"), true, "./program", &[]);
        assert_eq!(&args[..3], ["exec", "-i", "-t"]);

        let batch = exec_args("c1", Path::new("/w"), false, "./program", &[]);
        assert!(!batch.contains(&"-t".to_string()));
    }
}
