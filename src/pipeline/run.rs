//! Pipeline driver: stage, compile, validate, run, analyze

use crate::critique::CodeCritic;
use crate::error::Error;
use crate::pipeline::{decode_exit, CompileRequest, CompileResponse};
use crate::sandbox::{build_command, SandboxPolicy, SandboxSession};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Canned analysis when the critique service is unreachable
pub const FALLBACK_COMPILE_ANALYSIS: &str = "===Analysis===\n# Compiler Error\n\n\
    A detailed explanation could not be generated right now. \
    Please check the compiler message above.";

/// Canned analysis for runtime failures
pub const FALLBACK_RUNTIME_ANALYSIS: &str = "===Analysis===\n# Runtime Error\n\n\
    The program compiled but failed while running. Check for division by \
    zero, invalid memory access, or infinite loops.";

/// Canned analysis for successful runs
pub const FALLBACK_SUCCESS_ANALYSIS: &str = "===Analysis===\n# Code Analysis\n\n\
    A detailed analysis could not be generated right now. \
    The program compiled and ran successfully.";

/// Run the full batch pipeline for one submission. Every failure mode is
/// contained to this request; the response always carries exactly one
/// primary outcome.
pub async fn compile_and_run(
    policy: &SandboxPolicy,
    critic: &dyn CodeCritic,
    req: &CompileRequest,
) -> CompileResponse {
    info!("Starting compilation pipeline");

    // Stage
    let workspace = match tempfile::Builder::new()
        .prefix("clabd-compile-")
        .tempdir_in(crate::config::workspace_root())
    {
        Ok(dir) => dir,
        Err(err) => {
            warn!("Failed to create workspace: {err}");
            return CompileResponse::failure("failed to create temp dir");
        }
    };
    let src_path = workspace.path().join("program.c");
    let bin_path = workspace.path().join("program");

    if let Err(err) = tokio::fs::write(&src_path, &req.code).await {
        warn!("Failed to write source file: {err}");
        return CompileResponse::failure("failed to write source");
    }
    debug!(path = %src_path.display(), "Source staged");

    // Compile
    let compile_session = SandboxSession::compile(workspace.path(), &policy.limits);
    let gcc_args = vec![
        src_path.display().to_string(),
        "-o".to_string(),
        bin_path.display().to_string(),
        "-Wall".to_string(),
        "-Wextra".to_string(),
    ];
    let mut compile_cmd = match build_command(policy, &compile_session, "gcc", &gcc_args).await {
        Ok(cmd) => cmd,
        Err(err) => {
            warn!("Failed to create compile sandbox: {err}");
            return CompileResponse::failure(
                "server security configuration error creating compile sandbox",
            );
        }
    };

    let compiled = capture(&mut compile_cmd.tokio_command(), None, compile_session.deadline).await;
    compile_cmd.teardown.run().await;

    let compile_out = match compiled {
        Capture::Finished { status, output } if status.success() => output,
        Capture::Finished { output, .. } => {
            warn!("Compilation failed");
            let analysis = critic
                .critique(&req.code, &output)
                .await
                .unwrap_or_else(|err| {
                    warn!("Critique call failed: {err}");
                    FALLBACK_COMPILE_ANALYSIS.to_string()
                });
            return CompileResponse {
                error: output,
                analysis,
                ..Default::default()
            };
        }
        Capture::TimedOut => {
            return timeout_response("compilation", compile_session.deadline);
        }
        Capture::SpawnFailed(err) => {
            warn!("Compiler did not start: {err}");
            return CompileResponse::failure("failed to invoke compiler");
        }
    };
    if !compile_out.is_empty() {
        debug!("Compiler warnings: {compile_out}");
    }

    // ValidateBinary: the artifact must live in the staged workspace and
    // be executable, whatever the sandbox backend did with the path.
    if let Err(err) = validate_binary(&bin_path, workspace.path()) {
        warn!("Executable validation failed: {err}");
        return CompileResponse::failure(format!("Executable validation failed: {err}"));
    }

    // Run
    let deadline = req.run_deadline(policy.limits.run_timeout);
    let run_session = SandboxSession::run(workspace.path(), &policy.limits, deadline);
    let mut run_cmd =
        match build_command(policy, &run_session, &bin_path.display().to_string(), &[]).await {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("Failed to create run sandbox: {err}");
                return CompileResponse::failure(
                    "server security configuration error creating execution sandbox",
                );
            }
        };

    let ran = capture(&mut run_cmd.tokio_command(), req.stdin_data(), deadline).await;
    // Teardown is unconditional: it also force-kills anything the timeout
    // path left behind in a container.
    run_cmd.teardown.run().await;

    // Analyze
    match ran {
        Capture::Finished { status, output } if status.success() => {
            let analysis = critic
                .critique(&req.code, &output)
                .await
                .unwrap_or_else(|err| {
                    warn!("Critique call failed: {err}");
                    FALLBACK_SUCCESS_ANALYSIS.to_string()
                });
            info!(len = output.len(), "Program executed successfully");
            CompileResponse {
                output,
                analysis,
                ..Default::default()
            }
        }
        Capture::Finished { status, output } => {
            let mut error = output;
            if let Some(suffix) = decode_exit(&status) {
                error.push_str("\r\n");
                error.push_str(suffix);
            }
            if error.is_empty() {
                error = format!("program exited with {status}");
            }
            let analysis = critic
                .critique(&req.code, &error)
                .await
                .unwrap_or_else(|err| {
                    warn!("Critique call failed: {err}");
                    FALLBACK_RUNTIME_ANALYSIS.to_string()
                });
            CompileResponse {
                error,
                analysis,
                ..Default::default()
            }
        }
        Capture::TimedOut => timeout_response("execution", deadline),
        Capture::SpawnFailed(err) => {
            warn!("Program did not start: {err}");
            CompileResponse::failure("failed to start program")
        }
    }
}

/// Refuse to execute an artifact outside the ephemeral workspace or
/// without an executable bit. Guards against a compromised sandbox
/// backend redirecting the output path.
pub(crate) fn validate_binary(bin_path: &Path, workspace: &Path) -> crate::error::Result<()> {
    let canonical = bin_path
        .canonicalize()
        .map_err(|e| Error::InvalidInput(format!("cannot stat executable: {e}")))?;
    let root = workspace.canonicalize()?;
    if !canonical.starts_with(&root) {
        return Err(Error::InvalidInput(
            "executable must reside in the staging workspace".to_string(),
        ));
    }

    let meta = std::fs::metadata(&canonical)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::InvalidInput("file is not executable".to_string()));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    Ok(())
}

/// Uniform response for a pipeline stage that blew its wall-clock budget.
fn timeout_response(stage: &str, deadline: std::time::Duration) -> CompileResponse {
    let err = Error::Timeout(format!("{stage} exceeded {}s", deadline.as_secs()));
    CompileResponse::failure(err.to_string())
}

enum Capture {
    Finished {
        status: std::process::ExitStatus,
        output: String,
    },
    TimedOut,
    SpawnFailed(std::io::Error),
}

/// Spawn, feed stdin, and capture merged output under a wall-clock
/// deadline. The stdin feed runs concurrently with the wait so a child
/// that never reads cannot wedge the deadline. On timeout the whole
/// process group is signalled; container-tier teardown sweeps up the rest.
async fn capture(
    cmd: &mut tokio::process::Command,
    stdin_data: Option<String>,
    deadline: std::time::Duration,
) -> Capture {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return Capture::SpawnFailed(err),
    };
    let pid = child.id();
    let mut stdin = child.stdin.take();

    // Closing stdin is unconditional: the child must see EOF even when
    // there is nothing to feed, or a `read` loop would block forever.
    let feed = async {
        if let (Some(data), Some(pipe)) = (stdin_data, stdin.as_mut()) {
            if let Err(err) = pipe.write_all(data.as_bytes()).await {
                debug!("stdin write failed: {err}");
            }
        }
        drop(stdin.take());
    };
    let run = async {
        let (_, out) = tokio::join!(feed, child.wait_with_output());
        out
    };

    match tokio::time::timeout(deadline, run).await {
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            Capture::Finished {
                status: out.status,
                output,
            }
        }
        Ok(Err(err)) => Capture::SpawnFailed(err),
        Err(_) => {
            warn!("Execution timed out after {deadline:?}");
            // kill_on_drop only reaches the direct child; a shell that
            // forked grandchildren needs the whole group signalled.
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            Capture::TimedOut
        }
    }
}

/// Signal the process group rooted at `pid`. The sandbox commands are
/// spawned with `process_group(0)`, so the group id equals the child pid.
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let _ = tokio::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .output()
        .await;
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}
