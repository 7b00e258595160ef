//! Per-connection interactive session
//!
//! Each WebSocket connection runs two loops: the inbound loop decodes
//! control frames, the outbound loop drains the per-client channel into
//! the socket. A run sequence is spawned off the inbound loop so control
//! messages stay responsive while a program executes under its PTY.
//! The attached PTY and subprocess are one owned resource, released on
//! every exit path: normal exit, explicit stop, or connection drop.

use crate::config::SessionConfig;
use crate::critique::CodeCritic;
use crate::hub::protocol::{
    ControlMessage, EventFrame, Identity, MonitorEvent, MonitorFrame,
};
use crate::hub::{ClientHandle, Hub, Outbound};
use crate::pipeline::{decode_exit_code, MAX_WALL_CLOCK};
use crate::sandbox::{build_command, SandboxPolicy, SandboxSession};
use crate::storage::{record_run_logged, ExerciseContext, RunRecord, RunStore};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, Child, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared collaborators every connection needs
#[derive(Clone)]
pub struct SessionDeps {
    pub hub: Hub,
    pub policy: Arc<SandboxPolicy>,
    pub critic: Arc<dyn CodeCritic>,
    pub store: Arc<dyn RunStore>,
    pub config: SessionConfig,
}

/// The PTY-backed subprocess attached to a connection. At most one is
/// live per client; attaching a new one first kills the old.
#[derive(Default)]
struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    /// Bumped on every attach so a stale run sequence never clears the
    /// handles of its successor.
    generation: u64,
}

impl PtySession {
    /// Kill and reap the attached child. Waiting here is what keeps a
    /// displaced or abandoned process from lingering as a zombie.
    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn release(&mut self) {
        self.kill_child();
        self.writer = None;
        self.master = None;
    }
}

/// Drive one WebSocket connection to completion.
pub async fn serve_connection(socket: WebSocket, identity: Identity, deps: SessionDeps) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(deps.config.send_buffer);

    let handle = ClientHandle::new(identity.clone(), out_tx.clone());
    let client_id = handle.id;
    deps.hub.register(handle).await;

    let session: Arc<Mutex<PtySession>> = Arc::default();
    let writer = tokio::spawn(outbound_loop(ws_tx, out_rx, deps.config.ping_interval));

    inbound_loop(ws_rx, &identity, &out_tx, &session, &deps).await;

    // Connection gone: leave the registry, then release the PTY resource.
    deps.hub.unregister(client_id).await;
    match session.lock() {
        Ok(mut session) => session.release(),
        Err(poisoned) => poisoned.into_inner().release(),
    }
    drop(out_tx);
    let _ = writer.await;
    info!(user_id = %identity.user_id, "Session closed");
}

/// Drain the outbound channel into the socket; emit a liveness ping when
/// idle. Ends on socket error or when every sender is gone.
async fn outbound_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    ping_interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = out_rx.recv() => match message {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn inbound_loop(
    mut ws_rx: SplitStream<WebSocket>,
    identity: &Identity,
    out_tx: &Outbound,
    session: &Arc<Mutex<PtySession>>,
    deps: &SessionDeps,
) {
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if text.len() > deps.config.max_frame_bytes {
            warn!(len = text.len(), "Dropping oversized control frame");
            continue;
        }

        let message: ControlMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                // Malformed frames are logged and skipped, never fatal.
                warn!("Invalid control frame: {err}");
                continue;
            }
        };

        match message {
            ControlMessage::Input { payload } => {
                if let Ok(mut session) = session.lock() {
                    if let Some(writer) = session.writer.as_mut() {
                        let _ = writer.write_all(payload.as_bytes());
                        let _ = writer.flush();
                    }
                }
            }
            ControlMessage::Resize { rows, cols } => {
                if let Ok(session) = session.lock() {
                    if let Some(master) = session.master.as_ref() {
                        let _ = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                    }
                }
            }
            ControlMessage::RunCode {
                payload,
                exercise_id,
            } => {
                if let Ok(mut session) = session.lock() {
                    session.kill_child();
                }
                let ctx = RunContext {
                    identity: identity.clone(),
                    out: out_tx.clone(),
                    session: Arc::clone(session),
                    deps: deps.clone(),
                };
                tokio::spawn(run_sequence(ctx, payload, exercise_id));
            }
            ControlMessage::Stop => {
                let killed = match session.lock() {
                    Ok(mut session) => {
                        let had_child = session.child.is_some();
                        session.kill_child();
                        had_child
                    }
                    Err(_) => false,
                };
                if killed {
                    send_output(out_tx, "\r\n[User Interruption]: Process killed by user.\r\n");
                }
            }
        }
    }
}

/// Everything a run sequence needs, detached from the inbound loop
struct RunContext {
    identity: Identity,
    out: Outbound,
    session: Arc<Mutex<PtySession>>,
    deps: SessionDeps,
}

impl RunContext {
    fn send(&self, text: &str) {
        send_output(&self.out, text);
    }

    fn send_event(&self, frame: EventFrame) {
        let _ = self.out.try_send(Message::Text(frame.to_json().into()));
    }

    async fn monitor(&self, kind: MonitorEvent, payload: impl Into<String>) {
        let frame = MonitorFrame::new(kind, &self.identity, payload);
        self.deps.hub.broadcast_to_monitors(&frame).await;
    }
}

fn send_output(out: &Outbound, text: &str) {
    if out
        .try_send(Message::Binary(text.as_bytes().to_vec().into()))
        .is_err()
    {
        debug!("Send buffer full, dropping output");
    }
}

/// Compile the submission and attach its binary to a fresh PTY. Always
/// ends with a `status: stopped` event and a persisted run record for
/// authenticated users.
async fn run_sequence(ctx: RunContext, code: String, exercise_id: Option<i64>) {
    info!(
        user_id = %ctx.identity.user_id,
        exercise_id,
        "Starting interactive run"
    );
    ctx.monitor(MonitorEvent::CompileStart, "Starting compilation...")
        .await;

    let workspace = match tempfile::Builder::new()
        .prefix("clabd-ws-")
        .tempdir_in(crate::config::workspace_root())
    {
        Ok(dir) => dir,
        Err(err) => {
            fail_run(
                &ctx,
                &format!("Error creating temp dir: {err}"),
                "Workspace staging failed",
            )
            .await;
            return;
        }
    };
    let src_path = workspace.path().join("program.c");
    let bin_path = workspace.path().join("program");
    if let Err(err) = tokio::fs::write(&src_path, &code).await {
        fail_run(
            &ctx,
            &format!("Error writing source: {err}"),
            "Workspace staging failed",
        )
        .await;
        return;
    }

    let exercise = match exercise_id {
        Some(id) => ctx
            .deps
            .store
            .exercise_context(id)
            .await
            .unwrap_or_else(|err| {
                warn!(exercise_id = id, "Exercise lookup failed: {err}");
                None
            }),
        None => None,
    };
    let is_exam = exercise.as_ref().is_some_and(|e| e.is_exam);

    // Interactive compiles skip the sandbox: the compiler only reads the
    // staged source, and the student is waiting on its diagnostics.
    let compile = tokio::time::timeout(
        ctx.deps.policy.limits.compile_timeout,
        tokio::process::Command::new("gcc")
            .arg(&src_path)
            .arg("-o")
            .arg(&bin_path)
            .arg("-Wall")
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let compile_out = match compile {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => {
            fail_run(
                &ctx,
                &format!("Error invoking compiler: {err}"),
                "Compiler unavailable",
            )
            .await;
            return;
        }
        Err(_) => {
            ctx.send("Compilation timed out.\r\n");
            finish_stopped(&ctx, "Compilation timed out").await;
            return;
        }
    };

    if !compile_out.status.success() {
        let mut error_output = String::from_utf8_lossy(&compile_out.stdout).into_owned();
        error_output.push_str(&String::from_utf8_lossy(&compile_out.stderr));
        compile_failure(&ctx, &code, error_output, exercise_id, exercise.as_ref(), is_exam).await;
        return;
    }
    ctx.send("Compilation successful.\r\nRunning...\r\n");

    // The run itself always goes through the tiered builder.
    let run_session = SandboxSession::run(
        workspace.path(),
        &ctx.deps.policy.limits,
        MAX_WALL_CLOCK,
    )
    .interactive();
    let mut run_cmd = match build_command(
        &ctx.deps.policy,
        &run_session,
        &bin_path.display().to_string(),
        &[],
    )
    .await
    {
        Ok(cmd) => cmd,
        Err(err) => {
            warn!("Failed to create run sandbox: {err}");
            ctx.send("Error creating execution sandbox.\r\n");
            finish_stopped(&ctx, "Sandbox provisioning failed").await;
            return;
        }
    };

    let attached = attach_pty(&ctx, &run_cmd);
    let (mut reader, generation) = match attached {
        Ok(parts) => parts,
        Err(err) => {
            run_cmd.teardown.run().await;
            ctx.send(&format!("Error starting PTY: {err}"));
            finish_stopped(&ctx, "PTY attach failed").await;
            return;
        }
    };

    // Reader thread: PTY reads are blocking; EOF/EIO arrives once the
    // child exits and the slave side closes.
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let max_output = ctx.deps.policy.limits.max_output_bytes;
    let mut full_output: Vec<u8> = Vec::new();
    while let Some(chunk) = chunk_rx.recv().await {
        if full_output.len() < max_output {
            let room = max_output - full_output.len();
            full_output.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        let _ = ctx.out.try_send(Message::Binary(chunk.clone().into()));
        ctx.monitor(
            MonitorEvent::OutputChunk,
            String::from_utf8_lossy(&chunk).into_owned(),
        )
        .await;
    }

    // Output stream closed: reap the child and tear the sandbox down.
    let child = match ctx.session.lock() {
        Ok(mut session) if session.generation == generation => session.child.take(),
        _ => None,
    };
    let status = match child {
        Some(mut child) => tokio::task::spawn_blocking(move || child.wait())
            .await
            .ok()
            .and_then(|res| res.ok()),
        None => None,
    };
    run_cmd.teardown.run().await;

    let output = String::from_utf8_lossy(&full_output).into_owned();
    let exit_code = status.as_ref().map(|s| s.exit_code());
    let success = status.as_ref().is_some_and(|s| s.success());

    let exit_msg = match exit_code {
        Some(0) => "\r\nProgram exited.".to_string(),
        Some(code) => format!("\r\nProgram exited with code {code}"),
        None => "\r\nProgram exited.".to_string(),
    };

    let mut record = RunRecord {
        user_id: ctx.identity.db_id.unwrap_or(0),
        exercise_id,
        source: code.clone(),
        output: output.clone(),
        success,
        ..Default::default()
    };

    if success {
        analyze_success(&ctx, &code, &output, exercise.as_ref(), is_exam, &mut record).await;
    } else {
        analyze_failure(&ctx, &code, &output, exit_code, is_exam, &mut record).await;
    }

    ctx.send(&exit_msg);
    finish_stopped(&ctx, exit_msg.trim()).await;

    if ctx.identity.db_id.is_some() {
        record_run_logged(ctx.deps.store.as_ref(), record).await;
    }

    if let Ok(mut session) = ctx.session.lock() {
        if session.generation == generation {
            session.child = None;
            session.writer = None;
            session.master = None;
        }
    }
}

/// Open a PTY, spawn the sandboxed command on its slave side, and publish
/// the handles into the client session under one lock so the
/// one-subprocess invariant holds even against racing run requests.
fn attach_pty(
    ctx: &RunContext,
    run_cmd: &crate::sandbox::SandboxedCommand,
) -> crate::error::Result<(Box<dyn Read + Send>, u64)> {
    use crate::error::Error;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::Sandbox(format!("failed to open pty: {e}")))?;

    let child = pair
        .slave
        .spawn_command(run_cmd.pty_command())
        .map_err(|e| Error::Sandbox(format!("failed to spawn pty command: {e}")))?;
    // Slave must close so the master reader sees EOF when the child exits.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::Sandbox(format!("failed to clone pty reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::Sandbox(format!("failed to take pty writer: {e}")))?;

    let mut session = ctx
        .session
        .lock()
        .map_err(|_| Error::Internal("session lock poisoned".to_string()))?;
    session.kill_child();
    session.master = Some(pair.master);
    session.writer = Some(writer);
    session.child = Some(child);
    session.generation += 1;

    Ok((reader, session.generation))
}

async fn compile_failure(
    ctx: &RunContext,
    code: &str,
    error_output: String,
    exercise_id: Option<i64>,
    exercise: Option<&ExerciseContext>,
    is_exam: bool,
) {
    let mut record = RunRecord {
        user_id: ctx.identity.db_id.unwrap_or(0),
        exercise_id,
        source: code.to_string(),
        error: error_output.clone(),
        success: false,
        ..Default::default()
    };

    if is_exam {
        // Exam mode: detail withheld from the submitter, graded in full
        // for the instructor-facing record.
        ctx.send("Compilation Error.\r\n[EXAM MODE]: Details withheld. Check your syntax.\r\n");
        if let Some(exercise) = exercise {
            match ctx
                .deps
                .critic
                .graded_critique(code, &error_output, &exercise.expected_output, exercise.max_score)
                .await
            {
                Ok(grading) => {
                    record.grading = grading.feedback;
                    record.score = grading.score;
                }
                Err(err) => warn!("Exam grading failed: {err}"),
            }
        }
    } else {
        ctx.send(&format!("Compilation Error:\r\n{error_output}"));
        match ctx.deps.critic.critique(code, &error_output).await {
            Ok(analysis) => {
                ctx.send_event(EventFrame::ai_analysis("error", &analysis));
                ctx.send("\r\n[AI]: Compilation analysis sent to side panel.\r\n");
                record.analysis = analysis;
            }
            Err(err) => warn!("Critique call failed: {err}"),
        }
    }

    finish_stopped(ctx, "Compilation failed").await;

    if ctx.identity.db_id.is_some() {
        record_run_logged(ctx.deps.store.as_ref(), record).await;
    }
}

async fn analyze_success(
    ctx: &RunContext,
    code: &str,
    output: &str,
    exercise: Option<&ExerciseContext>,
    is_exam: bool,
    record: &mut RunRecord,
) {
    match exercise {
        Some(exercise) if is_exam => {
            ctx.send("\r\n[EXAM MODE]: Submission received.");
            ctx.send("\r\nYour answer was forwarded for grading.");
            match ctx
                .deps
                .critic
                .graded_critique(code, output, &exercise.expected_output, exercise.max_score)
                .await
            {
                Ok(grading) => {
                    record.grading = grading.feedback;
                    record.score = grading.score;
                }
                Err(err) => {
                    warn!("Exam grading failed: {err}");
                    record.grading = format!("automatic grading failed: {err}");
                }
            }
        }
        _ => {
            ctx.send("\r\nAnalyzing...");
            match ctx.deps.critic.critique(code, output).await {
                Ok(analysis) => {
                    ctx.send_event(EventFrame::ai_analysis("success", &analysis));
                    record.analysis = analysis;
                }
                Err(err) => ctx.send(&format!("\r\nAnalysis failed: {err}")),
            }
        }
    }
}

async fn analyze_failure(
    ctx: &RunContext,
    code: &str,
    output: &str,
    exit_code: Option<u32>,
    is_exam: bool,
    record: &mut RunRecord,
) {
    let mut error_text = output.to_string();
    let suffix = exit_code.and_then(decode_exit_code);
    if let Some(suffix) = suffix {
        error_text.push_str("\r\n");
        error_text.push_str(suffix);
    }
    record.error = error_text.clone();
    record.output = String::new();

    if is_exam {
        // Crash class stays in the record; the submitter learns nothing
        // beyond the fact of failure.
        ctx.send("\r\n[Runtime Error]\r\n[EXAM MODE]: Details withheld.\r\n");
        return;
    }

    match suffix {
        Some(suffix) => ctx.send(&format!("\r\n[Runtime Error]: {suffix}")),
        None => ctx.send("\r\n[Runtime Error]"),
    }

    ctx.send("\r\nAnalyzing...");
    match ctx.deps.critic.critique(code, &error_text).await {
        Ok(analysis) => {
            ctx.send_event(EventFrame::ai_analysis("error", &analysis));
            ctx.send("\r\n[AI]: Analysis sent to side panel.\r\n");
            record.analysis = analysis;
        }
        Err(err) => ctx.send(&format!("\r\nAnalysis failed: {err}")),
    }
}

/// Abort a run before anything executed. Monitors saw a compile start,
/// so the stream must still be closed out with an end marker and the
/// client must still get its terminal `stopped` status.
async fn fail_run(ctx: &RunContext, message: &str, monitor_note: &str) {
    ctx.send(message);
    finish_stopped(ctx, monitor_note).await;
}

async fn finish_stopped(ctx: &RunContext, monitor_note: &str) {
    ctx.monitor(MonitorEvent::CompileEnd, monitor_note).await;
    ctx.send_event(EventFrame::status_stopped());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::critique::Grading;
    use crate::error::Result;
    use crate::sandbox::{CapabilitySet, IsolationTier};
    use crate::storage::NoopStore;

    struct StubCritic;

    #[async_trait::async_trait]
    impl CodeCritic for StubCritic {
        async fn critique(&self, _source: &str, _outcome: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn graded_critique(
            &self,
            _source: &str,
            _outcome: &str,
            _reference: &str,
            _max_score: f64,
        ) -> Result<Grading> {
            Ok(Grading {
                score: 0.0,
                feedback: String::new(),
            })
        }
    }

    fn test_ctx(out: Outbound) -> RunContext {
        RunContext {
            identity: Identity::anonymous(),
            out,
            session: Arc::default(),
            deps: SessionDeps {
                hub: Hub::spawn(),
                policy: Arc::new(SandboxPolicy::new(
                    IsolationTier::Unconfined,
                    CapabilitySet::default(),
                    SandboxConfig::default(),
                )),
                critic: Arc::new(StubCritic),
                store: Arc::new(NoopStore),
                config: SessionConfig::default(),
            },
        }
    }

    #[test]
    fn test_pty_session_release_is_idempotent() {
        let mut session = PtySession::default();
        session.release();
        session.release();
        assert!(session.child.is_none());
        assert!(session.master.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_child_reaps_the_process() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = portable_pty::CommandBuilder::new("sleep");
        cmd.arg("300");
        let child = pair.slave.spawn_command(cmd).unwrap();
        drop(pair.slave);
        let pid = child.process_id();

        let mut session = PtySession {
            master: Some(pair.master),
            child: Some(child),
            ..Default::default()
        };
        session.kill_child();
        assert!(session.child.is_none());

        // A reaped child must not linger in the zombie state.
        if let Some(pid) = pid {
            if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                assert!(!stat.contains(") Z "), "child left unreaped: {stat}");
            }
        }
    }

    #[tokio::test]
    async fn test_aborted_run_still_emits_stopped_status() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ctx = test_ctx(out_tx);

        fail_run(&ctx, "Error creating temp dir: full", "Workspace staging failed").await;

        match out_rx.recv().await {
            Some(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                assert!(text.contains("temp dir"));
            }
            other => panic!("expected terminal output, got {other:?}"),
        }
        match out_rx.recv().await {
            Some(Message::Text(text)) => assert!(text.contains("\"stopped\"")),
            other => panic!("expected status event, got {other:?}"),
        }
    }
}
