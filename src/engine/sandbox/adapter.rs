use std::{
    path::Path,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::JoinHandle,
};

use crate::engine::{
    error::AdapterError,
    models::{ExecutionOutcome, Phase, TerminationReason},
    rules::Rule,
    sandbox::{
        EngineVerdict, InvocationSpec, IsolationEngine, PhaseExecutor,
        capture::{CaptureSink, OutputBudget, drain_into},
        expand_template, trim_for_log,
    },
    workspace::Workspace,
};

const ENGINE_LOG_LIMIT: u64 = 64 * 1024;

pub struct IsolationAdapter {
    engine: Arc<dyn IsolationEngine>,
    kill_grace: Duration,
}

impl IsolationAdapter {
    pub fn new(engine: Arc<dyn IsolationEngine>, kill_grace: Duration) -> Self {
        Self { engine, kill_grace }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    fn spec(
        &self,
        rule: &Rule,
        workspace: &Workspace,
        phase: Phase,
        template: &[String],
    ) -> InvocationSpec {
        let workdir = self
            .engine
            .program_workdir(workspace.input_root(), &rule.workdir);
        InvocationSpec {
            job_id: workspace.job_id(),
            phase,
            argv: expand_template(template, workdir, workspace.staged_files()),
            limits: rule.limits.clone(),
            read_only_mounts: rule.filesystem_view.clone(),
            host_workdir: workspace.input_root().to_path_buf(),
            sandbox_workdir: rule.workdir.clone(),
            env: rule.env.clone(),
            engine_log: workspace
                .output_root()
                .join(format!("{}.engine.log", phase.as_str())),
        }
    }
}

#[async_trait]
impl PhaseExecutor for IsolationAdapter {
    async fn invoke(
        &self,
        rule: &Rule,
        workspace: &Workspace,
        phase: Phase,
        stdin: Option<&Bytes>,
    ) -> Result<ExecutionOutcome, AdapterError> {
        let template = rule
            .command(phase)
            .ok_or_else(|| AdapterError::MissingCommand {
                language: rule.language.clone(),
                phase: phase.as_str(),
            })?;
        let spec = self.spec(rule, workspace, phase, template);
        let mut cmd = self.engine.build_command(&spec)?;
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

        tracing::debug!(
            job_id = %spec.job_id,
            phase = phase.as_str(),
            engine = self.engine.name(),
            argv = %trim_for_log(&spec.argv.join(" "), 194),
            "launching isolation engine"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(AdapterError::Launch)?;
        let mut group = ProcessGroup::new(child.id());

        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), stdin.cloned()) {
            tokio::spawn(async move {
                let _ = pipe.write_all(&input).await;
            });
        }

        let output_limit = rule.limits.max_output_bytes as usize;
        let budget = OutputBudget::new(output_limit);
        let stdout_sink = CaptureSink::default();
        let stderr_sink = CaptureSink::default();
        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(drain_into(pipe, stdout_sink.clone(), budget.clone()))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(drain_into(pipe, stderr_sink.clone(), budget.clone()))
        });

        let wall_limit = Duration::from_millis(rule.limits.wall_time_ms);
        let wait_result = tokio::time::timeout(wall_limit + self.kill_grace, child.wait()).await;

        let status = match wait_result {
            Ok(Ok(status)) => {
                // The leader is reaped, so its pgid may already belong to
                // someone else. Stragglers are left to the engine's pid
                // namespace and the pipe readers' grace period.
                group.disarm();
                Some(status)
            }
            Ok(Err(err)) => return Err(AdapterError::Wait(err)),
            Err(_) => {
                tracing::warn!(
                    job_id = %spec.job_id,
                    phase = phase.as_str(),
                    wall_time_ms = rule.limits.wall_time_ms,
                    "deadline exceeded, killing process group"
                );
                // Signal the group while the unreaped leader still pins its pgid.
                group.kill();
                group.disarm();
                let _ = child.kill().await;
                None
            }
        };
        let elapsed = started.elapsed();

        join_reader(stdout_task, self.kill_grace).await;
        join_reader(stderr_task, self.kill_grace).await;
        let engine_log = read_engine_log(&spec.engine_log).await;

        let verdict = match status {
            Some(status) => self.engine.interpret(status, &engine_log),
            None => EngineVerdict::TimedOut,
        };

        let (stdout, stdout_cut) = stdout_sink.into_string(output_limit);
        let (stderr, stderr_cut) = stderr_sink.into_string(output_limit - stdout.len());
        let mut outcome = ExecutionOutcome {
            exit_code: None,
            stdout,
            stderr,
            duration_ms: elapsed.as_millis() as u64,
            terminated_reason: TerminationReason::Normal,
            limit: None,
            truncated: budget.truncated() || stdout_cut || stderr_cut,
            detail: None,
        };

        match verdict {
            EngineVerdict::Exited(_) if elapsed > wall_limit => {
                outcome.terminated_reason = TerminationReason::WallTimeout;
                outcome.detail = Some("finished after the wall time limit".to_string());
            }
            EngineVerdict::Exited(code) => {
                outcome.exit_code = Some(code);
            }
            EngineVerdict::TimedOut => {
                outcome.terminated_reason = TerminationReason::WallTimeout;
            }
            EngineVerdict::LimitExceeded(limit) => {
                outcome.terminated_reason = TerminationReason::ResourceLimitExceeded;
                outcome.limit = Some(limit);
            }
            EngineVerdict::Denied(detail) => {
                outcome.terminated_reason = TerminationReason::SandboxDenied;
                outcome.detail = Some(detail);
            }
            EngineVerdict::Unrecognized(detail) => {
                tracing::error!(
                    job_id = %spec.job_id,
                    phase = phase.as_str(),
                    engine = self.engine.name(),
                    detail = %detail,
                    "isolation engine exited in an unrecognized way"
                );
                return Err(AdapterError::UnrecognizedExit(detail));
            }
        }

        tracing::debug!(
            job_id = %spec.job_id,
            phase = phase.as_str(),
            reason = ?outcome.terminated_reason,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration_ms,
            truncated = outcome.truncated,
            "phase finished"
        );
        Ok(outcome)
    }
}

/// Kills the engine's whole process group when dropped while still armed, so
/// an early return or a cancelled future cannot leave children behind.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self {
            pgid: leader.map(|pid| Pid::from_raw(pid as i32)),
        }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(pgid = pgid.as_raw(), error = %err, "failed to kill process group");
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn join_reader(task: Option<JoinHandle<()>>, grace: Duration) {
    let Some(task) = task else {
        return;
    };
    let abort = task.abort_handle();
    if tokio::time::timeout(grace, task).await.is_err() {
        // A descendant outside the group still holds the pipe open.
        abort.abort();
    }
}

async fn read_engine_log(path: &Path) -> String {
    let Ok(file) = tokio::fs::File::open(path).await else {
        return String::new();
    };
    let mut raw = Vec::new();
    if file.take(ENGINE_LOG_LIMIT).read_to_end(&mut raw).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&raw).into_owned()
}
