use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::engine::{
    error::JobFault,
    metrics::MetricsRegistry,
    models::{ExecutionOutcome, JobResult, JobState, Phase, TerminationReason},
    rules::Rule,
    sandbox::PhaseExecutor,
    workspace::{StagedFile, Workspace, WorkspaceManager},
};

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub rule: Arc<Rule>,
    pub files: Vec<StagedFile>,
    pub stdin: Option<Bytes>,
    pub submitted_at: DateTime<Utc>,
}

/// Sole writer of a job's state. Observers hold the paired receiver.
#[derive(Debug)]
pub struct JobTracker {
    id: Uuid,
    state: JobState,
    publisher: watch::Sender<JobState>,
}

impl JobTracker {
    pub fn new(id: Uuid) -> (Self, watch::Receiver<JobState>) {
        let (publisher, observer) = watch::channel(JobState::Queued);
        (
            Self {
                id,
                state: JobState::Queued,
                publisher,
            },
            observer,
        )
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves to another non-terminal state.
    pub fn advance(&mut self, next: JobState) -> Result<(), JobFault> {
        if next.is_terminal() || !self.state.can_transition_to(next) {
            return Err(JobFault::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        self.publisher.send_replace(next);
        Ok(())
    }

    /// Consumes the tracker, so a job settles exactly once. A proposed state
    /// that is not reachable from the current one settles as `InternalError`.
    pub fn finish(self, proposed: JobState) -> JobState {
        let settled = if proposed.is_terminal() && self.state.can_transition_to(proposed) {
            proposed
        } else {
            tracing::error!(
                job_id = %self.id,
                from = self.state.as_str(),
                to = proposed.as_str(),
                "illegal terminal transition"
            );
            JobState::InternalError
        };
        self.publisher.send_replace(settled);
        settled
    }
}

#[derive(Debug, Default)]
struct PhaseRecord {
    compile: Option<ExecutionOutcome>,
    run: Option<ExecutionOutcome>,
    detail: Option<String>,
}

pub struct JobOrchestrator {
    workspaces: WorkspaceManager,
    executor: Arc<dyn PhaseExecutor>,
    metrics: Arc<MetricsRegistry>,
}

impl JobOrchestrator {
    pub fn new(
        workspaces: WorkspaceManager,
        executor: Arc<dyn PhaseExecutor>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            workspaces,
            executor,
            metrics,
        }
    }

    /// Runs a job to its terminal state. The workspace is reclaimed before
    /// this returns, whatever happened in between.
    pub async fn execute(&self, job: Job, mut tracker: JobTracker) -> JobResult {
        let started = Instant::now();
        let mut record = PhaseRecord::default();

        let proposed = match self.workspaces.create(job.id).await {
            Ok(mut workspace) => {
                let proposed = match self
                    .drive(&job, &mut tracker, &mut workspace, &mut record)
                    .await
                {
                    Ok(state) => state,
                    Err(fault) => {
                        tracing::error!(
                            job_id = %job.id,
                            language = %job.rule.language,
                            state = tracker.state().as_str(),
                            error = %fault,
                            "job failed on a system fault"
                        );
                        record.detail = Some(fault.public_detail());
                        JobState::InternalError
                    }
                };
                if let Err(err) = workspace.reclaim().await {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %err,
                        "workspace reclaim failed, leaving it for operator cleanup"
                    );
                    self.metrics.reclaim_failed();
                }
                proposed
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    language = %job.rule.language,
                    error = %err,
                    "workspace allocation failed"
                );
                record.detail = Some("workspace allocation failed".to_string());
                JobState::InternalError
            }
        };

        let state = tracker.finish(proposed);
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            job_id = %job.id,
            language = %job.rule.language,
            state = state.as_str(),
            duration_ms,
            "job finished"
        );
        build_result(&job, state, record, duration_ms)
    }

    async fn drive(
        &self,
        job: &Job,
        tracker: &mut JobTracker,
        workspace: &mut Workspace,
        record: &mut PhaseRecord,
    ) -> Result<JobState, JobFault> {
        self.workspaces.stage(workspace, &job.files).await?;

        if job.rule.is_compiled() {
            tracker.advance(JobState::Compiling)?;
            let outcome = self
                .executor
                .invoke(&job.rule, workspace, Phase::Compile, None)
                .await?;
            let verdict = compile_verdict(&outcome);
            record.compile = Some(outcome);
            if let Some(state) = verdict {
                return Ok(state);
            }
        }

        tracker.advance(JobState::Running)?;
        let outcome = self
            .executor
            .invoke(&job.rule, workspace, Phase::Run, job.stdin.as_ref())
            .await?;
        let state = run_verdict(&outcome);
        record.run = Some(outcome);
        Ok(state)
    }
}

/// `None` means the compile succeeded and the run phase may start.
pub fn compile_verdict(outcome: &ExecutionOutcome) -> Option<JobState> {
    match outcome.terminated_reason {
        TerminationReason::Normal if outcome.exit_code == Some(0) => None,
        TerminationReason::Normal => Some(JobState::CompileError),
        TerminationReason::WallTimeout => Some(JobState::TimedOut),
        TerminationReason::ResourceLimitExceeded => Some(JobState::RuntimeError),
        TerminationReason::SandboxDenied => Some(JobState::SandboxViolation),
    }
}

pub fn run_verdict(outcome: &ExecutionOutcome) -> JobState {
    match outcome.terminated_reason {
        TerminationReason::Normal if outcome.exit_code == Some(0) => JobState::Completed,
        TerminationReason::Normal => JobState::RuntimeError,
        TerminationReason::WallTimeout => JobState::TimedOut,
        TerminationReason::ResourceLimitExceeded => JobState::RuntimeError,
        TerminationReason::SandboxDenied => JobState::SandboxViolation,
    }
}

fn build_result(job: &Job, state: JobState, record: PhaseRecord, duration_ms: u64) -> JobResult {
    let PhaseRecord {
        compile,
        run,
        detail,
    } = record;
    let last = run.as_ref().or(compile.as_ref());

    let exit_code = match (&run, &compile) {
        (Some(run), _) => run.exit_code,
        (None, Some(compile)) if state == JobState::CompileError => compile.exit_code,
        _ => None,
    };
    let truncated = compile.iter().chain(run.iter()).any(|o| o.truncated);
    let limit_exceeded = last.and_then(|o| o.limit);
    let detail = detail.or_else(|| last.and_then(|o| o.detail.clone()));

    let (stdout, stderr, run_duration_ms) = match run {
        Some(run) => (run.stdout, run.stderr, Some(run.duration_ms)),
        None => (String::new(), String::new(), None),
    };
    let (compile_stdout, compile_stderr, compile_duration_ms) = match compile {
        Some(compile) => (
            Some(compile.stdout),
            Some(compile.stderr),
            Some(compile.duration_ms),
        ),
        None => (None, None, None),
    };

    JobResult {
        id: job.id,
        language: job.rule.language.clone(),
        state,
        exit_code,
        stdout,
        stderr,
        compile_stdout,
        compile_stderr,
        compile_duration_ms,
        run_duration_ms,
        duration_ms,
        truncated,
        limit_exceeded,
        detail,
        submitted_at: job.submitted_at,
        finished_at: Utc::now(),
    }
}
