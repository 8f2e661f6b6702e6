use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::DashMap;
use tokio::{
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::engine::{
    config::WorkspaceConfig,
    error::AdmissionError,
    metrics::MetricsRegistry,
    models::{JobResult, JobState, JobStatusResponse, LanguageSummary, SubmitRequest},
    orchestrator::{Job, JobTracker},
    queue::{QueuedJob, Scheduler},
    rules::RuleSet,
    sandbox::trim_for_log,
    workspace::{StagedFile, validate_sources},
};

enum ResultSlot {
    Pending(oneshot::Receiver<JobResult>),
    Claimed,
}

struct JobHandle {
    language: String,
    state: watch::Receiver<JobState>,
    result: Arc<Mutex<ResultSlot>>,
    settled_at: Option<Instant>,
}

#[derive(Clone)]
pub struct AdmissionController {
    rules: Arc<RuleSet>,
    scheduler: Scheduler,
    jobs: Arc<DashMap<Uuid, JobHandle>>,
    metrics: Arc<MetricsRegistry>,
    workspace: WorkspaceConfig,
    max_stdin_bytes: usize,
}

impl AdmissionController {
    pub fn new(
        rules: Arc<RuleSet>,
        scheduler: Scheduler,
        metrics: Arc<MetricsRegistry>,
        workspace: WorkspaceConfig,
        max_stdin_bytes: usize,
    ) -> Self {
        Self {
            rules,
            scheduler,
            jobs: Arc::new(DashMap::new()),
            metrics,
            workspace,
            max_stdin_bytes,
        }
    }

    /// Admits a job or rejects it. Rejections leave the job table and the
    /// queue exactly as they were.
    pub fn submit(&self, request: SubmitRequest) -> Result<Uuid, AdmissionError> {
        let rule = self.rules.lookup(&request.language).map_err(|_| {
            self.metrics.rejected_unknown_language();
            tracing::info!(
                language = %trim_for_log(&request.language, 64),
                "rejected submission for unknown language"
            );
            AdmissionError::UnknownLanguage(request.language.clone())
        })?;

        let files = request
            .files
            .into_iter()
            .map(|file| {
                let content = file.encoding.decode(file.content).map_err(|err| {
                    format!("source file '{}' is not valid base64: {err}", file.name)
                })?;
                Ok(StagedFile {
                    name: file.name,
                    content,
                })
            })
            .collect::<Result<Vec<_>, String>>()
            .and_then(|files| {
                validate_sources(&files, &self.workspace).map_err(|err| err.to_string())?;
                Ok(files)
            });
        let files = match files {
            Ok(files) => files,
            Err(reason) => {
                self.metrics.rejected_invalid();
                return Err(AdmissionError::InvalidSubmission(reason));
            }
        };

        let encoding = request.stdin_encoding;
        let stdin = match request.stdin.map(|text| encoding.decode(text)).transpose() {
            Ok(stdin) => stdin,
            Err(err) => {
                self.metrics.rejected_invalid();
                return Err(AdmissionError::InvalidSubmission(format!(
                    "stdin is not valid base64: {err}"
                )));
            }
        };
        if let Some(input) = &stdin
            && input.len() > self.max_stdin_bytes
        {
            self.metrics.rejected_invalid();
            return Err(AdmissionError::InvalidSubmission(format!(
                "stdin is {} bytes, limit is {}",
                input.len(),
                self.max_stdin_bytes
            )));
        }

        let id = Uuid::new_v4();
        let (tracker, state) = JobTracker::new(id);
        let (reply, result) = oneshot::channel();
        let language = rule.language.clone();
        let queued = QueuedJob {
            job: Job {
                id,
                rule,
                files,
                stdin,
                submitted_at: Utc::now(),
            },
            tracker,
            reply,
        };

        if let Err(err) = self.scheduler.try_submit(queued) {
            if matches!(err, AdmissionError::RejectedAtCapacity) {
                self.metrics.rejected_at_capacity();
                tracing::warn!(language = %language, "rejected submission at capacity");
            }
            return Err(err);
        }

        self.metrics.submitted();
        self.jobs.insert(
            id,
            JobHandle {
                language: language.clone(),
                state,
                result: Arc::new(Mutex::new(ResultSlot::Pending(result))),
                settled_at: None,
            },
        );
        tracing::info!(job_id = %id, language = %language, "job admitted");
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatusResponse> {
        self.jobs.get(&id).map(|handle| JobStatusResponse {
            id,
            language: handle.language.clone(),
            state: *handle.state.borrow(),
        })
    }

    /// Waits for the job to settle and hands out its result. Each result is
    /// returned once; the job is forgotten afterwards.
    pub async fn await_result(&self, id: Uuid) -> Result<JobResult, AdmissionError> {
        let slot = self
            .jobs
            .get(&id)
            .map(|handle| handle.result.clone())
            .ok_or(AdmissionError::UnknownJob(id))?;

        let mut guard = slot.lock().await;
        let ResultSlot::Pending(receiver) = &mut *guard else {
            return Err(AdmissionError::UnknownJob(id));
        };
        // A cancelled waiter leaves the receiver in place for the next one.
        let received = receiver.await;
        *guard = ResultSlot::Claimed;
        drop(guard);
        self.jobs.remove(&id);
        received.map_err(|_| AdmissionError::Closed)
    }

    pub fn languages(&self) -> Vec<LanguageSummary> {
        self.rules
            .iter()
            .map(|rule| LanguageSummary {
                language: rule.language.clone(),
                compiled: rule.is_compiled(),
                limits: rule.limits.clone(),
            })
            .collect()
    }

    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Forgets settled jobs whose result nobody claimed within `ttl`.
    pub fn sweep_unclaimed(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.jobs.len();
        self.jobs.retain(|id, handle| {
            if !handle.state.borrow().is_terminal() {
                return true;
            }
            let settled = *handle.settled_at.get_or_insert(now);
            let keep = now.duration_since(settled) < ttl;
            if !keep {
                tracing::debug!(job_id = %id, "dropping unclaimed result");
            }
            keep
        });
        before.saturating_sub(self.jobs.len())
    }

    pub fn spawn_sweeper(&self, ttl: Duration) -> JoinHandle<()> {
        let controller = self.clone();
        let period = (ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = controller.sweep_unclaimed(ttl);
                if swept > 0 {
                    tracing::info!(swept, "swept unclaimed job results");
                }
            }
        })
    }
}
