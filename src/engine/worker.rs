use std::sync::Arc;

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::engine::{metrics::MetricsRegistry, orchestrator::JobOrchestrator, queue::QueuedJob};

/// One worker per execution slot; a job holds its worker from workspace
/// creation until reclamation finishes.
pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    orchestrator: Arc<JobOrchestrator>,
    metrics: Arc<MetricsRegistry>,
) {
    for worker_id in 0..workers {
        let receiver = receiver.clone();
        let orchestrator = orchestrator.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, orchestrator, metrics).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    orchestrator: Arc<JobOrchestrator>,
    metrics: Arc<MetricsRegistry>,
) {
    loop {
        let queued = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(QueuedJob {
            job,
            tracker,
            reply,
        }) = queued
        else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        tracing::info!(
            worker_id,
            job_id = %job.id,
            language = %job.rule.language,
            "starting job"
        );
        metrics.started();

        let job_id = job.id;
        let result = orchestrator.execute(job, tracker).await;
        metrics.finished(result.state);

        if reply.send(result).is_err() {
            tracing::debug!(worker_id, job_id = %job_id, "result dropped, nobody is waiting");
        }
    }
}
