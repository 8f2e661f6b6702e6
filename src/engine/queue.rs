use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
    oneshot,
};

use crate::engine::{
    error::AdmissionError,
    models::JobResult,
    orchestrator::{Job, JobTracker},
};

#[derive(Debug)]
pub struct QueuedJob {
    pub job: Job,
    pub tracker: JobTracker,
    pub reply: oneshot::Sender<JobResult>,
}

/// Bounded FIFO between admission and the worker pool.
#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Never waits: a full queue hands the job back untouched.
    pub fn try_submit(&self, job: QueuedJob) -> Result<(), AdmissionError> {
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => AdmissionError::RejectedAtCapacity,
            TrySendError::Closed(_) => AdmissionError::Closed,
        })
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}
