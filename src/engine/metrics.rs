use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::engine::models::JobState;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    rejected_capacity_total: AtomicU64,
    rejected_unknown_language_total: AtomicU64,
    rejected_invalid_total: AtomicU64,
    started_total: AtomicU64,
    finished_total: [AtomicU64; JobState::TERMINAL.len()],
    reclaim_failures_total: AtomicU64,
    queue_depth: AtomicU64,
    running: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_at_capacity(&self) {
        self.rejected_capacity_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_unknown_language(&self) {
        self.rejected_unknown_language_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_invalid(&self) {
        self.rejected_invalid_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
        saturating_decrement(&self.queue_depth);
    }

    pub fn finished(&self, state: JobState) {
        saturating_decrement(&self.running);
        if let Some(idx) = JobState::TERMINAL.iter().position(|s| *s == state) {
            self.finished_total[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reclaim_failed(&self) {
        self.reclaim_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = format!(
            concat!(
                "# TYPE runjail_jobs_submitted_total counter\n",
                "runjail_jobs_submitted_total {}\n",
                "# TYPE runjail_jobs_rejected_total counter\n",
                "runjail_jobs_rejected_total{{reason=\"at_capacity\"}} {}\n",
                "runjail_jobs_rejected_total{{reason=\"unknown_language\"}} {}\n",
                "runjail_jobs_rejected_total{{reason=\"invalid\"}} {}\n",
                "# TYPE runjail_jobs_started_total counter\n",
                "runjail_jobs_started_total {}\n",
                "# TYPE runjail_workspace_reclaim_failures_total counter\n",
                "runjail_workspace_reclaim_failures_total {}\n",
                "# TYPE runjail_queue_depth gauge\n",
                "runjail_queue_depth {}\n",
                "# TYPE runjail_jobs_running gauge\n",
                "runjail_jobs_running {}\n",
                "# TYPE runjail_jobs_finished_total counter\n",
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.rejected_capacity_total.load(Ordering::Relaxed),
            self.rejected_unknown_language_total.load(Ordering::Relaxed),
            self.rejected_invalid_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.reclaim_failures_total.load(Ordering::Relaxed),
            self.queue_depth(),
            self.running(),
        );
        for (state, counter) in JobState::TERMINAL.iter().zip(&self.finished_total) {
            let _ = writeln!(
                out,
                "runjail_jobs_finished_total{{state=\"{}\"}} {}",
                state.as_str(),
                counter.load(Ordering::Relaxed)
            );
        }
        out
    }
}

fn saturating_decrement(gauge: &AtomicU64) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
