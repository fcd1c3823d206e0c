use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_TIMER_JOBS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Publish,
    SignOfLife,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Publish => "update",
            JobKind::SignOfLife => "sign_of_life",
        }
    }
}

/// What a single timer invocation did. The scheduler records it and
/// reschedules the job regardless.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published { revision: u8 },
    Idle,
    Reported,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct JobStats {
    pub runs: u64,
    pub published: u64,
    pub idle: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerJob {
    pub kind: JobKind,
    pub period_ms: u64,
    pub next_due: u64,
    pub stats: JobStats,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("timer period must be non-zero")]
    ZeroPeriod,
    #[error("job already scheduled")]
    Duplicate,
    #[error("timer table full")]
    Full,
}

/// Ordered set of periodic jobs driven by one loop. Times are milliseconds
/// since the loop started.
#[derive(Debug)]
pub struct CycleScheduler {
    jobs: Vec<TimerJob, MAX_TIMER_JOBS>,
}

impl CycleScheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Add a job whose first run is one period after `current_time`.
    pub fn add_job(&mut self, kind: JobKind, period_ms: u64, current_time: u64) -> Result<(), SchedulerError> {
        if period_ms == 0 {
            return Err(SchedulerError::ZeroPeriod);
        }
        if self.jobs.iter().any(|job| job.kind == kind) {
            return Err(SchedulerError::Duplicate);
        }

        let job = TimerJob {
            kind,
            period_ms,
            next_due: current_time + period_ms,
            stats: JobStats::default(),
        };
        self.jobs.push(job).map_err(|_| SchedulerError::Full)?;
        self.jobs.sort_by_key(|job| job.next_due);
        Ok(())
    }

    /// Jobs due at `current_time`, earliest first.
    pub fn due_jobs(&self, current_time: u64) -> Vec<JobKind, MAX_TIMER_JOBS> {
        let mut ready = Vec::new();
        for job in self.jobs.iter() {
            if job.next_due > current_time {
                // Sorted by due time
                break;
            }
            let _ = ready.push(job.kind);
        }
        ready
    }

    /// Record the outcome of a run and schedule the next one. Runs missed
    /// while the loop was busy are skipped rather than replayed.
    pub fn complete(&mut self, kind: JobKind, outcome: &CycleOutcome, current_time: u64) {
        if let Some(job) = self.jobs.iter_mut().find(|job| job.kind == kind) {
            job.stats.runs += 1;
            match outcome {
                CycleOutcome::Published { .. } | CycleOutcome::Reported => job.stats.published += 1,
                CycleOutcome::Idle => job.stats.idle += 1,
                CycleOutcome::Failed { .. } => job.stats.failed += 1,
            }

            let mut next_due = job.next_due + job.period_ms;
            if next_due <= current_time {
                next_due = current_time + job.period_ms;
            }
            job.next_due = next_due;
        }
        self.jobs.sort_by_key(|job| job.next_due);
    }

    pub fn next_due(&self) -> Option<u64> {
        self.jobs.first().map(|job| job.next_due)
    }

    pub fn get_stats(&self, kind: JobKind) -> Option<JobStats> {
        self.jobs.iter().find(|job| job.kind == kind).map(|job| job.stats)
    }

    pub fn get_jobs(&self) -> &[TimerJob] {
        &self.jobs
    }
}

impl Default for CycleScheduler {
    fn default() -> Self {
        Self::new()
    }
}
