use crate::bus::ServiceBus;
use crate::queue::QueueStats;
use crate::scheduler::{CycleOutcome, JobStats};
use crate::service::PATH_AC_POWER;
use crate::subscriber::FeedStats;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Inputs for one sign-of-life report, gathered by the bus loop.
#[derive(Debug, Clone, Copy)]
pub struct LivenessSnapshot {
    pub last_update: Option<SystemTime>,
    pub queue: QueueStats,
    pub feed: FeedStats,
    pub publish: Option<JobStats>,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessReporter {
    interval_ms: u64,
}

impl LivenessReporter {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Log the sign-of-life block. Read-only: nothing on the bus changes.
    pub fn report<B: ServiceBus + ?Sized>(&self, bus: &B, snapshot: &LivenessSnapshot) -> CycleOutcome {
        let power = bus
            .get(PATH_AC_POWER)
            .map(|value| value.to_string())
            .unwrap_or_else(|e| e.to_string());

        for line in self.lines(&power, snapshot) {
            info!("{}", line);
        }

        CycleOutcome::Reported
    }

    /// The sign-of-life block, one entry per log line.
    pub fn lines(&self, power: &str, snapshot: &LivenessSnapshot) -> Vec<String> {
        let now = SystemTime::now();
        let mut lines = Vec::with_capacity(7);

        lines.push("--- Start: sign of life ---".to_string());
        lines.push(match snapshot.last_update {
            Some(at) => format!(
                "Last update: {} ({} ago)",
                unix_seconds(at),
                describe_age(now.duration_since(at).unwrap_or_default())
            ),
            None => "Last update: never".to_string(),
        });
        lines.push(format!("Last '{}': {}", PATH_AC_POWER, power));
        lines.push(format!(
            "Feed: received={} queued={} ignored={} rejected={}",
            snapshot.feed.received, snapshot.feed.queued, snapshot.feed.ignored, snapshot.feed.rejected
        ));
        lines.push(format!(
            "Queue: pushed={} evicted={} expired={} queued={}",
            snapshot.queue.total_pushed,
            snapshot.queue.total_evicted,
            snapshot.queue.total_expired,
            snapshot.queue.currently_queued
        ));
        if let Some(stats) = snapshot.publish {
            lines.push(format!(
                "Publish: runs={} published={} idle={} failed={}",
                stats.runs, stats.published, stats.idle, stats.failed
            ));
        }
        lines.push("--- End: sign of life ---".to_string());

        lines
    }
}

fn unix_seconds(at: SystemTime) -> String {
    let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}", since_epoch.as_secs(), since_epoch.subsec_millis())
}

fn describe_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{}.{:03}s", secs, age.subsec_millis())
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
