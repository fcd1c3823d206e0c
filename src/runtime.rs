//! The bus loop: one task owning the service bus, the periodic timers and
//! every request that touches the bus.

use crate::bus::ServiceBus;
use crate::config::TimingConfig;
use crate::liveness::{LivenessReporter, LivenessSnapshot};
use crate::protocol::{BusRequest, BusResponse, WatchEvent};
use crate::publisher::RevisionPublisher;
use crate::queue::FrameQueue;
use crate::scheduler::{CycleOutcome, CycleScheduler, JobKind, SchedulerError};
use crate::subscriber::FeedStatsHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

const REQUEST_CHANNEL_SIZE: usize = 32;
const WATCH_BROADCAST_BUFFER_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bus loop is not running")]
    LoopStopped,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Request plus the slot its response goes back through.
#[derive(Debug)]
pub struct BusCall {
    pub request: BusRequest,
    pub reply: oneshot::Sender<BusResponse>,
}

/// Cloneable entry point into the bus loop for other tasks.
#[derive(Debug, Clone)]
pub struct BusHandle {
    calls: mpsc::Sender<BusCall>,
    events: broadcast::Sender<WatchEvent>,
}

impl BusHandle {
    pub async fn call(&self, request: BusRequest) -> Result<BusResponse, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(BusCall { request, reply })
            .await
            .map_err(|_| RuntimeError::LoopStopped)?;
        response.await.map_err(|_| RuntimeError::LoopStopped)
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

pub struct BridgeRuntime<B: ServiceBus> {
    bus: B,
    publisher: RevisionPublisher,
    liveness: Option<LivenessReporter>,
    scheduler: CycleScheduler,
    feed_stats: FeedStatsHandle,
    calls: mpsc::Receiver<BusCall>,
    events: broadcast::Sender<WatchEvent>,
    start: Instant,
}

impl<B: ServiceBus> BridgeRuntime<B> {
    pub fn new(
        bus: B,
        queue: Arc<FrameQueue>,
        timing: &TimingConfig,
        feed_stats: FeedStatsHandle,
    ) -> Result<(Self, BusHandle), RuntimeError> {
        let mut scheduler = CycleScheduler::new();
        scheduler.add_job(JobKind::Publish, timing.publish_period_ms(), 0)?;

        let liveness = timing.sign_of_life_ms().map(LivenessReporter::new);
        if let Some(reporter) = &liveness {
            scheduler.add_job(JobKind::SignOfLife, reporter.interval_ms(), 0)?;
        }

        let (calls_tx, calls_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (events_tx, _) = broadcast::channel(WATCH_BROADCAST_BUFFER_SIZE);

        let runtime = Self {
            bus,
            publisher: RevisionPublisher::new(queue),
            liveness,
            scheduler,
            feed_stats,
            calls: calls_rx,
            events: events_tx.clone(),
            start: Instant::now(),
        };
        let handle = BusHandle {
            calls: calls_tx,
            events: events_tx,
        };
        Ok((runtime, handle))
    }

    /// Milliseconds since the loop was created.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Run every job due at `now_ms`. Returns how many ran.
    pub fn run_due(&mut self, now_ms: u64) -> usize {
        let due = self.scheduler.due_jobs(now_ms);
        for &kind in due.iter() {
            let outcome = self.run_job(kind);
            self.scheduler.complete(kind, &outcome, now_ms);
        }
        due.len()
    }

    fn run_job(&mut self, kind: JobKind) -> CycleOutcome {
        let outcome = match kind {
            JobKind::Publish => self.publisher.run_cycle(&mut self.bus),
            JobKind::SignOfLife => match &self.liveness {
                Some(reporter) => {
                    let snapshot = LivenessSnapshot {
                        last_update: self.publisher.last_update(),
                        queue: self.publisher.queue().get_stats(),
                        feed: self.feed_stats.snapshot(),
                        publish: self.scheduler.get_stats(JobKind::Publish),
                    };
                    reporter.report(&self.bus, &snapshot)
                }
                None => CycleOutcome::Idle,
            },
        };

        match &outcome {
            CycleOutcome::Published { revision } => {
                debug!("published revision {}", revision);
                self.broadcast_state();
            }
            CycleOutcome::Failed { reason } => {
                error!(severity = "critical", "Error at {}: {}", kind.name(), reason);
            }
            CycleOutcome::Idle | CycleOutcome::Reported => {}
        }
        outcome
    }

    fn broadcast_state(&self) {
        let Some(state) = self.publisher.last_state() else {
            return;
        };
        if self.events.receiver_count() == 0 {
            return;
        }
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        // No receivers left is not an error for the loop.
        let _ = self.events.send(WatchEvent {
            service: self.bus.service_name().to_string(),
            timestamp_ms,
            state: state.clone(),
        });
    }

    /// Serve one bus request against the current bus contents.
    pub fn handle_request(&mut self, request: BusRequest) -> BusResponse {
        match request {
            BusRequest::Ping => BusResponse {
                message: Some("pong".to_string()),
                ..BusResponse::success()
            },
            BusRequest::Get { path } => match (self.bus.get(&path), self.bus.text(&path)) {
                (Ok(value), Ok(text)) => BusResponse::value(&path, value, text),
                (Err(e), _) | (_, Err(e)) => BusResponse::error(e.to_string()),
            },
            BusRequest::Set { path, value } => match self.bus.write_external(&path, value) {
                Ok(true) => match (self.bus.get(&path), self.bus.text(&path)) {
                    (Ok(value), Ok(text)) => BusResponse::value(&path, value, text),
                    (Err(e), _) | (_, Err(e)) => BusResponse::error(e.to_string()),
                },
                Ok(false) => BusResponse::rejected(&path),
                Err(e) => BusResponse::error(e.to_string()),
            },
            BusRequest::Dump => BusResponse::listing(self.bus.entries()),
            // Streaming is done by the connection; the loop only acknowledges.
            BusRequest::Watch => BusResponse::success(),
        }
    }

    /// Drive timers and bus requests until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) -> B {
        tokio::pin!(shutdown);
        let mut calls_open = true;

        info!("bus loop running for {}", self.bus.service_name());

        loop {
            let now = self.now_ms();
            self.run_due(now);

            let wake_at = self
                .scheduler
                .next_due()
                .map(|due| self.start + Duration::from_millis(due));
            let timer = async move {
                match wake_at {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("bus loop stopping");
                    break;
                }
                call = self.calls.recv(), if calls_open => match call {
                    Some(call) => {
                        let response = self.handle_request(call.request);
                        let _ = call.reply.send(response);
                    }
                    None => calls_open = false,
                },
                _ = timer => {}
            }
        }

        self.bus
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn publisher(&self) -> &RevisionPublisher {
        &self.publisher
    }

    pub fn scheduler(&self) -> &CycleScheduler {
        &self.scheduler
    }
}
