use crate::bus::{BusError, ServiceBus};
use crate::queue::FrameQueue;
use crate::scheduler::CycleOutcome;
use crate::service::{PublishedState, PATH_UPDATE_INDEX};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{path} holds a non-integer revision")]
    BadRevision { path: &'static str },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Next value of the update index. Anything that would leave 0..=255 wraps to 0.
pub fn next_revision(current: i64) -> u8 {
    u8::try_from(current.saturating_add(1)).unwrap_or(0)
}

/// Drains the frame queue on every tick and commits the newest frame to the
/// bus together with an advanced update index.
#[derive(Debug)]
pub struct RevisionPublisher {
    queue: Arc<FrameQueue>,
    last_update: Option<SystemTime>,
    last_state: Option<PublishedState>,
}

impl RevisionPublisher {
    pub fn new(queue: Arc<FrameQueue>) -> Self {
        Self {
            queue,
            last_update: None,
            last_state: None,
        }
    }

    /// One timer tick. Never panics and never aborts the caller; failures come
    /// back as [`CycleOutcome::Failed`].
    pub fn run_cycle<B: ServiceBus + ?Sized>(&mut self, bus: &mut B) -> CycleOutcome {
        match self.publish_latest(bus) {
            Ok(Some(revision)) => CycleOutcome::Published { revision },
            Ok(None) => CycleOutcome::Idle,
            Err(e) => CycleOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn publish_latest<B: ServiceBus + ?Sized>(&mut self, bus: &mut B) -> Result<Option<u8>, PublishError> {
        let Some(frame) = self.queue.pop_latest() else {
            return Ok(None);
        };

        let current = bus
            .get(PATH_UPDATE_INDEX)?
            .as_i64()
            .ok_or(PublishError::BadRevision {
                path: PATH_UPDATE_INDEX,
            })?;
        let revision = next_revision(current);

        let state = PublishedState::from_frame(&frame, revision);
        bus.set_many(&state.updates())?;

        self.last_update = Some(SystemTime::now());
        self.last_state = Some(state);
        Ok(Some(revision))
    }

    /// Wall-clock time of the last successful publish.
    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }

    pub fn last_state(&self) -> Option<&PublishedState> {
        self.last_state.as_ref()
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}
