use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Shared;

/// Lifecycle state of a [`Worker`].
///
/// Transitions are monotone: `Waiting -> Active -> Finished`. Handles returned by
/// [`super::Waypoint::wait`] are always `Active`, the waiting phase is internal to the waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Waiting,
    Active,
    Finished,
}

/// One admitted unit of concurrency.
///
/// A worker occupies a slot of its waypoint until it is released, either explicitly through
/// [`Worker::done`] or implicitly when the handle is dropped. Both paths release the slot exactly
/// once, which keeps error, cancellation and panic paths from leaking capacity.
#[derive(Debug)]
pub struct Worker {
    id: u64,
    state: WorkerState,
    created: Instant,
    started: Instant,
    shared: Arc<Shared>,
}

impl Worker {
    pub(super) fn new(id: u64, created: Instant, started: Instant, shared: Arc<Shared>) -> Self {
        Self {
            id,
            state: WorkerState::Active,
            created,
            started,
            shared,
        }
    }

    /// Returns the id of this worker, unique within its waypoint.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Returns how long this worker waited before it was admitted.
    pub fn wait_duration(&self) -> Duration {
        self.started.duration_since(self.created)
    }

    /// Returns how long this worker has been active so far.
    pub fn active_duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finishes this worker and releases its slot.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.state != WorkerState::Active {
            return;
        }

        self.state = WorkerState::Finished;
        self.shared.release(self.id, self.started.elapsed());
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.release();
    }
}
