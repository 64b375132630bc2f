//! Bounded-concurrency coordination.
//!
//! A [`Waypoint`] meters how many workers may be active at once. Callers obtain a [`Worker`]
//! through [`Waypoint::wait`], which blocks until a slot is free or the supplied token is
//! cancelled, and release it with [`Worker::done`]. The capacity can be changed at any time with
//! [`Waypoint::resize`]; lowering it never preempts active workers.
//!
//! Admission is not FIFO: when a slot frees up, any blocked caller may take it.

mod worker;

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::signal::{Completion, CompletionTx, create_completion, fire_once};
use crate::error::{ErrorKind, SyncResult};
use crate::metrics::{
    SYNCTOOLS_WAYPOINT_ACTIVE_WORKERS, SYNCTOOLS_WAYPOINT_CAPACITY,
    SYNCTOOLS_WAYPOINT_FINISHED_WORKERS_TOTAL, SYNCTOOLS_WAYPOINT_WAIT_SECONDS,
    SYNCTOOLS_WAYPOINT_WAITING_WORKERS, WAYPOINT_LABEL,
};

pub use worker::{Worker, WorkerState};

/// Label used by waypoints created without an explicit one.
const DEFAULT_LABEL: &str = "waypoint";

/// Point-in-time view of a waypoint's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct WaypointMetrics {
    pub timestamp: DateTime<Utc>,
    pub capacity: usize,
    pub waiting: usize,
    pub active: usize,
    pub finished: u64,
    /// Accumulated time admitted workers spent waiting.
    pub wait_time: Duration,
    /// Accumulated time finished workers spent active.
    pub active_time: Duration,
}

#[derive(Debug)]
struct State {
    id_seq: u64,
    capacity: usize,
    num_waiting: usize,
    num_finished: u64,
    /// Active worker ids mapped to their admission instant.
    active: HashMap<u64, Instant>,
    closed: bool,
    wait_time: Duration,
    active_time: Duration,
}

impl State {
    fn has_free_slot(&self) -> bool {
        self.active.len() < self.capacity
    }

    fn is_complete(&self) -> bool {
        self.closed && self.active.is_empty() && (self.num_waiting == 0 || self.capacity == 0)
    }
}

/// State shared between a waypoint and the workers it admitted.
#[derive(Debug)]
struct Shared {
    label: String,
    state: Mutex<State>,
    notify: Notify,
    completion: CompletionTx,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the slot of worker `id` to the waypoint.
    fn release(&self, id: u64, active_duration: Duration) {
        let mut state = self.lock();
        if state.active.remove(&id).is_none() {
            return;
        }

        state.num_finished += 1;
        state.active_time += active_duration;

        // A freed slot is handed to a waiter before completion is evaluated, a capacity
        // raised concurrently with close must still be able to admit pending workers.
        if state.num_waiting > 0 && state.has_free_slot() {
            self.notify.notify_one();
        }

        counter!(
            SYNCTOOLS_WAYPOINT_FINISHED_WORKERS_TOTAL,
            WAYPOINT_LABEL => self.label.clone()
        )
        .increment(1);
        self.emit_gauges(&state);
        self.complete_if_drained(&state);
    }

    /// Forgets a waiter that gave up before being admitted.
    fn abandon(&self, id: u64) {
        let mut state = self.lock();
        state.num_waiting -= 1;

        // The abandoning waiter may have consumed a wakeup meant for a free slot.
        if state.num_waiting > 0 && state.has_free_slot() {
            self.notify.notify_one();
        }

        debug!(waypoint = %self.label, worker_id = id, "waiter abandoned admission");
        self.emit_gauges(&state);
        self.complete_if_drained(&state);
    }

    fn complete_if_drained(&self, state: &State) {
        if state.is_complete() && fire_once(&self.completion) {
            info!(
                waypoint = %self.label,
                finished = state.num_finished,
                abandoned_waiters = state.num_waiting,
                "waypoint completed"
            );
        }
    }

    fn emit_gauges(&self, state: &State) {
        gauge!(SYNCTOOLS_WAYPOINT_CAPACITY, WAYPOINT_LABEL => self.label.clone())
            .set(state.capacity as f64);
        gauge!(SYNCTOOLS_WAYPOINT_ACTIVE_WORKERS, WAYPOINT_LABEL => self.label.clone())
            .set(state.active.len() as f64);
        gauge!(SYNCTOOLS_WAYPOINT_WAITING_WORKERS, WAYPOINT_LABEL => self.label.clone())
            .set(state.num_waiting as f64);
    }
}

/// Registration of a caller blocked in [`Waypoint::wait`].
///
/// Dropping it before admission (cancellation or the wait future being dropped) removes the
/// caller from the waiting count.
struct PendingWorker<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
    created: Instant,
    admitted: bool,
}

impl PendingWorker<'_> {
    fn try_admit(&mut self) -> Option<Worker> {
        let mut state = self.shared.lock();
        if !state.has_free_slot() {
            return None;
        }

        let started = Instant::now();
        let waited = started.duration_since(self.created);

        state.num_waiting -= 1;
        state.active.insert(self.id, started);
        state.wait_time += waited;
        self.admitted = true;

        histogram!(SYNCTOOLS_WAYPOINT_WAIT_SECONDS, WAYPOINT_LABEL => self.shared.label.clone())
            .record(waited.as_secs_f64());
        self.shared.emit_gauges(&state);

        Some(Worker::new(
            self.id,
            self.created,
            started,
            Arc::clone(self.shared),
        ))
    }
}

impl Drop for PendingWorker<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.shared.abandon(self.id);
        }
    }
}

/// Capacity-bounded admission gate for concurrent workers.
///
/// Cloning yields another handle to the same waypoint.
#[derive(Debug, Clone)]
pub struct Waypoint {
    shared: Arc<Shared>,
}

impl Waypoint {
    /// Creates a waypoint admitting at most `capacity` workers at once.
    ///
    /// A capacity of zero admits nothing until the waypoint is resized.
    pub fn new(capacity: usize) -> Self {
        Self::with_label(DEFAULT_LABEL, capacity)
    }

    /// Creates a waypoint whose logs and metrics are labelled with `label`.
    pub fn with_label(label: impl Into<String>, capacity: usize) -> Self {
        let shared = Shared {
            label: label.into(),
            state: Mutex::new(State {
                id_seq: 0,
                capacity,
                num_waiting: 0,
                num_finished: 0,
                active: HashMap::new(),
                closed: false,
                wait_time: Duration::ZERO,
                active_time: Duration::ZERO,
            }),
            notify: Notify::new(),
            completion: create_completion(),
        };

        {
            let state = shared.lock();
            shared.emit_gauges(&state);
        }

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Returns the label of this waypoint.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Waits until a slot is free and returns the admitted [`Worker`].
    ///
    /// Fails with [`ErrorKind::Cancelled`] if `token` is cancelled before admission, in which
    /// case no worker is created, and with [`ErrorKind::WaypointClosed`] if the waypoint was
    /// closed before this call. Callers already blocked when the waypoint is closed stay
    /// eligible for admission.
    pub async fn wait(&self, token: &CancellationToken) -> SyncResult<Worker> {
        let mut pending = {
            let mut state = self.shared.lock();
            if state.closed {
                bail!(
                    ErrorKind::WaypointClosed,
                    "Waypoint does not admit new workers after close",
                    self.shared.label.as_str()
                );
            }
            if token.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Waiting for admission was cancelled");
            }

            state.id_seq += 1;
            state.num_waiting += 1;
            self.shared.emit_gauges(&state);

            PendingWorker {
                shared: &self.shared,
                id: state.id_seq,
                created: Instant::now(),
                admitted: false,
            }
        };

        loop {
            // Interest is registered before checking for a free slot, so a release that
            // happens in between is not missed.
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            if token.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Waiting for admission was cancelled");
            }
            if let Some(worker) = pending.try_admit() {
                return Ok(worker);
            }

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    bail!(ErrorKind::Cancelled, "Waiting for admission was cancelled");
                }
                _ = notified => {}
            }
        }
    }

    /// Sets the capacity to `capacity` and returns the previous one.
    ///
    /// Raising the capacity wakes every blocked caller so that up to the new capacity can be
    /// admitted. Fails with [`ErrorKind::WaypointClosed`] once the waypoint was closed.
    pub fn resize(&self, capacity: usize) -> SyncResult<usize> {
        let mut state = self.shared.lock();
        if state.closed {
            bail!(
                ErrorKind::WaypointClosed,
                "Waypoint cannot be resized after close",
                self.shared.label.as_str()
            );
        }

        let previous = std::mem::replace(&mut state.capacity, capacity);
        if capacity > previous {
            self.shared.notify.notify_waiters();
        }

        info!(
            waypoint = %self.shared.label,
            previous,
            capacity,
            active = state.active.len(),
            waiting = state.num_waiting,
            "waypoint resized"
        );
        self.shared.emit_gauges(&state);

        Ok(previous)
    }

    /// Closes the waypoint and returns its completion signal.
    ///
    /// The signal fires once no worker is active anymore and either no caller is waiting or
    /// the capacity is zero. Closing is idempotent, every call observes the same signal.
    pub fn close(&self) -> Completion {
        let completion = Completion::subscribe(&self.shared.completion);

        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            debug!(
                waypoint = %self.shared.label,
                active = state.active.len(),
                waiting = state.num_waiting,
                "waypoint closed"
            );
        }
        self.shared.complete_if_drained(&state);

        completion
    }

    /// Returns `true` once [`Waypoint::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Takes a consistent snapshot of the waypoint's counters.
    pub fn metrics(&self) -> WaypointMetrics {
        let state = self.shared.lock();

        WaypointMetrics {
            timestamp: Utc::now(),
            capacity: state.capacity,
            waiting: state.num_waiting,
            active: state.active.len(),
            finished: state.num_finished,
            wait_time: state.wait_time,
            active_time: state.active_time,
        }
    }
}
