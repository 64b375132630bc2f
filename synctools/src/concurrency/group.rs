use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Slot holding the first error reported by any task of a group.
#[derive(Debug, Clone, Default)]
struct FirstError(Arc<Mutex<Option<SyncError>>>);

impl FirstError {
    /// Stores `err` unless an error was already stored. Returns whether `err` was stored.
    fn record(&self, err: SyncError) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        *slot = Some(err);
        true
    }

    fn take(&self) -> Option<SyncError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Runs cancelable tasks concurrently, cancelling all of them on the first failure.
///
/// Every [`TaskGroup`] owns a child of the token it was created from. The first task that
/// fails (returns an error or panics) has its error recorded and cancels that child token;
/// the remaining tasks are expected to observe the cancellation and unwind. [`TaskGroup::wait`]
/// returns once every task has finished, yielding the first recorded error.
///
/// Cancelling the group never cancels the parent token, while cancelling the parent cancels
/// the group.
#[derive(Debug)]
pub struct TaskGroup {
    join_set: JoinSet<()>,
    token: CancellationToken,
    first_error: FirstError,
}

impl TaskGroup {
    /// Creates an empty group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            join_set: JoinSet::new(),
            token: parent.child_token(),
            first_error: FirstError::default(),
        }
    }

    /// Returns the token shared by the tasks of this group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns the number of tasks that have not been joined yet.
    pub fn len(&self) -> usize {
        self.join_set.len()
    }

    /// Returns `true` if the group has no tasks left to join.
    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Spawns `future` as a task of this group.
    ///
    /// An error returned by the future is recorded (if it is the first) and cancels the group.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = self.first_error.clone();

        self.join_set.spawn(async move {
            if let Err(err) = future.await {
                Self::report(&first_error, &token, err);
            }
        });
    }

    /// Reports `err` as if a task of this group had returned it.
    pub fn fail(&self, err: SyncError) {
        Self::report(&self.first_error, &self.token, err);
    }

    /// Cancels the group's token without recording an error.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for every task to finish and returns the first reported error.
    ///
    /// The group's token is cancelled before returning, mirroring the lifetime of the tasks.
    pub async fn wait(mut self) -> SyncResult<()> {
        while let Some(result) = self.join_set.join_next().await {
            if let Err(join_err) = result {
                if join_err.is_panic() {
                    Self::report(&self.first_error, &self.token, join_err.into());
                } else {
                    debug!("task group member was aborted");
                }
            }
        }

        self.token.cancel();

        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn report(first_error: &FirstError, token: &CancellationToken, err: SyncError) {
        // The error must be in place before cancelling, otherwise the cancellation errors of
        // sibling tasks could win the slot.
        if first_error.record(err.clone()) {
            warn!(error_kind = ?err.kind(), "task group member failed, cancelling group");
        } else {
            debug!(error_kind = ?err.kind(), "task group member failed after the first error");
        }

        token.cancel();
    }
}
