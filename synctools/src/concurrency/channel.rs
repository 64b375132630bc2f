//! Cancelable transfer of values over handoff channels.
//!
//! Pipeline tasks exchange type-erased [`Value`]s over small bounded channels. A send blocks
//! until the receiving task makes room, which is what bounds memory across a pipeline. The
//! helpers here race every send and receive against a [`CancellationToken`] so that no task
//! stays parked on a channel once its group is cancelled.

use std::any::{Any, type_name};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Type-erased value moved between pipeline tasks.
pub type Value = Box<dyn Any + Send>;

/// Sending half of a handoff channel.
///
/// The channel is closed once every [`Outlet`] clone has been dropped.
pub type Outlet = mpsc::Sender<Value>;

/// Receiving half of a handoff channel.
pub type Inlet = mpsc::Receiver<Value>;

/// Creates a handoff channel buffering at most `capacity` values (at least one).
pub fn handoff_channel(capacity: usize) -> (Outlet, Inlet) {
    mpsc::channel(capacity.max(1))
}

/// Sends `value` into `outlet`, boxing it as a [`Value`].
///
/// Use [`send_value`] for values that are already boxed, otherwise the box itself becomes the
/// transferred type.
pub async fn send<T>(token: &CancellationToken, value: T, outlet: &Outlet) -> SyncResult<()>
where
    T: Any + Send,
{
    send_value(token, Box::new(value), outlet).await
}

/// Sends an already type-erased `value` into `outlet`.
///
/// Fails with [`ErrorKind::Cancelled`] if `token` is cancelled before the channel accepts the
/// value (cancellation is checked first), and with [`ErrorKind::ChannelClosed`] if the receiving
/// half is gone.
pub async fn send_value(token: &CancellationToken, value: Value, outlet: &Outlet) -> SyncResult<()> {
    tokio::select! {
        biased;

        _ = token.cancelled() => {
            bail!(ErrorKind::Cancelled, "Send was cancelled");
        }
        result = outlet.send(value) => {
            if result.is_err() {
                bail!(ErrorKind::ChannelClosed, "Receiving side of the channel is closed");
            }
        }
    }

    Ok(())
}

/// Receives the next value from `inlet` without inspecting its type.
///
/// Returns `Ok(None)` once the channel is closed and drained. Cancellation takes priority over
/// a value that is already available.
pub async fn recv_value(token: &CancellationToken, inlet: &mut Inlet) -> SyncResult<Option<Value>> {
    tokio::select! {
        biased;

        _ = token.cancelled() => {
            bail!(ErrorKind::Cancelled, "Receive was cancelled");
        }
        value = inlet.recv() => Ok(value),
    }
}

/// Receives the next value from `inlet` and downcasts it to `T`.
///
/// Behaves like [`recv_value`], additionally failing with [`ErrorKind::TypeMismatch`] when the
/// received value is not a `T`. The mismatching value is dropped.
pub async fn recv<T>(token: &CancellationToken, inlet: &mut Inlet) -> SyncResult<Option<T>>
where
    T: Any,
{
    let Some(value) = recv_value(token, inlet).await? else {
        return Ok(None);
    };

    downcast(value).map(Some)
}

/// Downcasts a [`Value`] to `T`, failing with [`ErrorKind::TypeMismatch`].
pub fn downcast<T>(value: Value) -> SyncResult<T>
where
    T: Any,
{
    match value.downcast::<T>() {
        Ok(value) => Ok(*value),
        Err(_) => bail!(
            ErrorKind::TypeMismatch,
            "Received value has an unexpected type",
            format!("expected a value of type `{}`", type_name::<T>())
        ),
    }
}
