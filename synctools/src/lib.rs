//! Bounded-concurrency coordination and staged pipelines on tokio.
//!
//! [`waypoint::Waypoint`] bounds how many workers may be active at once with a capacity that can
//! change at runtime. [`pipeline::Pipeline`] connects a producer, an ordered list of stages (each
//! bounded by its own waypoint) and a consumer, cancelling the whole run on the first error.

pub mod concurrency;
pub mod error;
pub mod failpoints;
mod macros;
pub mod metrics;
pub mod pipeline;
pub mod waypoint;

pub use concurrency::channel::{Inlet, Outlet, Value, recv, send};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use pipeline::{Pipeline, PipelineIo, typed};
pub use waypoint::{Waypoint, WaypointMetrics, Worker};
