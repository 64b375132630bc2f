//! Metric names emitted by synctools.
//!
//! Metrics go through the [`metrics`] facade; nothing is recorded unless the embedding
//! application installs a recorder.

/// Label carrying the waypoint name (the stage name for pipeline stages).
pub const WAYPOINT_LABEL: &str = "waypoint";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

// Waypoint metrics

/// Gauge for the current capacity of a waypoint.
pub const SYNCTOOLS_WAYPOINT_CAPACITY: &str = "synctools_waypoint_capacity";

/// Gauge for the number of active workers of a waypoint.
pub const SYNCTOOLS_WAYPOINT_ACTIVE_WORKERS: &str = "synctools_waypoint_active_workers";

/// Gauge for the number of workers waiting for admission.
pub const SYNCTOOLS_WAYPOINT_WAITING_WORKERS: &str = "synctools_waypoint_waiting_workers";

/// Counter for workers that reached the finished state.
pub const SYNCTOOLS_WAYPOINT_FINISHED_WORKERS_TOTAL: &str =
    "synctools_waypoint_finished_workers_total";

/// Histogram of the seconds a worker waited before becoming active.
pub const SYNCTOOLS_WAYPOINT_WAIT_SECONDS: &str = "synctools_waypoint_wait_seconds";

// Pipeline metrics

/// Counter for pipeline runs that ended with an error.
pub const SYNCTOOLS_PIPELINE_ERRORS_TOTAL: &str = "synctools_pipeline_errors_total";
