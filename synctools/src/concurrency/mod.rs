//! Concurrency primitives shared by waypoints and pipelines.
//!
//! Provides cancelable channel transfer, task groups that fail fast, and one-shot completion
//! signals.

pub mod channel;
pub mod group;
pub mod signal;
