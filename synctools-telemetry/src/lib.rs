//! Logging setup shared by synctools binaries and tests.

pub mod tracing;
