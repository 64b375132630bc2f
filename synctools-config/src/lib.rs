//! Configuration types and loading for synctools pipelines.

pub mod environment;
pub mod load;
pub mod shared;
