//! Shared configuration types for synctools pipelines.

mod base;
mod pipeline;
mod stage;

pub use base::ValidationError;
pub use pipeline::PipelineConfig;
pub use stage::StageConfig;
