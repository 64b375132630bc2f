use serde::{Deserialize, Serialize};

/// Configuration of a single pipeline stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StageConfig {
    /// Name of the stage, unique within its pipeline.
    pub name: String,
    /// Initial number of items the stage may process concurrently.
    ///
    /// A capacity of zero is accepted: the stage admits nothing until it is resized.
    #[serde(default = "default_stage_capacity")]
    pub capacity: usize,
}

impl StageConfig {
    /// Default initial capacity for a stage.
    pub const DEFAULT_CAPACITY: usize = 1;

    /// Creates a new [`StageConfig`].
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

fn default_stage_capacity() -> usize {
    StageConfig::DEFAULT_CAPACITY
}
