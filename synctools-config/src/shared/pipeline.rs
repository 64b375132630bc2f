use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{StageConfig, ValidationError};

/// Configuration for a staged pipeline.
///
/// Stage entries are looked up by name when stages are registered through the
/// pipeline's configured registration path; their order here carries no meaning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Number of values a handoff channel buffers before a send blocks.
    ///
    /// The default of one keeps handoffs close to a rendezvous.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Per-stage settings.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Default capacity of the channels connecting pipeline tasks.
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

    /// Returns the configuration of the stage called `name`, if any.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Validates pipeline configuration settings.
    ///
    /// Ensures the channel capacity is non-zero and every stage has a unique, non-empty name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.channel_capacity == 0 {
            return Err(ValidationError::ChannelCapacityZero);
        }

        let mut seen = HashSet::with_capacity(self.stages.len());
        for (position, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(ValidationError::EmptyStageName(position));
            }

            if !seen.insert(stage.name.as_str()) {
                return Err(ValidationError::DuplicateStageName(stage.name.clone()));
            }
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            stages: Vec::new(),
        }
    }
}

impl Config for PipelineConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn default_channel_capacity() -> usize {
    PipelineConfig::DEFAULT_CHANNEL_CAPACITY
}
