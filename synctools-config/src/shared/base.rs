use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The handoff channel between two pipeline tasks must hold at least one value.
    #[error("`channel_capacity` cannot be zero")]
    ChannelCapacityZero,
    /// A stage was configured without a name.
    #[error("stage at position {0} has an empty `name`")]
    EmptyStageName(usize),
    /// Two stages were configured with the same name.
    #[error("stage name `{0}` is configured more than once")]
    DuplicateStageName(String),
}
