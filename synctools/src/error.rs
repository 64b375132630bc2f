//! Error types and result definitions for synctools operations.
//!
//! Every fallible operation in this crate returns a [`SyncError`]. Errors are classified by
//! [`ErrorKind`] so callers can react to a category (for example cancellation) without matching
//! on messages, and each error records the location where it was constructed.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use synctools_config::shared::ValidationError;
use tokio::task::JoinError;

/// Convenient result type using [`SyncError`] as the error type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Specific categories of errors that can occur while coordinating work.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Registration Errors
    AlreadyStarted,
    NotStarted,
    StageNameConflict,
    StageNameUnknown,
    NoStages,
    CorruptedState,

    // Coordination Errors
    WaypointClosed,

    // Runtime Errors
    Cancelled,
    ChannelClosed,
    TypeMismatch,
    ProcessingFailed,
    TaskPanic,

    // Configuration Errors
    ConfigError,

    Unknown,
}

impl ErrorKind {
    /// Returns a stable snake-case name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyStarted => "already_started",
            ErrorKind::NotStarted => "not_started",
            ErrorKind::StageNameConflict => "stage_name_conflict",
            ErrorKind::StageNameUnknown => "stage_name_unknown",
            ErrorKind::NoStages => "no_stages",
            ErrorKind::CorruptedState => "corrupted_state",
            ErrorKind::WaypointClosed => "waypoint_closed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ChannelClosed => "channel_closed",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::ProcessingFailed => "processing_failed",
            ErrorKind::TaskPanic => "task_panic",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Main error type for synctools operations.
///
/// Cloning is cheap: the optional source is reference counted, which lets the first error of a
/// task group be handed back to the caller while other tasks are still unwinding.
#[derive(Debug, Clone)]
pub struct SyncError {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
}

impl SyncError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the dynamic detail attached to this error, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the callsite where this error was constructed.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Returns `true` when this error reports a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Attaches an originating [`error::Error`], exposed via [`error::Error::source`].
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
    ) -> Self {
        SyncError {
            kind,
            description,
            detail,
            source: None,
            location: Location::caller(),
        }
    }
}

/// Two errors are equal when they have the same kind.
impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            self.kind,
            self.description,
            self.location.file(),
            self.location.line(),
            self.location.column()
        )?;

        if let Some(detail) = self.detail.as_deref() {
            if detail.trim().is_empty() {
                write!(f, "\n  Detail: <empty>")?;
            } else {
                write!(f, "\n  Detail:")?;
                for line in detail.lines() {
                    write!(f, "\n    {line}")?;
                }
            }
        }

        Ok(())
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

/// Creates a [`SyncError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None)
    }
}

/// Creates a [`SyncError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()))
    }
}

/// Converts a failed task join into a [`SyncError`].
///
/// Panics map to [`ErrorKind::TaskPanic`], aborted tasks to [`ErrorKind::Cancelled`].
impl From<JoinError> for SyncError {
    #[track_caller]
    fn from(err: JoinError) -> SyncError {
        let (kind, description) = if err.is_panic() {
            (ErrorKind::TaskPanic, "Task panicked")
        } else {
            (ErrorKind::Cancelled, "Task was aborted")
        };

        let detail = err.to_string();
        SyncError::from_components(kind, Cow::Borrowed(description), Some(Cow::Owned(detail)))
            .with_source(err)
    }
}

/// Converts configuration validation failures into [`ErrorKind::ConfigError`].
impl From<ValidationError> for SyncError {
    #[track_caller]
    fn from(err: ValidationError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid pipeline configuration"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}
