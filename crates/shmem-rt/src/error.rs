//! Error types for runtime operations.

use thiserror::Error;

/// Errors surfaced by the runtime core.
///
/// Init-path failures abort startup with one of these kinds and a log record
/// at error level; data-path functions hand the kind back to the caller and
/// never panic in release builds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtError {
    /// `init`/`attach` was called a second time in the same process.
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// The runtime API was used before `init`/`attach` (or after `cleanup`).
    #[error("no runtime configuration available")]
    NoConfig,

    /// The CPU is missing a required feature.
    #[error("unsupported cpu type")]
    Unsupported,

    /// Malformed option, bad alignment, name too long, and friends.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Name collision in a shared directory.
    #[error("name already exists: {0}")]
    AlreadyExists(String),

    /// Lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// No free span large enough, or a bounded shared table is exhausted.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Huge-page access or lock acquisition denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested process role cannot be satisfied (e.g. secondary with
    /// no live primary).
    #[error("process role conflict: {0}")]
    RoleConflict(String),

    /// Unrecoverable condition: re-map mismatch, magic corruption.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RtError {
    /// Returns `true` when retrying the same call can never succeed.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialized | Self::Unsupported | Self::Fatal(_)
        )
    }

    #[inline]
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    #[inline]
    pub(crate) fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}
