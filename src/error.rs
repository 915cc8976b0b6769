//! Error taxonomy for replication sync requests.
//!
//! Only two outcomes of a sync request are expected, non-fault conditions:
//! [`Error::Duplicate`] (everything in the request was already applied or is
//! stale) and [`Error::RetryReplication`] (local history is missing events the
//! update depends on). Callers must treat the former as an acknowledgement and
//! resolve the latter by fetching the indicated event range before retrying.
//! Everything else is either a storage failure or a hard defect.

use std::fmt;

use crate::WorkflowKey;
use crate::providers::ProviderError;
use crate::version_history::VersionHistoryError;

/// Request to re-fetch replicated events for one workflow starting after
/// `(start_event_id, start_version)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReplication {
    pub message: String,
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub start_event_id: i64,
    pub start_version: i64,
    pub end_event_id: i64,
    pub end_version: i64,
}

impl RetryReplication {
    /// Open-ended resend starting at `(start_event_id, start_version)`.
    pub fn from_start(
        message: impl Into<String>,
        key: &WorkflowKey,
        start_event_id: i64,
        start_version: i64,
    ) -> Self {
        Self {
            message: message.into(),
            namespace_id: key.namespace_id.clone(),
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id.clone(),
            start_event_id,
            start_version,
            end_event_id: crate::EMPTY_EVENT_ID,
            end_version: crate::EMPTY_VERSION,
        }
    }
}

impl fmt::Display for RetryReplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}/{}, start_event_id={}, start_version={})",
            self.message,
            self.namespace_id,
            self.workflow_id,
            self.run_id,
            self.start_event_id,
            self.start_version
        )
    }
}

/// Errors surfaced by the replication core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The workflow run does not exist in this region.
    NotFound { key: WorkflowKey },
    /// Every update in the request was discarded.
    Duplicate,
    /// Local history must catch up before the update can be applied.
    RetryReplication(RetryReplication),
    /// Corrupt or inconsistent version history.
    VersionHistory(VersionHistoryError),
    /// Logic or data-consistency defect.
    Internal(String),
    /// Malformed request.
    InvalidArgument(String),
    /// Persistence failure.
    Provider(ProviderError),
    /// The caller cancelled the request.
    Cancelled { operation: String },
    /// The caller's deadline elapsed.
    DeadlineExceeded { operation: String },
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Provider(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn retry_replication(&self) -> Option<&RetryReplication> {
        match self {
            Error::RetryReplication(r) => Some(r),
            _ => None,
        }
    }

    /// Whether redelivering the same request may succeed.
    ///
    /// `RetryReplication` is retryable only after the caller resent the
    /// missing events; it is reported as retryable so delivery keeps the task.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RetryReplication(_) => true,
            Error::Provider(e) => e.is_retryable(),
            Error::Cancelled { .. } | Error::DeadlineExceeded { .. } => true,
            Error::NotFound { .. }
            | Error::Duplicate
            | Error::VersionHistory(_)
            | Error::Internal(_)
            | Error::InvalidArgument(_) => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { key } => write!(f, "workflow execution not found: {key}"),
            Error::Duplicate => write!(f, "duplicate replication task"),
            Error::RetryReplication(r) => write!(f, "retry replication: {r}"),
            Error::VersionHistory(e) => write!(f, "version history: {e}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Provider(e) => write!(f, "provider error: {e}"),
            Error::Cancelled { operation } => write!(f, "{operation}: cancelled"),
            Error::DeadlineExceeded { operation } => write!(f, "{operation}: deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::VersionHistory(e) => Some(e),
            Error::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VersionHistoryError> for Error {
    fn from(e: VersionHistoryError) -> Self {
        Error::VersionHistory(e)
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Error::Provider(e)
    }
}
