/// Provider-specific error with retry classification
///
/// Execution stores return this error type to indicate what failed and
/// whether the operation may be retried. The replication core maps
/// [`ProviderErrorKind::NotFound`] on load to a silent drop and propagates
/// everything else unchanged.
///
/// # Error Classification
///
/// **Retryable (is_retryable = true)**:
/// - Database busy/locked
/// - Connection timeouts
/// - Optimistic concurrency conflicts (state must be reloaded first)
///
/// **Non-retryable (is_retryable = false)**:
/// - Missing workflow run
/// - Update mode does not match the run's current-run status
/// - Data corruption (invalid format)
///
/// # Example Usage
///
/// ```rust,no_run
/// use duroxide_xdc::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("update_workflow_execution", "database is busy"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "get_workflow_execution")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// What went wrong
    pub kind: ProviderErrorKind,
    /// Whether this error should be retried
    pub retryable: bool,
}

/// Classification of provider failures the core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The workflow run does not exist.
    NotFound,
    /// The stored record version did not match the expected one.
    ConditionFailed,
    /// The run's current-run status contradicts the requested update mode.
    CurrentWorkflowConditionFailed,
    /// The run already exists.
    AlreadyExists,
    /// Anything else.
    Other,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Other,
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Other,
            retryable: false,
        }
    }

    /// The workflow run does not exist
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::NotFound,
            retryable: false,
        }
    }

    /// Optimistic concurrency check failed; reload and retry
    pub fn condition_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::ConditionFailed,
            retryable: true,
        }
    }

    /// Update mode does not fit the run's current-run status
    pub fn current_workflow_condition_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::CurrentWorkflowConditionFailed,
            retryable: false,
        }
    }

    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::AlreadyExists,
            retryable: false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
