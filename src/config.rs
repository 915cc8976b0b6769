use std::time::Duration;

/// Configuration for the replication core.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use duroxide_xdc::ReplicationOptions;
///
/// let options = ReplicationOptions {
///     lease_acquire_timeout: Some(Duration::from_secs(5)),
///     ..Default::default()
/// };
/// assert!(!options.enable_update_workflow_mode_ignore_current);
/// ```
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Commit replicated activity state without checking whether the run is
    /// the current run of its workflow id.
    ///
    /// When disabled the commit mode follows the run's lifecycle state:
    /// zombie runs bypass the current run, everything else updates it.
    ///
    /// Default: false
    pub enable_update_workflow_mode_ignore_current: bool,

    /// Maximum number of workflow contexts kept in the cache.
    ///
    /// Only idle entries are evicted; entries with a held or awaited lease
    /// stay until released.
    ///
    /// Default: 512
    pub workflow_cache_max_entries: usize,

    /// Upper bound on how long a request waits for a workflow lease,
    /// independent of the caller's own deadline.
    ///
    /// Default: None (wait for the caller's deadline or cancellation only)
    pub lease_acquire_timeout: Option<Duration>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            enable_update_workflow_mode_ignore_current: false,
            workflow_cache_max_entries: 512,
            lease_acquire_timeout: None,
        }
    }
}
