//! Replicated activity-state conflict resolution and deterministic timer
//! derivation for multi-region, active-active durable workflow executions.
//!
//! Regions run the same workflow executions independently and replicate
//! activity progress (schedule, start, heartbeat, retry) to each other. Those
//! updates arrive out of order, duplicated, or late. This crate decides,
//! without coordination, whether an incoming update is newer, stale, or needs
//! missing history first, and regenerates the exact same pending timer tasks
//! on every region from the same mutable state.
//!
//! # Layers
//!
//! - [`version_history`]: branching `(event_id, version)` sequences and the
//!   lowest-common-ancestor reconciliation used to compare lineages.
//! - [`timer_sequence`]: derives every timer obligation that should exist for
//!   the pending activities and user timers, and creates the next one.
//! - [`replication`]: the activity-state reconciler and the sync orchestrator
//!   that drives batches under a workflow lease and commits passively.
//! - [`workflow`], [`providers`], [`shard`]: the lease provider, storage and
//!   shard collaborators the orchestrator runs against.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duroxide_xdc::providers::in_memory::InMemoryExecutionStore;
//! use duroxide_xdc::replication::{ActivityStateReplicator, SyncActivitiesRequest};
//! use duroxide_xdc::{CallContext, ReplicationOptions, ShardContext, WorkflowCache};
//!
//! # async fn example(request: SyncActivitiesRequest) -> Result<(), duroxide_xdc::Error> {
//! let store = Arc::new(InMemoryExecutionStore::default());
//! let shard = Arc::new(ShardContext::new(1, store, ReplicationOptions::default()));
//! let cache = Arc::new(WorkflowCache::new(shard.options().workflow_cache_max_entries));
//! let replicator = ActivityStateReplicator::new(shard, cache);
//!
//! match replicator.sync_activities_state(&CallContext::background(), request).await {
//!     Ok(()) => {}
//!     Err(e) if e.is_duplicate() => {} // already applied, ack the task
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod providers;
pub mod replication;
pub mod shard;
pub mod state;
pub mod tasks;
pub mod timer_sequence;
pub mod version_history;
pub mod workflow;

pub use config::ReplicationOptions;
pub use context::CallContext;
pub use error::{Error, RetryReplication};
pub use shard::ShardContext;
pub use workflow::{LockPriority, WorkflowCache, WorkflowLease};

/// Event id of the first event in every workflow history.
pub const FIRST_EVENT_ID: i64 = 1;

/// Marker for "no event": an activity that has not started yet carries this
/// as its started event id.
pub const EMPTY_EVENT_ID: i64 = 0;

/// Marker for "no version".
pub const EMPTY_VERSION: i64 = 0;

/// Identifies one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowKey {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}
