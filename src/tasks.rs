//! Tasks emitted into mutable state and persisted with the next commit.
//!
//! Task ids are assigned by the shard at commit time; until then a task only
//! carries its visibility timestamp and the data needed to validate it when
//! it fires.

use serde::{Deserialize, Serialize};

use crate::WorkflowKey;
use crate::timer_sequence::TimerType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Fires when an activity timeout of `timeout_type` may have elapsed.
    ActivityTimeout {
        key: WorkflowKey,
        visibility_timestamp_ms: u64,
        timeout_type: TimerType,
        event_id: i64,
        attempt: i32,
        stamp: i32,
    },
    /// Fires when a user timer expires.
    UserTimer {
        key: WorkflowKey,
        visibility_timestamp_ms: u64,
        event_id: i64,
    },
    /// Re-dispatches an activity after retry backoff.
    ActivityRetryTimer {
        key: WorkflowKey,
        visibility_timestamp_ms: u64,
        event_id: i64,
        version: i64,
        attempt: i32,
        stamp: i32,
    },
    /// Replicates an activity's state to other regions. Only generated by
    /// active transactions.
    SyncActivity {
        key: WorkflowKey,
        version: i64,
        scheduled_event_id: i64,
    },
}

impl Task {
    pub fn key(&self) -> &WorkflowKey {
        match self {
            Task::ActivityTimeout { key, .. }
            | Task::UserTimer { key, .. }
            | Task::ActivityRetryTimer { key, .. }
            | Task::SyncActivity { key, .. } => key,
        }
    }

    /// Visibility time for timer tasks; `None` for immediate tasks.
    pub fn visibility_timestamp_ms(&self) -> Option<u64> {
        match self {
            Task::ActivityTimeout {
                visibility_timestamp_ms,
                ..
            }
            | Task::UserTimer {
                visibility_timestamp_ms,
                ..
            }
            | Task::ActivityRetryTimer {
                visibility_timestamp_ms,
                ..
            } => Some(*visibility_timestamp_ms),
            Task::SyncActivity { .. } => None,
        }
    }

    pub fn is_timer(&self) -> bool {
        self.visibility_timestamp_ms().is_some()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::ActivityTimeout { .. } => "ActivityTimeout",
            Task::UserTimer { .. } => "UserTimer",
            Task::ActivityRetryTimer { .. } => "ActivityRetryTimer",
            Task::SyncActivity { .. } => "SyncActivity",
        }
    }
}

/// A task with the id the shard assigned at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub task_id: i64,
    pub task: Task,
}
