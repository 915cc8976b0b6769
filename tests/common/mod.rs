// Not every test binary uses every helper.
#![allow(dead_code)]

pub mod fault_injection;
pub mod tracing_capture;

use std::sync::Arc;
use std::time::Duration;

use duroxide_xdc::providers::in_memory::InMemoryExecutionStore;
use duroxide_xdc::providers::{CreateWorkflowMode, ExecutionStore, WorkflowSnapshot};
use duroxide_xdc::replication::{ActivityStateReplicator, SyncActivitiesRequest, SyncActivityRequest};
use duroxide_xdc::state::{
    ActivityInfo, ActivitySyncInfo, ExecutionInfo, RetryPolicy, WorkflowMutableState, WorkflowState, WorkflowStatus,
};
use duroxide_xdc::version_history::{VersionHistory, VersionHistoryItem};
use duroxide_xdc::{ReplicationOptions, ShardContext, WorkflowCache, WorkflowKey};

pub const NOW: u64 = 1_700_000_000_000;

pub fn key() -> WorkflowKey {
    WorkflowKey::new("ns-1", "wf-1", "run-1")
}

pub fn history(items: &[(i64, i64)]) -> VersionHistory {
    VersionHistory::new(
        b"branch-token".to_vec(),
        items.iter().map(|&(e, v)| VersionHistoryItem::new(e, v)).collect(),
    )
}

/// Scheduled, not yet started activity with schedule-to-start 10s,
/// schedule-to-close 1000s, start-to-close 100s and no heartbeat timeout.
pub fn activity(scheduled_event_id: i64, version: i64) -> ActivityInfo {
    let mut info = ActivityInfo::scheduled(format!("activity-{scheduled_event_id}"), version, scheduled_event_id, NOW);
    info.schedule_to_start_timeout = Duration::from_secs(10);
    info.schedule_to_close_timeout = Duration::from_secs(1000);
    info.start_to_close_timeout = Duration::from_secs(100);
    info
}

/// Update mirroring `info` as produced on a region whose branch is `items`.
pub fn sync_of(info: &ActivityInfo, items: &[(i64, i64)]) -> ActivitySyncInfo {
    ActivitySyncInfo {
        version: info.version,
        scheduled_event_id: info.scheduled_event_id,
        scheduled_time_ms: info.scheduled_time_ms,
        started_event_id: info.started_event_id,
        started_time_ms: info.started_time_ms,
        last_heartbeat_time_ms: info.last_heartbeat_update_time_ms,
        details: None,
        attempt: info.attempt,
        last_failure: None,
        last_worker_identity: String::new(),
        last_started_build_id: String::new(),
        last_started_redirect_counter: 0,
        version_history: history(items),
        first_scheduled_time_ms: info.first_scheduled_time_ms,
        last_attempt_complete_time_ms: None,
        stamp: info.stamp,
        paused: false,
        retry_policy: RetryPolicy::default(),
    }
}

/// Update reporting that `info`'s activity started at `started_time_ms`.
pub fn started_sync(info: &ActivityInfo, items: &[(i64, i64)], started_event_id: i64, started_time_ms: u64) -> ActivitySyncInfo {
    let mut sync = sync_of(info, items);
    sync.started_event_id = started_event_id;
    sync.started_time_ms = Some(started_time_ms);
    sync.last_worker_identity = "worker-a".to_string();
    sync
}

pub struct Harness {
    pub store: Arc<InMemoryExecutionStore>,
    pub shard: Arc<ShardContext>,
    pub cache: Arc<WorkflowCache>,
    pub replicator: ActivityStateReplicator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(ReplicationOptions::default())
    }

    pub fn with_options(options: ReplicationOptions) -> Self {
        Self::with_store(Arc::new(InMemoryExecutionStore::default()), options)
    }

    pub fn with_store(store: Arc<InMemoryExecutionStore>, options: ReplicationOptions) -> Self {
        let cache = Arc::new(WorkflowCache::from_options(&options));
        let shard = Arc::new(ShardContext::new(1, store.clone(), options));
        let replicator = ActivityStateReplicator::new(shard.clone(), cache.clone());
        Self {
            store,
            shard,
            cache,
            replicator,
        }
    }

    /// Persist a running run as the current run of its workflow id.
    pub async fn create_run(&self, key: &WorkflowKey, items: &[(i64, i64)], activities: Vec<ActivityInfo>) {
        self.create_run_in_state(key, items, activities, WorkflowState::Running, CreateWorkflowMode::BrandNew)
            .await;
    }

    pub async fn create_run_in_state(
        &self,
        key: &WorkflowKey,
        items: &[(i64, i64)],
        activities: Vec<ActivityInfo>,
        state: WorkflowState,
        mode: CreateWorkflowMode,
    ) {
        let mut ms = WorkflowMutableState::new(key.clone(), ExecutionInfo::new(history(items)));
        let status = match state {
            WorkflowState::Completed => WorkflowStatus::Completed,
            _ => WorkflowStatus::Running,
        };
        ms.set_workflow_state_status(state, status);
        for a in activities {
            ms.insert_activity_info(a);
        }
        self.store.create_workflow_execution(ms.to_snapshot(), mode).await.unwrap();
    }

    pub async fn load(&self, key: &WorkflowKey) -> WorkflowSnapshot {
        self.store.get_workflow_execution(key).await.unwrap()
    }

    pub fn single(&self, key: &WorkflowKey, activity: ActivitySyncInfo) -> SyncActivityRequest {
        SyncActivityRequest {
            key: key.clone(),
            activity,
        }
    }

    pub fn batch(&self, key: &WorkflowKey, activities: Vec<ActivitySyncInfo>) -> SyncActivitiesRequest {
        SyncActivitiesRequest {
            key: key.clone(),
            activities,
        }
    }
}
