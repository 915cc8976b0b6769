use std::collections::{BTreeMap, BTreeSet};

use super::{ActivityInfo, ActivitySyncInfo, ExecutionInfo, MutableState, TimerInfo, WorkflowState, WorkflowStatus};
use crate::WorkflowKey;
use crate::error::Error;
use crate::providers::{WorkflowMutation, WorkflowSnapshot};
use crate::shard::ShardContext;
use crate::tasks::{PersistedTask, Task};
use crate::timer_sequence::TimerTaskStatus;

/// Whether a transaction originates in this region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// Locally originated; side effects such as replication tasks are generated.
    Active,
    /// Applied from a replicated event; no side effects are generated.
    Passive,
}

/// In-memory mutable state of one workflow run, tracking what changed since
/// it was loaded or last committed.
#[derive(Debug, Clone)]
pub struct WorkflowMutableState {
    key: WorkflowKey,
    execution_info: ExecutionInfo,
    activity_infos: BTreeMap<i64, ActivityInfo>,
    timer_infos: BTreeMap<String, TimerInfo>,
    updated_activity_ids: BTreeSet<i64>,
    deleted_activity_ids: BTreeSet<i64>,
    updated_timer_ids: BTreeSet<String>,
    deleted_timer_ids: BTreeSet<String>,
    pending_tasks: Vec<Task>,
    db_record_version: i64,
}

impl WorkflowMutableState {
    /// Empty state for a run that has not been persisted yet.
    pub fn new(key: WorkflowKey, execution_info: ExecutionInfo) -> Self {
        Self {
            key,
            execution_info,
            activity_infos: BTreeMap::new(),
            timer_infos: BTreeMap::new(),
            updated_activity_ids: BTreeSet::new(),
            deleted_activity_ids: BTreeSet::new(),
            updated_timer_ids: BTreeSet::new(),
            deleted_timer_ids: BTreeSet::new(),
            pending_tasks: Vec::new(),
            db_record_version: 0,
        }
    }

    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self {
            db_record_version: snapshot.db_record_version,
            activity_infos: snapshot.activity_infos,
            timer_infos: snapshot.timer_infos,
            ..Self::new(snapshot.key, snapshot.execution_info)
        }
    }

    /// Image of the current state for creating the run. Pending tasks are not
    /// included.
    pub fn to_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            key: self.key.clone(),
            execution_info: self.execution_info.clone(),
            activity_infos: self.activity_infos.clone(),
            timer_infos: self.timer_infos.clone(),
            tasks: Vec::new(),
            db_record_version: self.db_record_version,
        }
    }

    pub fn db_record_version(&self) -> i64 {
        self.db_record_version
    }

    pub fn execution_info_mut(&mut self) -> &mut ExecutionInfo {
        &mut self.execution_info
    }

    pub fn set_workflow_state_status(&mut self, state: WorkflowState, status: WorkflowStatus) {
        self.execution_info.state = state;
        self.execution_info.status = status;
    }

    pub fn insert_activity_info(&mut self, info: ActivityInfo) {
        let id = info.scheduled_event_id;
        self.deleted_activity_ids.remove(&id);
        self.updated_activity_ids.insert(id);
        self.activity_infos.insert(id, info);
    }

    pub fn delete_activity_info(&mut self, scheduled_event_id: i64) -> Option<ActivityInfo> {
        let removed = self.activity_infos.remove(&scheduled_event_id)?;
        self.updated_activity_ids.remove(&scheduled_event_id);
        self.deleted_activity_ids.insert(scheduled_event_id);
        Some(removed)
    }

    pub fn insert_timer_info(&mut self, info: TimerInfo) {
        let id = info.timer_id.clone();
        self.deleted_timer_ids.remove(&id);
        self.updated_timer_ids.insert(id.clone());
        self.timer_infos.insert(id, info);
    }

    pub fn delete_timer_info(&mut self, timer_id: &str) -> Option<TimerInfo> {
        let removed = self.timer_infos.remove(timer_id)?;
        self.updated_timer_ids.remove(timer_id);
        self.deleted_timer_ids.insert(timer_id.to_string());
        Some(removed)
    }

    /// Tasks added since the last transaction was closed.
    pub fn pending_tasks(&self) -> &[Task] {
        &self.pending_tasks
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.updated_activity_ids.is_empty()
            || !self.deleted_activity_ids.is_empty()
            || !self.updated_timer_ids.is_empty()
            || !self.deleted_timer_ids.is_empty()
            || !self.pending_tasks.is_empty()
    }

    /// Close the current transaction: collect every change since the last
    /// one into a mutation and reset change tracking.
    ///
    /// Task ids are assigned from the shard. Active transactions emit one
    /// `SyncActivity` replication task per updated activity.
    pub fn close_transaction_as_mutation(&mut self, policy: TransactionPolicy, shard: &ShardContext) -> WorkflowMutation {
        let updated_activity_ids = std::mem::take(&mut self.updated_activity_ids);
        let mut tasks = std::mem::take(&mut self.pending_tasks);
        if policy == TransactionPolicy::Active {
            tasks.extend(updated_activity_ids.iter().filter_map(|id| {
                self.activity_infos.get(id).map(|info| Task::SyncActivity {
                    key: self.key.clone(),
                    version: info.version,
                    scheduled_event_id: info.scheduled_event_id,
                })
            }));
        }

        let first_task_id = shard.allocate_task_ids(tasks.len());
        let tasks: Vec<PersistedTask> = tasks
            .into_iter()
            .zip(first_task_id..)
            .map(|(task, task_id)| PersistedTask { task_id, task })
            .collect();

        let upsert_activity_infos = updated_activity_ids
            .into_iter()
            .filter_map(|id| self.activity_infos.get(&id).map(|info| (id, info.clone())))
            .collect();
        let upsert_timer_infos = std::mem::take(&mut self.updated_timer_ids)
            .into_iter()
            .filter_map(|id| self.timer_infos.get(&id).map(|info| (id, info.clone())))
            .collect();

        self.db_record_version += 1;
        WorkflowMutation {
            key: self.key.clone(),
            execution_info: self.execution_info.clone(),
            upsert_activity_infos,
            delete_activity_infos: std::mem::take(&mut self.deleted_activity_ids).into_iter().collect(),
            upsert_timer_infos,
            delete_timer_infos: std::mem::take(&mut self.deleted_timer_ids).into_iter().collect(),
            tasks,
            db_record_version: self.db_record_version,
        }
    }
}

impl MutableState for WorkflowMutableState {
    fn workflow_key(&self) -> &WorkflowKey {
        &self.key
    }

    fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    fn workflow_state_status(&self) -> (WorkflowState, WorkflowStatus) {
        (self.execution_info.state, self.execution_info.status)
    }

    fn activity_info(&self, scheduled_event_id: i64) -> Option<&ActivityInfo> {
        self.activity_infos.get(&scheduled_event_id)
    }

    fn pending_activity_infos(&self) -> &BTreeMap<i64, ActivityInfo> {
        &self.activity_infos
    }

    fn pending_timer_infos(&self) -> &BTreeMap<String, TimerInfo> {
        &self.timer_infos
    }

    fn user_timer_info_by_event_id(&self, started_event_id: i64) -> Option<&TimerInfo> {
        self.timer_infos
            .values()
            .find(|t| t.started_event_id == started_event_id)
    }

    fn update_activity_info(&mut self, sync: &ActivitySyncInfo, reset_timer_task_status: bool) -> Result<(), Error> {
        let Some(ai) = self.activity_infos.get_mut(&sync.scheduled_event_id) else {
            return Err(Error::internal(format!(
                "unable to find activity with scheduled event id {} in mutable state",
                sync.scheduled_event_id
            )));
        };
        ai.version = sync.version;
        ai.scheduled_time_ms = sync.scheduled_time_ms;
        ai.started_event_id = sync.started_event_id;
        ai.started_time_ms = sync.started_time_ms;
        ai.last_heartbeat_update_time_ms = sync.last_heartbeat_time_ms;
        ai.last_heartbeat_details = sync.details.clone();
        ai.attempt = sync.attempt;
        ai.last_failure = sync.last_failure.clone();
        ai.last_worker_identity = sync.last_worker_identity.clone();
        ai.last_started_build_id = sync.last_started_build_id.clone();
        ai.last_started_redirect_counter = sync.last_started_redirect_counter;
        ai.first_scheduled_time_ms = sync.first_scheduled_time_ms;
        ai.last_attempt_complete_time_ms = sync.last_attempt_complete_time_ms;
        ai.stamp = sync.stamp;
        ai.paused = sync.paused;
        ai.retry_policy = sync.retry_policy.clone();
        if reset_timer_task_status {
            ai.timer_task_status = TimerTaskStatus::NONE;
        }
        self.updated_activity_ids.insert(sync.scheduled_event_id);
        Ok(())
    }

    fn update_activity_task_status_with_timer_heartbeat(
        &mut self,
        scheduled_event_id: i64,
        status: TimerTaskStatus,
        heartbeat_timeout_visibility_ms: Option<u64>,
    ) -> Result<(), Error> {
        let Some(ai) = self.activity_infos.get_mut(&scheduled_event_id) else {
            return Err(Error::internal(format!(
                "unable to find activity with scheduled event id {scheduled_event_id} in mutable state"
            )));
        };
        ai.timer_task_status = status;
        if heartbeat_timeout_visibility_ms.is_some() {
            ai.last_heartbeat_timeout_visibility_ms = heartbeat_timeout_visibility_ms;
        }
        self.updated_activity_ids.insert(scheduled_event_id);
        Ok(())
    }

    fn update_user_timer_task_status(&mut self, timer_id: &str, status: TimerTaskStatus) -> Result<(), Error> {
        let Some(ti) = self.timer_infos.get_mut(timer_id) else {
            return Err(Error::internal(format!("unable to find timer {timer_id} in mutable state")));
        };
        ti.task_status = status;
        self.updated_timer_ids.insert(timer_id.to_string());
        Ok(())
    }

    fn add_tasks(&mut self, tasks: Vec<Task>) {
        self.pending_tasks.extend(tasks);
    }
}
