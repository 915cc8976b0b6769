//! Workflow mutable state: persisted records and the accessor/mutator
//! surface the reconciler and timer engine work against.
//!
//! [`MutableState`] is the only write path for [`ActivityInfo`] and
//! [`TimerInfo`]. Callers hold the workflow lease for the whole time they
//! have a `&mut dyn MutableState`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::WorkflowKey;
use crate::error::Error;
use crate::tasks::Task;
use crate::timer_sequence::TimerTaskStatus;
use crate::version_history::{VersionHistories, VersionHistory};

pub mod mutable_state;

pub use mutable_state::{TransactionPolicy, WorkflowMutableState};

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowState {
    #[default]
    Created,
    Running,
    Completed,
    /// Superseded by another run but not cleaned up yet.
    Zombie,
    Void,
    Corrupted,
}

/// Close status of a workflow run; `Running` while open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

/// Run-level fields of mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub version_histories: VersionHistories,
    /// Absolute run deadline; no timer is created past it.
    pub workflow_run_expiration_ms: Option<u64>,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
}

impl ExecutionInfo {
    pub fn new(history: VersionHistory) -> Self {
        Self {
            version_histories: VersionHistories::new(history),
            workflow_run_expiration_ms: None,
            state: WorkflowState::Running,
            status: WorkflowStatus::Running,
        }
    }
}

/// Retry policy fields carried on an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    /// 0 means unlimited.
    pub maximum_attempts: i32,
    pub backoff_coefficient: f64,
}

/// Persisted state of one pending activity, keyed by its scheduled event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub scheduled_event_id: i64,
    pub scheduled_time_ms: Option<u64>,
    /// Schedule time of attempt 1; stays fixed across retries.
    pub first_scheduled_time_ms: Option<u64>,
    /// `EMPTY_EVENT_ID` until the current attempt starts.
    pub started_event_id: i64,
    pub started_time_ms: Option<u64>,
    pub last_heartbeat_update_time_ms: Option<u64>,
    pub last_heartbeat_details: Option<Vec<u8>>,
    pub activity_id: String,
    pub schedule_to_start_timeout: Duration,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub attempt: i32,
    pub stamp: i32,
    /// Timer kinds that already have an outstanding task.
    pub timer_task_status: TimerTaskStatus,
    /// Visibility time of the last heartbeat timeout task created.
    pub last_heartbeat_timeout_visibility_ms: Option<u64>,
    pub last_failure: Option<String>,
    pub last_worker_identity: String,
    pub last_started_build_id: String,
    pub last_started_redirect_counter: i64,
    pub last_attempt_complete_time_ms: Option<u64>,
    pub paused: bool,
    pub retry_policy: RetryPolicy,
}

impl ActivityInfo {
    /// A freshly scheduled, not yet started activity at attempt 1.
    pub fn scheduled(activity_id: impl Into<String>, version: i64, scheduled_event_id: i64, scheduled_time_ms: u64) -> Self {
        Self {
            version,
            scheduled_event_id,
            scheduled_time_ms: Some(scheduled_time_ms),
            first_scheduled_time_ms: Some(scheduled_time_ms),
            started_event_id: crate::EMPTY_EVENT_ID,
            started_time_ms: None,
            last_heartbeat_update_time_ms: None,
            last_heartbeat_details: None,
            activity_id: activity_id.into(),
            schedule_to_start_timeout: Duration::ZERO,
            schedule_to_close_timeout: Duration::ZERO,
            start_to_close_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            attempt: 1,
            stamp: 0,
            timer_task_status: TimerTaskStatus::NONE,
            last_heartbeat_timeout_visibility_ms: None,
            last_failure: None,
            last_worker_identity: String::new(),
            last_started_build_id: String::new(),
            last_started_redirect_counter: 0,
            last_attempt_complete_time_ms: None,
            paused: false,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_event_id != crate::EMPTY_EVENT_ID
    }
}

/// Persisted state of one pending user timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_event_id: i64,
    pub expiry_time_ms: Option<u64>,
    pub version: i64,
    pub task_status: TimerTaskStatus,
}

/// Replicated activity update produced by the source region. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySyncInfo {
    pub version: i64,
    pub scheduled_event_id: i64,
    pub scheduled_time_ms: Option<u64>,
    pub started_event_id: i64,
    pub started_time_ms: Option<u64>,
    pub last_heartbeat_time_ms: Option<u64>,
    pub details: Option<Vec<u8>>,
    pub attempt: i32,
    pub last_failure: Option<String>,
    pub last_worker_identity: String,
    pub last_started_build_id: String,
    pub last_started_redirect_counter: i64,
    /// Source region's current branch when the update was produced.
    pub version_history: VersionHistory,
    pub first_scheduled_time_ms: Option<u64>,
    pub last_attempt_complete_time_ms: Option<u64>,
    pub stamp: i32,
    pub paused: bool,
    pub retry_policy: RetryPolicy,
}

impl ActivitySyncInfo {
    /// Whether this update describes a retry: not started, attempt moved past `local_attempt`.
    pub fn is_retry_of(&self, local_attempt: i32) -> bool {
        self.started_event_id == crate::EMPTY_EVENT_ID && self.attempt > local_attempt
    }
}

/// Whether timer tasks created for `current` carry stale data for an activity
/// updated to `incoming` and must be recreated.
pub fn should_reset_activity_timer_task_mask(current: &ActivityInfo, incoming: &ActivitySyncInfo) -> bool {
    current.version != incoming.version || current.attempt != incoming.attempt || current.stamp != incoming.stamp
}

/// Accessors and mutators over one workflow run's mutable state.
pub trait MutableState: Send {
    fn workflow_key(&self) -> &WorkflowKey;

    fn execution_info(&self) -> &ExecutionInfo;

    fn workflow_state_status(&self) -> (WorkflowState, WorkflowStatus);

    fn activity_info(&self, scheduled_event_id: i64) -> Option<&ActivityInfo>;

    fn pending_activity_infos(&self) -> &BTreeMap<i64, ActivityInfo>;

    /// Pending user timers keyed by timer id.
    fn pending_timer_infos(&self) -> &BTreeMap<String, TimerInfo>;

    fn user_timer_info_by_event_id(&self, started_event_id: i64) -> Option<&TimerInfo>;

    /// Overwrites the activity from a replicated update. With
    /// `reset_timer_task_status` the status mask is cleared so timers are
    /// recreated with the new attempt data.
    fn update_activity_info(&mut self, sync: &ActivitySyncInfo, reset_timer_task_status: bool) -> Result<(), Error>;

    /// Replaces the activity's timer status; `heartbeat_timeout_visibility_ms`
    /// is recorded when a heartbeat timer task is being created.
    fn update_activity_task_status_with_timer_heartbeat(
        &mut self,
        scheduled_event_id: i64,
        status: TimerTaskStatus,
        heartbeat_timeout_visibility_ms: Option<u64>,
    ) -> Result<(), Error>;

    fn update_user_timer_task_status(&mut self, timer_id: &str, status: TimerTaskStatus) -> Result<(), Error>;

    /// Queues tasks to be persisted with the next commit.
    fn add_tasks(&mut self, tasks: Vec<Task>);
}
