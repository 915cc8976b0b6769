use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::WorkflowKey;
use crate::state::{ActivityInfo, ExecutionInfo, TimerInfo};
use crate::tasks::PersistedTask;

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// Full persisted image of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub key: WorkflowKey,
    pub execution_info: ExecutionInfo,
    pub activity_infos: BTreeMap<i64, ActivityInfo>,
    pub timer_infos: BTreeMap<String, TimerInfo>,
    pub tasks: Vec<PersistedTask>,
    /// Optimistic concurrency token; bumped by every committed mutation.
    pub db_record_version: i64,
}

/// Incremental changes to one run, produced by closing a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMutation {
    pub key: WorkflowKey,
    pub execution_info: ExecutionInfo,
    pub upsert_activity_infos: BTreeMap<i64, ActivityInfo>,
    pub delete_activity_infos: Vec<i64>,
    pub upsert_timer_infos: BTreeMap<String, TimerInfo>,
    pub delete_timer_infos: Vec<String>,
    pub tasks: Vec<PersistedTask>,
    /// The write only applies if the stored run is at `db_record_version - 1`.
    pub db_record_version: i64,
}

/// How a run creation interacts with the current-run pointer of its workflow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateWorkflowMode {
    /// The run becomes the current run; fails if the workflow id has one.
    BrandNew,
    /// The run is stored without touching the current-run pointer.
    BypassCurrent,
}

/// How an update interacts with the current-run pointer of its workflow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateWorkflowMode {
    /// The run must be the current run.
    UpdateCurrent,
    /// The run must not be the current run (zombie).
    BypassCurrent,
    /// The current-run pointer is not checked.
    IgnoreCurrent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWorkflowExecutionRequest {
    pub shard_id: i32,
    pub mode: UpdateWorkflowMode,
    pub mutation: WorkflowMutation,
    /// Run created in the same write, e.g. by continue-as-new.
    pub new_snapshot: Option<WorkflowSnapshot>,
}

/// Durable storage of workflow runs.
///
/// Implementations must apply every write atomically: either the whole
/// mutation (and new run, if any) is visible afterwards or none of it is.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        snapshot: WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> Result<(), ProviderError>;

    /// Load a run. Unknown runs fail with [`ProviderErrorKind::NotFound`].
    async fn get_workflow_execution(&self, key: &WorkflowKey) -> Result<WorkflowSnapshot, ProviderError>;

    async fn update_workflow_execution(&self, request: UpdateWorkflowExecutionRequest) -> Result<(), ProviderError>;
}

/// In-memory store for tests and local use.
pub mod in_memory;
