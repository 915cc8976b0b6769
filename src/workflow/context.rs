use tracing::debug;

use crate::WorkflowKey;
use crate::context::CallContext;
use crate::error::Error;
use crate::providers::{UpdateWorkflowExecutionRequest, UpdateWorkflowMode};
use crate::shard::ShardContext;
use crate::state::{TransactionPolicy, WorkflowMutableState};

/// Cached execution context of one workflow run: the loaded mutable state and
/// the commit path back to the execution store.
///
/// Only reachable through a [`WorkflowLease`](super::WorkflowLease), so at
/// most one request uses it at a time.
#[derive(Debug)]
pub struct ExecutionContext {
    key: WorkflowKey,
    mutable_state: Option<WorkflowMutableState>,
}

impl ExecutionContext {
    pub fn new(key: WorkflowKey) -> Self {
        Self {
            key,
            mutable_state: None,
        }
    }

    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.mutable_state.is_some()
    }

    pub fn mutable_state(&self) -> Option<&WorkflowMutableState> {
        self.mutable_state.as_ref()
    }

    /// Return the cached mutable state, loading it from the store first if
    /// needed. A run the store does not know fails with [`Error::NotFound`].
    pub async fn load_mutable_state(
        &mut self,
        call_ctx: &CallContext,
        shard: &ShardContext,
    ) -> Result<&mut WorkflowMutableState, Error> {
        if self.mutable_state.is_none() {
            let loaded = call_ctx
                .run(
                    "load_mutable_state",
                    shard.execution_store().get_workflow_execution(&self.key),
                )
                .await?;
            let snapshot = match loaded {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_not_found() => return Err(Error::NotFound { key: self.key.clone() }),
                Err(e) => return Err(Error::Provider(e)),
            };
            debug!(
                target: "duroxide_xdc::workflow",
                namespace_id = %self.key.namespace_id,
                workflow_id = %self.key.workflow_id,
                run_id = %self.key.run_id,
                db_record_version = snapshot.db_record_version,
                "loaded mutable state"
            );
            self.mutable_state = Some(WorkflowMutableState::from_snapshot(snapshot));
        }
        self.mutable_state
            .as_mut()
            .ok_or_else(|| Error::internal("mutable state missing after load"))
    }

    /// Commit passively without checking the current-run pointer.
    pub async fn update_workflow_execution_as_passive(
        &mut self,
        call_ctx: &CallContext,
        shard: &ShardContext,
    ) -> Result<(), Error> {
        self.update_workflow_execution_with_new(
            call_ctx,
            shard,
            UpdateWorkflowMode::IgnoreCurrent,
            None,
            TransactionPolicy::Passive,
        )
        .await
    }

    /// Commit every change since the last commit, optionally creating a new
    /// run in the same write. Any failure drops the cached state so the next
    /// user reloads it from the store.
    pub async fn update_workflow_execution_with_new(
        &mut self,
        call_ctx: &CallContext,
        shard: &ShardContext,
        mode: UpdateWorkflowMode,
        new_mutable_state: Option<WorkflowMutableState>,
        policy: TransactionPolicy,
    ) -> Result<(), Error> {
        let Some(ms) = self.mutable_state.as_mut() else {
            return Err(Error::internal(format!("commit for {} without loaded mutable state", self.key)));
        };
        let mutation = ms.close_transaction_as_mutation(policy, shard);
        let db_record_version = mutation.db_record_version;
        let task_count = mutation.tasks.len();
        let request = UpdateWorkflowExecutionRequest {
            shard_id: shard.shard_id(),
            mode,
            mutation,
            new_snapshot: new_mutable_state.map(|n| n.to_snapshot()),
        };

        let result = match call_ctx
            .run(
                "update_workflow_execution",
                shard.execution_store().update_workflow_execution(request),
            )
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Provider(e)),
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => {
                shard.metrics().record_commit();
                debug!(
                    target: "duroxide_xdc::workflow",
                    namespace_id = %self.key.namespace_id,
                    workflow_id = %self.key.workflow_id,
                    run_id = %self.key.run_id,
                    ?mode,
                    ?policy,
                    db_record_version,
                    task_count,
                    "committed workflow mutation"
                );
            }
            Err(_) => self.clear(),
        }
        result
    }

    /// Drop the cached mutable state.
    pub fn clear(&mut self) {
        self.mutable_state = None;
    }
}
