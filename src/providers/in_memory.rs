use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{
    CreateWorkflowMode, ExecutionStore, ProviderError, UpdateWorkflowExecutionRequest, UpdateWorkflowMode,
    WorkflowMutation, WorkflowSnapshot,
};
use crate::WorkflowKey;
use crate::tasks::PersistedTask;

#[derive(Default)]
struct Inner {
    runs: HashMap<WorkflowKey, WorkflowSnapshot>,
    // (namespace_id, workflow_id) -> current run id
    current: HashMap<(String, String), String>,
    updates: u64,
}

impl Inner {
    fn is_current(&self, key: &WorkflowKey) -> bool {
        self.current
            .get(&(key.namespace_id.clone(), key.workflow_id.clone()))
            .is_some_and(|run_id| *run_id == key.run_id)
    }

    fn set_current(&mut self, key: &WorkflowKey) {
        self.current
            .insert((key.namespace_id.clone(), key.workflow_id.clone()), key.run_id.clone());
    }
}

/// Execution store kept entirely in memory.
///
/// Enforces the same conditions a durable store would: optimistic
/// `db_record_version` checks and current-run checks per update mode.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    inner: Mutex<Inner>,
    // next update fails with this error instead of applying (test hook)
    injected_update_failure: Mutex<Option<ProviderError>>,
}

impl InMemoryExecutionStore {
    /// Make the next `update_workflow_execution` call fail with `err`.
    pub async fn fail_next_update(&self, err: ProviderError) {
        *self.injected_update_failure.lock().await = Some(err);
    }

    /// Tasks committed for a run, in commit order.
    pub async fn tasks(&self, key: &WorkflowKey) -> Vec<PersistedTask> {
        let g = self.inner.lock().await;
        g.runs.get(key).map(|s| s.tasks.clone()).unwrap_or_default()
    }

    pub async fn current_run_id(&self, namespace_id: &str, workflow_id: &str) -> Option<String> {
        let g = self.inner.lock().await;
        g.current
            .get(&(namespace_id.to_string(), workflow_id.to_string()))
            .cloned()
    }

    /// Number of updates that were applied.
    pub async fn update_count(&self) -> u64 {
        self.inner.lock().await.updates
    }

    /// Return a pretty-printed dump of all runs (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut keys: Vec<&WorkflowKey> = g.runs.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            out.push_str(&format!("run={key}\n"));
            match serde_json::to_string_pretty(&g.runs[key]) {
                Ok(json) => out.push_str(&json),
                Err(e) => out.push_str(&format!("  <unserializable: {e}>")),
            }
            out.push('\n');
        }
        out
    }
}

fn apply_mutation(snapshot: &mut WorkflowSnapshot, mutation: WorkflowMutation) {
    snapshot.execution_info = mutation.execution_info;
    for id in &mutation.delete_activity_infos {
        snapshot.activity_infos.remove(id);
    }
    snapshot.activity_infos.extend(mutation.upsert_activity_infos);
    for id in &mutation.delete_timer_infos {
        snapshot.timer_infos.remove(id);
    }
    snapshot.timer_infos.extend(mutation.upsert_timer_infos);
    snapshot.tasks.extend(mutation.tasks);
    snapshot.db_record_version = mutation.db_record_version;
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_workflow_execution(
        &self,
        snapshot: WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> Result<(), ProviderError> {
        const OP: &str = "create_workflow_execution";
        let mut g = self.inner.lock().await;
        if g.runs.contains_key(&snapshot.key) {
            return Err(ProviderError::already_exists(OP, format!("run already exists: {}", snapshot.key)));
        }
        let current_key = (snapshot.key.namespace_id.clone(), snapshot.key.workflow_id.clone());
        if mode == CreateWorkflowMode::BrandNew {
            if let Some(run_id) = g.current.get(&current_key) {
                return Err(ProviderError::current_workflow_condition_failed(
                    OP,
                    format!("workflow already has current run {run_id}"),
                ));
            }
            g.set_current(&snapshot.key);
        }
        g.runs.insert(snapshot.key.clone(), snapshot);
        Ok(())
    }

    async fn get_workflow_execution(&self, key: &WorkflowKey) -> Result<WorkflowSnapshot, ProviderError> {
        let g = self.inner.lock().await;
        g.runs
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("get_workflow_execution", format!("run not found: {key}")))
    }

    async fn update_workflow_execution(&self, request: UpdateWorkflowExecutionRequest) -> Result<(), ProviderError> {
        const OP: &str = "update_workflow_execution";
        if let Some(err) = self.injected_update_failure.lock().await.take() {
            return Err(err);
        }

        let mut g = self.inner.lock().await;
        let key = request.mutation.key.clone();

        // validate everything before touching any run
        let stored_version = match g.runs.get(&key) {
            Some(run) => run.db_record_version,
            None => return Err(ProviderError::not_found(OP, format!("run not found: {key}"))),
        };
        if stored_version + 1 != request.mutation.db_record_version {
            return Err(ProviderError::condition_failed(
                OP,
                format!(
                    "record version mismatch for {key}: stored {stored_version}, update expects {}",
                    request.mutation.db_record_version - 1
                ),
            ));
        }
        match request.mode {
            UpdateWorkflowMode::UpdateCurrent if !g.is_current(&key) => {
                return Err(ProviderError::current_workflow_condition_failed(
                    OP,
                    format!("{key} is not the current run"),
                ));
            }
            UpdateWorkflowMode::BypassCurrent if g.is_current(&key) => {
                return Err(ProviderError::current_workflow_condition_failed(
                    OP,
                    format!("{key} is the current run"),
                ));
            }
            _ => {}
        }
        if let Some(new_run) = &request.new_snapshot {
            if g.runs.contains_key(&new_run.key) {
                return Err(ProviderError::already_exists(OP, format!("run already exists: {}", new_run.key)));
            }
        }

        if let Some(run) = g.runs.get_mut(&key) {
            apply_mutation(run, request.mutation);
        }
        if let Some(new_run) = request.new_snapshot {
            if request.mode == UpdateWorkflowMode::UpdateCurrent {
                g.set_current(&new_run.key);
            }
            g.runs.insert(new_run.key.clone(), new_run);
        }
        g.updates += 1;
        Ok(())
    }
}
