//! Execution store wrapper that can hold loads and commits until released,
//! for testing cancellation and deadlines at each suspension point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use duroxide_xdc::WorkflowKey;
use duroxide_xdc::providers::in_memory::InMemoryExecutionStore;
use duroxide_xdc::providers::{
    CreateWorkflowMode, ExecutionStore, ProviderError, UpdateWorkflowExecutionRequest, WorkflowSnapshot,
};
use tokio::sync::Notify;

pub struct BlockingStore {
    inner: Arc<InMemoryExecutionStore>,
    block_get: AtomicBool,
    block_update: AtomicBool,
    release: Notify,
    gets: AtomicU32,
    updates: AtomicU32,
}

impl BlockingStore {
    pub fn new(inner: Arc<InMemoryExecutionStore>) -> Self {
        Self {
            inner,
            block_get: AtomicBool::new(false),
            block_update: AtomicBool::new(false),
            release: Notify::new(),
            gets: AtomicU32::new(0),
            updates: AtomicU32::new(0),
        }
    }

    /// Loads wait until `unblock` is called.
    pub fn block_loads(&self) {
        self.block_get.store(true, Ordering::SeqCst);
    }

    /// Commits wait until `unblock` is called.
    pub fn block_updates(&self) {
        self.block_update.store(true, Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.block_get.store(false, Ordering::SeqCst);
        self.block_update.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub fn get_calls(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    async fn wait_while(&self, flag: &AtomicBool) {
        while flag.load(Ordering::SeqCst) {
            let notified = self.release.notified();
            if !flag.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ExecutionStore for BlockingStore {
    async fn create_workflow_execution(
        &self,
        snapshot: WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> Result<(), ProviderError> {
        self.inner.create_workflow_execution(snapshot, mode).await
    }

    async fn get_workflow_execution(&self, key: &WorkflowKey) -> Result<WorkflowSnapshot, ProviderError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.wait_while(&self.block_get).await;
        self.inner.get_workflow_execution(key).await
    }

    async fn update_workflow_execution(&self, request: UpdateWorkflowExecutionRequest) -> Result<(), ProviderError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.wait_while(&self.block_update).await;
        self.inner.update_workflow_execution(request).await
    }
}
