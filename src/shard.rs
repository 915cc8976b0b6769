use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::ReplicationOptions;
use crate::observability::ReplicationMetrics;
use crate::providers::ExecutionStore;

/// Shard-scoped handles shared by every request routed to one shard: the
/// execution store, options, metrics, and the task id sequence.
pub struct ShardContext {
    shard_id: i32,
    store: Arc<dyn ExecutionStore>,
    options: ReplicationOptions,
    next_task_id: AtomicI64,
    metrics: ReplicationMetrics,
}

impl ShardContext {
    pub fn new(shard_id: i32, store: Arc<dyn ExecutionStore>, options: ReplicationOptions) -> Self {
        Self::with_metrics(shard_id, store, options, ReplicationMetrics::default())
    }

    /// Shard whose counters are exported through `metrics`.
    pub fn with_metrics(
        shard_id: i32,
        store: Arc<dyn ExecutionStore>,
        options: ReplicationOptions,
        metrics: ReplicationMetrics,
    ) -> Self {
        Self {
            shard_id,
            store,
            options,
            next_task_id: AtomicI64::new(1),
            metrics,
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    pub fn execution_store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn metrics(&self) -> &ReplicationMetrics {
        &self.metrics
    }

    /// Reserve `count` consecutive task ids and return the first.
    pub fn allocate_task_ids(&self, count: usize) -> i64 {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.next_task_id.fetch_add(count, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard_id", &self.shard_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsConfig;
    use crate::providers::in_memory::InMemoryExecutionStore;

    #[test]
    fn task_ids_are_monotonic_and_contiguous() {
        let shard = ShardContext::new(3, Arc::new(InMemoryExecutionStore::default()), ReplicationOptions::default());
        assert_eq!(shard.allocate_task_ids(3), 1);
        assert_eq!(shard.allocate_task_ids(0), 4);
        assert_eq!(shard.allocate_task_ids(2), 4);
        assert_eq!(shard.allocate_task_ids(1), 6);
        assert_eq!(shard.shard_id(), 3);
    }

    #[test]
    fn shard_records_into_supplied_metrics() {
        let metrics = ReplicationMetrics::with_exporter(&MetricsConfig::default()).unwrap();
        let shard = ShardContext::with_metrics(
            1,
            Arc::new(InMemoryExecutionStore::default()),
            ReplicationOptions::default(),
            metrics,
        );
        shard.metrics().record_commit();
        assert_eq!(shard.metrics().snapshot().commits, 1);
        shard.metrics().shutdown().unwrap();
    }
}
