use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::lock::{LockPriority, PriorityLock};
use crate::WorkflowKey;
use crate::config::ReplicationOptions;
use crate::context::CallContext;
use crate::error::Error;

struct CacheEntry {
    lock: PriorityLock,
    // Some while no lease holds the context
    context: Mutex<Option<ExecutionContext>>,
}

impl CacheEntry {
    fn new(key: &WorkflowKey) -> Self {
        Self {
            lock: PriorityLock::default(),
            context: Mutex::new(Some(ExecutionContext::new(key.clone()))),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ExecutionContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct CacheCounters {
    acquired: AtomicU64,
    contended: AtomicU64,
    released_ok: AtomicU64,
    released_err: AtomicU64,
    evicted: AtomicU64,
}

/// Lease statistics, for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub acquired: u64,
    /// Acquisitions that had to wait for another holder.
    pub contended: u64,
    pub released_ok: u64,
    /// Releases reporting a failure, including leases dropped unreleased.
    pub released_err: u64,
    pub evicted: u64,
    pub entries: usize,
}

/// Cache of workflow execution contexts and the lease provider guarding them.
///
/// Each workflow run has one context; a [`WorkflowLease`] grants exclusive
/// use of it. Requests for different runs never contend.
pub struct WorkflowCache {
    entries: Mutex<HashMap<WorkflowKey, Arc<CacheEntry>>>,
    max_entries: usize,
    lease_acquire_timeout: Option<Duration>,
    counters: Arc<CacheCounters>,
}

impl WorkflowCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            lease_acquire_timeout: None,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn from_options(options: &ReplicationOptions) -> Self {
        Self {
            lease_acquire_timeout: options.lease_acquire_timeout,
            ..Self::new(options.workflow_cache_max_entries)
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkflowKey, Arc<CacheEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, key: &WorkflowKey) -> Arc<CacheEntry> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(key) {
            return entry.clone();
        }
        if entries.len() >= self.max_entries {
            // only entries nobody holds, awaits or is about to await
            let idle: Vec<WorkflowKey> = entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(e) == 1 && e.lock.is_idle())
                .map(|(k, _)| k.clone())
                .take(entries.len() + 1 - self.max_entries.max(1))
                .collect();
            for k in idle {
                entries.remove(&k);
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        let entry = Arc::new(CacheEntry::new(key));
        entries.insert(key.clone(), entry.clone());
        entry
    }

    /// Acquire the exclusive lease on `key`'s execution context.
    ///
    /// Waits behind the current holder, honouring `call_ctx` and the
    /// configured lease timeout. The run id must be concrete.
    pub async fn get_or_create_workflow_execution(
        &self,
        call_ctx: &CallContext,
        key: &WorkflowKey,
        priority: LockPriority,
    ) -> Result<WorkflowLease, Error> {
        if key.namespace_id.is_empty() || key.workflow_id.is_empty() {
            return Err(Error::InvalidArgument(format!("incomplete workflow key: {key}")));
        }
        if key.run_id.is_empty() {
            return Err(Error::InvalidArgument(format!("workflow key without run id: {key}")));
        }

        let entry = self.entry(key);
        let wait_ctx = match self.lease_acquire_timeout {
            Some(timeout) => call_ctx.clone().with_deadline(tokio::time::Instant::now() + timeout),
            None => call_ctx.clone(),
        };
        let contended = wait_ctx
            .run("acquire_workflow_lease", entry.lock.lock(priority))
            .await?;

        let context = entry.slot().take();
        let context = context.unwrap_or_else(|| ExecutionContext::new(key.clone()));
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.counters.contended.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            target: "duroxide_xdc::workflow",
            namespace_id = %key.namespace_id,
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            ?priority,
            contended,
            "acquired workflow lease"
        );
        Ok(WorkflowLease {
            entry,
            counters: self.counters.clone(),
            context: Some(context),
        })
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            acquired: c.acquired.load(Ordering::Relaxed),
            contended: c.contended.load(Ordering::Relaxed),
            released_ok: c.released_ok.load(Ordering::Relaxed),
            released_err: c.released_err.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            entries: self.entries().len(),
        }
    }

    /// Whether `key`'s context currently holds loaded mutable state.
    pub fn is_loaded(&self, key: &WorkflowKey) -> bool {
        let Some(entry) = self.entries().get(key).cloned() else {
            return false;
        };
        let slot = entry.slot();
        slot.as_ref().is_some_and(ExecutionContext::is_loaded)
    }
}

/// Exclusive use of one workflow's execution context.
///
/// Release with [`WorkflowLease::release`], passing the outcome of the work
/// done under the lease. A failed outcome drops the cached mutable state.
/// Dropping the lease without releasing it counts as a failed release.
pub struct WorkflowLease {
    entry: Arc<CacheEntry>,
    counters: Arc<CacheCounters>,
    context: Option<ExecutionContext>,
}

impl WorkflowLease {
    pub fn release(mut self, result: Result<(), &Error>) {
        self.finish(result.is_ok());
    }

    fn finish(&mut self, ok: bool) {
        let Some(mut context) = self.context.take() else {
            return;
        };
        if ok {
            self.counters.released_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            context.clear();
            self.counters.released_err.fetch_add(1, Ordering::Relaxed);
        }
        *self.entry.slot() = Some(context);
        self.entry.lock.unlock();
    }
}

impl Deref for WorkflowLease {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        // present until release consumes the lease
        self.context.as_ref().unwrap_or_else(|| unreachable!("workflow lease used after release"))
    }
}

impl DerefMut for WorkflowLease {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.context.as_mut().unwrap_or_else(|| unreachable!("workflow lease used after release"))
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        if let Some(context) = &self.context {
            warn!(
                target: "duroxide_xdc::workflow",
                workflow_key = %context.key(),
                "workflow lease dropped without release"
            );
            self.finish(false);
        }
    }
}
