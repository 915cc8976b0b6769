//! Workflow execution cache and the lease guarding each execution context.

pub mod cache;
pub mod context;
mod lock;

pub use cache::{CacheStats, WorkflowCache, WorkflowLease};
pub use context::ExecutionContext;
pub use lock::LockPriority;
