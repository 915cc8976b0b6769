//! Applying replicated activity state from other regions.

pub mod activity_state_replicator;

pub use activity_state_replicator::{
    ActivityStateReplicator, ResendReason, SyncActivitiesRequest, SyncActivityRequest, SyncOutcome,
    VersionHistoryVerdict, compare_activity, compare_version_history, sync_single_activity_state,
};
