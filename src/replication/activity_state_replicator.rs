//! Conflict resolution for replicated activity state.
//!
//! A sync update describes an activity as the source region last saw it. It is
//! applied only if it is newer than the local record, discarded if it is
//! stale, and answered with a resend request if local history is missing
//! events the update depends on.
//!
//! Two checks decide this, in order:
//!
//! 1. [`compare_version_history`] compares the source region's branch with
//!    the local current branch at their lowest common ancestor (LCA).
//! 2. [`compare_activity`] orders the two activity records by
//!    `(version, stamp, attempt, started event id, last heartbeat)`.
//!
//! Because the comparison is a total order on those fields, replaying the
//! same updates in any order converges to the state of the newest one.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::WorkflowKey;
use crate::context::CallContext;
use crate::error::{Error, RetryReplication};
use crate::providers::UpdateWorkflowMode;
use crate::shard::ShardContext;
use crate::state::{
    ActivityInfo, ActivitySyncInfo, MutableState, TransactionPolicy, WorkflowState,
    should_reset_activity_timer_task_mask,
};
use crate::tasks::Task;
use crate::timer_sequence::TimerSequence;
use crate::version_history::{VersionHistory, VersionHistoryItem};
use crate::workflow::{LockPriority, WorkflowCache, WorkflowLease};

const TARGET: &str = "duroxide_xdc::replication";

/// Why the source region must resend events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendReason {
    /// Local history does not contain the activity's scheduled event yet.
    MissingEvents,
    /// The source region's branch won over the local branch.
    HigherVersion,
}

impl ResendReason {
    pub fn message(self) -> &'static str {
        match self {
            ResendReason::MissingEvents => "Resend missed sync activity events",
            ResendReason::HigherVersion => "Resend sync activity events due to a higher version received",
        }
    }
}

/// Result of reconciling one update against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Stale, duplicate, or targeting an activity or workflow that is gone.
    Discarded,
    /// Events after `(resume_event_id, resume_version)` must be replicated first.
    ResendRequired {
        reason: ResendReason,
        resume_event_id: i64,
        resume_version: i64,
    },
}

impl SyncOutcome {
    /// The resend request for `key`, if this outcome asks for one.
    pub fn into_retry_replication(self, key: &WorkflowKey) -> Option<RetryReplication> {
        match self {
            SyncOutcome::ResendRequired {
                reason,
                resume_event_id,
                resume_version,
            } => Some(RetryReplication::from_start(reason.message(), key, resume_event_id, resume_version)),
            SyncOutcome::Applied | SyncOutcome::Discarded => None,
        }
    }
}

/// Outcome of comparing the incoming branch with the local current branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionHistoryVerdict {
    /// Continue with the activity-level comparison.
    Proceed,
    Discard,
    Resend { reason: ResendReason, lca: VersionHistoryItem },
}

/// Compare the workflow's current branch with the branch the update was
/// produced on.
///
/// If one branch extends the other, the update is usable once local history
/// contains its scheduled event. If they diverged, the branch whose last
/// item has the higher version wins. Updates for completed workflows are
/// discarded once no resend is needed.
pub fn compare_version_history<M: MutableState + ?Sized>(
    mutable_state: &M,
    scheduled_event_id: i64,
    incoming: &VersionHistory,
) -> Result<VersionHistoryVerdict, Error> {
    let local = mutable_state.execution_info().version_histories.current()?;
    let last_local = local.last_item()?;
    let last_incoming = incoming.last_item()?;
    let lca = local.find_lca_item(incoming)?;

    if local.is_lca_appendable(&lca)? || incoming.is_lca_appendable(&lca)? {
        // one branch extends the other
        if scheduled_event_id > lca.event_id {
            return Ok(VersionHistoryVerdict::Resend {
                reason: ResendReason::MissingEvents,
                lca,
            });
        }
    } else {
        if last_incoming.version == last_local.version {
            let key = mutable_state.workflow_key();
            warn!(
                target: TARGET,
                namespace_id = %key.namespace_id,
                workflow_id = %key.workflow_id,
                run_id = %key.run_id,
                scheduled_event_id,
                local_last = %last_local,
                incoming_last = %last_incoming,
                lca = %lca,
                "diverged version histories with equal last version, discarding activity update"
            );
        }
        return Ok(resolve_divergence(last_local, last_incoming, lca));
    }

    let (state, _) = mutable_state.workflow_state_status();
    if state == WorkflowState::Completed {
        return Ok(VersionHistoryVerdict::Discard);
    }
    Ok(VersionHistoryVerdict::Proceed)
}

/// Pick the winner of two diverged branches by the version of their last
/// items. Equal versions cannot be ordered yet and the update is dropped;
/// the source region resends once either branch moves on.
fn resolve_divergence(
    last_local: VersionHistoryItem,
    last_incoming: VersionHistoryItem,
    lca: VersionHistoryItem,
) -> VersionHistoryVerdict {
    match last_incoming.version.cmp(&last_local.version) {
        Ordering::Less | Ordering::Equal => VersionHistoryVerdict::Discard,
        Ordering::Greater => VersionHistoryVerdict::Resend {
            reason: ResendReason::HigherVersion,
            lca,
        },
    }
}

/// Whether `incoming` is newer than the local `activity`.
///
/// Ordered by version (changes only on failover), then stamp (changes on
/// every option update), then attempt, then started event id, then last
/// heartbeat time. A missing heartbeat counts as time zero, and a heartbeat
/// that is not strictly newer loses, so an identical update is applied once
/// and discarded on redelivery.
pub fn compare_activity(activity: &ActivityInfo, incoming: &ActivitySyncInfo) -> bool {
    if activity.version != incoming.version {
        return activity.version < incoming.version;
    }
    if activity.stamp != incoming.stamp {
        return activity.stamp < incoming.stamp;
    }
    if activity.attempt != incoming.attempt {
        return activity.attempt < incoming.attempt;
    }
    if activity.started_event_id != incoming.started_event_id {
        return activity.started_event_id < incoming.started_event_id;
    }
    activity.last_heartbeat_update_time_ms.unwrap_or(0) < incoming.last_heartbeat_time_ms.unwrap_or(0)
}

/// Reconcile one update against `mutable_state`, applying it if it wins.
///
/// Applying a retry (not started, attempt increased) also queues an
/// activity retry timer task at the new schedule time. Activity timeout
/// timers are left to the caller, which regenerates them once per batch.
pub fn sync_single_activity_state<M: MutableState + ?Sized>(
    mutable_state: &mut M,
    sync: &ActivitySyncInfo,
) -> Result<SyncOutcome, Error> {
    let key = mutable_state.workflow_key().clone();
    let scheduled_event_id = sync.scheduled_event_id;

    match compare_version_history(&*mutable_state, scheduled_event_id, &sync.version_history)? {
        VersionHistoryVerdict::Proceed => {}
        VersionHistoryVerdict::Discard => {
            debug!(
                target: TARGET,
                namespace_id = %key.namespace_id,
                workflow_id = %key.workflow_id,
                run_id = %key.run_id,
                scheduled_event_id,
                version = sync.version,
                "activity update discarded by version history"
            );
            return Ok(SyncOutcome::Discarded);
        }
        VersionHistoryVerdict::Resend { reason, lca } => {
            info!(
                target: TARGET,
                namespace_id = %key.namespace_id,
                workflow_id = %key.workflow_id,
                run_id = %key.run_id,
                scheduled_event_id,
                version = sync.version,
                resume_event_id = lca.event_id,
                resume_version = lca.version,
                reason = reason.message(),
                "activity update requires resend"
            );
            return Ok(SyncOutcome::ResendRequired {
                reason,
                resume_event_id: lca.event_id,
                resume_version: lca.version,
            });
        }
    }

    let Some(activity) = mutable_state.activity_info(scheduled_event_id) else {
        // activity already finished locally
        debug!(
            target: TARGET,
            namespace_id = %key.namespace_id,
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            scheduled_event_id,
            "activity update for an activity that is no longer pending"
        );
        return Ok(SyncOutcome::Discarded);
    };
    if !compare_activity(activity, sync) {
        debug!(
            target: TARGET,
            namespace_id = %key.namespace_id,
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            scheduled_event_id,
            local_version = activity.version,
            local_stamp = activity.stamp,
            local_attempt = activity.attempt,
            version = sync.version,
            stamp = sync.stamp,
            attempt = sync.attempt,
            "stale activity update discarded"
        );
        return Ok(SyncOutcome::Discarded);
    }

    let reset_timer_task_status = should_reset_activity_timer_task_mask(activity, sync);
    if sync.is_retry_of(activity.attempt) {
        let visibility_timestamp_ms = sync.scheduled_time_ms.unwrap_or(0);
        mutable_state.add_tasks(vec![Task::ActivityRetryTimer {
            key: key.clone(),
            visibility_timestamp_ms,
            event_id: scheduled_event_id,
            version: sync.version,
            attempt: sync.attempt,
            stamp: sync.stamp,
        }]);
    }
    mutable_state.update_activity_info(sync, reset_timer_task_status)?;

    debug!(
        target: TARGET,
        namespace_id = %key.namespace_id,
        workflow_id = %key.workflow_id,
        run_id = %key.run_id,
        scheduled_event_id,
        version = sync.version,
        stamp = sync.stamp,
        attempt = sync.attempt,
        reset_timer_task_status,
        "activity update applied"
    );
    Ok(SyncOutcome::Applied)
}

/// Replicated state of one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncActivityRequest {
    pub key: WorkflowKey,
    pub activity: ActivitySyncInfo,
}

/// Replicated state of several activities of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncActivitiesRequest {
    pub key: WorkflowKey,
    pub activities: Vec<ActivitySyncInfo>,
}

/// Applies replicated activity state to workflow runs of one shard.
///
/// Each request holds the run's lease at high priority for its whole
/// duration and commits at most once, as a passive transaction.
pub struct ActivityStateReplicator {
    shard: Arc<ShardContext>,
    cache: Arc<WorkflowCache>,
}

impl ActivityStateReplicator {
    pub fn new(shard: Arc<ShardContext>, cache: Arc<WorkflowCache>) -> Self {
        Self { shard, cache }
    }

    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Apply one activity update.
    ///
    /// Returns [`Error::Duplicate`] if the update was discarded and
    /// [`Error::RetryReplication`] if events must be resent first. Updates
    /// for runs this region does not have are dropped with `Ok(())`.
    pub async fn sync_activity_state(&self, call_ctx: &CallContext, request: SyncActivityRequest) -> Result<(), Error> {
        self.sync(call_ctx, &request.key, std::slice::from_ref(&request.activity))
            .await
    }

    /// Apply a batch of activity updates for one run, in order.
    ///
    /// The batch is a duplicate only if every update was discarded. The first
    /// resend request or error aborts the batch without committing anything.
    pub async fn sync_activities_state(
        &self,
        call_ctx: &CallContext,
        request: SyncActivitiesRequest,
    ) -> Result<(), Error> {
        self.sync(call_ctx, &request.key, &request.activities).await
    }

    async fn sync(&self, call_ctx: &CallContext, key: &WorkflowKey, activities: &[ActivitySyncInfo]) -> Result<(), Error> {
        let mut lease = self
            .cache
            .get_or_create_workflow_execution(call_ctx, key, LockPriority::High)
            .await?;
        let result = self.sync_under_lease(call_ctx, &mut lease, key, activities).await;
        lease.release(result.as_ref().map(|_| ()));
        result
    }

    async fn sync_under_lease(
        &self,
        call_ctx: &CallContext,
        lease: &mut WorkflowLease,
        key: &WorkflowKey,
        activities: &[ActivitySyncInfo],
    ) -> Result<(), Error> {
        let metrics = self.shard.metrics();
        let mutable_state = match lease.load_mutable_state(call_ctx, &self.shard).await {
            Ok(ms) => ms,
            Err(e) if e.is_not_found() => {
                // the update raced ahead of the workflow start, or the run is long gone
                warn!(
                    target: TARGET,
                    namespace_id = %key.namespace_id,
                    workflow_id = %key.workflow_id,
                    run_id = %key.run_id,
                    "dropping activity sync for unknown workflow run"
                );
                metrics.record_not_found_dropped();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut any_applied = false;
        for activity in activities {
            let outcome = sync_single_activity_state(&mut *mutable_state, activity)?;
            match outcome {
                SyncOutcome::Applied => {
                    metrics.record_activity_applied();
                    any_applied = true;
                }
                SyncOutcome::Discarded => metrics.record_activity_discarded(),
                SyncOutcome::ResendRequired { .. } => {
                    metrics.record_resend_requested();
                    if let Some(resend) = outcome.into_retry_replication(key) {
                        return Err(Error::RetryReplication(resend));
                    }
                }
            }
        }
        if !any_applied {
            metrics.record_duplicate_batch();
            return Err(Error::Duplicate);
        }

        // passive side creates activity timers explicitly
        TimerSequence::new(&mut *mutable_state).create_next_activity_timer()?;

        if self.shard.options().enable_update_workflow_mode_ignore_current {
            return lease.update_workflow_execution_as_passive(call_ctx, &self.shard).await;
        }
        let mode = match mutable_state.workflow_state_status().0 {
            WorkflowState::Zombie => UpdateWorkflowMode::BypassCurrent,
            _ => UpdateWorkflowMode::UpdateCurrent,
        };
        lease
            .update_workflow_execution_with_new(call_ctx, &self.shard, mode, None, TransactionPolicy::Passive)
            .await
    }
}
