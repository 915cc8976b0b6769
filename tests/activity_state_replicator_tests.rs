mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fault_injection::BlockingStore;
use common::tracing_capture::install_tracing_capture;
use common::*;
use duroxide_xdc::providers::in_memory::InMemoryExecutionStore;
use duroxide_xdc::providers::{CreateWorkflowMode, ExecutionStore, ProviderErrorKind};
use duroxide_xdc::replication::{ActivityStateReplicator, ResendReason};
use duroxide_xdc::state::WorkflowState;
use duroxide_xdc::tasks::Task;
use duroxide_xdc::timer_sequence::{TimerTaskStatus, TimerType};
use duroxide_xdc::{CallContext, Error, LockPriority, ReplicationOptions, ShardContext, WorkflowCache, WorkflowKey};
use tokio_util::sync::CancellationToken;
use tracing::Level;

fn bg() -> CallContext {
    CallContext::background()
}

/// Let spawned tasks run until they block.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn started_update_is_applied_and_commits_passively() {
    let h = Harness::new();
    let k = key();
    let local = activity(5, 1);
    h.create_run(&k, &[(10, 1)], vec![local.clone()]).await;

    let update = started_sync(&local, &[(10, 1)], 6, NOW + 2_000);
    h.replicator.sync_activity_state(&bg(), h.single(&k, update)).await.unwrap();

    let snapshot = h.load(&k).await;
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.started_event_id, 6);
    assert_eq!(ai.started_time_ms, Some(NOW + 2_000));
    assert_eq!(ai.last_worker_identity, "worker-a");
    assert_eq!(ai.timer_task_status, TimerTaskStatus::START_TO_CLOSE);

    // passive commit: a single timeout task, no replication task
    let tasks: Vec<&Task> = snapshot.tasks.iter().map(|t| &t.task).collect();
    assert_eq!(
        tasks,
        vec![&Task::ActivityTimeout {
            key: k.clone(),
            visibility_timestamp_ms: NOW + 2_000 + 100_000,
            timeout_type: TimerType::StartToClose,
            event_id: 5,
            attempt: 1,
            stamp: 0,
        }]
    );

    let m = h.shard.metrics().snapshot();
    assert_eq!(m.activities_applied, 1);
    assert_eq!(m.commits, 1);
    assert_eq!(h.cache.stats().released_ok, 1);
    assert!(h.cache.is_loaded(&k));
}

#[tokio::test]
async fn diverged_history_with_higher_incoming_version_requests_resend() {
    let h = Harness::new();
    let k = key();
    let local = activity(5, 5);
    h.create_run(&k, &[(80, 5), (100, 5)], vec![local.clone()]).await;

    let mut update = sync_of(&local, &[(80, 5), (90, 7)]);
    update.version = 7;
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, update))
        .await
        .unwrap_err();

    let resend = err.retry_replication().cloned().unwrap();
    assert_eq!((resend.start_event_id, resend.start_version), (80, 5));
    assert_eq!(resend.message, ResendReason::HigherVersion.message());
    assert_eq!(
        (resend.namespace_id.as_str(), resend.workflow_id.as_str(), resend.run_id.as_str()),
        ("ns-1", "wf-1", "run-1")
    );
    assert!(err.is_retryable());
    assert_eq!(h.store.update_count().await, 0);
    assert_eq!(h.shard.metrics().snapshot().resends_requested, 1);
}

#[tokio::test]
async fn diverged_history_with_lower_incoming_version_is_duplicate() {
    let h = Harness::new();
    let k = key();
    let local = activity(5, 5);
    h.create_run(&k, &[(80, 5), (100, 7)], vec![local.clone()]).await;

    let update = sync_of(&local, &[(80, 5), (90, 5)]);
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, update))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    assert!(!err.is_retryable());
    assert_eq!(h.store.update_count().await, 0);
}

#[tokio::test]
async fn extension_beyond_local_history_requests_missing_events() {
    let h = Harness::new();
    let k = key();
    h.create_run(&k, &[(50, 2)], vec![activity(5, 2)]).await;

    // the activity itself is not known locally yet
    let update = sync_of(&activity(80, 2), &[(120, 2)]);
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, update))
        .await
        .unwrap_err();
    let resend = err.retry_replication().unwrap();
    assert_eq!((resend.start_event_id, resend.start_version), (50, 2));
    assert_eq!(resend.message, ResendReason::MissingEvents.message());
    assert_eq!(resend.end_event_id, duroxide_xdc::EMPTY_EVENT_ID);
}

#[tokio::test]
async fn redelivered_update_is_applied_once() {
    let h = Harness::new();
    let k = key();
    let local = activity(5, 1);
    h.create_run(&k, &[(10, 1)], vec![local.clone()]).await;

    let update = started_sync(&local, &[(10, 1)], 6, NOW + 2_000);
    h.replicator
        .sync_activity_state(&bg(), h.single(&k, update.clone()))
        .await
        .unwrap();
    let first = h.load(&k).await;
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, update.clone()))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    let second = h.load(&k).await;
    assert_eq!(first.activity_infos, second.activity_infos);
    assert_eq!(first.tasks, second.tasks);

    // once a newer stamp landed the old update is stale
    let mut newer = update.clone();
    newer.stamp = 1;
    h.replicator.sync_activity_state(&bg(), h.single(&k, newer)).await.unwrap();
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, update))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(h.store.update_count().await, 2);

    let m = h.shard.metrics().snapshot();
    assert_eq!((m.activities_applied, m.activities_discarded, m.duplicate_batches), (2, 2, 2));
}

#[tokio::test]
async fn reordered_stamps_converge_to_newest_update() {
    let local = activity(5, 1);
    let mut u1 = started_sync(&local, &[(10, 1)], 6, NOW + 1_000);
    u1.stamp = 1;
    u1.last_worker_identity = "worker-1".into();
    let mut u2 = started_sync(&local, &[(10, 1)], 6, NOW + 3_000);
    u2.stamp = 2;
    u2.last_worker_identity = "worker-2".into();

    let apply = |order: Vec<duroxide_xdc::state::ActivitySyncInfo>| {
        let local = local.clone();
        async move {
            let h = Harness::new();
            let k = key();
            h.create_run(&k, &[(10, 1)], vec![local]).await;
            let mut outcomes = Vec::new();
            for u in order {
                outcomes.push(h.replicator.sync_activity_state(&bg(), h.single(&k, u)).await);
            }
            (outcomes, h.load(&k).await.activity_infos)
        }
    };

    let (forward, forward_state) = apply(vec![u1.clone(), u2.clone()]).await;
    let (backward, backward_state) = apply(vec![u2.clone(), u1.clone()]).await;
    let (_, only_u2_state) = apply(vec![u2.clone()]).await;

    assert!(forward.iter().all(|r| r.is_ok()));
    assert!(backward[0].is_ok());
    assert!(backward[1].as_ref().unwrap_err().is_duplicate());
    assert_eq!(forward_state, only_u2_state);
    assert_eq!(backward_state, only_u2_state);
    assert_eq!(only_u2_state[&5].last_worker_identity, "worker-2");
    assert_eq!(only_u2_state[&5].stamp, 2);
}

#[tokio::test]
async fn unknown_run_is_dropped_silently() {
    let h = Harness::new();
    let (logs, _guard) = install_tracing_capture();

    let k = WorkflowKey::new("ns-1", "wf-1", "never-started");
    let update = sync_of(&activity(5, 1), &[(10, 1)]);
    h.replicator
        .sync_activities_state(&bg(), h.batch(&k, vec![update]))
        .await
        .unwrap();

    assert_eq!(h.shard.metrics().snapshot().not_found_dropped, 1);
    assert_eq!(h.store.update_count().await, 0);
    let dropped = logs.matching(Level::WARN, "unknown workflow run");
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].target, "duroxide_xdc::replication");
    assert_eq!(dropped[0].field("run_id").as_deref(), Some("never-started"));
}

#[tokio::test]
async fn batch_is_duplicate_only_when_everything_is_discarded() {
    let h = Harness::new();
    let k = key();
    let mut a = activity(5, 3);
    a.stamp = 4;
    let b = activity(7, 3);
    h.create_run(&k, &[(10, 3)], vec![a.clone(), b.clone()]).await;

    let mut stale_a = sync_of(&a, &[(10, 3)]);
    stale_a.stamp = 3;
    let mut stale_b = sync_of(&b, &[(10, 3)]);
    stale_b.version = 2;
    let err = h
        .replicator
        .sync_activities_state(&bg(), h.batch(&k, vec![stale_a.clone(), stale_b]))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(h.store.update_count().await, 0);

    let fresh_b = started_sync(&b, &[(10, 3)], 8, NOW + 500);
    h.replicator
        .sync_activities_state(&bg(), h.batch(&k, vec![stale_a, fresh_b]))
        .await
        .unwrap();
    assert_eq!(h.store.update_count().await, 1);

    let snapshot = h.load(&k).await;
    assert_eq!(snapshot.activity_infos[&5].stamp, 4);
    assert_eq!(snapshot.activity_infos[&7].started_event_id, 8);
    // timers are created once per batch: only the earliest obligation
    assert_eq!(snapshot.tasks.len(), 1);
}

#[tokio::test]
async fn resend_in_the_middle_of_a_batch_commits_nothing() {
    let h = Harness::new();
    let k = key();
    let a = activity(5, 1);
    h.create_run(&k, &[(10, 1)], vec![a.clone()]).await;

    let fresh = started_sync(&a, &[(10, 1)], 6, NOW + 500);
    let ahead = sync_of(&activity(30, 1), &[(40, 1)]);
    let err = h
        .replicator
        .sync_activities_state(&bg(), h.batch(&k, vec![fresh.clone(), ahead]))
        .await
        .unwrap_err();
    assert!(err.retry_replication().is_some());
    assert_eq!(h.store.update_count().await, 0);
    // the in-memory change was thrown away with the lease
    assert!(!h.cache.is_loaded(&k));

    h.replicator
        .sync_activities_state(&bg(), h.batch(&k, vec![fresh]))
        .await
        .unwrap();
    assert_eq!(h.load(&k).await.activity_infos[&5].started_event_id, 6);
}

#[tokio::test]
async fn completed_workflow_discards_updates() {
    let h = Harness::new();
    let k = key();
    let a = activity(5, 1);
    h.create_run_in_state(&k, &[(10, 1)], vec![a.clone()], WorkflowState::Completed, CreateWorkflowMode::BrandNew)
        .await;

    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, started_sync(&a, &[(10, 1)], 6, NOW)))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn zombie_run_commits_bypassing_current() {
    let h = Harness::new();
    let current = WorkflowKey::new("ns-1", "wf-1", "run-current");
    let zombie = WorkflowKey::new("ns-1", "wf-1", "run-zombie");
    let a = activity(5, 1);
    h.create_run(&current, &[(10, 1)], vec![]).await;
    h.create_run_in_state(&zombie, &[(10, 1)], vec![a.clone()], WorkflowState::Zombie, CreateWorkflowMode::BypassCurrent)
        .await;

    h.replicator
        .sync_activity_state(&bg(), h.single(&zombie, started_sync(&a, &[(10, 1)], 6, NOW)))
        .await
        .unwrap();
    assert_eq!(h.load(&zombie).await.activity_infos[&5].started_event_id, 6);
    assert_eq!(h.store.current_run_id("ns-1", "wf-1").await.as_deref(), Some("run-current"));
}

#[tokio::test]
async fn non_current_running_run_needs_ignore_current_mode() {
    let a = activity(5, 1);
    let current = WorkflowKey::new("ns-1", "wf-1", "run-current");
    let stale = WorkflowKey::new("ns-1", "wf-1", "run-old");

    let h = Harness::new();
    h.create_run(&current, &[(10, 1)], vec![]).await;
    h.create_run_in_state(&stale, &[(10, 1)], vec![a.clone()], WorkflowState::Running, CreateWorkflowMode::BypassCurrent)
        .await;
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&stale, started_sync(&a, &[(10, 1)], 6, NOW)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Provider(ref e) if e.kind == ProviderErrorKind::CurrentWorkflowConditionFailed
    ));
    assert_eq!(h.cache.stats().released_err, 1);

    let h = Harness::with_options(ReplicationOptions {
        enable_update_workflow_mode_ignore_current: true,
        ..Default::default()
    });
    h.create_run(&current, &[(10, 1)], vec![]).await;
    h.create_run_in_state(&stale, &[(10, 1)], vec![a.clone()], WorkflowState::Running, CreateWorkflowMode::BypassCurrent)
        .await;
    h.replicator
        .sync_activity_state(&bg(), h.single(&stale, started_sync(&a, &[(10, 1)], 6, NOW)))
        .await
        .unwrap();
}

#[tokio::test]
async fn retry_update_schedules_retry_timer_and_fresh_timeouts() {
    let h = Harness::new();
    let k = key();
    let mut a = activity(5, 1);
    a.timer_task_status = TimerTaskStatus::SCHEDULE_TO_START;
    h.create_run(&k, &[(10, 1)], vec![a.clone()]).await;

    let mut retry = sync_of(&a, &[(10, 1)]);
    retry.attempt = 2;
    retry.scheduled_time_ms = Some(NOW + 5_000);
    retry.last_failure = Some("timeout".into());
    h.replicator.sync_activity_state(&bg(), h.single(&k, retry)).await.unwrap();

    let snapshot = h.load(&k).await;
    let tasks: Vec<Task> = snapshot.tasks.iter().map(|t| t.task.clone()).collect();
    assert_eq!(
        tasks,
        vec![
            Task::ActivityRetryTimer {
                key: k.clone(),
                visibility_timestamp_ms: NOW + 5_000,
                event_id: 5,
                version: 1,
                attempt: 2,
                stamp: 0,
            },
            Task::ActivityTimeout {
                key: k.clone(),
                visibility_timestamp_ms: NOW + 5_000 + 10_000,
                timeout_type: TimerType::ScheduleToStart,
                event_id: 5,
                attempt: 2,
                stamp: 0,
            },
        ]
    );
    assert!(snapshot.tasks[0].task_id < snapshot.tasks[1].task_id);
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.attempt, 2);
    assert_eq!(ai.first_scheduled_time_ms, Some(NOW));
    assert_eq!(ai.last_failure.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn heartbeat_only_update_keeps_outstanding_timers() {
    let h = Harness::new();
    let k = key();
    let mut a = activity(5, 1);
    a.started_event_id = 6;
    a.started_time_ms = Some(NOW);
    a.heartbeat_timeout = Duration::from_secs(30);
    a.last_heartbeat_update_time_ms = Some(NOW + 1_000);
    a.timer_task_status = TimerTaskStatus::HEARTBEAT;
    h.create_run(&k, &[(10, 1)], vec![a.clone()]).await;

    let mut beat = sync_of(&a, &[(10, 1)]);
    beat.last_heartbeat_time_ms = Some(NOW + 20_000);
    beat.details = Some(b"50%".to_vec());
    h.replicator.sync_activity_state(&bg(), h.single(&k, beat)).await.unwrap();

    let snapshot = h.load(&k).await;
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.last_heartbeat_update_time_ms, Some(NOW + 20_000));
    assert_eq!(ai.last_heartbeat_details.as_deref(), Some(&b"50%"[..]));
    assert_eq!(ai.timer_task_status, TimerTaskStatus::HEARTBEAT);
    // the next obligation (heartbeat at NOW+50s) is already created
    assert!(snapshot.tasks.is_empty());

    let mut old_beat = sync_of(&a, &[(10, 1)]);
    old_beat.last_heartbeat_time_ms = Some(NOW + 10_000);
    let err = h
        .replicator
        .sync_activity_state(&bg(), h.single(&k, old_beat))
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn replication_sync_jumps_ahead_of_low_priority_lease_waiters() {
    let h = Harness::new();
    let k = key();
    let a = activity(5, 1);
    h.create_run(&k, &[(10, 1)], vec![a.clone()]).await;

    let held = h
        .cache
        .get_or_create_workflow_execution(&bg(), &k, LockPriority::Low)
        .await
        .unwrap();

    let low_waiter = {
        let cache = h.cache.clone();
        let store = h.store.clone();
        let k = k.clone();
        tokio::spawn(async move {
            let lease = cache
                .get_or_create_workflow_execution(&CallContext::background(), &k, LockPriority::Low)
                .await
                .unwrap();
            let committed_before = store.update_count().await;
            lease.release(Ok(()));
            committed_before
        })
    };
    settle().await;

    let replicator = ActivityStateReplicator::new(h.shard.clone(), h.cache.clone());
    let sync = {
        let request = h.single(&k, started_sync(&a, &[(10, 1)], 6, NOW));
        tokio::spawn(async move { replicator.sync_activity_state(&CallContext::background(), request).await })
    };
    settle().await;

    held.release(Ok(()));
    sync.await.unwrap().unwrap();
    assert_eq!(low_waiter.await.unwrap(), 1);
    assert_eq!(h.cache.stats().contended, 2);
}

fn blocking_harness() -> (Arc<BlockingStore>, Arc<InMemoryExecutionStore>, ActivityStateReplicator, Arc<WorkflowCache>) {
    let inner = Arc::new(InMemoryExecutionStore::default());
    let store = Arc::new(BlockingStore::new(inner.clone()));
    let shard = Arc::new(ShardContext::new(1, store.clone(), ReplicationOptions::default()));
    let cache = Arc::new(WorkflowCache::new(16));
    let replicator = ActivityStateReplicator::new(shard, cache.clone());
    (store, inner, replicator, cache)
}

#[tokio::test]
async fn cancellation_while_loading_releases_the_lease() {
    let (store, inner, replicator, cache) = blocking_harness();
    let k = key();
    let a = activity(5, 1);
    Harness::with_store(inner.clone(), ReplicationOptions::default())
        .create_run(&k, &[(10, 1)], vec![a.clone()])
        .await;
    let replicator = Arc::new(replicator);

    store.block_loads();
    let token = CancellationToken::new();
    let ctx = CallContext::background().with_cancellation(token.clone());
    let request = duroxide_xdc::replication::SyncActivityRequest {
        key: k.clone(),
        activity: started_sync(&a, &[(10, 1)], 6, NOW),
    };
    let task = {
        let replicator = replicator.clone();
        let request = request.clone();
        tokio::spawn(async move { replicator.sync_activity_state(&ctx, request).await })
    };
    while store.get_calls() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled { ref operation } if operation == "load_mutable_state"));
    assert_eq!(cache.stats().released_err, 1);

    store.unblock();
    replicator.sync_activity_state(&bg(), request).await.unwrap();
    assert_eq!(inner.update_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_commit_leaves_no_partial_write() {
    let (store, inner, replicator, cache) = blocking_harness();
    let k = key();
    let a = activity(5, 1);
    Harness::with_store(inner.clone(), ReplicationOptions::default())
        .create_run(&k, &[(10, 1)], vec![a.clone()])
        .await;

    store.block_updates();
    let request = duroxide_xdc::replication::SyncActivityRequest {
        key: k.clone(),
        activity: started_sync(&a, &[(10, 1)], 6, NOW),
    };
    let err = replicator
        .sync_activity_state(&CallContext::with_timeout(Duration::from_millis(200)), request.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { ref operation } if operation == "update_workflow_execution"));
    assert_eq!(store.update_calls(), 1);
    assert_eq!(inner.update_count().await, 0);
    let stored = inner.get_workflow_execution(&k).await.unwrap();
    assert_eq!(stored.db_record_version, 0);
    assert!(stored.tasks.is_empty());
    assert_eq!(stored.activity_infos[&5].started_event_id, duroxide_xdc::EMPTY_EVENT_ID);
    assert!(!cache.is_loaded(&k));

    store.unblock();
    replicator.sync_activity_state(&bg(), request).await.unwrap();
    assert_eq!(inner.update_count().await, 1);
}

#[tokio::test]
async fn resend_decision_is_logged_with_resume_point() {
    let h = Harness::new();
    let (logs, _guard) = install_tracing_capture();
    let k = key();
    let local = activity(5, 5);
    h.create_run(&k, &[(80, 5), (100, 5)], vec![local.clone()]).await;

    let mut update = sync_of(&local, &[(80, 5), (90, 7)]);
    update.version = 7;
    let _ = h.replicator.sync_activity_state(&bg(), h.single(&k, update)).await;

    let resend = logs.matching(Level::INFO, "requires resend");
    assert_eq!(resend.len(), 1);
    assert_eq!(resend[0].field("resume_event_id").as_deref(), Some("80"));
    assert_eq!(resend[0].field("resume_version").as_deref(), Some("5"));
    assert_eq!(resend[0].field("workflow_id").as_deref(), Some("wf-1"));
}
