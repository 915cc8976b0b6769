//! Deterministic derivation of pending timer obligations.
//!
//! Every region derives the same sorted list of [`TimerSequenceId`]s from the
//! same mutable state, and creates at most one new timer task per call. Which
//! obligations already have an outstanding task is tracked in
//! [`TimerTaskStatus`] on the owning record, so re-running the derivation
//! never duplicates a task.
//!
//! Only the earliest obligation is ever created. Later ones are picked up when
//! the earlier task fires and the derivation runs again.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::Error;
use crate::state::{ActivityInfo, MutableState, TimerInfo};
use crate::tasks::Task;

/// Kind of timeout a timer enforces. The discriminant is the tie-break order
/// between obligations with equal timestamp and event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum TimerType {
    StartToClose = 1,
    ScheduleToStart = 2,
    ScheduleToClose = 3,
    Heartbeat = 4,
}

impl TimerType {
    /// Status bit recording that a task of this kind exists.
    pub fn status_bit(self) -> TimerTaskStatus {
        match self {
            TimerType::StartToClose => TimerTaskStatus::START_TO_CLOSE,
            TimerType::ScheduleToStart => TimerTaskStatus::SCHEDULE_TO_START,
            TimerType::ScheduleToClose => TimerTaskStatus::SCHEDULE_TO_CLOSE,
            TimerType::Heartbeat => TimerTaskStatus::HEARTBEAT,
        }
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerType::StartToClose => "StartToClose",
            TimerType::ScheduleToStart => "ScheduleToStart",
            TimerType::ScheduleToClose => "ScheduleToClose",
            TimerType::Heartbeat => "Heartbeat",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    /// Timer kinds that already have an outstanding task.
    ///
    /// Bit values are persisted and must not change. User timers only use
    /// [`TimerTaskStatus::CREATED`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TimerTaskStatus: u32 {
        const START_TO_CLOSE = 1;
        const SCHEDULE_TO_START = 2;
        const SCHEDULE_TO_CLOSE = 4;
        const HEARTBEAT = 8;
    }
}

impl TimerTaskStatus {
    pub const NONE: Self = Self::empty();
    /// User timer task created.
    pub const CREATED: Self = Self::START_TO_CLOSE;

    pub fn has(self, kind: TimerType) -> bool {
        self.contains(kind.status_bit())
    }

    pub fn mark(&mut self, kind: TimerType) {
        self.insert(kind.status_bit());
    }

    pub fn unmark(&mut self, kind: TimerType) {
        self.remove(kind.status_bit());
    }
}

// Persisted as the raw integer; unknown bits from newer writers are kept.
impl Serialize for TimerTaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for TimerTaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(TimerTaskStatus::from_bits_retain)
    }
}

/// One derived timer obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSequenceId {
    /// Scheduled event id of the activity, or started event id of the user timer.
    pub event_id: i64,
    pub timestamp_ms: u64,
    pub timer_type: TimerType,
    pub timer_created: bool,
    pub attempt: i32,
}

impl TimerSequenceId {
    fn sort_key(&self) -> (u64, i64, TimerType) {
        (self.timestamp_ms, self.event_id, self.timer_type)
    }
}

fn sort_timer_sequence_ids(ids: &mut [TimerSequenceId]) {
    ids.sort_by_key(TimerSequenceId::sort_key);
}

fn deadline(start_ms: u64, timeout: Duration) -> u64 {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    start_ms.saturating_add(timeout_ms)
}

/// Derives and creates timer tasks for one workflow run's mutable state.
pub struct TimerSequence<'a, M: MutableState + ?Sized> {
    mutable_state: &'a mut M,
}

impl<'a, M: MutableState + ?Sized> TimerSequence<'a, M> {
    pub fn new(mutable_state: &'a mut M) -> Self {
        Self { mutable_state }
    }

    /// Create the task for the earliest user timer if it has none yet.
    /// Returns whether mutable state was modified.
    pub fn create_next_user_timer(&mut self) -> Result<bool, Error> {
        let Some(first) = self.load_and_sort_user_timers().into_iter().next() else {
            return Ok(false);
        };
        if first.timer_created || self.is_past_run_expiration(first.timestamp_ms) {
            return Ok(false);
        }

        let timer_id = match self.mutable_state.user_timer_info_by_event_id(first.event_id) {
            Some(timer_info) => timer_info.timer_id.clone(),
            None => {
                return Err(Error::internal(format!(
                    "unable to load user timer with started event id {}",
                    first.event_id
                )))
            }
        };
        self.mutable_state
            .update_user_timer_task_status(&timer_id, TimerTaskStatus::CREATED)?;

        let key = self.mutable_state.workflow_key().clone();
        debug!(
            target: "duroxide_xdc::timer_sequence",
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            timer_id = %timer_id,
            event_id = first.event_id,
            visibility_timestamp_ms = first.timestamp_ms,
            "creating user timer task"
        );
        self.mutable_state.add_tasks(vec![Task::UserTimer {
            key,
            visibility_timestamp_ms: first.timestamp_ms,
            event_id: first.event_id,
        }]);
        Ok(true)
    }

    /// Create the task for the earliest activity timeout if it has none yet.
    /// Returns whether mutable state was modified.
    pub fn create_next_activity_timer(&mut self) -> Result<bool, Error> {
        let Some(first) = self.load_and_sort_activity_timers().into_iter().next() else {
            return Ok(false);
        };
        if first.timer_created || self.is_past_run_expiration(first.timestamp_ms) {
            return Ok(false);
        }

        let (status, stamp) = match self.mutable_state.activity_info(first.event_id) {
            Some(info) => (info.timer_task_status | first.timer_type.status_bit(), info.stamp),
            None => {
                return Err(Error::internal(format!(
                    "unable to load activity info with scheduled event id {}",
                    first.event_id
                )))
            }
        };
        let heartbeat_visibility =
            (first.timer_type == TimerType::Heartbeat).then_some(first.timestamp_ms);
        self.mutable_state
            .update_activity_task_status_with_timer_heartbeat(first.event_id, status, heartbeat_visibility)?;

        let key = self.mutable_state.workflow_key().clone();
        debug!(
            target: "duroxide_xdc::timer_sequence",
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            scheduled_event_id = first.event_id,
            timeout_type = %first.timer_type,
            attempt = first.attempt,
            visibility_timestamp_ms = first.timestamp_ms,
            "creating activity timeout task"
        );
        self.mutable_state.add_tasks(vec![Task::ActivityTimeout {
            key,
            visibility_timestamp_ms: first.timestamp_ms,
            timeout_type: first.timer_type,
            event_id: first.event_id,
            attempt: first.attempt,
            stamp,
        }]);
        Ok(true)
    }

    /// Every pending user timer's obligation, sorted.
    pub fn load_and_sort_user_timers(&self) -> Vec<TimerSequenceId> {
        let mut ids: Vec<TimerSequenceId> = self
            .mutable_state
            .pending_timer_infos()
            .values()
            .filter_map(Self::user_timer_sequence_id)
            .collect();
        sort_timer_sequence_ids(&mut ids);
        ids
    }

    /// Every applicable activity timeout obligation, sorted.
    pub fn load_and_sort_activity_timers(&self) -> Vec<TimerSequenceId> {
        let mut ids = Vec::new();
        for info in self.mutable_state.pending_activity_infos().values() {
            ids.extend(
                [
                    Self::activity_schedule_to_start_timer(info),
                    Self::activity_schedule_to_close_timer(info),
                    Self::activity_start_to_close_timer(info),
                    Self::activity_heartbeat_timer(info),
                ]
                .into_iter()
                .flatten(),
            );
        }
        sort_timer_sequence_ids(&mut ids);
        ids
    }

    fn is_past_run_expiration(&self, timestamp_ms: u64) -> bool {
        self.mutable_state
            .execution_info()
            .workflow_run_expiration_ms
            .is_some_and(|expiration| timestamp_ms > expiration)
    }

    pub fn user_timer_sequence_id(timer_info: &TimerInfo) -> Option<TimerSequenceId> {
        Some(TimerSequenceId {
            event_id: timer_info.started_event_id,
            timestamp_ms: timer_info.expiry_time_ms?,
            timer_type: TimerType::StartToClose,
            timer_created: timer_info.task_status != TimerTaskStatus::NONE,
            attempt: 1,
        })
    }

    pub fn activity_schedule_to_start_timer(info: &ActivityInfo) -> Option<TimerSequenceId> {
        if info.scheduled_event_id == crate::EMPTY_EVENT_ID || info.is_started() {
            return None;
        }
        if info.schedule_to_start_timeout.is_zero() {
            return None;
        }
        Some(TimerSequenceId {
            event_id: info.scheduled_event_id,
            timestamp_ms: deadline(info.scheduled_time_ms?, info.schedule_to_start_timeout),
            timer_type: TimerType::ScheduleToStart,
            timer_created: info.timer_task_status.has(TimerType::ScheduleToStart),
            attempt: info.attempt,
        })
    }

    pub fn activity_schedule_to_close_timer(info: &ActivityInfo) -> Option<TimerSequenceId> {
        if info.scheduled_event_id == crate::EMPTY_EVENT_ID || info.schedule_to_close_timeout.is_zero() {
            return None;
        }
        // cumulative across retries
        let start = info.first_scheduled_time_ms.or(info.scheduled_time_ms)?;
        Some(TimerSequenceId {
            event_id: info.scheduled_event_id,
            timestamp_ms: deadline(start, info.schedule_to_close_timeout),
            timer_type: TimerType::ScheduleToClose,
            timer_created: info.timer_task_status.has(TimerType::ScheduleToClose),
            attempt: info.attempt,
        })
    }

    pub fn activity_start_to_close_timer(info: &ActivityInfo) -> Option<TimerSequenceId> {
        if !info.is_started() || info.start_to_close_timeout.is_zero() {
            return None;
        }
        Some(TimerSequenceId {
            event_id: info.scheduled_event_id,
            timestamp_ms: deadline(info.started_time_ms?, info.start_to_close_timeout),
            timer_type: TimerType::StartToClose,
            timer_created: info.timer_task_status.has(TimerType::StartToClose),
            attempt: info.attempt,
        })
    }

    pub fn activity_heartbeat_timer(info: &ActivityInfo) -> Option<TimerSequenceId> {
        if !info.is_started() || info.heartbeat_timeout.is_zero() {
            return None;
        }
        let last_heartbeat = info.last_heartbeat_update_time_ms.or(info.started_time_ms)?;
        Some(TimerSequenceId {
            event_id: info.scheduled_event_id,
            timestamp_ms: deadline(last_heartbeat, info.heartbeat_timeout),
            timer_type: TimerType::Heartbeat,
            timer_created: info.timer_task_status.has(TimerType::Heartbeat),
            attempt: info.attempt,
        })
    }
}
