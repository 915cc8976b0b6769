use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Queue position of a lease request. High priority waiters are served
/// before any low priority waiter; within one priority, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockPriority {
    High,
    Low,
}

struct Waiter {
    priority: LockPriority,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<Waiter>,
}

/// Exclusive lock with priority-ordered hand-off.
///
/// Unlocking hands ownership directly to the next waiter, so a waiter that
/// arrives later can never barge ahead of one already queued.
#[derive(Default)]
pub(crate) struct PriorityLock {
    state: Mutex<LockState>,
}

impl PriorityLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        // the state is always left consistent, so a poisoned guard is usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock. Returns whether the caller had to wait.
    ///
    /// Cancel safe: if the returned future is dropped after ownership was
    /// handed to it, the lock is passed on.
    pub(crate) async fn lock(&self, priority: LockPriority) -> bool {
        let rx = {
            let mut st = self.state();
            if !st.held {
                st.held = true;
                return false;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { priority, tx };
            match priority {
                LockPriority::High => {
                    let pos = st
                        .waiters
                        .iter()
                        .position(|w| w.priority == LockPriority::Low)
                        .unwrap_or(st.waiters.len());
                    st.waiters.insert(pos, waiter);
                }
                LockPriority::Low => st.waiters.push_back(waiter),
            }
            rx
        };

        let mut pending = PendingAcquire { lock: self, rx: Some(rx) };
        if let Some(rx) = pending.rx.as_mut() {
            // senders only leave the queue through unlock, which sends
            let _ = rx.await;
        }
        pending.rx = None;
        true
    }

    /// Release the lock, handing it to the next live waiter if any.
    pub(crate) fn unlock(&self) {
        let mut st = self.state();
        while let Some(waiter) = st.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        st.held = false;
    }

    /// Neither held nor awaited.
    pub(crate) fn is_idle(&self) -> bool {
        let st = self.state();
        !st.held && st.waiters.is_empty()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.state().waiters.len()
    }
}

struct PendingAcquire<'a> {
    lock: &'a PriorityLock,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        if rx.try_recv().is_ok() {
            // ownership arrived after the waiter gave up
            self.lock.unlock();
        }
    }
}
