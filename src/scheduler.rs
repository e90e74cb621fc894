//! Abstract timer scheduling.
//!
//! Replaces ad-hoc `setTimeout`/`setInterval`-style timers with a small
//! trait the Batcher and Dispatcher consume. Production wiring uses
//! [`TokioScheduler`]; tests that need deterministic control over elapsed
//! time use [`VirtualScheduler`] instead of sleeping in wall-clock time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Opaque handle returned by [`Scheduler::schedule`]; pass to `cancel` to
/// abort a pending task before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run after `after` elapses. Returns a handle usable
    /// with `cancel`.
    fn schedule(&self, after: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Cancel a previously scheduled task. A no-op if it already fired or was
    /// already cancelled.
    fn cancel(&self, handle: TimerHandle);
}

/// Production scheduler backed by the Tokio timer wheel.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    handles: Mutex<BTreeMap<u64, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            task();
        });
        self.handles.lock().unwrap().insert(id, join);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = self.handles.lock().unwrap().remove(&handle.0) {
            join.abort();
        }
    }
}

/// Test double with a manually-advanced clock. `advance` runs every task
/// whose deadline has elapsed, in deadline order.
pub struct VirtualScheduler {
    now: Mutex<Duration>,
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, (Duration, Option<Box<dyn FnOnce() + Send>>)>>,
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self {
            now: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
        }
    }
}

impl VirtualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    /// Advance the virtual clock by `delta`, firing every task whose
    /// deadline has been reached, in deadline order.
    pub fn advance(&self, delta: Duration) {
        let target = {
            let mut now = self.now.lock().unwrap();
            *now += delta;
            *now
        };

        let mut due: Vec<(u64, Duration, Box<dyn FnOnce() + Send>)> = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            let ready_ids: Vec<u64> = pending
                .iter()
                .filter(|(_, (deadline, task))| *deadline <= target && task.is_some())
                .map(|(id, _)| *id)
                .collect();
            for id in ready_ids {
                if let Some((deadline, task_slot)) = pending.get_mut(&id) {
                    if let Some(task) = task_slot.take() {
                        due.push((id, *deadline, task));
                    }
                }
                pending.remove(&id);
            }
        }
        due.sort_by_key(|(_, deadline, _)| *deadline);
        for (_, _, task) in due {
            task();
        }
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&self, after: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = self.now() + after;
        self.pending
            .lock()
            .unwrap()
            .insert(id, (deadline, Some(task)));
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.pending.lock().unwrap().remove(&handle.0);
    }
}
