use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Handle for a task scheduled on a [`SyncClock`].
    pub struct SyncTaskId;
}

pub type SyncTask = Arc<dyn Fn() + Send + Sync>;

/// Fixed-cadence task runner driven by the host.
///
/// Tasks are snapshotted at the start of each tick and run outside the
/// internal lock, so a task may schedule or cancel tasks (itself included).
/// A task cancelled mid-tick may still run once in that tick.
pub struct SyncClock {
    tasks: Mutex<SlotMap<SyncTaskId, SyncTask>>,
    ticks: AtomicU64,
}

impl SyncClock {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(SlotMap::with_key()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Run `task` once per tick, starting with the next tick.
    pub fn schedule_repeating(&self, task: SyncTask) -> SyncTaskId {
        self.tasks.lock().insert(task)
    }

    pub fn cancel(&self, id: SyncTaskId) -> bool {
        self.tasks.lock().remove(id).is_some()
    }

    /// Advance one tick. Returns the number of tasks run.
    pub fn tick(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let tasks: Vec<SyncTask> = self.tasks.lock().values().cloned().collect();
        for task in &tasks {
            task();
        }
        tasks.len()
    }

    pub fn current_tick(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new()
    }
}
