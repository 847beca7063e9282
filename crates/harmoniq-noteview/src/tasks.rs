//! Task bookkeeping for background preparation: keyed cancel-and-replace,
//! cooperative cancellation, a counting throttle and a latest-wins result slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};

/// Shared cancellation flag polled by long-running loops.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A started task: its key, ordering generation and cancellation token.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct RunningTask {
    generation: u64,
    token: CancellationToken,
}

/// At most one in-flight task per key.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    running: Mutex<HashMap<String, RunningTask>>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the task running under `key`, if any, and registers a new one.
    pub fn start(&self, key: &str) -> TaskHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.running.lock().insert(
            key.to_owned(),
            RunningTask {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::debug!(key, replaced = previous.generation, generation, "task replaced");
        }
        TaskHandle {
            key: key.to_owned(),
            generation,
            token,
        }
    }

    /// Unregisters `handle` unless a newer task has replaced it.
    pub fn finish(&self, handle: &TaskHandle) -> bool {
        let mut running = self.running.lock();
        match running.get(&handle.key) {
            Some(task) if task.generation == handle.generation => {
                running.remove(&handle.key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.running.lock().remove(key) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<RunningTask> = self.running.lock().drain().map(|(_, task)| task).collect();
        for task in &drained {
            task.token.cancel();
        }
        drained.len()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running.lock().contains_key(key)
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

#[derive(Debug)]
struct ThrottleState {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

/// Counting semaphore bounding concurrent preparation jobs.
#[derive(Clone, Debug)]
pub struct ComputeThrottle {
    state: Arc<ThrottleState>,
}

/// Returns its slot to the throttle when dropped.
#[derive(Debug)]
pub struct ThrottlePermit {
    state: Arc<ThrottleState>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        *self.state.available.lock() += 1;
        self.state.released.notify_one();
    }
}

const PERMIT_POLL: Duration = Duration::from_millis(5);

impl ComputeThrottle {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(ThrottleState {
                available: Mutex::new(capacity),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    /// One permit per logical CPU.
    pub fn per_cpu() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    pub fn available(&self) -> usize {
        *self.state.available.lock()
    }

    pub fn try_acquire(&self) -> Option<ThrottlePermit> {
        let mut available = self.state.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(ThrottlePermit {
            state: Arc::clone(&self.state),
        })
    }

    /// Waits for a permit, giving up as soon as `token` is cancelled.
    pub fn acquire_cancellable(&self, token: &CancellationToken) -> Option<ThrottlePermit> {
        let mut available = self.state.available.lock();
        loop {
            if token.is_cancelled() {
                return None;
            }
            if *available > 0 {
                *available -= 1;
                return Some(ThrottlePermit {
                    state: Arc::clone(&self.state),
                });
            }
            self.state.released.wait_for(&mut available, PERMIT_POLL);
        }
    }
}

/// A value tagged with the generation of the task that produced it.
#[derive(Debug, PartialEq)]
pub struct Versioned<T> {
    pub generation: u64,
    pub value: T,
}

/// Holds the newest published result. Older generations are rejected.
pub struct SnapshotSlot<T> {
    current: ArcSwapOption<Versioned<T>>,
}

impl<T> Default for SnapshotSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SnapshotSlot<T> {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// Stores `value` unless a result with the same or a newer generation is present.
    pub fn publish(&self, generation: u64, value: T) -> bool {
        let candidate = Arc::new(Versioned { generation, value });
        let mut accepted = false;
        self.current.rcu(|current| match current {
            Some(existing) if existing.generation >= generation => {
                accepted = false;
                Some(Arc::clone(existing))
            }
            _ => {
                accepted = true;
                Some(Arc::clone(&candidate))
            }
        });
        if !accepted {
            tracing::debug!(generation, "stale snapshot discarded");
        }
        accepted
    }

    pub fn latest(&self) -> Option<Arc<Versioned<T>>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> Option<u64> {
        self.current.load_full().map(|versioned| versioned.generation)
    }

    pub fn clear(&self) {
        self.current.store(None);
    }
}
