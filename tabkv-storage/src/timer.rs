//! Delay scheduling for flush timers.
//!
//! [`TokioTimer`] runs callbacks on a tokio runtime; [`ManualTimer`] only
//! fires them when its clock is advanced, which keeps tests deterministic
//! and lets hosts with their own event loop drive flushing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tabkv_core::{StorageError, TabKvResult, Timestamp};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Callback run once when a scheduled delay elapses.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Opaque handle identifying a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Schedules callbacks after a delay.
///
/// `schedule` must not run the callback before it returns. Cancelling a
/// handle that already fired or was already cancelled is a no-op.
pub trait Timer: Send + Sync {
    /// Current time according to this timer.
    fn now(&self) -> Timestamp;

    /// Run `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TabKvResult<TimerHandle>;

    /// Prevent a scheduled callback from running.
    fn cancel(&self, handle: TimerHandle);
}

// ============================================================================
// TOKIO TIMER
// ============================================================================

/// Timer backed by `tokio::time::sleep` tasks.
#[derive(Clone)]
pub struct TokioTimer {
    runtime: Handle,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl TokioTimer {
    /// Bind to the tokio runtime of the calling context.
    pub fn new() -> TabKvResult<Self> {
        let runtime = Handle::try_current().map_err(|e| StorageError::Timer {
            reason: e.to_string(),
        })?;
        Ok(Self::with_handle(runtime))
    }

    /// Bind to an explicit runtime handle.
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of callbacks scheduled and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTimer")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Timer for TokioTimer {
    fn now(&self) -> Timestamp {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TabKvResult<TimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        let mut guard = self.tasks.lock().map_err(|_| StorageError::LockPoisoned)?;
        // The task cannot deregister itself before the guard is released,
        // so its handle is always inserted first.
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            callback();
        });
        guard.insert(id, task);
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(task) = task {
            task.abort();
        }
    }
}

// ============================================================================
// MANUAL TIMER
// ============================================================================

struct Scheduled {
    id: u64,
    due: Timestamp,
    callback: TimerCallback,
}

struct ManualState {
    now: Timestamp,
    next_id: u64,
    scheduled: Vec<Scheduled>,
}

/// Timer with a clock that only moves when [`advance`](Self::advance) is
/// called. Clones share one clock.
#[derive(Clone)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimer {
    /// Start the clock at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start the clock at `now`.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now,
                next_id: 0,
                scheduled: Vec::new(),
            })),
        }
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.lock().scheduled.len()
    }

    /// Move the clock forward, running every callback that falls due, in due
    /// order. Callbacks may schedule further callbacks; those run too if they
    /// fall due within the advanced window.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let target = {
            let state = self.lock();
            state.now.checked_add_signed(by).unwrap_or(state.now)
        };

        loop {
            let next = {
                let mut state = self.lock();
                let due = state
                    .scheduled
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.due <= target)
                    .min_by_key(|(_, s)| (s.due, s.id))
                    .map(|(index, _)| index);
                match due {
                    Some(index) => {
                        let scheduled = state.scheduled.remove(index);
                        state.now = scheduled.due;
                        Some(scheduled.callback)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("pending", &state.scheduled.len())
            .finish()
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> Timestamp {
        self.lock().now
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TabKvResult<TimerHandle> {
        let delay = chrono::Duration::from_std(delay).map_err(|e| StorageError::Timer {
            reason: e.to_string(),
        })?;
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now.checked_add_signed(delay).ok_or_else(|| StorageError::Timer {
            reason: "delay overflows the clock".to_string(),
        })?;
        state.scheduled.push(Scheduled { id, due, callback });
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        self.lock().scheduled.retain(|s| s.id != handle.0);
    }
}
