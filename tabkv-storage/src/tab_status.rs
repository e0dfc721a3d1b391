//! Tab visibility tracking.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::Subscription;

/// Callback invoked when the tab is about to become inactive.
pub type InactiveCallback = Arc<dyn Fn() + Send + Sync>;

/// Reports whether the tab is in the foreground and announces when it is
/// about to leave it.
pub trait TabStatusWatcher: Send + Sync {
    /// Begin watching. Calls nest: each `start` is paired with a `stop`.
    fn start(&self);

    /// Stop watching.
    fn stop(&self);

    /// Whether the tab is currently active.
    fn is_active(&self) -> bool;

    /// Register a callback for the active → inactive transition.
    fn on_inactive(&self, callback: InactiveCallback) -> Subscription;
}

struct WatcherState {
    active: AtomicBool,
    watchers: AtomicUsize,
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(u64, InactiveCallback)>>,
}

/// Tab status driven by the host, which reports visibility changes through
/// [`set_active`](Self::set_active). Clones share one state.
#[derive(Clone)]
pub struct VisibilityWatcher {
    state: Arc<WatcherState>,
}

impl Default for VisibilityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilityWatcher {
    /// Create a watcher for a tab that starts out active.
    pub fn new() -> Self {
        Self::with_active(true)
    }

    pub fn with_active(active: bool) -> Self {
        Self {
            state: Arc::new(WatcherState {
                active: AtomicBool::new(active),
                watchers: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                callbacks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Record a visibility change.
    ///
    /// Going from active to inactive runs the registered callbacks, but only
    /// while the watcher is started.
    pub fn set_active(&self, active: bool) {
        let was_active = self.state.active.swap(active, Ordering::SeqCst);
        if !was_active || active || !self.is_watching() {
            return;
        }

        debug!("tab became inactive");
        let callbacks: Vec<InactiveCallback> = self
            .state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Whether at least one `start` is outstanding.
    pub fn is_watching(&self) -> bool {
        self.state.watchers.load(Ordering::SeqCst) > 0
    }

    pub fn callback_count(&self) -> usize {
        self.state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for VisibilityWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityWatcher")
            .field("active", &self.is_active())
            .field("watching", &self.is_watching())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

impl TabStatusWatcher for VisibilityWatcher {
    fn start(&self) {
        self.state.watchers.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        // Saturates at zero: an unmatched stop is ignored.
        self.state
            .watchers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok();
    }

    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    fn on_inactive(&self, callback: InactiveCallback) -> Subscription {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state
                    .callbacks
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(cb_id, _)| *cb_id != id);
            }
        })
    }
}
