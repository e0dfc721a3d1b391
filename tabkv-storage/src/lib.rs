//! tabkv Storage - Storage Trait, Shared Memory Store and Write Cache
//!
//! Defines the key/value backend contract shared by every storage facade,
//! an in-memory implementation whose facades share one table and notify each
//! other of changes, and [`CachedStorage`], which buffers writes for selected
//! keys and reconciles them against changes made by other facades.

pub mod bus;
pub mod cached;
pub mod diagnostics;
pub mod flush;
pub mod memory;
pub mod tab_status;
pub mod timer;

use std::fmt;
use std::sync::Arc;

use tabkv_core::{ChangeEvent, StorageValue, TabKvResult};

pub use bus::ExternalChangeBus;
pub use cached::{CachedStorage, CachedStorageBuilder, CachedStorageConfig, MatcherFn, MergeFn};
pub use diagnostics::{CacheEvent, DiagnosticSink, ReconcileResolution};
pub use memory::{MemoryStorage, MemoryStorageOptions};
pub use tab_status::{InactiveCallback, TabStatusWatcher, VisibilityWatcher};
pub use timer::{ManualTimer, Timer, TimerCallback, TimerHandle, TokioTimer};

/// Callback invoked when another facade changes the shared table.
pub type ExternalChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Handle returned by listener registrations.
///
/// Dropping a subscription does not unregister the listener; call
/// [`Subscription::unsubscribe`].
#[must_use = "a dropped subscription can no longer be unsubscribed"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` when unsubscribed.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the registration this subscription was created for.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Key/value backend contract.
///
/// Implementations must be safe to share between threads, but callers are
/// expected to drive them cooperatively: every operation runs to completion
/// and change listeners are invoked synchronously before `set`/`delete`
/// return.
pub trait Storage: Send + Sync {
    /// Whether the key currently holds a value.
    fn has(&self, key: &str) -> TabKvResult<bool>;

    /// Read a value; `None` when the key is absent.
    fn get(&self, key: &str) -> TabKvResult<Option<StorageValue>>;

    /// Write a value. `None` deletes the key.
    fn set(&self, key: &str, value: Option<StorageValue>) -> TabKvResult<()>;

    /// Remove a key.
    fn delete(&self, key: &str) -> TabKvResult<()>;

    /// Current keys in insertion order.
    fn keys(&self) -> TabKvResult<Vec<String>>;

    /// Approximate bytes used by the record, 0 when absent.
    fn record_size(&self, key: &str) -> TabKvResult<usize>;

    /// Observe writes made through other facades of the same table.
    fn on_external_change(&self, listener: ExternalChangeListener) -> TabKvResult<Subscription>;
}
