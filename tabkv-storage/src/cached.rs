//! Write-coalescing cache over any [`Storage`] backend.
//!
//! Writes to keys matching a cache-inclusion pattern are held in memory
//! while the tab is active and written to the backend together: after the
//! flush delay, when the tab becomes inactive, or on [`CachedStorage::stop`].
//! Every other write goes straight through.
//!
//! # Reconciliation
//!
//! When another facade of the same table writes a key this cache has
//! buffered, the buffered value is dropped (external delete, or no merge
//! function configured) or replaced by `merge(key, buffered, external)` and
//! flushed before the notification returns.
//!
//! # Known limitation
//!
//! [`keys`](Storage::keys) lists the backend's keys only. A key that has
//! been buffered but never flushed does not appear until the next flush.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tabkv_core::{
    pattern, serialized_len, ChangeEvent, ConfigError, LifecycleError, PatternError,
    StorageError, StorageValue, TabKvResult, Timestamp,
};
use tracing::{debug, warn};

use crate::diagnostics::{CacheEvent, DiagnosticSink, ReconcileResolution};
use crate::flush::{FlushTimer, WriteBuffer};
use crate::tab_status::{TabStatusWatcher, VisibilityWatcher};
use crate::timer::{Timer, TokioTimer};
use crate::{ExternalChangeListener, Storage, Subscription};

/// Conflict resolver: `(key, buffered, external) -> merged`.
pub type MergeFn = Arc<dyn Fn(&str, &StorageValue, &StorageValue) -> StorageValue + Send + Sync>;

/// Pattern matcher: `(key, pattern) -> matches`.
pub type MatcherFn = Arc<dyn Fn(&str, &str) -> Result<bool, PatternError> + Send + Sync>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the cached storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedStorageConfig {
    /// Delay between the first buffered write and the automatic flush.
    /// Required.
    pub flush_delay: Option<Duration>,
    /// Initial cache-inclusion patterns.
    pub cached_keys: Vec<String>,
}

impl CachedStorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flush delay.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = Some(delay);
        self
    }

    /// Append a cache-inclusion pattern.
    pub fn with_cached_key(mut self, pattern: impl Into<String>) -> Self {
        self.cached_keys.push(pattern.into());
        self
    }

    /// Append several cache-inclusion patterns.
    pub fn with_cached_keys<I, P>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.cached_keys.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Build from validated host settings.
    pub fn from_settings(settings: &tabkv_core::CacheSettings) -> TabKvResult<Self> {
        settings.validate()?;
        Ok(Self {
            flush_delay: Some(settings.flush_delay()?),
            cached_keys: settings.cached_keys.clone(),
        })
    }

    fn required_flush_delay(&self) -> Result<Duration, ConfigError> {
        match self.flush_delay {
            None => Err(ConfigError::MissingRequired {
                field: "flush_delay".to_string(),
            }),
            Some(delay) if delay.is_zero() => Err(ConfigError::InvalidValue {
                field: "flush_delay".to_string(),
                value: format!("{:?}", delay),
                reason: "flush_delay must be positive".to_string(),
            }),
            Some(delay) => Ok(delay),
        }
    }
}

/// Builder for [`CachedStorage`], collecting the optional collaborators.
pub struct CachedStorageBuilder<S> {
    backend: S,
    config: CachedStorageConfig,
    tab_status: Option<Arc<dyn TabStatusWatcher>>,
    timer: Option<Arc<dyn Timer>>,
    merge: Option<MergeFn>,
    matcher: Option<MatcherFn>,
    log: Option<Arc<dyn DiagnosticSink>>,
}

impl<S: Storage + 'static> CachedStorageBuilder<S> {
    fn new(backend: S) -> Self {
        Self {
            backend,
            config: CachedStorageConfig::default(),
            tab_status: None,
            timer: None,
            merge: None,
            matcher: None,
            log: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CachedStorageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.config.flush_delay = Some(delay);
        self
    }

    pub fn cache_key(mut self, pattern: impl Into<String>) -> Self {
        self.config.cached_keys.push(pattern.into());
        self
    }

    pub fn tab_status(mut self, watcher: Arc<dyn TabStatusWatcher>) -> Self {
        self.tab_status = Some(watcher);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Resolve conflicts with external writes instead of discarding.
    pub fn merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&str, &StorageValue, &StorageValue) -> StorageValue + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }

    /// Override the default wildcard matcher.
    pub fn matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&str, &str) -> Result<bool, PatternError> + Send + Sync + 'static,
    {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    pub fn log(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.log = Some(sink);
        self
    }

    /// Build the cache. Fails when the flush delay is missing, or when no
    /// timer was given and there is no tokio runtime to default to.
    pub fn build(self) -> TabKvResult<CachedStorage<S>> {
        let flush_delay = self.config.required_flush_delay()?;
        let timer: Arc<dyn Timer> = match self.timer {
            Some(timer) => timer,
            None => Arc::new(TokioTimer::new()?),
        };
        let tab_status: Arc<dyn TabStatusWatcher> = match self.tab_status {
            Some(watcher) => watcher,
            None => Arc::new(VisibilityWatcher::new()),
        };
        let matcher: MatcherFn = match self.matcher {
            Some(matcher) => matcher,
            None => Arc::new(pattern::matches),
        };

        Ok(CachedStorage {
            inner: Arc::new(Inner {
                backend: self.backend,
                tab_status,
                timer,
                flush_delay,
                merge: self.merge,
                matcher,
                log: self.log,
                state: Mutex::new(CacheState {
                    buffer: WriteBuffer::new(),
                    patterns: self.config.cached_keys,
                    flush_timer: FlushTimer::Idle,
                    timer_epoch: 0,
                    lifecycle: Lifecycle::Stopped,
                    last_flush: None,
                }),
            }),
        })
    }
}

// ============================================================================
// STATE
// ============================================================================

enum Lifecycle {
    Stopped,
    Started {
        inactive: Subscription,
        external: Subscription,
    },
}

struct CacheState {
    buffer: WriteBuffer,
    patterns: Vec<String>,
    flush_timer: FlushTimer,
    timer_epoch: u64,
    lifecycle: Lifecycle,
    last_flush: Option<Timestamp>,
}

struct Inner<S> {
    backend: S,
    tab_status: Arc<dyn TabStatusWatcher>,
    timer: Arc<dyn Timer>,
    flush_delay: Duration,
    merge: Option<MergeFn>,
    matcher: MatcherFn,
    log: Option<Arc<dyn DiagnosticSink>>,
    state: Mutex<CacheState>,
}

/// Storage facade that buffers writes to selected keys.
///
/// Cloning yields another handle to the same cache. No lock is held while
/// the backend, tab watcher, merge function or diagnostic sink runs, so all
/// of them may call back into the cache.
pub struct CachedStorage<S: Storage + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: Storage + 'static> Clone for CachedStorage<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Storage + 'static> fmt::Debug for CachedStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStorage")
            .field("flush_delay", &self.inner.flush_delay)
            .field("started", &self.is_started())
            .field("buffered", &self.buffered_keys().len())
            .finish()
    }
}

impl<S: Storage + 'static> CachedStorage<S> {
    /// Start building a cache over `backend`.
    pub fn builder(backend: S) -> CachedStorageBuilder<S> {
        CachedStorageBuilder::new(backend)
    }

    /// Build with default collaborators.
    pub fn new(backend: S, config: CachedStorageConfig) -> TabKvResult<Self> {
        Self::builder(backend).config(config).build()
    }

    /// Begin observing tab inactivity and external changes.
    pub fn start(&self) -> TabKvResult<()> {
        self.inner.start()
    }

    /// Flush buffered writes and stop observing.
    ///
    /// This is the only way to guarantee buffered data reaches the backend
    /// before the cache is dropped.
    pub fn stop(&self) -> TabKvResult<()> {
        self.inner.stop()
    }

    /// Write every buffered value to the backend.
    pub fn flush(&self) -> TabKvResult<()> {
        self.inner.flush()
    }

    /// Make keys matching `pattern` eligible for buffering. Affects later
    /// writes only.
    pub fn cache_key(&self, pattern: impl Into<String>) -> TabKvResult<()> {
        self.inner.lock()?.patterns.push(pattern.into());
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .lock()
            .map(|s| matches!(s.lifecycle, Lifecycle::Started { .. }))
            .unwrap_or(false)
    }

    pub fn is_flush_armed(&self) -> bool {
        self.inner
            .lock()
            .map(|s| s.flush_timer.is_armed())
            .unwrap_or(false)
    }

    /// When the pending flush timer was armed.
    pub fn flush_armed_at(&self) -> Option<Timestamp> {
        self.inner.lock().ok().and_then(|s| s.flush_timer.armed_at())
    }

    /// When the last flush ran, if ever.
    pub fn last_flush(&self) -> Option<Timestamp> {
        self.inner.lock().ok().and_then(|s| s.last_flush)
    }

    /// Keys currently held in memory, in buffering order.
    pub fn buffered_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|s| s.buffer.keys().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn cached_patterns(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|s| s.patterns.clone())
            .unwrap_or_default()
    }

    pub fn flush_delay(&self) -> Duration {
        self.inner.flush_delay
    }

    pub fn backend(&self) -> &S {
        &self.inner.backend
    }
}

impl<S: Storage + 'static> Storage for CachedStorage<S> {
    fn has(&self, key: &str) -> TabKvResult<bool> {
        if self.inner.lock()?.buffer.contains(key) {
            return Ok(true);
        }
        self.inner.backend.has(key)
    }

    fn get(&self, key: &str) -> TabKvResult<Option<StorageValue>> {
        if let Some(value) = self.inner.lock()?.buffer.get(key) {
            return Ok(Some(value.clone()));
        }
        self.inner.backend.get(key)
    }

    fn set(&self, key: &str, value: Option<StorageValue>) -> TabKvResult<()> {
        match value {
            Some(value) => self.inner.set(key, value),
            None => self.delete(key),
        }
    }

    fn delete(&self, key: &str) -> TabKvResult<()> {
        self.inner.lock()?.buffer.remove(key);
        self.inner.backend.delete(key)
    }

    fn keys(&self) -> TabKvResult<Vec<String>> {
        self.inner.backend.keys()
    }

    /// Buffered records report the serialized value length only; the key is
    /// not counted again.
    fn record_size(&self, key: &str) -> TabKvResult<usize> {
        if let Some(value) = self.inner.lock()?.buffer.get(key) {
            return Ok(serialized_len(value));
        }
        self.inner.backend.record_size(key)
    }

    fn on_external_change(&self, listener: ExternalChangeListener) -> TabKvResult<Subscription> {
        self.inner.backend.on_external_change(listener)
    }
}

// ============================================================================
// CORE LOGIC
// ============================================================================

impl<S: Storage + 'static> Inner<S> {
    fn lock(&self) -> TabKvResult<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(log) = &self.log {
            log.record(&event);
        }
    }

    fn is_cacheable(&self, key: &str) -> TabKvResult<bool> {
        if !self.tab_status.is_active() {
            return Ok(false);
        }
        let patterns = self.lock()?.patterns.clone();
        for pattern in &patterns {
            if (self.matcher)(key, pattern.as_str())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn set(self: &Arc<Self>, key: &str, value: StorageValue) -> TabKvResult<()> {
        if !self.is_cacheable(key)? {
            // A stale buffered value must not overwrite this write later.
            self.lock()?.buffer.remove(key);
            self.backend.set(key, Some(value))?;
            debug!(key, "write through");
            self.emit(CacheEvent::WroteThrough {
                key: key.to_string(),
            });
            return Ok(());
        }

        {
            let mut state = self.lock()?;
            state.buffer.insert(key, value);
            if !state.flush_timer.is_armed() {
                state.timer_epoch += 1;
                let epoch = state.timer_epoch;
                let weak = Arc::downgrade(self);
                let handle = self.timer.schedule(
                    self.flush_delay,
                    Box::new(move || on_flush_timer(&weak, epoch)),
                )?;
                state.flush_timer.arm(handle, self.timer.now(), epoch);
                debug!(key, delay = ?self.flush_delay, "flush timer armed");
            }
        }
        debug!(key, "write buffered");
        self.emit(CacheEvent::Buffered {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Write buffered entries in order.
    ///
    /// Each entry leaves the buffer just before its own backend write, so a
    /// notification raised by that write finds it gone while the entries not
    /// yet written remain buffered and can still be reconciled.
    fn flush(&self) -> TabKvResult<()> {
        let now = self.timer.now();
        let handle = {
            let mut state = self.lock()?;
            state.last_flush = Some(now);
            state.flush_timer.disarm()
        };
        if let Some(handle) = handle {
            self.timer.cancel(handle);
        }

        let mut count = 0;
        loop {
            let Some((key, value)) = self.lock()?.buffer.pop_front() else {
                break;
            };
            if let Err(err) = self.backend.set(&key, Some(value.clone())) {
                self.restore(key, value);
                return Err(err);
            }
            count += 1;
        }

        debug!(count, "flushed");
        self.emit(CacheEvent::Flushed { count, at: now });
        Ok(())
    }

    /// Put back a write the backend rejected, unless a newer value was
    /// buffered for its key meanwhile.
    fn restore(&self, key: String, value: StorageValue) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffer
            .push_front_if_absent(key, value);
    }

    /// Flush from a context with no caller to report errors to.
    fn flush_detached(&self, trigger: &'static str) {
        if let Err(err) = self.flush() {
            warn!(trigger, error = %err, "flush failed");
            self.emit(CacheEvent::FlushFailed {
                reason: err.to_string(),
            });
        }
    }

    fn handle_external_change(&self, event: &ChangeEvent) {
        let resolution = match self.reconcile(event) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return,
            Err(err) => {
                warn!(key = %event.key, error = %err, "reconciliation failed");
                return;
            }
        };

        debug!(key = %event.key, resolution = ?resolution, "external change reconciled");
        self.emit(CacheEvent::Reconciled {
            key: event.key.clone(),
            resolution,
        });
        if resolution == ReconcileResolution::Merged {
            self.flush_detached("reconcile");
        }
    }

    fn reconcile(&self, event: &ChangeEvent) -> TabKvResult<Option<ReconcileResolution>> {
        let mut state = self.lock()?;
        if !matches!(state.lifecycle, Lifecycle::Started { .. }) {
            return Ok(None);
        }
        let Some(buffered) = state.buffer.get(&event.key).cloned() else {
            return Ok(None);
        };

        match (&event.value, &self.merge) {
            (None, _) => {
                state.buffer.remove(&event.key);
                Ok(Some(ReconcileResolution::Deleted))
            }
            (Some(external), Some(merge)) => {
                drop(state);
                let merged = merge(&event.key, &buffered, external);
                self.lock()?.buffer.insert(&event.key, merged);
                Ok(Some(ReconcileResolution::Merged))
            }
            (Some(_), None) => {
                state.buffer.remove(&event.key);
                Ok(Some(ReconcileResolution::Discarded))
            }
        }
    }

    fn start(self: &Arc<Self>) -> TabKvResult<()> {
        if matches!(self.lock()?.lifecycle, Lifecycle::Started { .. }) {
            return Err(LifecycleError::AlreadyStarted.into());
        }

        self.tab_status.start();
        let weak = Arc::downgrade(self);
        let inactive = self.tab_status.on_inactive(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush_detached("inactive");
            }
        }));

        let weak = Arc::downgrade(self);
        let listener: ExternalChangeListener = Arc::new(move |event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_external_change(event);
            }
        });
        let external = match self.backend.on_external_change(listener) {
            Ok(subscription) => subscription,
            Err(err) => {
                inactive.unsubscribe();
                self.tab_status.stop();
                return Err(err);
            }
        };

        self.lock()?.lifecycle = Lifecycle::Started { inactive, external };
        debug!("cached storage started");
        self.emit(CacheEvent::Started);
        Ok(())
    }

    fn stop(&self) -> TabKvResult<()> {
        if !matches!(self.lock()?.lifecycle, Lifecycle::Started { .. }) {
            return Err(LifecycleError::NotStarted.into());
        }

        self.flush()?;

        let lifecycle = std::mem::replace(&mut self.lock()?.lifecycle, Lifecycle::Stopped);
        self.tab_status.stop();
        if let Lifecycle::Started { inactive, external } = lifecycle {
            inactive.unsubscribe();
            external.unsubscribe();
        }
        debug!("cached storage stopped");
        self.emit(CacheEvent::Stopped);
        Ok(())
    }
}

fn on_flush_timer<S: Storage + 'static>(weak: &Weak<Inner<S>>, epoch: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    // A cancelled timer can still fire once; only the armed one flushes.
    // Forget its handle so flush does not cancel it.
    match inner.lock() {
        Ok(mut state) if state.flush_timer.is_current(epoch) => {
            state.flush_timer.disarm();
        }
        _ => return,
    }
    inner.flush_detached("timer");
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.flush_timer.disarm() {
            self.timer.cancel(handle);
        }
        if let Lifecycle::Started { inactive, external } =
            std::mem::replace(&mut state.lifecycle, Lifecycle::Stopped)
        {
            inactive.unsubscribe();
            external.unsubscribe();
            self.tab_status.stop();
        }
    }
}
