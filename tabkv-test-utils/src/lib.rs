//! tabkv Test Utilities
//!
//! Centralized test infrastructure for the tabkv workspace:
//! - Proptest generators for keys, values and patterns
//! - Fixtures simulating several tabs over one shared table
//! - A diagnostic sink that records cache events
//! - Tracing initialisation for tests

use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

// Re-export storage types from their source crate
pub use tabkv_storage::{
    CacheEvent, CachedStorage, DiagnosticSink, ManualTimer, MemoryStorage, MemoryStorageOptions,
    ReconcileResolution, Storage, Subscription, TabStatusWatcher, Timer, VisibilityWatcher,
};

// Re-export core types for convenience
pub use tabkv_core::{
    ChangeEvent, ConfigError, LifecycleError, PatternError, StorageError, StorageValue,
    TabKvError, TabKvResult,
};

use proptest::prelude::*;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber once per process. Honours `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// RECORDING SINK
// ============================================================================

/// Collects every [`CacheEvent`] a cache reports.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink handle to pass to [`CachedStorage::builder`].
    pub fn sink(&self) -> Arc<dyn DiagnosticSink> {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &CacheEvent| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone())
        })
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event names in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(CacheEvent::name).collect()
    }

    /// Reconciliation outcomes in order.
    pub fn resolutions(&self) -> Vec<(String, ReconcileResolution)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::Reconciled { key, resolution } => Some((key, resolution)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Default flush delay used by fixtures.
pub const FIXTURE_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Default cache-inclusion pattern used by fixtures.
pub const FIXTURE_PATTERN: &str = "cached-*";

/// One simulated tab: a cached storage over its own facade of the shared
/// table, with its own visibility and diagnostics.
pub struct TabFixture {
    pub cache: CachedStorage<MemoryStorage>,
    pub facade: MemoryStorage,
    pub watcher: VisibilityWatcher,
    pub sink: RecordingSink,
}

/// Several tabs sharing one table and one manual clock.
pub struct MultiTabFixture {
    pub root: MemoryStorage,
    pub timer: ManualTimer,
    pub tabs: Vec<TabFixture>,
}

/// Merge function signature accepted by fixtures.
pub type FixtureMerge = fn(&str, &StorageValue, &StorageValue) -> StorageValue;

impl MultiTabFixture {
    /// Create `count` started tabs with identities "1", "2", ...
    pub fn new(count: usize) -> TabKvResult<Self> {
        Self::build(count, None)
    }

    /// Like [`new`](Self::new), with a merge function on every tab.
    pub fn with_merge(count: usize, merge: FixtureMerge) -> TabKvResult<Self> {
        Self::build(count, Some(merge))
    }

    fn build(count: usize, merge: Option<FixtureMerge>) -> TabKvResult<Self> {
        init_test_tracing();
        let root = MemoryStorage::new();
        let timer = ManualTimer::new();
        let mut tabs = Vec::with_capacity(count);

        for n in 1..=count {
            let facade = root.create_shared_instance(&n.to_string())?;
            let watcher = VisibilityWatcher::new();
            let sink = RecordingSink::new();
            let mut builder = CachedStorage::builder(facade.clone())
                .flush_delay(FIXTURE_FLUSH_DELAY)
                .cache_key(FIXTURE_PATTERN)
                .timer(Arc::new(timer.clone()))
                .tab_status(Arc::new(watcher.clone()))
                .log(sink.sink());
            if let Some(merge) = merge {
                builder = builder.merge(merge);
            }
            let cache = builder.build()?;
            cache.start()?;
            tabs.push(TabFixture {
                cache,
                facade,
                watcher,
                sink,
            });
        }

        Ok(Self { root, timer, tabs })
    }

    pub fn tab(&self, index: usize) -> &TabFixture {
        &self.tabs[index]
    }

    /// Stop every tab, flushing its buffer.
    pub fn stop_all(&self) -> TabKvResult<()> {
        for tab in &self.tabs {
            tab.cache.stop()?;
        }
        Ok(())
    }
}

/// Merge that combines two JSON arrays, keeping order and dropping
/// duplicates; for anything else the buffered value wins.
pub fn union_merge(_key: &str, buffered: &StorageValue, external: &StorageValue) -> StorageValue {
    match (buffered, external) {
        (StorageValue::Array(local), StorageValue::Array(remote)) => {
            let mut merged = remote.clone();
            for item in local {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            StorageValue::Array(merged)
        }
        _ => buffered.clone(),
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Keys that match [`FIXTURE_PATTERN`].
pub fn arb_cached_key() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}".prop_map(|s| format!("cached-{}", s))
}

/// Keys that never match [`FIXTURE_PATTERN`].
pub fn arb_plain_key() -> impl Strategy<Value = String> {
    "plain-[a-z0-9]{1,8}"
}

/// Either kind of key.
pub fn arb_key() -> impl Strategy<Value = String> {
    prop_oneof![arb_cached_key(), arb_plain_key()]
}

/// Arbitrary JSON values of bounded depth, including any finite float.
pub fn arb_value() -> impl Strategy<Value = StorageValue> {
    let leaf = prop_oneof![
        Just(StorageValue::Null),
        any::<bool>().prop_map(StorageValue::from),
        any::<i64>().prop_map(StorageValue::from),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(StorageValue::from),
        "[ -~]{0,16}".prop_map(StorageValue::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(StorageValue::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| StorageValue::Object(m.into_iter().collect())),
        ]
    })
}

/// Well-formed patterns: exact keys or prefixes with a trailing wildcard.
pub fn arb_pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z-]{0,6}".prop_map(|p| format!("{}*", p)),
        "[a-z-]{1,6}",
    ]
}

/// Patterns with a wildcard somewhere other than the end.
pub fn arb_invalid_pattern() -> impl Strategy<Value = String> {
    ("[a-z]{0,4}", "[a-z]{1,4}").prop_map(|(a, b)| format!("{}*{}", a, b))
}
