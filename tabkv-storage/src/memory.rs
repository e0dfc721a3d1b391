//! In-memory storage whose facades share one table.
//!
//! [`MemoryStorage`] stands in for the browser's persistent key/value store:
//! every facade created with [`MemoryStorage::create_shared_instance`] reads
//! and writes the same table, and a write through one facade is reported to
//! the external-change listeners of every other facade.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tabkv_core::{
    record_size, serialize_value, ChangeEvent, FacadeIdentity, StorageError, StorageValue,
    TabKvResult,
};
use tracing::trace;

use crate::bus::ExternalChangeBus;
use crate::{ExternalChangeListener, Storage, Subscription};

/// Options fixed when the shared table is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStorageOptions {
    /// Round-trip every stored value through its text form, like a backend
    /// that only stores strings. Reads then never share structure with
    /// the value that was written.
    pub serialize: bool,
    /// Maximum total record size in bytes. Writes beyond it fail with
    /// [`StorageError::QuotaExceeded`].
    pub quota_bytes: Option<usize>,
}

impl Default for MemoryStorageOptions {
    fn default() -> Self {
        Self {
            serialize: true,
            quota_bytes: None,
        }
    }
}

impl MemoryStorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the serialization round-trip.
    pub fn with_serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    /// Set the byte quota.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Live(StorageValue),
}

#[derive(Debug)]
struct Entry {
    /// Insertion sequence; overwriting a key keeps its position.
    seq: u64,
    value: StoredValue,
    size: usize,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    total_bytes: usize,
}

struct SharedData {
    table: RwLock<Table>,
    bus: Arc<ExternalChangeBus>,
    options: MemoryStorageOptions,
}

/// A storage facade over a table that other facades may share.
///
/// Cloning yields a facade with the same identity; use
/// [`create_shared_instance`](Self::create_shared_instance) for a facade
/// that should see the clone's writes as external changes.
#[derive(Clone)]
pub struct MemoryStorage {
    identity: Option<FacadeIdentity>,
    shared: Arc<SharedData>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new table with default options and an anonymous facade.
    pub fn new() -> Self {
        Self::with_options(MemoryStorageOptions::default())
    }

    /// Create a new table and an anonymous facade over it.
    ///
    /// An anonymous facade never notifies and is never notified.
    pub fn with_options(options: MemoryStorageOptions) -> Self {
        Self {
            identity: None,
            shared: Arc::new(SharedData {
                table: RwLock::new(Table::default()),
                bus: Arc::new(ExternalChangeBus::new()),
                options,
            }),
        }
    }

    /// Create a facade over the same table and listener registry with a
    /// distinct identity.
    pub fn create_shared_instance(&self, identity: &str) -> TabKvResult<MemoryStorage> {
        let identity = FacadeIdentity::new(identity)?;
        Ok(Self {
            identity: Some(identity),
            shared: Arc::clone(&self.shared),
        })
    }

    /// This facade's identity, if any.
    pub fn identity(&self) -> Option<&FacadeIdentity> {
        self.identity.as_ref()
    }

    /// Whether both facades share one table.
    pub fn shares_table_with(&self, other: &MemoryStorage) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn options(&self) -> &MemoryStorageOptions {
        &self.shared.options
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read_table().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of all records in bytes.
    pub fn total_bytes(&self) -> usize {
        self.read_table().map(|t| t.total_bytes).unwrap_or(0)
    }

    /// Number of external-change registrations on the shared table.
    pub fn listener_count(&self) -> usize {
        self.shared.bus.len()
    }

    /// Delete every key, notifying other facades once per key.
    pub fn clear(&self) -> TabKvResult<()> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn read_table(&self) -> TabKvResult<RwLockReadGuard<'_, Table>> {
        self.shared
            .table
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write_table(&self) -> TabKvResult<RwLockWriteGuard<'_, Table>> {
        self.shared
            .table
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn notify(&self, event: ChangeEvent) -> TabKvResult<()> {
        self.shared.bus.notify(self.identity.as_ref(), &event)
    }

    fn store(&self, key: &str, value: StorageValue) -> TabKvResult<()> {
        let previous_value = self.get(key)?;
        let stored = if self.shared.options.serialize {
            StoredValue::Text(serialize_value(&value))
        } else {
            StoredValue::Live(value.clone())
        };
        let size = record_size(key, &value);

        {
            let mut table = self.write_table()?;
            let replaced = table.entries.get(key).map(|e| (e.seq, e.size));
            let old_size = replaced.map(|(_, s)| s).unwrap_or(0);
            let requested = table.total_bytes - old_size + size;
            if let Some(quota) = self.shared.options.quota_bytes {
                if requested > quota {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        requested,
                        quota,
                    }
                    .into());
                }
            }

            let seq = match replaced {
                Some((seq, _)) => seq,
                None => {
                    table.next_seq += 1;
                    table.next_seq
                }
            };
            table.total_bytes = requested;
            table.entries.insert(
                key.to_string(),
                Entry {
                    seq,
                    value: stored,
                    size,
                },
            );
        }

        trace!(key, size, identity = ?self.identity, "memory storage set");
        self.notify(ChangeEvent {
            key: key.to_string(),
            value: Some(value),
            previous_value,
        })
    }
}

impl Storage for MemoryStorage {
    fn has(&self, key: &str) -> TabKvResult<bool> {
        Ok(self.read_table()?.entries.contains_key(key))
    }

    fn get(&self, key: &str) -> TabKvResult<Option<StorageValue>> {
        let stored = match self.read_table()?.entries.get(key) {
            Some(entry) => entry.value.clone(),
            None => return Ok(None),
        };
        match stored {
            StoredValue::Text(text) => Ok(Some(serde_json::from_str(&text)?)),
            StoredValue::Live(value) => Ok(Some(value)),
        }
    }

    fn set(&self, key: &str, value: Option<StorageValue>) -> TabKvResult<()> {
        match value {
            Some(value) => self.store(key, value),
            None => self.delete(key),
        }
    }

    fn delete(&self, key: &str) -> TabKvResult<()> {
        let previous_value = self.get(key)?;
        {
            let mut table = self.write_table()?;
            if let Some(entry) = table.entries.remove(key) {
                table.total_bytes -= entry.size;
            }
        }

        trace!(key, identity = ?self.identity, "memory storage delete");
        self.notify(ChangeEvent {
            key: key.to_string(),
            value: None,
            previous_value,
        })
    }

    fn keys(&self) -> TabKvResult<Vec<String>> {
        let table = self.read_table()?;
        let mut keys: Vec<(&String, u64)> = table.entries.iter().map(|(k, e)| (k, e.seq)).collect();
        keys.sort_by_key(|(_, seq)| *seq);
        Ok(keys.into_iter().map(|(k, _)| k.clone()).collect())
    }

    fn record_size(&self, key: &str) -> TabKvResult<usize> {
        Ok(self
            .read_table()?
            .entries
            .get(key)
            .map(|e| e.size)
            .unwrap_or(0))
    }

    fn on_external_change(&self, listener: ExternalChangeListener) -> TabKvResult<Subscription> {
        self.shared.bus.register(self.identity.clone(), listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tabkv_core::{ConfigError, TabKvError};

    fn recording(storage: &MemoryStorage) -> (Arc<Mutex<Vec<ChangeEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = storage
            .on_external_change(Arc::new(move |e: &ChangeEvent| {
                sink.lock().unwrap().push(e.clone())
            }))
            .unwrap();
        (events, sub)
    }

    // ========================================================================
    // Table Tests
    // ========================================================================

    #[test]
    fn test_set_get_has() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("a").unwrap());
        assert_eq!(storage.get("a").unwrap(), None);

        storage.set("a", Some(json!({"n": 1}))).unwrap();
        assert!(storage.has("a").unwrap());
        assert_eq!(storage.get("a").unwrap(), Some(json!({"n": 1})));
    }

    #[test]
    fn test_set_none_deletes() {
        let storage = MemoryStorage::new();
        storage.set("a", Some(json!(1))).unwrap();
        storage.set("a", None).unwrap();
        assert!(!storage.has("a").unwrap());
        assert_eq!(storage.record_size("a").unwrap(), 0);
    }

    #[test]
    fn test_delete_absent_key_is_fine() {
        let storage = MemoryStorage::new();
        storage.delete("missing").unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_keys_insertion_order() {
        let storage = MemoryStorage::new();
        storage.set("b", Some(json!(1))).unwrap();
        storage.set("a", Some(json!(2))).unwrap();
        storage.set("c", Some(json!(3))).unwrap();
        // overwrite keeps position
        storage.set("b", Some(json!(4))).unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["b", "a", "c"]);

        // re-insertion after delete moves to the end
        storage.delete("b").unwrap();
        storage.set("b", Some(json!(5))).unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_record_size() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.record_size("k").unwrap(), 0);
        storage.set("k", Some(json!("Two"))).unwrap();
        assert_eq!(storage.record_size("k").unwrap(), 2 * (1 + 5));
        assert_eq!(storage.total_bytes(), 12);
    }

    #[test]
    fn test_serialize_roundtrip_on_and_off() {
        let serialized = MemoryStorage::new();
        assert!(serialized.options().serialize);
        serialized.set("v", Some(json!([1, {"a": null}]))).unwrap();
        assert_eq!(serialized.get("v").unwrap(), Some(json!([1, {"a": null}])));

        let live = MemoryStorage::with_options(MemoryStorageOptions::new().with_serialize(false));
        live.set("v", Some(json!({"x": 1.5}))).unwrap();
        assert_eq!(live.get("v").unwrap(), Some(json!({"x": 1.5})));
    }

    #[test]
    fn test_quota_exceeded_leaves_table_unchanged() {
        let storage = MemoryStorage::with_options(MemoryStorageOptions::new().with_quota(20));
        storage.set("k", Some(json!("Two"))).unwrap(); // 12 bytes

        let err = storage.set("big", Some(json!("0123456789"))).unwrap_err();
        assert!(matches!(
            err,
            TabKvError::Storage(StorageError::QuotaExceeded { quota: 20, .. })
        ));
        assert!(!storage.has("big").unwrap());
        assert_eq!(storage.total_bytes(), 12);

        // overwriting accounts for the replaced record
        storage.set("k", Some(json!("Six"))).unwrap();
        assert_eq!(storage.total_bytes(), 12);
    }

    #[test]
    fn test_clear() {
        let storage = MemoryStorage::new();
        storage.set("a", Some(json!(1))).unwrap();
        storage.set("b", Some(json!(2))).unwrap();
        storage.clear().unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.total_bytes(), 0);
    }

    // ========================================================================
    // Shared Instance Tests
    // ========================================================================

    #[test]
    fn test_shared_instances_share_table() {
        let root = MemoryStorage::new();
        let a = root.create_shared_instance("1").unwrap();
        let b = a.create_shared_instance("2").unwrap();

        assert!(a.shares_table_with(&b));
        assert!(root.shares_table_with(&b));
        assert_eq!(b.identity().map(|i| i.as_str()), Some("2"));

        a.set("x", Some(json!("from a"))).unwrap();
        assert_eq!(b.get("x").unwrap(), Some(json!("from a")));
        assert_eq!(root.keys().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_shared_instance_requires_identity() {
        let root = MemoryStorage::new();
        let err = root.create_shared_instance("").err().unwrap();
        assert_eq!(err, TabKvError::Config(ConfigError::MissingIdentity));
    }

    #[test]
    fn test_external_change_reaches_other_identity_only() {
        let root = MemoryStorage::new();
        let a = root.create_shared_instance("1").unwrap();
        let b = root.create_shared_instance("2").unwrap();
        let (a_events, _a_sub) = recording(&a);
        let (b_events, _b_sub) = recording(&b);

        a.set("x", Some(json!("v"))).unwrap();

        assert!(a_events.lock().unwrap().is_empty());
        assert_eq!(
            *b_events.lock().unwrap(),
            vec![ChangeEvent {
                key: "x".to_string(),
                value: Some(json!("v")),
                previous_value: None,
            }]
        );
    }

    #[test]
    fn test_delete_notifies_with_previous_value() {
        let root = MemoryStorage::new();
        let a = root.create_shared_instance("1").unwrap();
        let b = root.create_shared_instance("2").unwrap();
        a.set("x", Some(json!(1))).unwrap();
        let (b_events, _sub) = recording(&b);

        a.delete("x").unwrap();

        let events = b_events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_delete());
        assert_eq!(events[0].previous_value, Some(json!(1)));
    }

    #[test]
    fn test_anonymous_facade_is_invisible_to_bus() {
        let root = MemoryStorage::new();
        let tab = root.create_shared_instance("1").unwrap();
        let (tab_events, _tab_sub) = recording(&tab);
        let (root_events, root_sub) = recording(&root);

        root.set("x", Some(json!(1))).unwrap();
        tab.set("y", Some(json!(2))).unwrap();

        assert!(tab_events.lock().unwrap().is_empty());
        assert!(root_events.lock().unwrap().is_empty());

        assert_eq!(root.listener_count(), 2);
        root_sub.unsubscribe();
        assert_eq!(root.listener_count(), 1);
    }

    #[test]
    fn test_serialized_floats_read_back_exactly() {
        let storage = MemoryStorage::new();
        let floats = [
            1.0715660391465826e-75,
            -1.603964615428183e143,
            0.1,
            f64::MIN_POSITIVE,
            f64::MAX,
        ];
        for (i, f) in floats.iter().enumerate() {
            let key = format!("f{}", i);
            storage.set(&key, Some(json!(f))).unwrap();
            let back = storage.get(&key).unwrap().and_then(|v| v.as_f64());
            assert_eq!(back.map(f64::to_bits), Some(f.to_bits()), "{:e}", f);
        }
    }

    #[test]
    fn test_notification_sees_committed_write() {
        let root = MemoryStorage::new();
        let a = root.create_shared_instance("1").unwrap();
        let b = root.create_shared_instance("2").unwrap();
        let observed = Arc::new(Mutex::new(None));
        let observed_in = Arc::clone(&observed);
        let reader = b.clone();
        let _sub = b
            .on_external_change(Arc::new(move |e: &ChangeEvent| {
                *observed_in.lock().unwrap() = reader.get(&e.key).unwrap();
            }))
            .unwrap();

        a.set("x", Some(json!("committed"))).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(json!("committed")));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_total_bytes_matches_record_sizes(
                ops in prop::collection::vec(("[a-c]{1,2}", prop::option::of(any::<i64>())), 0..24)
            ) {
                let storage = MemoryStorage::new();
                for (key, value) in ops {
                    storage.set(&key, value.map(StorageValue::from)).unwrap();
                }
                let sum: usize = storage
                    .keys()
                    .unwrap()
                    .iter()
                    .map(|k| storage.record_size(k).unwrap())
                    .sum();
                prop_assert_eq!(storage.total_bytes(), sum);
            }
        }
    }
}
