//! Scenarios with several tabs sharing one table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use tabkv_test_utils::*;

fn collect_events(storage: &dyn Storage) -> (Arc<Mutex<Vec<ChangeEvent>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = storage
        .on_external_change(Arc::new(move |e: &ChangeEvent| {
            sink.lock().unwrap().push(e.clone())
        }))
        .unwrap();
    (seen, sub)
}

#[test]
fn test_write_notifies_other_tabs_only() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let (seen_by_a, sub_a) = collect_events(&fixture.tab(0).facade);
    let (seen_by_b, sub_b) = collect_events(&fixture.tab(1).facade);

    fixture.tab(0).facade.set("plain-x", Some(json!("v"))).unwrap();

    assert!(seen_by_a.lock().unwrap().is_empty());
    assert_eq!(
        *seen_by_b.lock().unwrap(),
        vec![ChangeEvent {
            key: "plain-x".to_string(),
            value: Some(json!("v")),
            previous_value: None,
        }]
    );
    sub_a.unsubscribe();
    sub_b.unsubscribe();
}

#[test]
fn test_buffered_value_is_private_until_flushed() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let a = fixture.tab(0);
    let b = fixture.tab(1);

    a.cache.set("cached-count", Some(json!(1))).unwrap();
    assert_eq!(a.cache.get("cached-count").unwrap(), Some(json!(1)));
    assert_eq!(b.cache.get("cached-count").unwrap(), None);

    fixture.timer.advance(FIXTURE_FLUSH_DELAY);
    assert_eq!(b.cache.get("cached-count").unwrap(), Some(json!(1)));
    assert_eq!(fixture.root.get("cached-count").unwrap(), Some(json!(1)));
}

#[test]
fn test_external_write_discards_buffered_value_without_merge() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let a = fixture.tab(0);
    let b = fixture.tab(1);

    a.cache.set("cached-title", Some(json!("mine"))).unwrap();
    b.facade.set("cached-title", Some(json!("theirs"))).unwrap();

    assert!(a.cache.buffered_keys().is_empty());
    assert_eq!(a.cache.get("cached-title").unwrap(), Some(json!("theirs")));
    assert_eq!(
        a.sink.resolutions(),
        vec![("cached-title".to_string(), ReconcileResolution::Discarded)]
    );

    // Nothing left to overwrite the external value later.
    fixture.timer.advance(FIXTURE_FLUSH_DELAY * 2);
    assert_eq!(fixture.root.get("cached-title").unwrap(), Some(json!("theirs")));
}

#[test]
fn test_external_delete_discards_buffered_value() {
    let fixture = MultiTabFixture::with_merge(2, union_merge).unwrap();
    let a = fixture.tab(0);
    let b = fixture.tab(1);

    b.facade.set("cached-list", Some(json!([1]))).unwrap();
    a.cache.set("cached-list", Some(json!([1, 2]))).unwrap();
    b.facade.delete("cached-list").unwrap();

    assert!(!a.cache.has("cached-list").unwrap());
    assert_eq!(
        a.sink.resolutions(),
        vec![("cached-list".to_string(), ReconcileResolution::Deleted)]
    );
}

#[test]
fn test_merge_is_durable_before_external_write_returns() {
    let fixture = MultiTabFixture::with_merge(2, union_merge).unwrap();
    let a = fixture.tab(0);
    let b = fixture.tab(1);

    b.cache.set("cached-tags", Some(json!(["b"]))).unwrap();
    a.facade.set("cached-tags", Some(json!(["a"]))).unwrap();

    assert_eq!(fixture.root.get("cached-tags").unwrap(), Some(json!(["a", "b"])));
    assert!(b.cache.buffered_keys().is_empty());
    assert!(!b.cache.is_flush_armed());
    assert_eq!(
        b.sink.resolutions(),
        vec![("cached-tags".to_string(), ReconcileResolution::Merged)]
    );
}

#[test]
fn test_merge_during_flush_keeps_every_buffered_value() {
    let fixture = MultiTabFixture::with_merge(2, union_merge).unwrap();
    let a = fixture.tab(0);
    let b = fixture.tab(1);

    a.cache.set("cached-k1", Some(json!(["a1"]))).unwrap();
    a.cache.set("cached-k2", Some(json!(["a2"]))).unwrap();
    b.cache.set("cached-k1", Some(json!(["b1"]))).unwrap();
    b.cache.set("cached-k2", Some(json!(["b2"]))).unwrap();

    a.cache.flush().unwrap();

    assert_eq!(fixture.root.get("cached-k1").unwrap(), Some(json!(["a1", "b1"])));
    assert_eq!(fixture.root.get("cached-k2").unwrap(), Some(json!(["b2", "a2"])));
    assert!(a.cache.buffered_keys().is_empty());
    assert!(b.cache.buffered_keys().is_empty());
    assert_eq!(
        b.sink.resolutions(),
        vec![("cached-k1".to_string(), ReconcileResolution::Merged)]
    );
    assert_eq!(
        a.sink.resolutions(),
        vec![("cached-k2".to_string(), ReconcileResolution::Merged)]
    );
}

#[test]
fn test_unrelated_external_write_leaves_buffer_alone() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let a = fixture.tab(0);

    a.cache.set("cached-a", Some(json!(1))).unwrap();
    fixture.tab(1).facade.set("cached-b", Some(json!(2))).unwrap();

    assert_eq!(a.cache.buffered_keys(), vec!["cached-a".to_string()]);
    assert!(a.sink.resolutions().is_empty());
}

#[test]
fn test_inactive_tab_writes_through() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let a = fixture.tab(0);

    a.watcher.set_active(false);
    a.cache.set("cached-x", Some(json!("now"))).unwrap();

    assert!(a.cache.buffered_keys().is_empty());
    assert_eq!(fixture.tab(1).facade.get("cached-x").unwrap(), Some(json!("now")));
    assert_eq!(a.sink.names().last(), Some(&"wrote_through"));
}

#[test]
fn test_going_inactive_flushes_buffer() {
    let fixture = MultiTabFixture::new(2).unwrap();
    let a = fixture.tab(0);

    a.cache.set("cached-x", Some(json!(1))).unwrap();
    a.cache.set("cached-y", Some(json!(2))).unwrap();
    a.watcher.set_active(false);

    assert_eq!(fixture.root.keys().unwrap(), vec!["cached-x", "cached-y"]);
    assert!(!a.cache.is_flush_armed());
}

#[test]
fn test_stop_all_flushes_every_tab() {
    let fixture = MultiTabFixture::new(3).unwrap();
    for (i, tab) in fixture.tabs.iter().enumerate() {
        tab.cache
            .set(&format!("cached-{}", i), Some(json!(i)))
            .unwrap();
    }
    assert!(fixture.root.is_empty());

    fixture.stop_all().unwrap();
    assert_eq!(fixture.root.len(), 3);
    assert_eq!(fixture.root.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tokio_timer_flushes_after_delay() {
    let root = MemoryStorage::new();
    let facade = root.create_shared_instance("1").unwrap();
    let cache = CachedStorage::builder(facade)
        .flush_delay(Duration::from_millis(200))
        .cache_key(FIXTURE_PATTERN)
        .build()
        .unwrap();
    cache.start().unwrap();

    cache.set("cached-draft", Some(json!("hello"))).unwrap();
    assert!(!root.has("cached-draft").unwrap());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(root.get("cached-draft").unwrap(), Some(json!("hello")));
    assert!(cache.last_flush().is_some());

    cache.stop().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cache_reads_its_own_writes(key in arb_key(), value in arb_value()) {
        let fixture = MultiTabFixture::new(1).unwrap();
        let tab = fixture.tab(0);

        tab.cache.set(&key, Some(value.clone())).unwrap();
        prop_assert_eq!(tab.cache.get(&key).unwrap(), Some(value.clone()));
        prop_assert!(tab.cache.has(&key).unwrap());

        fixture.timer.advance(FIXTURE_FLUSH_DELAY);
        prop_assert_eq!(fixture.root.get(&key).unwrap(), Some(value));

        tab.cache.delete(&key).unwrap();
        prop_assert!(!tab.cache.has(&key).unwrap());
        prop_assert!(!fixture.root.has(&key).unwrap());
    }

    #[test]
    fn prop_last_buffered_write_wins(key in arb_cached_key(), values in prop::collection::vec(arb_value(), 1..6)) {
        let fixture = MultiTabFixture::new(1).unwrap();
        let tab = fixture.tab(0);

        for value in &values {
            tab.cache.set(&key, Some(value.clone())).unwrap();
        }
        prop_assert_eq!(tab.cache.buffered_keys().len(), 1);
        tab.cache.flush().unwrap();
        prop_assert_eq!(fixture.root.get(&key).unwrap(), values.last().cloned());
    }
}
