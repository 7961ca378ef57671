//! Tests for MvMap
//!
//! These tests verify:
//! - Basic put/get/remove semantics
//! - Conditional writes (put_if_absent, replace, replace_if, remove_if)
//! - Custom decisions through operate
//! - Navigation (first/last, higher/ceiling/floor/lower, key_at, key_index)
//! - Page splits keep the tree valid
//! - clear, append and trim_last
//! - Typed reopening of maps

use atlasmv::{
    BytesType, Config, Decision, DecisionMaker, LongType, MvMap, MvStore, StringType,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> MvStore {
    let config = Config::builder()
        .auto_commit_disabled()
        .keys_per_page(8)
        .build();
    MvStore::open(config).unwrap()
}

fn filled_map(store: &MvStore, count: u64) -> MvMap<LongType, StringType> {
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    for i in 0..count {
        map.put(i * 10, format!("value{}", i)).unwrap();
    }
    map
}

// =============================================================================
// Put / Get / Remove Tests
// =============================================================================

#[test]
fn test_put_and_get() {
    let store = setup_temp_store();
    let map = store.open_map::<StringType, StringType>("users").unwrap();

    assert_eq!(map.put("alice".into(), "admin".into()).unwrap(), None);
    assert_eq!(map.get(&"alice".to_string()).unwrap(), Some("admin".to_string()));
    assert_eq!(map.get(&"bob".to_string()).unwrap(), None);
    assert_eq!(map.size(), 1);
}

#[test]
fn test_put_returns_previous_value() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    assert_eq!(map.put(1, 100).unwrap(), None);
    assert_eq!(map.put(1, 200).unwrap(), Some(100));
    assert_eq!(map.get(&1).unwrap(), Some(200));
    assert_eq!(map.size(), 1);
}

#[test]
fn test_remove() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 100).unwrap();
    map.put(2, 200).unwrap();

    assert_eq!(map.remove(&1).unwrap(), Some(100));
    assert_eq!(map.remove(&1).unwrap(), None);
    assert!(!map.contains_key(&1).unwrap());
    assert!(map.contains_key(&2).unwrap());
    assert_eq!(map.size(), 1);
}

#[test]
fn test_remove_missing_key_on_empty_map() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    assert_eq!(map.remove(&42).unwrap(), None);
    assert!(map.is_empty());
}

// =============================================================================
// Conditional Write Tests
// =============================================================================

#[test]
fn test_put_if_absent() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, StringType>("data").unwrap();

    assert_eq!(map.put_if_absent(1, "first".into()).unwrap(), None);
    assert_eq!(map.put_if_absent(1, "second".into()).unwrap(), Some("first".to_string()));
    assert_eq!(map.get(&1).unwrap(), Some("first".to_string()));
}

#[test]
fn test_replace_only_when_present() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, StringType>("data").unwrap();

    assert_eq!(map.replace(1, "x".into()).unwrap(), None);
    assert!(!map.contains_key(&1).unwrap());

    map.put(1, "a".into()).unwrap();
    assert_eq!(map.replace(1, "b".into()).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&1).unwrap(), Some("b".to_string()));
}

#[test]
fn test_replace_if_and_remove_if() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 10).unwrap();

    assert!(!map.replace_if(1, 99, 20).unwrap());
    assert_eq!(map.get(&1).unwrap(), Some(10));
    assert!(map.replace_if(1, 10, 20).unwrap());
    assert_eq!(map.get(&1).unwrap(), Some(20));

    assert!(!map.remove_if(1, 10).unwrap());
    assert!(map.remove_if(1, 20).unwrap());
    assert_eq!(map.get(&1).unwrap(), None);
}

/// Adds the provided value to the existing one
struct Add;

impl DecisionMaker<LongType, LongType> for Add {
    fn decide(&mut self, _existing: Option<&u64>, _provided: Option<&u64>) -> Decision {
        Decision::Put
    }

    fn select_value(&mut self, existing: Option<&u64>, provided: Option<u64>) -> Option<u64> {
        Some(existing.copied().unwrap_or(0) + provided.unwrap_or(0))
    }
}

#[test]
fn test_operate_with_custom_decision() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("counters").unwrap();

    for _ in 0..5 {
        map.operate(7, Some(3), &mut Add).unwrap();
    }
    assert_eq!(map.get(&7).unwrap(), Some(15));
}

// =============================================================================
// Navigation Tests
// =============================================================================

#[test]
fn test_first_and_last_key() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.first_key().unwrap(), None);
    assert_eq!(map.last_key().unwrap(), None);

    let map = filled_map(&store, 100);
    assert_eq!(map.first_key().unwrap(), Some(0));
    assert_eq!(map.last_key().unwrap(), Some(990));
}

#[test]
fn test_neighbour_keys() {
    let store = setup_temp_store();
    let map = filled_map(&store, 100);

    assert_eq!(map.higher_key(&50).unwrap(), Some(60));
    assert_eq!(map.higher_key(&55).unwrap(), Some(60));
    assert_eq!(map.ceiling_key(&50).unwrap(), Some(50));
    assert_eq!(map.ceiling_key(&55).unwrap(), Some(60));
    assert_eq!(map.floor_key(&50).unwrap(), Some(50));
    assert_eq!(map.floor_key(&55).unwrap(), Some(50));
    assert_eq!(map.lower_key(&50).unwrap(), Some(40));
    assert_eq!(map.lower_key(&55).unwrap(), Some(50));

    assert_eq!(map.higher_key(&990).unwrap(), None);
    assert_eq!(map.lower_key(&0).unwrap(), None);
    assert_eq!(map.ceiling_key(&991).unwrap(), None);
}

#[test]
fn test_key_at_and_key_index() {
    let store = setup_temp_store();
    let map = filled_map(&store, 100);

    for i in 0..100u64 {
        assert_eq!(map.key_at(i as i64).unwrap(), Some(i * 10));
        assert_eq!(map.key_index(&(i * 10)).unwrap(), i as i64);
    }
    assert_eq!(map.key_at(100).unwrap(), None);
    assert_eq!(map.key_at(-1).unwrap(), None);

    // absent keys report -(insertion point) - 1
    assert_eq!(map.key_index(&5).unwrap(), -2);
    assert_eq!(map.key_index(&10_000).unwrap(), -101);
}

// =============================================================================
// Tree Shape Tests
// =============================================================================

#[test]
fn test_many_entries_split_pages() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    // reverse order exercises splits at the left edge
    for i in (0..2000u64).rev() {
        map.put(i, i * 2).unwrap();
    }
    assert_eq!(map.size(), 2000);
    assert_eq!(map.validate_tree().unwrap(), 2000);
    assert!(!map.root_page().unwrap().is_leaf());

    for i in 0..2000u64 {
        assert_eq!(map.get(&i).unwrap(), Some(i * 2));
    }
}

#[test]
fn test_removing_everything_leaves_empty_tree() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    for i in 0..500u64 {
        map.put(i, i).unwrap();
    }
    for i in 0..500u64 {
        assert_eq!(map.remove(&i).unwrap(), Some(i));
    }

    assert!(map.is_empty());
    assert_eq!(map.validate_tree().unwrap(), 0);
    assert_eq!(map.first_key().unwrap(), None);
}

#[test]
fn test_clear() {
    let store = setup_temp_store();
    let map = filled_map(&store, 300);

    let before = map.clear().unwrap();
    assert_eq!(before.total_count(), 300);
    assert!(map.is_empty());
    assert_eq!(map.get(&10).unwrap(), None);

    map.put(1, "again".into()).unwrap();
    assert_eq!(map.size(), 1);
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_map_buffers_and_flushes() {
    let store = setup_temp_store();
    let map = store.open_append_map::<LongType, LongType>("log").unwrap();
    assert!(map.is_single_writer());

    for i in 0..100u64 {
        map.append(i, i + 1).unwrap();
    }
    assert_eq!(map.size(), 100);
    assert_eq!(map.get(&42).unwrap(), Some(43));
    assert_eq!(map.last_key().unwrap(), Some(99));
    assert_eq!(map.validate_tree().unwrap(), 100);
}

#[test]
fn test_append_rejects_keys_out_of_order() {
    let store = setup_temp_store();
    let map = store.open_append_map::<LongType, LongType>("log").unwrap();
    map.append(10, 1).unwrap();

    assert!(map.append(5, 2).is_err());
    assert!(map.append(10, 3).is_err());
    assert_eq!(map.size(), 1);
}

#[test]
fn test_trim_last() {
    let store = setup_temp_store();
    let map = store.open_append_map::<LongType, LongType>("log").unwrap();
    for i in 0..3u64 {
        map.append(i, i).unwrap();
    }

    map.trim_last().unwrap();
    assert_eq!(map.size(), 2);
    assert_eq!(map.last_key().unwrap(), Some(1));

    // trimming after a flush removes from the tree
    assert_eq!(map.get(&0).unwrap(), Some(0));
    map.trim_last().unwrap();
    assert_eq!(map.last_key().unwrap(), Some(0));
}

// =============================================================================
// Opening Tests
// =============================================================================

#[test]
fn test_reopening_map_returns_same_data() {
    let store = setup_temp_store();
    let first = store.open_map::<LongType, LongType>("data").unwrap();
    first.put(1, 1).unwrap();

    let second = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(second.id(), first.id());
    assert_eq!(second.get(&1).unwrap(), Some(1));
    assert_eq!(second.name(), Some("data".to_string()));
}

#[test]
fn test_reopening_with_other_types_fails() {
    let store = setup_temp_store();
    store.open_map::<LongType, LongType>("data").unwrap();

    assert!(store.open_map::<StringType, BytesType>("data").is_err());
    assert!(store.open_append_map::<LongType, LongType>("data").is_err());
}

#[test]
fn test_map_ids_are_distinct() {
    let store = setup_temp_store();
    let a = store.open_map::<LongType, LongType>("a").unwrap();
    let b = store.open_map::<LongType, LongType>("b").unwrap();

    assert_ne!(a.id(), b.id());
    assert!(a.id() >= atlasmv::store::MIN_USER_MAP_ID);
    assert_eq!(store.map_names().unwrap(), vec!["a".to_string(), "b".to_string()]);
}
