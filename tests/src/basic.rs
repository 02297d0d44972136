use tagmap::{MapError, TagMap};

#[test]
fn add_and_get() {
    let mut map: TagMap<u64, String> = TagMap::new();
    map.add(1, "one".to_string()).unwrap();
    map.add(2, "two".to_string()).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&1).unwrap(), "one");
    assert_eq!(map.get(&3), Err(MapError::KeyNotFound));
    assert_eq!(map.try_get(&2).map(String::as_str), Some("two"));
    assert!(map.try_get(&3).is_none());
}

#[test]
fn duplicate_add_is_rejected() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    map.add(5, 50).unwrap();
    assert_eq!(map.add(5, 51), Err(MapError::DuplicateKey));
    // the stored value is untouched by the failed insert
    assert_eq!(*map.get(&5).unwrap(), 50);
    assert_eq!(map.len(), 1);
}

#[test]
fn try_add_reports_presence() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    assert!(map.try_add(1, 10).unwrap());
    assert!(!map.try_add(1, 11).unwrap());
    assert_eq!(*map.get(&1).unwrap(), 10);
}

#[test]
fn set_overwrites_and_returns_previous() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    assert_eq!(map.set(1, 10).unwrap(), None);
    assert_eq!(map.set(1, 20).unwrap(), Some(10));
    assert_eq!(*map.get(&1).unwrap(), 20);
    assert_eq!(map.len(), 1);
}

#[test]
fn get_mut_updates_in_place() {
    let mut map: TagMap<String, u64> = TagMap::new();
    map.add("counter".to_string(), 1).unwrap();
    *map.get_mut("counter").unwrap() += 10;
    assert_eq!(*map.get("counter").unwrap(), 11);
}

#[test]
fn borrowed_key_lookups() {
    let mut map: TagMap<String, u64> = TagMap::new();
    map.add("alpha".to_string(), 1).unwrap();
    assert!(map.contains_key("alpha"));
    assert!(!map.contains_key("beta"));
    assert_eq!(map.remove("alpha"), Some(1));
    assert_eq!(map.remove("alpha"), None);
}

#[test]
fn contains_value_walks_the_table() {
    let mut map: TagMap<u64, String> = TagMap::new();
    for k in 0..32u64 {
        map.add(k, format!("value-{}", k)).unwrap();
    }
    assert!(map.contains_value(&"value-7".to_string()));
    assert!(!map.contains_value(&"value-99".to_string()));
}

#[test]
fn remove_returns_the_value() {
    let mut map: TagMap<u64, String> = TagMap::new();
    map.add(1, "one".to_string()).unwrap();
    assert_eq!(map.remove(&1), Some("one".to_string()));
    assert!(map.is_empty());
    assert!(!map.contains_key(&1));
}

#[test]
fn iteration_yields_every_entry() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    for k in 0..100u64 {
        map.add(k, k * 2).unwrap();
    }
    let mut keys: Vec<u64> = map.iter().map(|(k, _)| *k).collect();
    keys.sort();
    assert_eq!(keys, (0..100u64).collect::<Vec<_>>());
    for (k, v) in &map {
        assert_eq!(*v, *k * 2);
    }
    assert_eq!(map.iter().len(), 100);
}

#[test]
fn clear_keeps_the_storage() {
    let mut map: TagMap<u64, u64> = TagMap::with_capacity(64);
    for k in 0..50u64 {
        map.add(k, k).unwrap();
    }
    let capacity = map.capacity();
    map.clear();
    assert_eq!(map.len(), 0);
    assert_eq!(map.capacity(), capacity);
    for k in 0..50u64 {
        assert!(!map.contains_key(&k));
    }
    // the cleared table behaves like a fresh one of the same capacity
    for k in 0..50u64 {
        map.add(k, k + 1).unwrap();
    }
    assert_eq!(*map.get(&10).unwrap(), 11);
    assert_eq!(map.capacity(), capacity);
}

#[test]
fn clone_is_independent() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    for k in 0..32u64 {
        map.add(k, k).unwrap();
    }
    map.remove(&7);

    let snapshot = map.clone();
    assert_eq!(snapshot.len(), map.len());
    for (k, v) in map.iter() {
        assert_eq!(snapshot.try_get(k), Some(v));
    }

    map.add(100, 100).unwrap();
    assert!(snapshot.try_get(&100).is_none());
    assert_eq!(snapshot.len(), 31);
}

#[test]
fn zero_capacity_map_allocates_nothing() {
    let mut map: TagMap<u64, u64> = TagMap::with_capacity(0);
    assert_eq!(map.capacity(), 0);
    assert!(map.try_get(&1).is_none());
    assert!(map.remove(&1).is_none());
    assert_eq!(map.iter().count(), 0);
    map.add(1, 1).unwrap();
    assert_eq!(*map.get(&1).unwrap(), 1);
}

#[test]
fn drops_run_for_owned_values() {
    use std::rc::Rc;

    let value = Rc::new(());
    let mut map: TagMap<u64, Rc<()>> = TagMap::new();
    for k in 0..16u64 {
        map.add(k, value.clone()).unwrap();
    }
    assert_eq!(Rc::strong_count(&value), 17);
    map.remove(&3);
    assert_eq!(Rc::strong_count(&value), 16);
    map.clear();
    assert_eq!(Rc::strong_count(&value), 1);
    for k in 0..16u64 {
        map.add(k, value.clone()).unwrap();
    }
    drop(map);
    assert_eq!(Rc::strong_count(&value), 1);
}
