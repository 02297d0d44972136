use std::hash::{BuildHasher, Hasher};

use rand::seq::SliceRandom;
use rand::SeedableRng;

use tagmap::{MapError, TagMap};

/// Hashes a key to itself so bucket placement is predictable.
#[derive(Clone, Default)]
struct IdentityHash;

struct IdentityHasher(u64);

impl BuildHasher for IdentityHash {
    type Hasher = IdentityHasher;

    fn build_hasher(&self) -> IdentityHasher {
        IdentityHasher(0)
    }
}

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u64::from(b);
        }
    }
    fn write_u64(&mut self, i: u64) {
        self.0 = i;
    }
}

#[test]
fn growth_staircase() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    assert_eq!(map.capacity(), 0);

    map.add(1, 1).unwrap();
    // The first insert allocates the smallest table, which holds 3 entries.
    assert_eq!(map.capacity(), 3);
    map.add(2, 2).unwrap();
    map.add(3, 3).unwrap();
    assert_eq!(map.capacity(), 3);

    // The fourth insert grows to 8 buckets, which hold 7 entries.
    map.add(4, 4).unwrap();
    assert_eq!(map.capacity(), 7);
    assert_eq!(map.len(), 4);
    for k in 1..=4u64 {
        assert_eq!(*map.get(&k).unwrap(), k);
    }
}

#[test]
fn tombstone_insert_does_not_grow() {
    let mut map: TagMap<u64, u64, IdentityHash> =
        TagMap::with_capacity_and_hasher(7, IdentityHash);
    assert_eq!(map.capacity(), 7);
    for k in 1..=7u64 {
        map.add(k, k * 10).unwrap();
    }
    assert_eq!(map.len(), 7);

    map.remove(&4).unwrap();
    // Key 11 probes to slot 3 first and the freed slot 4 is right behind it,
    // so the insert reuses it without growing the table.
    map.add(11, 110).unwrap();

    assert_eq!(map.len(), 7);
    assert_eq!(map.capacity(), 7);
    for k in (1..=7u64).filter(|k| *k != 4) {
        assert_eq!(*map.get(&k).unwrap(), k * 10);
    }
    assert_eq!(*map.get(&11).unwrap(), 110);
    assert!(!map.contains_key(&4));
}

#[test]
fn duplicate_rejection_preserves_the_value() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    map.add(5, 50).unwrap();
    assert_eq!(map.add(5, 51), Err(MapError::DuplicateKey));
    assert_eq!(*map.get(&5).unwrap(), 50);
}

#[test]
fn scan_tolerates_erasure() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    for k in 1..=16u64 {
        map.add(k, k).unwrap();
    }

    let mut scan = map.scan();
    // A pure erasure does not invalidate the cursor; the erased key simply
    // never shows up.
    map.remove(&8).unwrap();

    let mut seen = Vec::new();
    while let Some((k, _)) = scan.next(&map).unwrap() {
        seen.push(*k);
    }
    seen.sort();
    assert_eq!(seen, (1..=16u64).filter(|k| *k != 8).collect::<Vec<_>>());
}

#[test]
fn scan_tolerates_erasure_mid_stream() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    for k in 1..=64u64 {
        map.add(k, k).unwrap();
    }

    let mut scan = map.scan();
    let mut seen = Vec::new();
    // Pull a few entries, then erase one of each kind: one already yielded,
    // one still pending.
    for _ in 0..3 {
        seen.push(*scan.next(&map).unwrap().unwrap().0);
    }
    let yielded = seen[0];
    let pending = (1..=64u64).find(|k| !seen.contains(k)).unwrap();
    map.remove(&pending).unwrap();

    while let Some((k, _)) = scan.next(&map).unwrap() {
        seen.push(*k);
    }
    seen.sort();
    seen.dedup();
    // Every surviving key appears exactly once and the erased one never does.
    assert_eq!(seen.len(), 63);
    assert!(seen.contains(&yielded));
    assert!(!seen.contains(&pending));
}

#[test]
fn scan_detects_inserts() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    for k in 1..=4u64 {
        map.add(k, k).unwrap();
    }

    let mut scan = map.scan();
    assert!(scan.next(&map).unwrap().is_some());

    map.add(99, 99).unwrap();
    assert_eq!(scan.next(&map), Err(MapError::ConcurrentModification));

    // An explicit reset recaptures the versions and starts over.
    scan.reset(&map);
    let mut count = 0;
    while scan.next(&map).unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 5);
}

#[test]
fn scan_detects_overwrites_and_clears() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    map.add(1, 1).unwrap();
    map.add(2, 2).unwrap();

    let mut scan = map.scan();
    map.set(1, 100).unwrap();
    assert_eq!(scan.next(&map), Err(MapError::ConcurrentModification));

    scan.reset(&map);
    map.clear();
    assert_eq!(scan.next(&map), Err(MapError::ConcurrentModification));
}

#[test]
fn scan_on_an_empty_map_ends_immediately() {
    let map: TagMap<u64, u64> = TagMap::new();
    let mut scan = map.scan();
    assert_eq!(scan.next(&map).unwrap(), None);
    assert_eq!(scan.next(&map).unwrap(), None);
}

#[test]
fn trim_to_exact_capacity() {
    let mut map: TagMap<u64, u64> = TagMap::with_capacity(1000);
    assert!(map.capacity() >= 1000);
    for k in 1..=3u64 {
        map.add(k, k).unwrap();
    }

    // Trimming to 3 re-lays the table out at 4 buckets, which hold exactly 3.
    assert_eq!(map.trim_excess(3).unwrap(), 3);
    assert_eq!(map.len(), 3);
    assert_eq!(map.capacity(), 3);
    for k in 1..=3u64 {
        assert_eq!(*map.get(&k).unwrap(), k);
    }

    // Trimming below the live count is rejected without touching the table.
    assert!(matches!(
        map.trim_excess(2),
        Err(MapError::InvalidOperation(_))
    ));
    assert_eq!(map.len(), 3);

    // The trimmed table grows again on the next insert.
    map.add(4, 4).unwrap();
    assert_eq!(map.capacity(), 7);
}

#[test]
fn trim_to_zero_releases_the_storage() {
    let mut map: TagMap<u64, u64> = TagMap::with_capacity(100);
    map.add(1, 1).unwrap();
    map.remove(&1);

    assert_eq!(map.trim_excess(0).unwrap(), 0);
    assert_eq!(map.capacity(), 0);
    assert_eq!(map.len(), 0);

    // Writes grow the empty singleton again.
    map.add(2, 2).unwrap();
    assert_eq!(*map.get(&2).unwrap(), 2);
}

#[test]
fn ensure_capacity_grows_once() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    let capacity = map.ensure_capacity(100).unwrap();
    assert!(capacity >= 100);

    for k in 0..100u64 {
        map.add(k, k).unwrap();
    }
    // No further growth was needed while filling up to the reserved capacity.
    assert_eq!(map.capacity(), capacity);

    // A second call with a smaller requirement is a no-op.
    assert_eq!(map.ensure_capacity(10).unwrap(), capacity);
}

#[test]
fn ensure_capacity_overflow_is_detected_before_allocating() {
    let mut map: TagMap<u64, u64> = TagMap::new();
    map.add(1, 1).unwrap();
    assert_eq!(
        map.ensure_capacity(0x3800_0000),
        Err(MapError::CapacityOverflow)
    );
    // The failed request left the map untouched.
    assert_eq!(map.len(), 1);
    assert_eq!(*map.get(&1).unwrap(), 1);
}

#[test]
fn add_remove_interleaved_with_reserves() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut map: TagMap<u64, u64> = TagMap::new();
    let mut keys: Vec<u64> = (0..512).collect();

    keys.shuffle(&mut rng);
    for (i, k) in keys.iter().enumerate() {
        map.add(*k, k * 2).unwrap();
        if i % 64 == 0 {
            map.ensure_capacity(i + 32).unwrap();
        }
    }
    assert_eq!(map.len(), 512);
    for k in keys.iter() {
        assert_eq!(*map.get(k).unwrap(), k * 2);
    }

    keys.shuffle(&mut rng);
    for k in keys.iter() {
        assert_eq!(map.remove(k), Some(k * 2));
    }
    assert_eq!(map.len(), 0);

    // The drained table is fully reusable.
    for k in keys.iter() {
        map.add(*k, *k).unwrap();
    }
    assert_eq!(map.len(), 512);
}

#[test]
fn removal_order_does_not_matter() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    for _round in 0..8 {
        let mut map: TagMap<u64, u64, IdentityHash> =
            TagMap::with_capacity_and_hasher(28, IdentityHash);
        let mut keys: Vec<u64> = (0..28).collect();
        for k in keys.iter() {
            map.add(*k, *k).unwrap();
        }
        keys.shuffle(&mut rng);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.remove(k), Some(*k));
            assert_eq!(map.len(), 28 - i - 1);
        }
        assert!(map.is_empty());
    }
}

#[test]
fn dense_identity_keys_probe_across_groups() {
    // Saturate a 32-bucket table so lookups have to walk tombstones and
    // wrapped probe windows.
    let mut map: TagMap<u64, u64, IdentityHash> =
        TagMap::with_capacity_and_hasher(28, IdentityHash);
    for k in 0..28u64 {
        // All keys collide onto the first group origin.
        map.add(k * 32, k).unwrap();
    }
    assert_eq!(map.len(), 28);
    for k in 0..28u64 {
        assert_eq!(*map.get(&(k * 32)).unwrap(), k);
    }
    for k in 0..14u64 {
        assert_eq!(map.remove(&(k * 32)), Some(k));
    }
    for k in 14..28u64 {
        assert_eq!(*map.get(&(k * 32)).unwrap(), k);
    }
}
