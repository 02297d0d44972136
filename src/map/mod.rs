// Copyright (c) 2016 Amanieu d'Antras
// SPDX-License-Identifier: MIT

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::error::{MapError, Result};

cfg_if::cfg_if! {
    // Use the SSE2 implementation if possible: it allows us to scan 16 buckets
    // at once instead of 8. We don't bother with AVX since it would require
    // runtime dispatch and wouldn't gain us much anyways: the probability of
    // finding a match drops off drastically after the first few buckets.
    //
    // I attempted an implementation on ARM using NEON instructions, but it
    // turns out that most NEON instructions have multi-cycle latency, which in
    // the end outweighs any gains over the generic implementation.
    if #[cfg(all(
        target_feature = "sse2",
        any(target_arch = "x86", target_arch = "x86_64"),
        not(miri)
    ))] {
        mod sse2;
        use sse2 as imp;
    } else {
        #[path = "generic.rs"]
        mod generic;
        use generic as imp;
    }
}

mod bitmask;
mod scopeguard;
mod table;

use self::table::{RawIter, RawScan, RawTable};

// Set FxHash to default as most keys tend to be small
pub type DefaultHashBuilder = fxhash::FxBuildHasher;

#[inline]
pub(crate) fn make_hash<K: Hash + ?Sized>(hash_builder: &impl BuildHasher, val: &K) -> u64 {
    let mut state = hash_builder.build_hasher();
    val.hash(&mut state);
    state.finish()
}

/// A swiss-table map from keys of type `K` to values of type `V`.
///
/// Slot metadata is kept in a separate array of control bytes which is
/// scanned a SIMD group at a time, so lookups usually touch a single cache
/// line of metadata before the first key comparison.
///
/// The hashing strategy is supplied through the `S` type parameter, which
/// defaults to [`DefaultHashBuilder`].
pub struct TagMap<K, V, S = DefaultHashBuilder> {
    hash_builder: S,
    table: RawTable<(K, V)>,
    // Gates every scan cursor for fail-fast semantics.
    version: u64,
    // Raised by pure erasures only, so scan cursors can shed erased entries
    // without failing.
    tolerant_version: u64,
}

impl<K, V> TagMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map. No memory is allocated until the first insert.
    #[inline]
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Creates an empty map with room for at least `capacity` entries.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> TagMap<K, V, S> {
    /// Creates an empty map which hashes with `hash_builder`.
    #[inline]
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            hash_builder,
            table: RawTable::new(),
            version: 0,
            tolerant_version: 0,
        }
    }

    /// Creates an empty map with room for at least `capacity` entries which
    /// hashes with `hash_builder`.
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            hash_builder,
            table: RawTable::with_capacity(capacity),
            version: 0,
            tolerant_version: 0,
        }
    }

    /// Returns a reference to the map's hashing strategy.
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Returns the number of entries in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of entries the map can hold before it grows.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Removes every entry while keeping the allocated storage.
    pub fn clear(&mut self) {
        self.table.clear();
        self.version += 1;
    }

    /// Returns a borrowing iterator over the entries.
    ///
    /// The map cannot be mutated while the iterator is alive; use [`scan`]
    /// for a cursor that tolerates erasure.
    ///
    /// [`scan`]: #method.scan
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: unsafe { self.table.iter() },
            marker: PhantomData,
        }
    }

    /// Opens a detached scan cursor positioned before the first entry.
    #[inline]
    pub fn scan(&self) -> Scan {
        Scan {
            raw: RawScan::new(),
            ctrl: self.table.ctrl_ptr(),
            version: self.version,
            tolerant_version: self.tolerant_version,
        }
    }
}

impl<K, V, S> TagMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Inserts a new entry, failing if the key is already present.
    pub fn add(&mut self, k: K, v: V) -> Result<()> {
        let hash = make_hash(&self.hash_builder, &k);
        if self.table.find(hash, |x| k.eq(&x.0)).is_some() {
            return Err(MapError::DuplicateKey);
        }
        self.insert_new(hash, k, v)
    }

    /// Inserts a new entry unless the key is already present.
    ///
    /// Returns whether the entry was inserted.
    pub fn try_add(&mut self, k: K, v: V) -> Result<bool> {
        let hash = make_hash(&self.hash_builder, &k);
        if self.table.find(hash, |x| k.eq(&x.0)).is_some() {
            return Ok(false);
        }
        self.insert_new(hash, k, v)?;
        Ok(true)
    }

    /// Inserts an entry, overwriting and returning the previous value if the
    /// key was already present.
    pub fn set(&mut self, k: K, v: V) -> Result<Option<V>> {
        let hash = make_hash(&self.hash_builder, &k);
        if let Some(item) = self.table.find(hash, |x| k.eq(&x.0)) {
            self.version += 1;
            Ok(Some(mem::replace(unsafe { &mut item.as_mut().1 }, v)))
        } else {
            self.insert_new(hash, k, v)?;
            Ok(None)
        }
    }

    #[inline]
    fn insert_new(&mut self, hash: u64, k: K, v: V) -> Result<()> {
        let hash_builder = &self.hash_builder;
        let (_, reused_tombstone) = self
            .table
            .insert(hash, (k, v), |x| make_hash(hash_builder, &x.0))?;
        self.version += 1;
        if reused_tombstone {
            self.tolerant_version += 1;
        }
        Ok(())
    }

    /// Returns the value for `k`, failing if it is absent.
    ///
    /// This is the indexer-read contract; use [`try_get`] for an `Option`.
    ///
    /// [`try_get`]: #method.try_get
    pub fn get<Q: ?Sized>(&self, k: &Q) -> Result<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.try_get(k).ok_or(MapError::KeyNotFound)
    }

    #[inline]
    pub fn try_get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.get_key_value(k).map(|(_, v)| v)
    }

    #[inline]
    pub fn get_key_value<Q: ?Sized>(&self, k: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let hash = make_hash(&self.hash_builder, k);
        self.table
            .find(hash, |x| k.eq(x.0.borrow()))
            .map(|item| unsafe {
                let &(ref key, ref value) = item.as_ref();
                (key, value)
            })
    }

    #[inline]
    pub fn get_mut<Q: ?Sized>(&mut self, k: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let hash = make_hash(&self.hash_builder, k);
        self.table
            .find(hash, |x| k.eq(x.0.borrow()))
            .map(|item| unsafe { &mut item.as_mut().1 })
    }

    #[inline]
    pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.get_key_value(k).is_some()
    }

    /// Returns whether any entry maps to `v`. This walks the whole table.
    pub fn contains_value(&self, v: &V) -> bool
    where
        V: PartialEq,
    {
        self.iter().any(|(_, value)| value == v)
    }

    /// Removes the entry for `k`, returning its value.
    pub fn remove<Q: ?Sized>(&mut self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let hash = make_hash(&self.hash_builder, k);
        let item = self.table.find(hash, |x| k.eq(x.0.borrow()))?;
        unsafe {
            let index = self.table.bucket_index(&item);
            let (_, v) = self.table.remove(index);
            self.tolerant_version += 1;
            Some(v)
        }
    }

    /// Grows the table if it cannot hold `capacity` entries in total.
    ///
    /// Returns the load capacity after the call.
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<usize> {
        if self.table.capacity() < capacity {
            let hash_builder = &self.hash_builder;
            let additional = capacity - self.table.len();
            self.table
                .reserve(additional, |x| make_hash(hash_builder, &x.0))?;
            self.version += 1;
        }
        Ok(self.table.capacity())
    }

    /// Re-lays the table out at the smallest size that holds `capacity`
    /// entries. `capacity` must be at least the current length; trimming to
    /// zero releases the storage entirely.
    ///
    /// Returns the load capacity after the call.
    pub fn trim_excess(&mut self, capacity: usize) -> Result<usize> {
        if capacity < self.table.len() {
            return Err(MapError::InvalidOperation(
                "cannot trim below the number of live entries",
            ));
        }
        if capacity == 0 {
            self.table = RawTable::new();
        } else {
            let hash_builder = &self.hash_builder;
            self.table
                .shrink_to(capacity, |x| make_hash(hash_builder, &x.0))?;
        }
        self.version += 1;
        Ok(self.table.capacity())
    }
}

impl<K, V, S> Default for TagMap<K, V, S>
where
    S: Default,
{
    #[inline]
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Clone for TagMap<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            hash_builder: self.hash_builder.clone(),
            table: self.table.clone(),
            version: self.version,
            tolerant_version: self.tolerant_version,
        }
    }
}

impl<'a, K, V, S> IntoIterator for &'a TagMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

/// Borrowing iterator over the entries of a [`TagMap`].
pub struct Iter<'a, K, V> {
    inner: RawIter<(K, V)>,
    marker: PhantomData<&'a (K, V)>,
}

impl<'a, K, V> Clone for Iter<'a, K, V> {
    #[inline]
    fn clone(&self) -> Self {
        Iter {
            inner: self.inner.clone(),
            marker: PhantomData,
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        self.inner.next().map(|bucket| unsafe {
            let &(ref key, ref value) = bucket.as_ref();
            (key, value)
        })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {}
impl<'a, K, V> FusedIterator for Iter<'a, K, V> {}

/// A detached cursor over the live entries of a [`TagMap`].
///
/// Unlike [`TagMap::iter`], a `Scan` does not borrow the map: every call to
/// [`next`] re-borrows it, so the caller is free to mutate the map between
/// steps. Inserts, overwrites, growth, clears and trims invalidate the cursor
/// and the next step fails with [`MapError::ConcurrentModification`]. Pure
/// erasures do not: an entry erased before the cursor reaches it is simply
/// never yielded.
///
/// A cursor must only be resumed against the map that created it.
///
/// [`next`]: #method.next
pub struct Scan {
    raw: RawScan,
    // Identity of the control allocation the cursor was opened against.
    ctrl: *const u8,
    version: u64,
    tolerant_version: u64,
}

impl Scan {
    /// Advances to the next live entry.
    ///
    /// Returns `Ok(None)` when the scan is exhausted.
    pub fn next<'a, K, V, S>(
        &mut self,
        map: &'a TagMap<K, V, S>,
    ) -> Result<Option<(&'a K, &'a V)>> {
        if self.version != map.version || !ptr::eq(self.ctrl, map.table.ctrl_ptr()) {
            return Err(MapError::ConcurrentModification);
        }
        if self.tolerant_version != map.tolerant_version {
            self.raw.refresh(&map.table);
            self.tolerant_version = map.tolerant_version;
        }
        match self.raw.next(&map.table) {
            Some(index) => unsafe {
                let &(ref key, ref value) = map.table.bucket(index).as_ref();
                Ok(Some((key, value)))
            },
            None => Ok(None),
        }
    }

    /// Restarts the cursor from the first group and recaptures the versions.
    pub fn reset<K, V, S>(&mut self, map: &TagMap<K, V, S>) {
        *self = map.scan();
    }
}
