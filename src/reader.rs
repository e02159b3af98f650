//! Consumer-side cache of read-only segments.
//!
//! A consumer holding a `(name, offset)` locator turns it into bytes with
//! [`ShmReader::read`]. The reader opens each named segment at most once,
//! keeps the mapping cached, and hands out borrow-counted guards;
//! [`gc`](ShmReader::gc) evicts whatever nothing points at anymore.
//!
//! The reader is deliberately single-threaded (`Rc` + `RefCell` keep it
//! `!Send` and `!Sync`); give each consuming thread its own reader or wrap
//! one in external serialization.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::Rc;

use bytemuck::AnyBitPattern;

use crate::error::{Error, Result};
use crate::segment::{Segment, Viewer};

/// A cache entry: one read-only segment mapping.
///
/// The entry's borrow count is its `Rc` strong count minus the cache's own
/// reference; every live [`ReadGuard`] and every handle returned by
/// [`ShmReader::select_shm`] holds one.
pub struct CachedSegment {
    segment: Segment<Viewer>,
}

impl CachedSegment {
    /// The underlying read-only segment.
    pub fn segment(&self) -> &Segment<Viewer> {
        &self.segment
    }
}

impl Deref for CachedSegment {
    type Target = Segment<Viewer>;

    fn deref(&self) -> &Self::Target {
        &self.segment
    }
}

/// A name-keyed cache of accessor segments with borrow counting.
#[derive(Default)]
pub struct ShmReader {
    cache: RefCell<HashMap<String, Rc<CachedSegment>>>,
}

impl ShmReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named segment is currently cached.
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.borrow().contains_key(name)
    }

    /// The cached segment for `name`, opening and inserting it on a miss.
    ///
    /// Opening waits for the object per the accessor policy (bounded poll,
    /// see [`Segment::open`]). The returned handle pins the entry against
    /// [`gc`](Self::gc) until dropped.
    pub fn select_shm(&self, name: &str) -> Result<Rc<CachedSegment>> {
        if let Some(entry) = self.cache.borrow().get(name) {
            return Ok(Rc::clone(entry));
        }

        let segment = Segment::<Viewer>::open(name)?;
        tracing::debug!("reader cached segment `{name}` ({} bytes)", segment.len());
        let entry = Rc::new(CachedSegment { segment });
        self.cache
            .borrow_mut()
            .insert(name.to_owned(), Rc::clone(&entry));
        Ok(entry)
    }

    /// Borrow the `T` at `offset` bytes into the named segment.
    ///
    /// Two successive reads of the same location yield guards pointing at
    /// the same address; the second never opens a second mapping.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectNotInArena`] when `offset + size_of::<T>()` runs past
    /// the segment end; otherwise whatever opening the segment surfaces.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not aligned for `T`: the guard lends out a
    /// reference to the mapped bytes in place.
    pub fn read<T: AnyBitPattern>(&self, name: &str, offset: usize) -> Result<ReadGuard<T>> {
        let entry = self.select_shm(name)?;

        let end = offset
            .checked_add(std::mem::size_of::<T>())
            .ok_or(Error::ObjectNotInArena(offset))?;
        if end > entry.segment.len() {
            return Err(Error::ObjectNotInArena(
                entry.segment.as_ptr() as usize + offset,
            ));
        }
        assert_eq!(
            (entry.segment.as_ptr() as usize + offset) % std::mem::align_of::<T>(),
            0,
            "offset {offset} is not aligned for the requested type"
        );

        // SAFETY: base is non-null and offset stays within the mapping.
        let ptr =
            unsafe { NonNull::new_unchecked(entry.segment.as_ptr().add(offset) as *mut T) };
        Ok(ReadGuard { entry, ptr })
    }

    /// Evict every cache entry with a zero borrow count.
    ///
    /// Returns the number of evicted segments. Pinned entries (live guards
    /// or `select_shm` handles) are kept.
    pub fn gc(&self) -> usize {
        let mut cache = self.cache.borrow_mut();
        let before = cache.len();
        cache.retain(|name, entry| {
            let pinned = Rc::strong_count(entry) > 1;
            if !pinned {
                tracing::debug!("reader evicted segment `{name}`");
            }
            pinned
        });
        before - cache.len()
    }
}

/// A borrow of a `T` living inside a cached segment.
///
/// Dereferences to `&T`. Dropping the guard decrements the entry's borrow
/// count; the mapping itself stays cached until [`ShmReader::gc`] runs with
/// no borrows outstanding.
pub struct ReadGuard<T> {
    entry: Rc<CachedSegment>,
    ptr: NonNull<T>,
}

impl<T> ReadGuard<T> {
    /// The segment this guard points into.
    pub fn segment(&self) -> &Segment<Viewer> {
        &self.entry.segment
    }
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr is in bounds of the pinned mapping; T is
        // AnyBitPattern, so whatever the producer wrote is a valid value.
        unsafe { self.ptr.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::name::generate_name;
    use crate::segment::Owner;

    fn write_bytes(segment: &Segment<Owner>, offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            segment.set_byte(offset + i, b);
        }
    }

    #[test]
    fn test_read_sees_producer_bytes() {
        let seg = Segment::<Owner>::create(generate_name(), 4096).unwrap();
        write_bytes(&seg, 0, &[1, 2, 3, 4]);

        let reader = ShmReader::new();
        let value = reader.read::<[u8; 4]>(seg.name(), 0).unwrap();
        assert_eq!(*value, [1, 2, 3, 4]);
    }

    #[test]
    fn test_second_read_reuses_mapping() {
        let seg = Segment::<Owner>::create(generate_name(), 4096).unwrap();
        seg.set_byte(8, 7);

        let reader = ShmReader::new();
        let a = reader.read::<u8>(seg.name(), 8).unwrap();
        let b = reader.read::<u8>(seg.name(), 8).unwrap();
        assert!(std::ptr::eq(&*a, &*b));
        assert!(Rc::ptr_eq(&a.entry, &b.entry));
    }

    #[test]
    fn test_read_past_end_fails() {
        let seg = Segment::<Owner>::create(generate_name(), 16).unwrap();
        let reader = ShmReader::new();
        assert!(matches!(
            reader.read::<[u8; 32]>(seg.name(), 0),
            Err(Error::ObjectNotInArena(_))
        ));
        assert!(matches!(
            reader.read::<u8>(seg.name(), 16),
            Err(Error::ObjectNotInArena(_))
        ));
    }

    #[test]
    fn test_missing_segment_times_out() {
        let reader = ShmReader::new();
        // Unique name that nothing created; the accessor wait applies.
        let name = generate_name();
        let start = std::time::Instant::now();
        let result = reader.read::<u8>(&name, 0);
        assert!(matches!(result, Err(Error::ObjectNotFoundWithin(_))));
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_gc_keeps_pinned_entries() {
        let seg_a = Segment::<Owner>::create(generate_name(), 4096).unwrap();
        let seg_b = Segment::<Owner>::create(generate_name(), 4096).unwrap();

        let reader = ShmReader::new();
        let guard = reader.read::<u8>(seg_a.name(), 0).unwrap();
        reader.read::<u8>(seg_b.name(), 0).unwrap(); // guard dropped at once

        assert_eq!(reader.gc(), 1);
        assert!(reader.is_cached(seg_a.name()));
        assert!(!reader.is_cached(seg_b.name()));

        drop(guard);
        assert_eq!(reader.gc(), 1);
        assert!(!reader.is_cached(seg_a.name()));
        assert_eq!(reader.gc(), 0);
    }

    #[test]
    fn test_select_shm_pins_like_a_guard() {
        let seg = Segment::<Owner>::create(generate_name(), 4096).unwrap();

        let reader = ShmReader::new();
        let handle = reader.select_shm(seg.name()).unwrap();
        assert_eq!(handle.len(), 4096);
        assert_eq!(reader.gc(), 0);

        drop(handle);
        assert_eq!(reader.gc(), 1);
    }
}
