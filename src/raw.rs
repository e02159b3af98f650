//! Raw segment-manufacturing resources with reverse lookup.
//!
//! A raw resource answers every `allocate` by manufacturing a brand-new
//! creator [`Segment`] and indexing it by its mapping base address. The two
//! flavors differ only in the index:
//!
//! - [`OrderedShmResource`] keeps an address-sorted tree, giving O(log N)
//!   [`find_arena`](OrderedShmResource::find_arena) for arbitrary interior
//!   pointers.
//! - [`HashedShmResource`] keeps a hash map plus a last-insertion scalar,
//!   giving O(1) [`last_inserted`](HashedShmResource::last_inserted) and an
//!   O(N) arbitrary-pointer scan.
//!
//! Downstream adapters pick the flavor matching their lookup pattern: the
//! monotonic buffer mostly asks about its freshest segment (hashed), the
//! pool hands out interior pointers of long-lived chunks (ordered).

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::name::generate_name;
use crate::page::{ceil_to_page_size, page_size};
use crate::resource::ShmResource;
use crate::segment::{Owner, Segment};

/// Manufacture one creator segment able to hold `size` bytes at `align`.
///
/// The mapped length is `size` rounded up to a page multiple; the base is
/// page-aligned, which is also why alignments beyond a page are refused.
fn manufacture(size: usize, align: usize) -> Result<Segment<Owner>> {
    if size == 0 {
        return Err(Error::ZeroLength);
    }
    let page = page_size();
    if align > page {
        return Err(Error::TooLargeAlignment {
            requested: align,
            page_size: page,
        });
    }
    debug_assert!(align.is_power_of_two());

    Segment::create(generate_name(), ceil_to_page_size(size))
}

/// Validate that `[addr, addr + len)` sits inside `segment`.
fn span_in_segment(segment: &Segment<Owner>, addr: usize, len: usize) -> bool {
    let base = segment.as_ptr() as usize;
    let end = match addr.checked_add(len.max(1)) {
        Some(end) => end,
        None => return false,
    };
    addr >= base && end <= base + segment.len()
}

/// Address-ordered raw resource: O(log N) reverse lookup.
#[derive(Default)]
pub struct OrderedShmResource {
    segments: BTreeMap<usize, Segment<Owner>>,
}

impl OrderedShmResource {
    /// Create an empty resource owning no segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments currently owned.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether no segments are owned.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read-only view of the owned segments, in address order.
    pub fn resources(&self) -> impl Iterator<Item = &Segment<Owner>> + '_ {
        self.segments.values()
    }

    /// Find the segment whose address range contains `ptr`.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectNotInArena`] when no owned segment contains `ptr`.
    pub fn find_arena(&self, ptr: *const u8) -> Result<&Segment<Owner>> {
        self.find_arena_span(ptr, 1)
    }

    /// Find the segment containing the `len`-byte object at `ptr`.
    ///
    /// The whole span must fit: a pointer whose object would run past the
    /// segment end is treated as outside.
    pub fn find_arena_span(&self, ptr: *const u8, len: usize) -> Result<&Segment<Owner>> {
        let addr = ptr as usize;
        let (_, segment) = self
            .segments
            .range(..=addr)
            .next_back()
            .ok_or(Error::ObjectNotInArena(addr))?;
        if span_in_segment(segment, addr, len) {
            Ok(segment)
        } else {
            Err(Error::ObjectNotInArena(addr))
        }
    }

    /// Drop every owned segment (unmap + unlink).
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
    }
}

impl ShmResource for OrderedShmResource {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let segment = manufacture(size, align)?;
        let ptr = segment.as_non_null();
        tracing::trace!(
            "ordered resource grew by `{}` ({} bytes)",
            segment.name(),
            segment.len()
        );
        self.segments.insert(ptr.as_ptr() as usize, segment);
        Ok(ptr)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let segment = self
            .segments
            .remove(&addr)
            .ok_or(Error::ObjectNotInArena(addr))?;
        debug_assert_eq!(segment.len(), ceil_to_page_size(size));
        tracing::trace!("ordered resource released `{}`", segment.name());
        Ok(())
    }
}

/// Address-hashed raw resource: O(1) last-insert lookup.
#[derive(Default)]
pub struct HashedShmResource {
    segments: HashMap<usize, Segment<Owner>>,
    last: Option<usize>,
}

impl HashedShmResource {
    /// Create an empty resource owning no segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments currently owned.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether no segments are owned.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read-only view of the owned segments, in no particular order.
    pub fn resources(&self) -> impl Iterator<Item = &Segment<Owner>> + '_ {
        self.segments.values()
    }

    /// The most recently manufactured segment, if any survives.
    ///
    /// This is the common case for a producer that just allocated and wants
    /// the containing segment's name and offset.
    pub fn last_inserted(&self) -> Option<&Segment<Owner>> {
        self.last.and_then(|addr| self.segments.get(&addr))
    }

    /// Find the segment whose address range contains `ptr`.
    ///
    /// Linear scan over the owned set; the ordered flavor answers the same
    /// question in O(log N).
    pub fn find_arena(&self, ptr: *const u8) -> Result<&Segment<Owner>> {
        self.find_arena_span(ptr, 1)
    }

    /// Find the segment containing the `len`-byte object at `ptr`.
    pub fn find_arena_span(&self, ptr: *const u8, len: usize) -> Result<&Segment<Owner>> {
        let addr = ptr as usize;
        self.segments
            .values()
            .find(|segment| span_in_segment(segment, addr, len))
            .ok_or(Error::ObjectNotInArena(addr))
    }

    /// Drop every owned segment (unmap + unlink).
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.last = None;
    }
}

impl ShmResource for HashedShmResource {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let segment = manufacture(size, align)?;
        let ptr = segment.as_non_null();
        tracing::trace!(
            "hashed resource grew by `{}` ({} bytes)",
            segment.name(),
            segment.len()
        );
        let addr = ptr.as_ptr() as usize;
        self.segments.insert(addr, segment);
        self.last = Some(addr);
        Ok(ptr)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let segment = self
            .segments
            .remove(&addr)
            .ok_or(Error::ObjectNotInArena(addr))?;
        debug_assert_eq!(segment.len(), ceil_to_page_size(size));
        if self.last == Some(addr) {
            self.last = None;
        }
        tracing::trace!("hashed resource released `{}`", segment.name());
        Ok(())
    }
}

impl From<HashedShmResource> for OrderedShmResource {
    /// Re-index every segment by address order, moving the mappings as-is.
    fn from(hashed: HashedShmResource) -> Self {
        Self {
            segments: hashed.segments.into_iter().collect(),
        }
    }
}
