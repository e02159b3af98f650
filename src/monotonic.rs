//! Monotonic bump allocator over lazily-fetched segments.
//!
//! [`MonotonicShmBuffer`] carves sub-allocations out of a single active
//! segment with one forward-moving cursor. When the tail cannot hold the
//! request, it fetches a fresh segment from its owned upstream
//! [`HashedShmResource`], doubling the requested size each time.
//! Individual deallocation does not exist: the producer picks this adapter
//! when every message in a batch dies together, and
//! [`release`](MonotonicShmBuffer::release) drops the whole set at once.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::page::{ceil_to_page_size, page_size};
use crate::raw::HashedShmResource;
use crate::resource::ShmResource;

/// Cursor over the segment currently being carved.
struct ActiveSegment {
    base: usize,
    len: usize,
    used: usize,
}

/// A monotonic buffer resource over shared-memory segments.
///
/// # Example
///
/// ```rust,ignore
/// use shmbus::monotonic::MonotonicShmBuffer;
///
/// let mut buf = MonotonicShmBuffer::new(1);
/// let msg = buf.allocate(100, 1)?;
/// let segment = buf.upstream().find_arena(msg.as_ptr())?;
/// let locator = segment.locator(segment.offset_of(msg.as_ptr()).unwrap())?;
/// ```
pub struct MonotonicShmBuffer {
    upstream: HashedShmResource,
    /// First upstream request size, page-rounded; `release` restores it.
    initial_size: usize,
    next_size: usize,
    active: Option<ActiveSegment>,
}

impl MonotonicShmBuffer {
    /// Create a buffer whose first upstream request is `initial_size`
    /// bytes, rounded up to a page multiple (so a minimum of one page).
    pub fn new(initial_size: usize) -> Self {
        let initial_size = ceil_to_page_size(initial_size.max(1));
        Self {
            upstream: HashedShmResource::new(),
            initial_size,
            next_size: initial_size,
            active: None,
        }
    }

    /// The upstream resource owning every segment this buffer carved.
    ///
    /// Useful for reverse lookup: `upstream().find_arena(ptr)` names the
    /// segment containing an allocation, and
    /// `upstream().last_inserted()` is the freshest one.
    pub fn upstream(&self) -> &HashedShmResource {
        &self.upstream
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Carves from the active segment when the aligned tail fits,
    /// otherwise fetches `max(next_size, size)` bytes upstream and retries.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroLength`] for `size == 0`;
    /// [`Error::TooLargeAlignment`] for `align > page_size()` (the upstream
    /// error, surfaced without retry).
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
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

        if let Some(ptr) = self.carve(size, align) {
            return Ok(ptr);
        }

        let request = self.next_size.max(size);
        let base = self.upstream.allocate(request, align)?;
        self.next_size = self.next_size.saturating_mul(2);
        self.active = Some(ActiveSegment {
            base: base.as_ptr() as usize,
            len: ceil_to_page_size(request),
            used: 0,
        });
        tracing::debug!(
            "monotonic buffer refilled with {} bytes (next request {})",
            ceil_to_page_size(request),
            self.next_size
        );

        match self.carve(size, align) {
            Some(ptr) => Ok(ptr),
            // A fresh segment of at least `size` bytes always fits the
            // request at offset 0.
            None => unreachable!("fresh segment cannot be too small"),
        }
    }

    /// Individual deallocation is a no-op; memory comes back via
    /// [`release`](Self::release).
    pub fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize, _align: usize) {}

    /// Drop every segment fetched so far and reset the growth schedule to
    /// the configured initial size.
    pub fn release(&mut self) {
        let dropped = self.upstream.len();
        self.upstream.clear();
        self.active = None;
        self.next_size = self.initial_size;
        tracing::debug!("monotonic buffer released {dropped} segments");
    }

    /// Try to place the request in the active segment's tail.
    fn carve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let active = self.active.as_mut()?;
        let aligned = active.used.next_multiple_of(align);
        if aligned.checked_add(size)? > active.len {
            return None;
        }
        active.used = aligned + size;
        // Segment bases are page-aligned, so base + aligned keeps `align`.
        NonNull::new((active.base + aligned) as *mut u8)
    }
}

impl Default for MonotonicShmBuffer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ShmResource for MonotonicShmBuffer {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        MonotonicShmBuffer::allocate(self, size, align)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        MonotonicShmBuffer::deallocate(self, ptr, size, align);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successive_allocations_advance() {
        let mut buf = MonotonicShmBuffer::new(1);
        let p1 = buf.allocate(100, 1).unwrap().as_ptr() as usize;
        let p2 = buf.allocate(100, 1).unwrap().as_ptr() as usize;
        assert!(p2 >= p1 + 100);
        // One page holds both.
        assert_eq!(buf.upstream().len(), 1);
    }

    #[test]
    fn test_alignment_is_honored() {
        let mut buf = MonotonicShmBuffer::new(1);
        buf.allocate(3, 1).unwrap();
        let p = buf.allocate(64, 64).unwrap().as_ptr() as usize;
        assert_eq!(p % 64, 0);
    }

    #[test]
    fn test_refill_grows_geometrically() {
        let page = page_size();
        let mut buf = MonotonicShmBuffer::new(1);

        // Fill the first page, forcing a refill.
        buf.allocate(page, 1).unwrap();
        buf.allocate(page, 1).unwrap();
        assert_eq!(buf.upstream().len(), 2);

        let newest = buf.upstream().last_inserted().unwrap();
        assert_eq!(newest.len(), 2 * page);
    }

    #[test]
    fn test_oversized_request_is_served_whole() {
        let page = page_size();
        let mut buf = MonotonicShmBuffer::new(1);
        let p = buf.allocate(3 * page + 1, 1).unwrap();

        let segment = buf.upstream().find_arena(p.as_ptr()).unwrap();
        assert_eq!(segment.len(), 4 * page);
        assert_eq!(segment.as_ptr(), p.as_ptr() as *const u8);
    }

    #[test]
    fn test_release_resets_growth() {
        let page = page_size();
        let mut buf = MonotonicShmBuffer::new(1);
        buf.allocate(page, 1).unwrap();
        buf.allocate(page, 1).unwrap();

        buf.release();
        assert!(buf.upstream().is_empty());

        // Behaves as freshly constructed: first request is one page again.
        buf.allocate(16, 1).unwrap();
        assert_eq!(buf.upstream().last_inserted().unwrap().len(), page);
    }

    #[test]
    fn test_over_alignment_propagates() {
        let mut buf = MonotonicShmBuffer::new(1);
        assert!(matches!(
            buf.allocate(8, page_size() * 2),
            Err(Error::TooLargeAlignment { .. })
        ));
    }

    #[test]
    fn test_deallocate_is_noop() {
        let mut buf = MonotonicShmBuffer::new(1);
        let p = buf.allocate(100, 1).unwrap();
        buf.deallocate(p, 100, 1);
        assert_eq!(buf.upstream().len(), 1);
    }
}
