//! The allocate/deallocate seam shared by every allocator adapter.

use std::ptr::NonNull;

use crate::error::Result;

/// A polymorphic source of shared-memory allocations.
///
/// Implementations differ in how they carve the bytes (one fresh segment
/// per call, a bump cursor, size-class free-lists) but share the same
/// triad: allocate, deallocate, and instance identity.
///
/// `align` must be a power of two; alignments beyond the host page size are
/// rejected with [`TooLargeAlignment`](crate::error::Error::TooLargeAlignment)
/// because mapping bases are only ever page-aligned.
pub trait ShmResource {
    /// Allocate `size` bytes aligned to `align` inside some shared-memory
    /// segment owned by this resource.
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Return an allocation previously obtained from this resource, with
    /// the same `size` and `align` it was requested with.
    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()>;

    /// Whether `self` and `other` are the very same resource instance.
    ///
    /// Distinct instances own disjoint segments, so anything beyond
    /// identity would be a lie.
    fn is_equal(&self, other: &dyn ShmResource) -> bool
    where
        Self: Sized,
    {
        std::ptr::eq(
            self as *const Self as *const u8,
            other as *const dyn ShmResource as *const u8,
        )
    }
}
