//! Size-class pool allocator over shared-memory chunks.
//!
//! [`ShmPool`] keeps one free-list per power-of-two size class. A class
//! refills by requesting a chunk segment from the owned upstream
//! [`OrderedShmResource`] and splitting it into equal blocks. Requests
//! beyond [`PoolOptions::largest_pooled_block`] bypass the classes and get
//! a dedicated segment each, returned to the upstream as soon as they are
//! deallocated. Chunk segments stay resident until
//! [`release`](ShmPool::release).
//!
//! [`SyncShmPool`] is the same pool behind a mutex for callers that share
//! one instance across threads.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::page::{ceil_to_page_size, page_size};
use crate::raw::OrderedShmResource;
use crate::resource::ShmResource;

/// Smallest block any class hands out.
const MIN_BLOCK: usize = 8;

/// Blocks in the first chunk of each class; doubles per refill up to
/// [`PoolOptions::max_blocks_per_chunk`].
const FIRST_CHUNK_BLOCKS: usize = 4;

/// Tuning knobs for [`ShmPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Largest request served from the size classes; anything bigger
    /// bypasses the pool. Rounded up to a page multiple at construction,
    /// minimum one page.
    pub largest_pooled_block: usize,
    /// Upper bound on the number of blocks a single chunk is split into.
    pub max_blocks_per_chunk: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            largest_pooled_block: page_size(),
            max_blocks_per_chunk: 32,
        }
    }
}

/// One power-of-two size class.
struct SizeClass {
    block_size: usize,
    /// Addresses of free blocks, most recently returned last.
    free: Vec<usize>,
    /// Blocks the next chunk will be split into.
    next_blocks: usize,
}

/// An unsynchronized pool resource over shared-memory segments.
///
/// # Example
///
/// ```rust,ignore
/// use shmbus::pool::{PoolOptions, ShmPool};
///
/// let mut pool = ShmPool::new(PoolOptions { largest_pooled_block: 8000, ..Default::default() });
/// let msg = pool.allocate(100, 8)?;
/// pool.deallocate(msg, 100, 8)?;
/// ```
pub struct ShmPool {
    upstream: OrderedShmResource,
    options: PoolOptions,
    classes: Vec<SizeClass>,
}

impl ShmPool {
    /// Create a pool with the given options.
    pub fn new(options: PoolOptions) -> Self {
        let largest = ceil_to_page_size(options.largest_pooled_block.max(1));
        let options = PoolOptions {
            largest_pooled_block: largest,
            max_blocks_per_chunk: options.max_blocks_per_chunk.max(1),
        };

        let mut classes = Vec::new();
        let mut block = MIN_BLOCK;
        loop {
            classes.push(SizeClass {
                block_size: block,
                free: Vec::new(),
                next_blocks: FIRST_CHUNK_BLOCKS.min(options.max_blocks_per_chunk),
            });
            if block >= largest {
                break;
            }
            block *= 2;
        }

        Self {
            upstream: OrderedShmResource::new(),
            options,
            classes,
        }
    }

    /// The effective options, with the rounded largest-pooled-block value.
    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// The upstream resource owning every chunk and bypass segment.
    pub fn upstream(&self) -> &OrderedShmResource {
        &self.upstream
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroLength`] for `size == 0`;
    /// [`Error::TooLargeAlignment`] for `align > page_size()`.
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

        if size > self.options.largest_pooled_block {
            // Bypass: one dedicated segment for this allocation alone.
            return self.upstream.allocate(size, align);
        }

        let index = self.class_index(size, align);
        if self.classes[index].free.is_empty() {
            self.refill_class(index, align)?;
        }
        let class = &mut self.classes[index];
        match class.free.pop().and_then(|addr| NonNull::new(addr as *mut u8)) {
            Some(ptr) => Ok(ptr),
            // refill_class either errored out above or stocked the list.
            None => unreachable!("refilled class has free blocks"),
        }
    }

    /// Return an allocation to the pool.
    ///
    /// Bypass allocations (recognized by `size`) hand their segment back to
    /// the upstream for destruction; pooled blocks rejoin their class
    /// free-list.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        if size > self.options.largest_pooled_block {
            return self.upstream.deallocate(ptr, size, align);
        }
        debug_assert!(self.upstream.find_arena(ptr.as_ptr()).is_ok());
        let index = self.class_index(size, align);
        self.classes[index].free.push(ptr.as_ptr() as usize);
        Ok(())
    }

    /// Drop every chunk and bypass segment and empty the free-lists.
    pub fn release(&mut self) {
        for class in &mut self.classes {
            class.free.clear();
            class.next_blocks = FIRST_CHUNK_BLOCKS.min(self.options.max_blocks_per_chunk);
        }
        let dropped = self.upstream.len();
        self.upstream.clear();
        tracing::debug!("pool released {dropped} segments");
    }

    /// Smallest class covering `size` at `align`.
    fn class_index(&self, size: usize, align: usize) -> usize {
        let want = size.max(align).max(MIN_BLOCK).next_power_of_two();
        let index = want.trailing_zeros() - MIN_BLOCK.trailing_zeros();
        debug_assert!((index as usize) < self.classes.len());
        (index as usize).min(self.classes.len() - 1)
    }

    /// Split one fresh upstream chunk into blocks for class `index`.
    fn refill_class(&mut self, index: usize, align: usize) -> Result<()> {
        let (block_size, blocks) = {
            let class = &self.classes[index];
            (class.block_size, class.next_blocks)
        };

        let chunk = self.upstream.allocate(block_size * blocks, align)?;
        let chunk_len = ceil_to_page_size(block_size * blocks);
        let base = chunk.as_ptr() as usize;

        let class = &mut self.classes[index];
        // Page-rounded chunks divide evenly into power-of-two blocks; use
        // the whole mapping, not just the requested span.
        let split = chunk_len / block_size;
        class.free.extend((0..split).rev().map(|i| base + i * block_size));
        class.next_blocks = (blocks * 2).min(self.options.max_blocks_per_chunk);

        tracing::debug!(
            "pool class {block_size} refilled with {split} blocks ({chunk_len} bytes)"
        );
        Ok(())
    }
}

impl Default for ShmPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl ShmResource for ShmPool {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        ShmPool::allocate(self, size, align)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        ShmPool::deallocate(self, ptr, size, align)
    }
}

/// A mutex-serialized [`ShmPool`] for shared use across threads.
///
/// Behaviorally identical to the unsynchronized pool; every operation
/// holds the internal lock for its duration.
pub struct SyncShmPool {
    inner: Mutex<ShmPool>,
}

impl SyncShmPool {
    /// Create a synchronized pool with the given options.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Mutex::new(ShmPool::new(options)),
        }
    }

    /// Allocate `size` bytes aligned to `align`. See [`ShmPool::allocate`].
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.lock().allocate(size, align)
    }

    /// Return an allocation. See [`ShmPool::deallocate`].
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        self.lock().deallocate(ptr, size, align)
    }

    /// Drop every owned segment. See [`ShmPool::release`].
    pub fn release(&self) {
        self.lock().release()
    }

    /// The effective options.
    pub fn options(&self) -> PoolOptions {
        self.lock().options()
    }

    /// Run `f` against the upstream resource while holding the lock.
    pub fn with_upstream<R>(&self, f: impl FnOnce(&OrderedShmResource) -> R) -> R {
        f(self.lock().upstream())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShmPool> {
        // A poisoned pool is still structurally sound; keep serving.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SyncShmPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_pooled_allocation_reuses_freed_block() {
        let mut pool = ShmPool::new(PoolOptions {
            largest_pooled_block: 8000,
            ..Default::default()
        });

        let p1 = pool.allocate(100, 8).unwrap();
        pool.deallocate(p1, 100, 8).unwrap();
        let p2 = pool.allocate(100, 8).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_distinct_live_blocks() {
        let mut pool = ShmPool::default();
        let a = pool.allocate(64, 8).unwrap();
        let b = pool.allocate(64, 8).unwrap();
        assert_ne!(a, b);
        assert!(a.as_ptr() as usize % 8 == 0);
        assert!(b.as_ptr() as usize % 8 == 0);
    }

    #[test]
    fn test_bypass_allocation_gets_own_segment() {
        let mut pool = ShmPool::new(PoolOptions {
            largest_pooled_block: 8000,
            ..Default::default()
        });
        let big = 3 * page_size();
        assert!(big > pool.options().largest_pooled_block);

        let p = pool.allocate(big, 8).unwrap();
        let segment = pool.upstream().find_arena(p.as_ptr()).unwrap();
        assert_eq!(segment.as_ptr(), p.as_ptr() as *const u8);

        let before = pool.upstream().len();
        pool.deallocate(p, big, 8).unwrap();
        assert_eq!(pool.upstream().len(), before - 1);
    }

    #[test]
    fn test_chunks_survive_deallocate() {
        let mut pool = ShmPool::default();
        let p = pool.allocate(100, 8).unwrap();
        let chunks = pool.upstream().len();
        pool.deallocate(p, 100, 8).unwrap();
        assert_eq!(pool.upstream().len(), chunks);
    }

    #[test]
    fn test_release_drops_everything() {
        let mut pool = ShmPool::default();
        let p = pool.allocate(100, 8).unwrap();
        pool.deallocate(p, 100, 8).unwrap();
        pool.allocate(2 * page_size() + 1, 8).unwrap();

        pool.release();
        assert!(pool.upstream().is_empty());

        // Usable again afterwards.
        pool.allocate(100, 8).unwrap();
    }

    #[test]
    fn test_alignment_selects_covering_class() {
        let mut pool = ShmPool::default();
        let p = pool.allocate(24, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
    }

    #[test]
    fn test_over_alignment_rejected() {
        let mut pool = ShmPool::default();
        assert!(matches!(
            pool.allocate(8, page_size() * 2),
            Err(Error::TooLargeAlignment { .. })
        ));
    }

    #[test]
    fn test_options_are_rounded() {
        let pool = ShmPool::new(PoolOptions {
            largest_pooled_block: 8000,
            max_blocks_per_chunk: 0,
        });
        assert_eq!(
            pool.options().largest_pooled_block,
            ceil_to_page_size(8000)
        );
        assert_eq!(pool.options().max_blocks_per_chunk, 1);
    }

    #[test]
    fn test_sync_pool_across_threads() {
        let pool = Arc::new(SyncShmPool::default());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let p = pool.allocate(64, 8).unwrap();
                    pool.deallocate(p, 64, 8).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every block went back; chunks are still resident.
        pool.with_upstream(|upstream| assert!(!upstream.is_empty()));
    }
}
