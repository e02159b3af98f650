//! # shmbus
//!
//! Pass arbitrary in-memory messages between cooperating local processes
//! through named, file-backed shared-memory segments.
//!
//! A producer allocates message space from one of the allocator adapters,
//! writes its bytes, and publishes a `(segment name, offset)` [`Locator`]
//! over any out-of-band channel (typically a tiny well-known segment). A
//! consumer resolves locators with a [`ShmReader`], which lazily opens and
//! caches each named segment exactly once.
//!
//! ## Layers
//!
//! - [`Segment`]: one named POSIX shared-memory object, mapped into this
//!   process. Role and write capability are type parameters: [`Owner`]
//!   creates and unlinks, [`Editor`] / [`Viewer`] open an existing object
//!   read-write / read-only.
//! - [`OrderedShmResource`] / [`HashedShmResource`]: raw resources that
//!   manufacture a fresh segment per allocation and index segments by base
//!   address for reverse lookup ([`find_arena`](OrderedShmResource::find_arena)).
//! - [`MonotonicShmBuffer`]: bump allocation over lazily-fetched segments,
//!   for batches that die together.
//! - [`ShmPool`] / [`SyncShmPool`]: size-class free-lists over segment
//!   chunks, for churn with individual deallocation.
//! - [`ShmReader`]: the consumer-side cache with borrow-counted reads.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use shmbus::prelude::*;
//!
//! // Producer.
//! let mut buf = MonotonicShmBuffer::new(1);
//! let msg = buf.allocate(100, 1)?;
//! unsafe { msg.as_ptr().copy_from_nonoverlapping(b"hello".as_ptr(), 5) };
//! let segment = buf.upstream().find_arena(msg.as_ptr())?;
//! let locator = segment.locator(segment.offset_of(msg.as_ptr()).unwrap())?;
//! // ... publish `locator` through a well-known descriptor segment ...
//!
//! // Consumer.
//! let reader = ShmReader::new();
//! let bytes = reader.read::<[u8; 5]>(locator.segment_name()?, locator.offset())?;
//! assert_eq!(&*bytes, b"hello");
//! ```
//!
//! All cross-process synchronization on the message bytes themselves is the
//! caller's business; the library only guarantees that a segment is fully
//! created and sized before any accessor maps it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod monotonic;
pub mod name;
pub mod page;
pub mod pool;
pub mod raw;
pub mod reader;
pub mod resource;
pub mod segment;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::monotonic::MonotonicShmBuffer;
    pub use crate::name::generate_name;
    pub use crate::page::{ceil_to_page_size, page_size};
    pub use crate::pool::{PoolOptions, ShmPool, SyncShmPool};
    pub use crate::raw::{HashedShmResource, OrderedShmResource};
    pub use crate::reader::ShmReader;
    pub use crate::resource::ShmResource;
    pub use crate::segment::{Editor, Locator, Owner, Segment, Viewer};
}

pub use error::{Error, Result};
pub use monotonic::MonotonicShmBuffer;
pub use pool::{PoolOptions, ShmPool, SyncShmPool};
pub use raw::{HashedShmResource, OrderedShmResource};
pub use reader::{ReadGuard, ShmReader};
pub use resource::ShmResource;
pub use segment::{Editor, Locator, Owner, Segment, Viewer};
