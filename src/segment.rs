//! Named shared-memory segments.
//!
//! A [`Segment`] is one POSIX shared-memory object mapped into this process.
//! The mode parameter decides, at compile time, what the handle may do:
//!
//! - [`Owner`]: creates the object, maps it read-write, and unlinks the name
//!   on drop. Exactly one owner can exist per name host-wide.
//! - [`Editor`]: opens an existing object read-write. Does not unlink.
//! - [`Viewer`]: opens an existing object read-only. Does not unlink.
//!
//! All three unmap on drop; the kernel releases the object once the owner
//! has unlinked it and the last mapping anywhere is gone. The library never
//! counts cross-process mappings itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmbus::segment::{Owner, Segment, Viewer};
//!
//! // Producer process.
//! let seg = Segment::<Owner>::create("/my-message", 4096)?;
//! seg.set_byte(0, 0x2a);
//!
//! // Consumer process. Waits (bounded) for the name to appear.
//! let view = Segment::<Viewer>::open("/my-message")?;
//! assert_eq!(view.byte(0), 0x2a);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate, Mode};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm;

use crate::error::{Error, Result};
use crate::name::validate_name;

/// How long an accessor waits for the named object to appear by default.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of the accessor wait loop.
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Set once the host refuses an executable mapping; later mappings skip the
/// `PROT_EXEC` attempt entirely.
static EXEC_REFUSED: AtomicBool = AtomicBool::new(false);

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Owner {}
    impl Sealed for super::Editor {}
    impl Sealed for super::Viewer {}
}

/// Capability profile of a [`Segment`] handle.
///
/// Implemented only by the three zero-sized markers [`Owner`], [`Editor`],
/// and [`Viewer`].
pub trait SegmentMode: sealed::Sealed {
    /// Whether handles in this mode unlink the object on drop.
    const UNLINKS: bool;
    /// Whether handles in this mode map the object writable.
    const WRITABLE: bool;
}

/// Modes whose segments may be written through.
pub trait Writable: SegmentMode {}

/// Modes that open an existing object rather than creating one.
pub trait OpenMode: SegmentMode {}

/// Creator role: creates and truncates the object, maps it read-write,
/// unlinks the name on drop.
#[derive(Debug)]
pub struct Owner;

/// Writable accessor role: opens an existing object with `O_RDWR`.
#[derive(Debug)]
pub struct Editor;

/// Read-only accessor role: opens an existing object with `O_RDONLY`.
#[derive(Debug)]
pub struct Viewer;

impl SegmentMode for Owner {
    const UNLINKS: bool = true;
    const WRITABLE: bool = true;
}
impl SegmentMode for Editor {
    const UNLINKS: bool = false;
    const WRITABLE: bool = true;
}
impl SegmentMode for Viewer {
    const UNLINKS: bool = false;
    const WRITABLE: bool = false;
}

impl Writable for Owner {}
impl Writable for Editor {}

impl OpenMode for Editor {}
impl OpenMode for Viewer {}

/// One named POSIX shared-memory object, mapped into this process.
pub struct Segment<M: SegmentMode> {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    _mode: PhantomData<M>,
}

// SAFETY: the mapping is plain shared memory valid for the lifetime of the
// handle; which threads touch it is the caller's concern, exactly as with
// any other shared mapping. Reads and writes go through volatile accessors
// or explicitly unsafe slice views.
unsafe impl<M: SegmentMode> Send for Segment<M> {}
unsafe impl<M: SegmentMode> Sync for Segment<M> {}

/// Map `fd` for `len` bytes. Writable mappings ask for `PROT_EXEC` too,
/// falling back without it when the host answers `EPERM`; read-only
/// mappings add `MAP_NORESERVE`.
fn map_fd(fd: &OwnedFd, len: usize, writable: bool) -> Result<NonNull<u8>> {
    let ptr = if writable {
        let prot = ProtFlags::READ | ProtFlags::WRITE;
        if EXEC_REFUSED.load(Ordering::Relaxed) {
            // SAFETY: fresh mapping, null hint, offset 0 within the object.
            unsafe { mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0) }?
        } else {
            // SAFETY: as above.
            match unsafe {
                mmap(
                    std::ptr::null_mut(),
                    len,
                    prot | ProtFlags::EXEC,
                    MapFlags::SHARED,
                    fd,
                    0,
                )
            } {
                Ok(ptr) => ptr,
                // Hardened hosts spell the refusal EPERM or EACCES.
                Err(Errno::PERM | Errno::ACCESS) => {
                    EXEC_REFUSED.store(true, Ordering::Relaxed);
                    tracing::debug!("host refuses PROT_EXEC mappings, continuing without");
                    // SAFETY: as above.
                    unsafe { mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0) }?
                }
                Err(errno) => return Err(Error::MappingFailed(errno)),
            }
        }
    } else {
        // SAFETY: as above.
        unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::SHARED | MapFlags::NORESERVE,
                fd,
                0,
            )
        }?
    };

    NonNull::new(ptr.cast::<u8>()).ok_or(Error::MappingFailed(Errno::FAULT))
}

impl Segment<Owner> {
    /// Create a new shared-memory object named `name` of exactly `size`
    /// bytes, and map it read-write.
    ///
    /// The region starts zeroed (`ftruncate` extends with zero bytes).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] / [`Error::NameTooLong`] for a malformed name.
    /// - [`Error::ZeroLength`] for `size == 0`.
    /// - [`Error::NameInUse`] when the name already exists on the host.
    /// - [`Error::MappingFailed`] when `ftruncate` or `mmap` fail.
    pub fn create(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        if size == 0 {
            return Err(Error::ZeroLength);
        }

        let fd = shm::open(
            name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH,
        )
        .map_err(|errno| match errno {
            Errno::EXIST => Error::NameInUse(name.clone()),
            Errno::INVAL | Errno::NOENT => Error::InvalidName(name.clone()),
            other => Error::MappingFailed(other),
        })?;

        if let Err(errno) = ftruncate(&fd, size as u64) {
            let _ = shm::unlink(name.as_str());
            return Err(Error::MappingFailed(errno));
        }

        let ptr = match map_fd(&fd, size, true) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm::unlink(name.as_str());
                return Err(err);
            }
        };
        // fd drops here; the mapping keeps the object referenced.

        tracing::debug!("created segment `{name}` ({size} bytes)");
        Ok(Self {
            name,
            ptr,
            len: size,
            _mode: PhantomData,
        })
    }
}

impl<M: OpenMode> Segment<M> {
    /// Open the existing object named `name`, waiting up to
    /// [`DEFAULT_OPEN_TIMEOUT`] for it to appear and be sized.
    ///
    /// The segment length is whatever the kernel reports at open time.
    pub fn open(name: impl Into<String>) -> Result<Self> {
        Self::open_timeout(name, DEFAULT_OPEN_TIMEOUT)
    }

    /// Like [`open`](Self::open) with a caller-chosen wait budget.
    ///
    /// The name is polled every 20 ms until it exists and `ftruncate` has
    /// given it a nonzero size; at least one attempt is always made.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectNotFoundWithin`] once `timeout` elapses without the
    /// object appearing; [`Error::MappingFailed`] for unexpected errnos.
    pub fn open_timeout(name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;

        let oflags = if M::WRITABLE {
            shm::OFlags::RDWR
        } else {
            shm::OFlags::RDONLY
        };

        let start = Instant::now();
        let (fd, len) = loop {
            match shm::open(name.as_str(), oflags, Mode::empty()) {
                Ok(fd) => {
                    let stat = fstat(&fd)?;
                    if stat.st_size > 0 {
                        break (fd, stat.st_size as usize);
                    }
                    // Created but not yet truncated to size; keep waiting.
                }
                Err(Errno::NOENT) => {}
                Err(errno) => return Err(Error::MappingFailed(errno)),
            }
            if start.elapsed() >= timeout {
                return Err(Error::ObjectNotFoundWithin(timeout));
            }
            thread::sleep(OPEN_POLL_INTERVAL);
        };

        let ptr = map_fd(&fd, len, M::WRITABLE)?;
        // fd drops here; the mapping keeps the object referenced.

        tracing::debug!(
            "opened segment `{name}` ({len} bytes, {})",
            if M::WRITABLE { "rw" } else { "ro" }
        );
        Ok(Self {
            name,
            ptr,
            len,
            _mode: PhantomData,
        })
    }

    /// Establish a second, independent mapping of the same object.
    ///
    /// The clone has the same name and length, and generally a different
    /// address. Fails if the object has been unlinked in the meantime.
    pub fn try_clone(&self) -> Result<Self> {
        Self::open_timeout(self.name.clone(), Duration::ZERO)
    }
}

impl<M: SegmentMode> Segment<M> {
    /// The object's name, `/`-prefixed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapping length in bytes. Always positive.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; kept for container-like symmetry.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Base address as a `NonNull`, for use as a lookup key.
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Whether `ptr` falls inside this mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Byte offset of `ptr` from the mapping base, if it is inside.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        self.contains(ptr)
            .then(|| ptr as usize - self.ptr.as_ptr() as usize)
    }

    /// A [`Locator`] naming the byte at `offset` within this segment.
    pub fn locator(&self, offset: usize) -> Result<Locator> {
        Locator::new(&self.name, offset)
    }

    /// Read the `i`-th byte.
    ///
    /// Goes through a volatile load: other processes may be writing the
    /// region concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    pub fn byte(&self, i: usize) -> u8 {
        assert!(i < self.len, "byte index out of bounds");
        // SAFETY: i is in bounds of the live mapping.
        unsafe { self.ptr.as_ptr().add(i).read_volatile() }
    }

    /// View the whole mapping as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no process writes the region while the slice
    /// is live.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for len bytes; caller upholds the
        // no-concurrent-writer contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the byte range `start..end` of the mapping.
    ///
    /// # Safety
    ///
    /// Same contract as [`as_slice`](Self::as_slice).
    ///
    /// # Panics
    ///
    /// Panics unless `start <= end <= self.len()`.
    pub unsafe fn subspan(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.len, "subspan out of bounds");
        // SAFETY: range checked above; caller upholds the aliasing contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), end - start) }
    }
}

impl<M: Writable> Segment<M> {
    /// Base address of the mapping, writable.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Write the `i`-th byte through a volatile store.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    pub fn set_byte(&self, i: usize, value: u8) {
        assert!(i < self.len, "byte index out of bounds");
        // SAFETY: i is in bounds of the live writable mapping.
        unsafe { self.ptr.as_ptr().add(i).write_volatile(value) }
    }

    /// View the whole mapping as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the region while the
    /// slice is live. The mutable reference is produced from `&self`
    /// because the mapped bytes are shared state the handle merely views.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: the mapping is valid for len bytes; caller guarantees
        // exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the byte range `start..end`.
    ///
    /// # Safety
    ///
    /// Same contract as [`as_mut_slice`](Self::as_mut_slice).
    ///
    /// # Panics
    ///
    /// Panics unless `start <= end <= self.len()`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn subspan_mut(&self, start: usize, end: usize) -> &mut [u8] {
        assert!(start <= end && end <= self.len, "subspan out of bounds");
        // SAFETY: range checked above; caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), end - start) }
    }
}

impl<A: SegmentMode, B: SegmentMode> PartialEq<Segment<B>> for Segment<A> {
    fn eq(&self, other: &Segment<B>) -> bool {
        self.name == other.name
    }
}

impl<M: SegmentMode> Eq for Segment<M> {}

impl<M: SegmentMode> Hash for Segment<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<M: SegmentMode> fmt::Debug for Segment<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .field("unlinks", &M::UNLINKS)
            .field("writable", &M::WRITABLE)
            .finish()
    }
}

impl<M: SegmentMode> Drop for Segment<M> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping made at construction.
        if let Err(errno) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!("munmap of `{}` failed: {errno}", self.name);
        }
        if M::UNLINKS {
            match shm::unlink(self.name.as_str()) {
                Ok(()) => tracing::debug!("unlinked segment `{}`", self.name),
                Err(errno) => tracing::warn!("shm_unlink of `{}` failed: {errno}", self.name),
            }
        }
    }
}

/// A portable `(segment name, offset)` message locator.
///
/// Exactly 32 bytes: a 24-byte NUL-terminated name field followed by a
/// little-endian-agnostic native `u64` offset. Generated names are 23 bytes,
/// so they always fit with their terminator. Being [`Pod`], a `Locator` can
/// be copied verbatim into a well-known descriptor segment by the producer
/// and read back out by the consumer.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Locator {
    name: [u8; 24],
    offset: u64,
}

const _: () = assert!(std::mem::size_of::<Locator>() == 32);

impl Locator {
    /// Size of the encoded form in bytes.
    pub const SIZE: usize = std::mem::size_of::<Locator>();

    /// Build a locator for the byte at `offset` inside the segment named
    /// `name`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] for a malformed name, [`Error::NameTooLong`]
    /// when `name` does not fit the 24-byte field with its terminator.
    pub fn new(name: &str, offset: usize) -> Result<Self> {
        validate_name(name)?;
        if name.len() >= 24 {
            return Err(Error::NameTooLong { len: name.len() });
        }
        let mut bytes = [0u8; 24];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            name: bytes,
            offset: offset as u64,
        })
    }

    /// The segment name carried by this locator.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] when the name field (which may have been read
    /// from untrusted shared bytes) is not a valid name.
    pub fn segment_name(&self) -> Result<&str> {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidName(String::from_utf8_lossy(&self.name).into_owned()))?;
        let name = std::str::from_utf8(&self.name[..end])
            .map_err(|_| Error::InvalidName(String::from_utf8_lossy(&self.name).into_owned()))?;
        validate_name(name)?;
        Ok(name)
    }

    /// The byte offset within the named segment.
    pub fn offset(&self) -> usize {
        self.offset as usize
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locator")
            .field("name", &self.segment_name().unwrap_or("<invalid>"))
            .field("offset", &self.offset)
            .finish()
    }
}
