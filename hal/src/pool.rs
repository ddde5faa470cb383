
//! Memory pools: the allocation side of the agent ABI.
//!
//! Pools hand out page-aligned allocations rounded to the pool granule.
//! Pointers are non-owning; callers free explicitly, as with
//! `hsa_amd_memory_pool_free`. Locking (pinning) host memory is real
//! accounting even though the software device can always reach host
//! memory: the device layer's pin caches and chunk loops depend on it.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Segment {
  Global,
  Group,
  Private,
  ReadOnly,
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GlobalFlags(pub u32);
impl GlobalFlags {
  pub const KERNARG_INIT: u32 = 1 << 0;
  pub const FINE_GRAINED: u32 = 1 << 1;
  pub const COARSE_GRAINED: u32 = 1 << 2;

  pub fn kernel_arg(&self) -> bool {
    (self.0 & Self::KERNARG_INIT) != 0
  }
  pub fn fine_grained(&self) -> bool {
    (self.0 & Self::FINE_GRAINED) != 0
  }
  pub fn coarse_grained(&self) -> bool {
    (self.0 & Self::COARSE_GRAINED) != 0
  }
}
impl fmt::Debug for GlobalFlags {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "GlobalFlags(")?;
    if self.kernel_arg() {
      write!(f, "kernel arg,")?;
    }
    if self.fine_grained() {
      write!(f, "fine grained,")?;
    }
    if self.coarse_grained() {
      write!(f, "coarse grained,")?;
    }
    write!(f, ")")
  }
}

pub const ALLOC_ALIGNMENT: usize = 4096;
pub const ALLOC_GRANULE: usize = 4096;

struct PoolInner {
  segment: Segment,
  flags: GlobalFlags,
  // live allocations, keyed by base address. Needed to rebuild the layout
  // on free and to reject bogus frees.
  allocs: Mutex<HashMap<usize, Layout>>,
  locked: Mutex<HashMap<usize, usize>>,
}

/// A memory pool handle. Cheap to clone; all clones refer to one pool.
#[derive(Clone)]
pub struct MemoryPool {
  inner: Arc<PoolInner>,
}

impl MemoryPool {
  pub(crate) fn new(segment: Segment, flags: GlobalFlags) -> Self {
    MemoryPool {
      inner: Arc::new(PoolInner {
        segment,
        flags,
        allocs: Mutex::new(HashMap::new()),
        locked: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn segment(&self) -> Segment {
    self.inner.segment
  }
  pub fn global_flags(&self) -> GlobalFlags {
    self.inner.flags
  }
  pub fn alloc_alignment(&self) -> usize {
    ALLOC_ALIGNMENT
  }
  pub fn alloc_granule(&self) -> usize {
    ALLOC_GRANULE
  }
  pub fn alloc_allowed(&self) -> bool {
    true
  }

  /// Allocates `bytes`, rounded up to the pool granule, aligned to
  /// `alloc_alignment()`. The memory is zero initialized.
  pub fn alloc(&self, bytes: usize) -> Result<PoolPtr, Error> {
    let len = round_up(bytes.max(1), self.alloc_granule());
    let layout = Layout::from_size_align(len, self.alloc_alignment())
      .map_err(|_| Error::InvalidAllocation )?;

    let ptr = unsafe { alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr).ok_or(Error::OutOfResources)?;

    self.inner.allocs.lock().insert(ptr.as_ptr() as usize, layout);
    trace!(bytes, len, "pool alloc @ {:p}", ptr);
    Ok(PoolPtr { ptr, len })
  }

  /// Frees an allocation previously returned by `alloc` on this pool.
  pub fn free(&self, p: PoolPtr) -> Result<(), Error> {
    let layout = self.inner.allocs.lock()
      .remove(&(p.ptr.as_ptr() as usize))
      .ok_or(Error::ResourceFree)?;
    unsafe { dealloc(p.ptr.as_ptr(), layout) };
    Ok(())
  }

  /// Locks (pins) a host range for device access. The returned agent
  /// pointer aliases the host range.
  ///
  /// Unsafe: the host range must stay valid until `unlock`.
  pub unsafe fn lock(&self, host_ptr: NonNull<u8>, bytes: usize)
    -> Result<PinnedPtr, Error>
  {
    if bytes == 0 {
      return Err(Error::InvalidArgument);
    }
    trace!(bytes, "locking host range @ {:p}", host_ptr);
    self.inner.locked.lock().insert(host_ptr.as_ptr() as usize, bytes);
    Ok(PinnedPtr {
      agent_ptr: host_ptr,
      bytes,
    })
  }

  pub fn unlock(&self, pinned: PinnedPtr) -> Result<(), Error> {
    self.inner.locked.lock()
      .remove(&(pinned.agent_ptr.as_ptr() as usize))
      .map(|_| () )
      .ok_or(Error::ResourceFree)
  }

  /// Bytes currently pinned through this pool. Accounting hook for tests.
  pub fn locked_bytes(&self) -> usize {
    self.inner.locked.lock().values().sum()
  }
  /// Live allocation count. Accounting hook for tests.
  pub fn live_allocs(&self) -> usize {
    self.inner.allocs.lock().len()
  }
}

impl fmt::Debug for MemoryPool {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("MemoryPool")
      .field("segment", &self.inner.segment)
      .field("flags", &self.inner.flags)
      .finish()
  }
}

/// A non-owning pointer into a pool allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PoolPtr {
  ptr: NonNull<u8>,
  len: usize,
}
impl PoolPtr {
  #[inline(always)]
  pub fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }
  /// Allocated length; at least the requested size, rounded to the granule.
  #[inline(always)]
  pub fn len(&self) -> usize {
    self.len
  }
  #[inline(always)]
  pub fn addr(&self) -> usize {
    self.ptr.as_ptr() as usize
  }
  /// Offset view. Stays within the allocation or this is UB downstream.
  #[inline(always)]
  pub fn offset(&self, bytes: usize) -> *mut u8 {
    debug_assert!(bytes <= self.len);
    unsafe { self.ptr.as_ptr().add(bytes) }
  }
}
unsafe impl Send for PoolPtr { }
unsafe impl Sync for PoolPtr { }

/// A pinned host range, usable as a DMA source/destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PinnedPtr {
  agent_ptr: NonNull<u8>,
  bytes: usize,
}
impl PinnedPtr {
  #[inline(always)]
  pub fn as_ptr(&self) -> *mut u8 {
    self.agent_ptr.as_ptr()
  }
  #[inline(always)]
  pub fn len(&self) -> usize {
    self.bytes
  }
}
unsafe impl Send for PinnedPtr { }
unsafe impl Sync for PinnedPtr { }

#[inline(always)]
pub(crate) fn round_up(v: usize, to: usize) -> usize {
  (v + to - 1) / to * to
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn alloc_is_aligned_and_granular() {
    let pool = MemoryPool::new(Segment::Global,
                               GlobalFlags(GlobalFlags::FINE_GRAINED));
    let p = pool.alloc(100).unwrap();
    assert_eq!(p.addr() % ALLOC_ALIGNMENT, 0);
    assert_eq!(p.len(), ALLOC_GRANULE);
    assert_eq!(pool.live_allocs(), 1);
    pool.free(p).unwrap();
    assert_eq!(pool.live_allocs(), 0);
  }

  #[test]
  fn double_free_rejected() {
    let pool = MemoryPool::new(Segment::Global,
                               GlobalFlags(GlobalFlags::COARSE_GRAINED));
    let p = pool.alloc(16).unwrap();
    pool.free(p).unwrap();
    assert_eq!(pool.free(p), Err(Error::ResourceFree));
  }

  #[test]
  fn lock_unlock_accounting() {
    let pool = MemoryPool::new(Segment::Global,
                               GlobalFlags(GlobalFlags::FINE_GRAINED));
    let mut host = vec![0u8; 8192];
    let nn = NonNull::new(host.as_mut_ptr()).unwrap();
    let pinned = unsafe { pool.lock(nn, 8192) }.unwrap();
    assert_eq!(pool.locked_bytes(), 8192);
    assert_eq!(pinned.as_ptr(), host.as_mut_ptr());
    pool.unlock(pinned).unwrap();
    assert_eq!(pool.locked_bytes(), 0);
  }
}
