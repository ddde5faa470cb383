
//! Agents: handles to the CPU and the (software) GPU compute devices.
//!
//! A GPU agent owns its memory pools, its kernel-object registry and can
//! create user-mode kernel queues. Kernel objects are host functions behind
//! opaque `u64` code handles, registered once at device bring-up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::Error;
use crate::packet::KernelDispatch;
use crate::pool::{GlobalFlags, MemoryPool, Segment};
use crate::queue::UserQueue;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DeviceType {
  Cpu,
  Gpu,
}

/// A finalized kernel code handle, as embedded in dispatch packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct KernelObject(pub u64);

pub type KernelFn = dyn Fn(&KernelDispatch) + Send + Sync;

pub(crate) struct AgentInner {
  id: u32,
  device_type: DeviceType,
  name: String,
  pools: Vec<MemoryPool>,
  kernels: RwLock<HashMap<u64, Arc<KernelFn>>>,
  next_kernel_object: AtomicU64,
}

#[derive(Clone)]
pub struct Agent {
  pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
  pub(crate) fn new_cpu(id: u32) -> Self {
    let pools = vec![
      MemoryPool::new(Segment::Global,
                      GlobalFlags(GlobalFlags::FINE_GRAINED)),
      MemoryPool::new(Segment::Global,
                      GlobalFlags(GlobalFlags::COARSE_GRAINED)),
    ];
    Agent::new(id, DeviceType::Cpu, format!("cpu-{}", id), pools)
  }
  pub(crate) fn new_gpu(id: u32) -> Self {
    let pools = vec![
      // device local
      MemoryPool::new(Segment::Global,
                      GlobalFlags(GlobalFlags::COARSE_GRAINED)),
      // host visible fine grain
      MemoryPool::new(Segment::Global,
                      GlobalFlags(GlobalFlags::FINE_GRAINED)),
      // kernarg
      MemoryPool::new(Segment::Global,
                      GlobalFlags(GlobalFlags::FINE_GRAINED
                                  | GlobalFlags::KERNARG_INIT)),
    ];
    Agent::new(id, DeviceType::Gpu, format!("gfx-soft-{}", id), pools)
  }

  fn new(id: u32, device_type: DeviceType, name: String,
         pools: Vec<MemoryPool>) -> Self {
    Agent {
      inner: Arc::new(AgentInner {
        id,
        device_type,
        name,
        pools,
        kernels: RwLock::new(HashMap::new()),
        // handles start above zero; zero means "no kernel object".
        next_kernel_object: AtomicU64::new(0x1000),
      }),
    }
  }

  pub fn id(&self) -> u32 {
    self.inner.id
  }
  pub fn device_type(&self) -> DeviceType {
    self.inner.device_type
  }
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn memory_pools(&self) -> &[MemoryPool] {
    &self.inner.pools
  }

  /// First allocatable global pool matching `select`, the discovery idiom
  /// device bring-up uses.
  pub fn find_pool<F>(&self, select: F) -> Option<MemoryPool>
    where F: Fn(GlobalFlags) -> bool,
  {
    self.inner.pools.iter()
      .filter(|p| p.alloc_allowed() )
      .find(|p| select(p.global_flags()) )
      .cloned()
  }

  /// Registers a kernel, returning the code handle dispatch packets name
  /// it by. Registered kernels live until the agent is dropped.
  pub fn register_kernel<F>(&self, f: F) -> KernelObject
    where F: Fn(&KernelDispatch) + Send + Sync + 'static,
  {
    let handle = self.inner.next_kernel_object
      .fetch_add(1, Ordering::Relaxed);
    self.inner.kernels.write().insert(handle, Arc::new(f));
    KernelObject(handle)
  }

  /// Resolves a code handle back to the registered kernel.
  pub fn lookup_kernel(&self, handle: u64) -> Option<Arc<KernelFn>> {
    self.inner.kernels.read().get(&handle).cloned()
  }

  /// Creates a kernel dispatch queue of `1 << size_log2` packets with a
  /// running command processor behind it.
  pub fn new_kernel_queue(&self, size_log2: usize)
    -> Result<UserQueue, Error>
  {
    if self.device_type() != DeviceType::Gpu {
      return Err(Error::InvalidQueueCreation);
    }
    UserQueue::new(self.clone(), size_log2)
  }
}

impl fmt::Debug for Agent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Agent")
      .field("id", &self.inner.id)
      .field("device_type", &self.inner.device_type)
      .field("name", &self.inner.name)
      .finish()
  }
}
