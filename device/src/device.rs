
//! Device bring-up and the device side of the coherence protocol.
//!
//! `Platform` is the explicit registry: it owns the runtime context and
//! the mem object arena and hands out devices. Nothing here is a global;
//! the embedder threads the platform through.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use hal::pool::{PinnedPtr, PoolPtr};
use hal::signal::{ConditionOrdering, Signal, WaitState};
use hal::{Agent, Context, MemoryPool};

use crate::blit::{BlitEngine, PINNED_MEMORY_ALIGNMENT,
                  SPIN_WAIT_MAX_BYTES};
use crate::error::{Error, Result};
use crate::kernel::round_up;
use crate::kernels::create_blit_kernels;
use crate::memory::{DeviceId, MemId, MemKind, Memory, MemoryArena};
use crate::queue::HostQueue;
use crate::settings::Settings;
use crate::virtual_gpu::VirtualGPU;

/// The runtime registry: context, arena and every created device.
pub struct Platform {
  ctx: Context,
  arena: Arc<MemoryArena>,
  devices: Mutex<Vec<Arc<Device>>>,
}

impl Platform {
  pub fn new() -> Result<Platform> {
    Platform::with_gpus(1)
  }

  pub fn with_gpus(gpus: usize) -> Result<Platform> {
    let ctx = Context::new(gpus)?;
    let host_pool = ctx.cpu_agent()
      .find_pool(|f| f.fine_grained() )
      .ok_or(Error::Hal(hal::Error::InvalidAgent))?;
    Ok(Platform {
      ctx,
      arena: MemoryArena::new(host_pool),
      devices: Mutex::new(Vec::new()),
    })
  }

  pub fn context(&self) -> &Context {
    &self.ctx
  }
  pub fn arena(&self) -> &Arc<MemoryArena> {
    &self.arena
  }
  pub fn devices(&self) -> Vec<Arc<Device>> {
    self.devices.lock().clone()
  }
}

pub struct Device {
  id: DeviceId,
  ctx: Context,
  agent: Agent,
  settings: Settings,
  host_pool: MemoryPool,
  local_pool: MemoryPool,
  kernarg_pool: MemoryPool,
  arena: Arc<MemoryArena>,
  blit: BlitEngine,
  memories: Mutex<HashMap<u32, Arc<Memory>>>,
  xfer_bufs: Mutex<Vec<PoolPtr>>,
  copy_signal: Mutex<Signal>,
}

impl Device {
  /// Brings up the next unclaimed GPU agent: pool discovery, blit
  /// kernel registration, blit engine construction. Fails closed; a
  /// device without a working blit engine is useless.
  pub fn new(platform: &Platform, settings: Settings)
    -> Result<Arc<Device>>
  {
    let ctx = platform.context().clone();
    let claimed = platform.devices.lock().len();
    let agent = ctx.gpu_agents().nth(claimed)
      .ok_or(Error::Hal(hal::Error::InvalidAgent))?
      .clone();

    let local_pool = agent
      .find_pool(|f| f.coarse_grained() && !f.kernel_arg() )
      .ok_or(Error::Hal(hal::Error::InvalidAllocation))?;
    let kernarg_pool = agent
      .find_pool(|f| f.kernel_arg() )
      .ok_or(Error::Hal(hal::Error::InvalidAllocation))?;
    let host_pool = ctx.cpu_agent()
      .find_pool(|f| f.fine_grained() )
      .ok_or(Error::Hal(hal::Error::InvalidAllocation))?;

    let kernels = create_blit_kernels(&agent);
    let blit = BlitEngine::create(&settings, &ctx, kernels)?;

    info!(agent = agent.name(), "device online");
    let dev = Arc::new(Device {
      id: DeviceId(agent.id()),
      ctx,
      agent,
      settings,
      host_pool,
      local_pool,
      kernarg_pool,
      arena: platform.arena().clone(),
      blit,
      memories: Mutex::new(HashMap::new()),
      xfer_bufs: Mutex::new(Vec::new()),
      copy_signal: Mutex::new(Signal::new(0)),
    });
    platform.devices.lock().push(dev.clone());
    Ok(dev)
  }

  pub fn id(&self) -> DeviceId {
    self.id
  }
  pub fn agent(&self) -> &Agent {
    &self.agent
  }
  pub fn ctx(&self) -> &Context {
    &self.ctx
  }
  pub fn settings(&self) -> &Settings {
    &self.settings
  }
  pub fn arena(&self) -> &Arc<MemoryArena> {
    &self.arena
  }
  pub fn blit(&self) -> &BlitEngine {
    &self.blit
  }
  pub(crate) fn kernarg_pool(&self) -> &MemoryPool {
    &self.kernarg_pool
  }

  pub fn create_virtual_gpu(self: &Arc<Self>) -> Result<VirtualGPU> {
    VirtualGPU::new(self.clone())
  }
  pub fn create_host_queue(self: &Arc<Self>) -> Result<HostQueue> {
    HostQueue::new(self.clone())
  }

  /// The device shadow of a mem object, realized on first use. Views
  /// realize their root first and share its allocation.
  pub fn get_memory(&self, id: MemId) -> Result<Arc<Memory>> {
    if let Some(m) = self.memories.lock().get(&id.0) {
      return Ok(m.clone());
    }
    let obj = self.arena.get(id)?;
    let mem = match obj.kind() {
      MemKind::View { .. } => {
        let (root, off) = self.arena.root_of(&obj)?;
        let root_mem = self.get_memory(root.id())?;
        Arc::new(Memory::new(obj.clone(), root,
                             off, root_mem.dev_alloc(), obj.size()))
      },
      _ => {
        let dev = self.local_pool.alloc(obj.size())
          .map_err(|_| Error::MemObjectAllocationFailure )?;
        debug!(id = id.0, size = obj.size(), "realized device shadow");
        Arc::new(Memory::new(obj.clone(), obj.clone(), 0, dev,
                             obj.size()))
      },
    };

    let mut map = self.memories.lock();
    if let Some(existing) = map.get(&id.0) {
      // Raced another realizer; keep theirs.
      if !mem.is_view() {
        let _ = self.local_pool.free(mem.dev_alloc());
      }
      return Ok(existing.clone());
    }
    map.insert(id.0, mem.clone());
    Ok(mem)
  }

  /// Drops this device's shadow and its pinned/staging attachments.
  /// The arena object itself stays alive.
  pub fn free_memory(&self, id: MemId) -> Result<()> {
    let mem = self.memories.lock().remove(&id.0);
    if let Some(mem) = mem {
      if let Some(p) = mem.take_pinned() {
        let _ = self.host_pool.unlock(p);
      }
      if !mem.is_view() {
        self.local_pool.free(mem.dev_alloc())?;
      }
    }
    Ok(())
  }

  /// Makes the device copy current: copies host to device when the
  /// owner version moved and this device is not already the last
  /// writer. Views delegate to their root, parent first.
  pub fn sync_cache_from_host(&self, mem: &Memory) -> Result<()> {
    if mem.is_view() {
      let root = self.get_memory(mem.root().id())?;
      return self.sync_cache_from_host(&root);
    }
    let (version, writer) = {
      let st = mem.owner().state.lock();
      (st.version, st.last_writer)
    };
    if writer == Some(self.id) {
      return Ok(());
    }
    if *mem.version.lock() == version {
      return Ok(());
    }

    let host = self.ensure_pinned(mem)?;
    debug!(id = mem.id().0, version, "syncing device cache from host");
    self.blocking_copy(mem.dev_ptr(), host as *const u8, mem.size())?;
    *mem.version.lock() = version;
    Ok(())
  }

  /// Writes the device copy back when this device was the last writer.
  /// The caller must have drained the queue first.
  pub fn sync_host_from_cache(&self, mem: &Memory) -> Result<()> {
    if mem.is_view() {
      let root = self.get_memory(mem.root().id())?;
      return self.sync_host_from_cache(&root);
    }
    if mem.owner().state.lock().last_writer != Some(self.id) {
      return Ok(());
    }
    let host = self.ensure_pinned(mem)?;
    debug!(id = mem.id().0, "writing device cache back to host");
    self.blocking_copy(host, mem.dev_ptr() as *const u8, mem.size())?;
    mem.owner().state.lock().last_writer = None;
    Ok(())
  }

  /// Records a device-side write: bumps the owner version and takes
  /// last-writer, leaving the host copy stale.
  pub fn mark_device_write(&self, mem: &Memory) -> Result<()> {
    if mem.is_view() {
      let root = self.get_memory(mem.root().id())?;
      return self.mark_device_write(&root);
    }
    let version = {
      let mut st = mem.owner().state.lock();
      st.version += 1;
      st.last_writer = Some(self.id);
      st.version
    };
    *mem.version.lock() = version;
    Ok(())
  }

  fn ensure_pinned(&self, mem: &Memory) -> Result<*mut u8> {
    if let Some(p) = &*mem.pinned.lock() {
      return Ok(p.as_ptr());
    }
    let nn = mem.host_nonnull(&self.arena)?;
    let pinned = unsafe { self.host_pool.lock(nn, mem.size())? };
    let ptr = pinned.as_ptr();
    mem.set_pinned(pinned);
    Ok(ptr)
  }

  /// One synchronous engine copy, spin-waited below the threshold.
  pub(crate) fn blocking_copy(&self, dst: *mut u8, src: *const u8,
                              bytes: usize) -> Result<()> {
    let sig = self.copy_signal.lock();
    sig.silent_store_relaxed(1);
    unsafe {
      self.ctx.async_copy(dst, src, bytes, &[], sig.as_ref())?;
    }
    let state = if bytes <= SPIN_WAIT_MAX_BYTES {
      WaitState::Active
    } else {
      WaitState::Blocked
    };
    sig.wait_scacquire(ConditionOrdering::Equal, 0, None, state);
    Ok(())
  }

  pub(crate) fn acquire_xfer_buf(&self) -> Result<PoolPtr> {
    if let Some(buf) = self.xfer_bufs.lock().pop() {
      return Ok(buf);
    }
    self.host_pool.alloc(self.settings.xfer_buf_size)
      .map_err(|_| Error::OutOfResources )
  }
  pub(crate) fn release_xfer_buf(&self, buf: PoolPtr) {
    self.xfer_bufs.lock().push(buf);
  }

  /// Pins an arbitrary host range, aligned down to the pin granule.
  /// Returns the pin and the byte delta of `ptr` inside it.
  pub(crate) fn pin_host_range(&self, ptr: *mut u8, bytes: usize)
    -> Result<(PinnedPtr, usize)>
  {
    let addr = ptr as usize;
    let base = addr / PINNED_MEMORY_ALIGNMENT * PINNED_MEMORY_ALIGNMENT;
    let delta = addr - base;
    let len = round_up(delta + bytes, PINNED_MEMORY_ALIGNMENT);
    let nn = NonNull::new(base as *mut u8)
      .ok_or(Error::InvalidValue)?;
    let pinned = unsafe { self.host_pool.lock(nn, len)? };
    Ok((pinned, delta))
  }
  pub(crate) fn unpin(&self, pinned: PinnedPtr) {
    let _ = self.host_pool.unlock(pinned);
  }

  pub(crate) fn host_pool(&self) -> &MemoryPool {
    &self.host_pool
  }
}

impl Drop for Device {
  fn drop(&mut self) {
    for (_, mem) in self.memories.get_mut().drain() {
      if let Some(p) = mem.take_pinned() {
        let _ = self.host_pool.unlock(p);
      }
      if !mem.is_view() {
        let _ = self.local_pool.free(mem.dev_alloc());
      }
    }
    for buf in self.xfer_bufs.get_mut().drain(..) {
      let _ = self.host_pool.free(buf);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn device() -> (Platform, Arc<Device>) {
    let p = Platform::new().unwrap();
    let d = Device::new(&p, Settings::default()).unwrap();
    (p, d)
  }

  #[test]
  fn realize_allocates_once() {
    let (p, d) = device();
    let id = p.arena().create_buffer(4096).unwrap();
    let a = d.get_memory(id).unwrap();
    let b = d.get_memory(id).unwrap();
    assert_eq!(a.dev_addr(), b.dev_addr());
    d.free_memory(id).unwrap();
  }

  #[test]
  fn host_write_flows_to_device() {
    let (p, d) = device();
    let id = p.arena().create_buffer_init(&[7u8; 256]).unwrap();
    let mem = d.get_memory(id).unwrap();

    d.sync_cache_from_host(&mem).unwrap();
    let dev = unsafe {
      std::slice::from_raw_parts(mem.dev_ptr() as *const u8, 256)
    };
    assert!(dev.iter().all(|&b| b == 7 ));
  }

  #[test]
  fn unmarked_host_mutation_is_not_synced() {
    let (p, d) = device();
    let id = p.arena().create_buffer_init(&[1u8; 64]).unwrap();
    let obj = p.arena().get(id).unwrap();
    let mem = d.get_memory(id).unwrap();
    d.sync_cache_from_host(&mem).unwrap();

    // Mutate host bytes without marking the write.
    unsafe {
      *p.arena().host_ptr(&obj).unwrap() = 99;
    }
    d.sync_cache_from_host(&mem).unwrap();
    assert_eq!(unsafe { *(mem.dev_ptr() as *const u8) }, 1);

    // Marking it makes the next sync pick it up.
    p.arena().mark_host_write(id).unwrap();
    d.sync_cache_from_host(&mem).unwrap();
    assert_eq!(unsafe { *(mem.dev_ptr() as *const u8) }, 99);
  }

  #[test]
  fn device_write_flows_back_once() {
    let (p, d) = device();
    let id = p.arena().create_buffer(64).unwrap();
    let obj = p.arena().get(id).unwrap();
    let mem = d.get_memory(id).unwrap();

    unsafe { *mem.dev_ptr() = 42 };
    d.mark_device_write(&mem).unwrap();
    // Last writer is this device, so a from-host sync must not clobber.
    d.sync_cache_from_host(&mem).unwrap();
    assert_eq!(unsafe { *(mem.dev_ptr() as *const u8) }, 42);

    d.sync_host_from_cache(&mem).unwrap();
    assert_eq!(unsafe { *p.arena().host_ptr(&obj).unwrap() }, 42);
    assert_eq!(obj.last_writer(), None);
  }

  #[test]
  fn view_sync_goes_through_root() {
    let (p, d) = device();
    let id = p.arena().create_buffer_init(&[5u8; 512]).unwrap();
    let sub = p.arena().create_sub_buffer(id, 128, 64).unwrap();
    let sub_mem = d.get_memory(sub).unwrap();
    let root_mem = d.get_memory(id).unwrap();

    assert_eq!(sub_mem.dev_addr(), root_mem.dev_addr() + 128);
    d.sync_cache_from_host(&sub_mem).unwrap();
    assert_eq!(unsafe { *(sub_mem.dev_ptr() as *const u8) }, 5);
  }
}
