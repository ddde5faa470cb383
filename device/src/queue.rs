
//! In-order host command queues.
//!
//! A `HostQueue` owns one worker thread and one `VirtualGPU`. Commands
//! are executed strictly in submission order, so a completed event also
//! orders every earlier command on the same queue. Cross-queue ordering
//! goes through event wait lists.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{Builder as ThreadBuilder, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::blit::BufferRect;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, LaunchParams, NdRange};
use crate::memory::{FillColor, MemId};
use crate::virtual_gpu::VirtualGPU;

/// OpenCL execution status and error codes, as the embedder reports
/// them. Statuses count down to `CL_COMPLETE`; negatives are errors.
pub mod cl {
  pub const CL_COMPLETE: i32 = 0x0;
  pub const CL_RUNNING: i32 = 0x1;
  pub const CL_SUBMITTED: i32 = 0x2;
  pub const CL_QUEUED: i32 = 0x3;

  pub const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
  pub const CL_OUT_OF_RESOURCES: i32 = -5;
  pub const CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
  pub const CL_INVALID_VALUE: i32 = -30;
  pub const CL_INVALID_MEM_OBJECT: i32 = -38;
  pub const CL_INVALID_KERNEL_ARGS: i32 = -52;
  pub const CL_INVALID_OPERATION: i32 = -59;
}

/// Completion handle for one enqueued command.
pub struct Event {
  status: AtomicI32,
  lock: Mutex<()>,
  cond: Condvar,
  /// Host pointer produced by a map command; zero otherwise.
  mapped: AtomicUsize,
}

impl Event {
  pub(crate) fn new() -> Arc<Event> {
    Arc::new(Event {
      status: AtomicI32::new(cl::CL_QUEUED),
      lock: Mutex::new(()),
      cond: Condvar::new(),
      mapped: AtomicUsize::new(0),
    })
  }

  pub fn status(&self) -> i32 {
    self.status.load(Ordering::Acquire)
  }
  pub fn is_complete(&self) -> bool {
    self.status() <= cl::CL_COMPLETE
  }

  /// Blocks until the command settles; returns the final status,
  /// `CL_COMPLETE` or a negative error code.
  pub fn wait(&self) -> i32 {
    let mut guard = self.lock.lock();
    loop {
      let st = self.status.load(Ordering::Acquire);
      if st <= cl::CL_COMPLETE {
        return st;
      }
      self.cond.wait(&mut guard);
    }
  }

  /// The pointer a completed map command produced.
  pub fn mapped_ptr(&self) -> *mut u8 {
    self.mapped.load(Ordering::Acquire) as *mut u8
  }

  pub(crate) fn set_status(&self, st: i32) {
    let _guard = self.lock.lock();
    self.status.store(st, Ordering::Release);
    if st <= cl::CL_COMPLETE {
      self.cond.notify_all();
    }
  }
  fn set_mapped(&self, ptr: *mut u8) {
    self.mapped.store(ptr as usize, Ordering::Release);
  }
}

/// Raw host pointer carried across the worker channel. The embedder
/// guarantees the range outlives the command, per the map/read/write
/// contracts.
struct HostMem(*mut u8);
unsafe impl Send for HostMem { }

pub(crate) enum Command {
  ReadBuffer {
    src: MemId,
    dst: HostMem,
    origin: usize,
    size: usize,
  },
  WriteBuffer {
    src: HostMem,
    dst: MemId,
    origin: usize,
    size: usize,
  },
  CopyBuffer {
    src: MemId,
    dst: MemId,
    src_origin: usize,
    dst_origin: usize,
    size: usize,
  },
  FillBuffer {
    dst: MemId,
    pattern: Vec<u8>,
    origin: usize,
    size: usize,
  },
  ReadBufferRect {
    src: MemId,
    dst: HostMem,
    buf_rect: BufferRect,
    host_rect: BufferRect,
    region: [usize; 3],
  },
  WriteBufferRect {
    src: HostMem,
    dst: MemId,
    host_rect: BufferRect,
    buf_rect: BufferRect,
    region: [usize; 3],
  },
  CopyBufferRect {
    src: MemId,
    dst: MemId,
    src_rect: BufferRect,
    dst_rect: BufferRect,
    region: [usize; 3],
  },
  ReadImage {
    src: MemId,
    dst: HostMem,
    origin: [usize; 3],
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
  },
  WriteImage {
    src: HostMem,
    dst: MemId,
    origin: [usize; 3],
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
  },
  CopyImage {
    src: MemId,
    dst: MemId,
    src_origin: [usize; 3],
    dst_origin: [usize; 3],
    region: [usize; 3],
  },
  CopyImageToBuffer {
    src: MemId,
    dst: MemId,
    origin: [usize; 3],
    region: [usize; 3],
    dst_origin: usize,
  },
  CopyBufferToImage {
    src: MemId,
    dst: MemId,
    src_origin: usize,
    origin: [usize; 3],
    region: [usize; 3],
  },
  FillImage {
    dst: MemId,
    color: FillColor,
    origin: [usize; 3],
    region: [usize; 3],
  },
  MapMemory {
    mem: MemId,
    write: bool,
  },
  UnmapMemory {
    mem: MemId,
  },
  Kernel {
    kernel: Arc<Kernel>,
    range: NdRange,
    params: LaunchParams,
  },
  Migrate {
    mems: Vec<MemId>,
  },
  Finish,
  Quit,
}

struct Envelope {
  cmd: Command,
  waits: Vec<Arc<Event>>,
  event: Arc<Event>,
}

pub struct HostQueue {
  tx: Sender<Envelope>,
  worker: Option<JoinHandle<()>>,
}

impl HostQueue {
  pub(crate) fn new(dev: Arc<Device>) -> Result<HostQueue> {
    let gpu = dev.create_virtual_gpu()?;
    let (tx, rx) = channel();
    let worker = ThreadBuilder::new()
      .name("rocl-host-queue".into())
      .spawn(move || {
        worker_loop(dev, gpu, rx);
      })
      .map_err(|_| Error::OutOfResources )?;
    Ok(HostQueue {
      tx,
      worker: Some(worker),
    })
  }

  fn push(&self, cmd: Command, waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    let event = Event::new();
    let env = Envelope {
      cmd,
      waits: waits.to_vec(),
      event: event.clone(),
    };
    self.tx.send(env)
      .map_err(|_| Error::InvalidOperation )?;
    Ok(event)
  }

  /// # Safety
  /// `dst..dst+size` must stay valid and unaliased until the returned
  /// event completes.
  pub unsafe fn enqueue_read_buffer(&self, src: MemId, dst: *mut u8,
                                    origin: usize, size: usize,
                                    waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::ReadBuffer {
      src,
      dst: HostMem(dst),
      origin,
      size,
    }, waits)
  }

  /// # Safety
  /// `src..src+size` must stay valid until the returned event completes.
  pub unsafe fn enqueue_write_buffer(&self, src: *const u8, dst: MemId,
                                     origin: usize, size: usize,
                                     waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::WriteBuffer {
      src: HostMem(src as *mut u8),
      dst,
      origin,
      size,
    }, waits)
  }

  pub fn enqueue_copy_buffer(&self, src: MemId, dst: MemId,
                             src_origin: usize, dst_origin: usize,
                             size: usize, waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::CopyBuffer {
      src, dst, src_origin, dst_origin, size,
    }, waits)
  }

  pub fn enqueue_fill_buffer(&self, dst: MemId, pattern: &[u8],
                             origin: usize, size: usize,
                             waits: &[Arc<Event>]) -> Result<Arc<Event>> {
    if pattern.is_empty() {
      return Err(Error::InvalidValue);
    }
    self.push(Command::FillBuffer {
      dst,
      pattern: pattern.to_vec(),
      origin,
      size,
    }, waits)
  }

  /// # Safety
  /// The host window described by `host_rect`/`region` must stay valid
  /// until the returned event completes.
  pub unsafe fn enqueue_read_buffer_rect(&self, src: MemId, dst: *mut u8,
                                         buf_rect: BufferRect,
                                         host_rect: BufferRect,
                                         region: [usize; 3],
                                         waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::ReadBufferRect {
      src,
      dst: HostMem(dst),
      buf_rect,
      host_rect,
      region,
    }, waits)
  }

  /// # Safety
  /// The host window described by `host_rect`/`region` must stay valid
  /// until the returned event completes.
  pub unsafe fn enqueue_write_buffer_rect(&self, src: *const u8,
                                          dst: MemId,
                                          host_rect: BufferRect,
                                          buf_rect: BufferRect,
                                          region: [usize; 3],
                                          waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::WriteBufferRect {
      src: HostMem(src as *mut u8),
      dst,
      host_rect,
      buf_rect,
      region,
    }, waits)
  }

  pub fn enqueue_copy_buffer_rect(&self, src: MemId, dst: MemId,
                                  src_rect: BufferRect,
                                  dst_rect: BufferRect,
                                  region: [usize; 3],
                                  waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::CopyBufferRect {
      src, dst, src_rect, dst_rect, region,
    }, waits)
  }

  /// # Safety
  /// The pitched host window must stay valid until the returned event
  /// completes.
  pub unsafe fn enqueue_read_image(&self, src: MemId, dst: *mut u8,
                                   origin: [usize; 3], region: [usize; 3],
                                   row_pitch: usize, slice_pitch: usize,
                                   waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::ReadImage {
      src,
      dst: HostMem(dst),
      origin,
      region,
      row_pitch,
      slice_pitch,
    }, waits)
  }

  /// # Safety
  /// The pitched host window must stay valid until the returned event
  /// completes.
  pub unsafe fn enqueue_write_image(&self, src: *const u8, dst: MemId,
                                    origin: [usize; 3],
                                    region: [usize; 3], row_pitch: usize,
                                    slice_pitch: usize,
                                    waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::WriteImage {
      src: HostMem(src as *mut u8),
      dst,
      origin,
      region,
      row_pitch,
      slice_pitch,
    }, waits)
  }

  pub fn enqueue_copy_image(&self, src: MemId, dst: MemId,
                            src_origin: [usize; 3],
                            dst_origin: [usize; 3], region: [usize; 3],
                            waits: &[Arc<Event>]) -> Result<Arc<Event>> {
    self.push(Command::CopyImage {
      src, dst, src_origin, dst_origin, region,
    }, waits)
  }

  pub fn enqueue_copy_image_to_buffer(&self, src: MemId, dst: MemId,
                                      origin: [usize; 3],
                                      region: [usize; 3],
                                      dst_origin: usize,
                                      waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::CopyImageToBuffer {
      src, dst, origin, region, dst_origin,
    }, waits)
  }

  pub fn enqueue_copy_buffer_to_image(&self, src: MemId, dst: MemId,
                                      src_origin: usize,
                                      origin: [usize; 3],
                                      region: [usize; 3],
                                      waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::CopyBufferToImage {
      src, dst, src_origin, origin, region,
    }, waits)
  }

  pub fn enqueue_fill_image(&self, dst: MemId, color: FillColor,
                            origin: [usize; 3], region: [usize; 3],
                            waits: &[Arc<Event>]) -> Result<Arc<Event>> {
    self.push(Command::FillImage {
      dst, color, origin, region,
    }, waits)
  }

  /// Maps the object into host memory. The completed event carries the
  /// host pointer; a write map must be paired with `enqueue_unmap`.
  pub fn enqueue_map(&self, mem: MemId, write: bool,
                     waits: &[Arc<Event>]) -> Result<Arc<Event>> {
    self.push(Command::MapMemory { mem, write }, waits)
  }

  pub fn enqueue_unmap(&self, mem: MemId, waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::UnmapMemory { mem }, waits)
  }

  pub fn enqueue_kernel(&self, kernel: Arc<Kernel>, range: NdRange,
                        params: LaunchParams, waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::Kernel { kernel, range, params }, waits)
  }

  /// Realizes the objects on this queue's device ahead of use.
  pub fn enqueue_migrate(&self, mems: &[MemId], waits: &[Arc<Event>])
    -> Result<Arc<Event>>
  {
    self.push(Command::Migrate { mems: mems.to_vec() }, waits)
  }

  /// Drains the queue: every earlier command has completed and its
  /// device writes are observable when this returns.
  pub fn finish(&self) -> Result<()> {
    let event = self.push(Command::Finish, &[])?;
    let st = event.wait();
    if st < 0 {
      return Err(Error::InvalidOperation);
    }
    Ok(())
  }
}

impl Drop for HostQueue {
  fn drop(&mut self) {
    let _ = self.push(Command::Quit, &[]);
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

fn worker_loop(dev: Arc<Device>, mut gpu: VirtualGPU,
               rx: Receiver<Envelope>) {
  while let Ok(env) = rx.recv() {
    if let Command::Quit = env.cmd {
      env.event.set_status(cl::CL_COMPLETE);
      break;
    }
    env.event.set_status(cl::CL_SUBMITTED);

    let mut gated = false;
    for wait in &env.waits {
      if wait.wait() < 0 {
        env.event.set_status(
          cl::CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
        gated = true;
        break;
      }
    }
    if gated {
      continue;
    }

    env.event.set_status(cl::CL_RUNNING);
    match execute(&dev, &mut gpu, env.cmd, &env.event) {
      Ok(()) => {
        env.event.set_status(cl::CL_COMPLETE);
      },
      Err(err) => {
        error!("queue command failed: {}", err);
        env.event.set_status(err.cl_status());
      },
    }
  }
  trace!("host queue worker exiting");
}

fn execute(dev: &Arc<Device>, gpu: &mut VirtualGPU, cmd: Command,
           event: &Arc<Event>) -> Result<()> {
  let blit = dev.blit();
  match cmd {
    Command::ReadBuffer { src, dst, origin, size } => {
      let mem = dev.get_memory(src)?;
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.read_buffer(dev, gpu, &mem, dst.0, origin, size)?;
      }
    },
    Command::WriteBuffer { src, dst, origin, size } => {
      let mem = dev.get_memory(dst)?;
      // Partial writes merge into existing content.
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.write_buffer(dev, gpu, src.0 as *const u8, &mem, origin,
                          size)?;
      }
      dev.mark_device_write(&mem)?;
    },
    Command::CopyBuffer { src, dst, src_origin, dst_origin, size } => {
      let src = dev.get_memory(src)?;
      let dst = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&src)?;
      dev.sync_cache_from_host(&dst)?;
      blit.copy_buffer(gpu, &src, &dst, src_origin, dst_origin, size)?;
      dev.mark_device_write(&dst)?;
    },
    Command::FillBuffer { dst, pattern, origin, size } => {
      let mem = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&mem)?;
      blit.fill_buffer(gpu, &mem, &pattern, origin, size)?;
      dev.mark_device_write(&mem)?;
    },
    Command::ReadBufferRect { src, dst, buf_rect, host_rect, region } => {
      let mem = dev.get_memory(src)?;
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.read_buffer_rect(dev, gpu, &mem, dst.0, &buf_rect,
                              &host_rect, region)?;
      }
    },
    Command::WriteBufferRect { src, dst, host_rect, buf_rect,
                               region } => {
      let mem = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.write_buffer_rect(dev, gpu, src.0 as *const u8, &mem,
                               &host_rect, &buf_rect, region)?;
      }
      dev.mark_device_write(&mem)?;
    },
    Command::CopyBufferRect { src, dst, src_rect, dst_rect, region } => {
      let src = dev.get_memory(src)?;
      let dst = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&src)?;
      dev.sync_cache_from_host(&dst)?;
      blit.copy_buffer_rect(gpu, &src, &dst, &src_rect, &dst_rect,
                            region)?;
      dev.mark_device_write(&dst)?;
    },
    Command::ReadImage { src, dst, origin, region, row_pitch,
                         slice_pitch } => {
      let mem = dev.get_memory(src)?;
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.read_image(dev, gpu, &mem, dst.0, origin, region,
                        row_pitch, slice_pitch)?;
      }
    },
    Command::WriteImage { src, dst, origin, region, row_pitch,
                          slice_pitch } => {
      let mem = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&mem)?;
      unsafe {
        blit.write_image(dev, gpu, src.0 as *const u8, &mem, origin,
                         region, row_pitch, slice_pitch)?;
      }
      dev.mark_device_write(&mem)?;
    },
    Command::CopyImage { src, dst, src_origin, dst_origin, region } => {
      let src = dev.get_memory(src)?;
      let dst = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&src)?;
      dev.sync_cache_from_host(&dst)?;
      blit.copy_image(dev, gpu, &src, &dst, src_origin, dst_origin,
                      region)?;
      dev.mark_device_write(&dst)?;
    },
    Command::CopyImageToBuffer { src, dst, origin, region,
                                 dst_origin } => {
      let src = dev.get_memory(src)?;
      let dst = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&src)?;
      dev.sync_cache_from_host(&dst)?;
      blit.copy_image_to_buffer(dev, gpu, &src, &dst, origin, region,
                                dst_origin)?;
      dev.mark_device_write(&dst)?;
    },
    Command::CopyBufferToImage { src, dst, src_origin, origin,
                                 region } => {
      let src = dev.get_memory(src)?;
      let dst = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&src)?;
      dev.sync_cache_from_host(&dst)?;
      blit.copy_buffer_to_image(dev, gpu, &src, &dst, src_origin,
                                origin, region)?;
      dev.mark_device_write(&dst)?;
    },
    Command::FillImage { dst, color, origin, region } => {
      let mem = dev.get_memory(dst)?;
      dev.sync_cache_from_host(&mem)?;
      blit.fill_image(dev, gpu, &mem, &color, origin, region)?;
      dev.mark_device_write(&mem)?;
    },
    Command::MapMemory { mem, write } => {
      let shadow = dev.get_memory(mem)?;
      // Settle in-flight device writes before exposing host bytes.
      gpu.release_gpu_memory_fence()?;
      dev.sync_host_from_cache(&shadow)?;
      let obj = dev.arena().get(mem)?;
      let ptr = dev.arena().host_ptr(&obj)?;
      {
        let mut map = shadow.indirect.lock();
        map.count += 1;
        if write {
          map.writers += 1;
        }
      }
      event.set_mapped(ptr);
    },
    Command::UnmapMemory { mem } => {
      let shadow = dev.get_memory(mem)?;
      let write = {
        let mut map = shadow.indirect.lock();
        if map.count == 0 {
          return Err(Error::InvalidOperation);
        }
        map.count -= 1;
        if map.writers > 0 {
          map.writers -= 1;
          true
        } else {
          false
        }
      };
      if write {
        dev.arena().mark_host_write(mem)?;
      }
    },
    Command::Kernel { kernel, range, params } => {
      gpu.submit_kernel_internal(&range, &kernel, &params)?;
      // Completion must imply the kernel's writes are observable.
      gpu.release_gpu_memory_fence()?;
    },
    Command::Migrate { mems } => {
      for id in mems {
        let mem = dev.get_memory(id)?;
        dev.sync_cache_from_host(&mem)?;
      }
    },
    Command::Finish => {
      gpu.release_gpu_memory_fence()?;
    },
    Command::Quit => { },
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn event_starts_queued() {
    let e = Event::new();
    assert_eq!(e.status(), cl::CL_QUEUED);
    assert!(!e.is_complete());
  }

  #[test]
  fn error_status_counts_as_settled() {
    let e = Event::new();
    e.set_status(cl::CL_INVALID_VALUE);
    assert!(e.is_complete());
    assert_eq!(e.wait(), cl::CL_INVALID_VALUE);
  }

  #[test]
  fn wait_unblocks_on_completion() {
    let e = Event::new();
    let waiter = {
      let e = e.clone();
      std::thread::spawn(move || e.wait() )
    };
    std::thread::sleep(std::time::Duration::from_millis(10));
    e.set_status(cl::CL_COMPLETE);
    assert_eq!(waiter.join().unwrap(), cl::CL_COMPLETE);
  }
}
