
//! The per-queue execution context: one AQL queue, its kernarg ring, the
//! memory dependency tracker and the barrier machinery.
//!
//! Dispatch headers start at no-sync and are upgraded to a full
//! acquire/release header only when the tracker detects a hazard against
//! an earlier kernel's address ranges, when the tracker overflows, or
//! when the kernel stores program-scope globals. Tests read the queue's
//! retired-header log to check placement.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use hal::packet::{self, BarrierAnd, FenceScope, KernelDispatch, PacketType};
use hal::pool::PoolPtr;
use hal::signal::{ConditionOrdering, Signal, WaitState};
use hal::UserQueue;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernel::{round_up, Kernel, KernelArg, LaunchParams, NdRange,
                    IMPLICIT_ARGS_SIZE};

/// Largest per-dimension grid size one dispatch packet can carry.
pub const MAX_GRID_DIM_SIZE: u64 = 0xFFFF_FFFF;

#[derive(Clone, Copy, Default)]
struct MemoryState {
  start: usize,
  end: usize,
  read_only: bool,
}

/// Bounded tracker of device address ranges referenced by in-flight
/// kernels. `validate` answers "does this access need a sync header";
/// detecting a hazard (or overflowing) also forgets every range belonging
/// to prior kernels, since the sync header orders against all of them.
pub struct MemoryDependency {
  states: Vec<MemoryState>,
  num: usize,
  /// Entries below this index belong to kernels before the current one.
  end: usize,
}

impl MemoryDependency {
  pub fn new(max: usize) -> MemoryDependency {
    MemoryDependency {
      states: vec![MemoryState::default(); max],
      num: 0,
      end: 0,
    }
  }

  /// Starts tracking a new kernel; everything recorded so far becomes
  /// "prior work".
  pub fn new_kernel(&mut self) {
    self.end = self.num;
  }

  /// Records `[start, end)` and reports whether the dispatch needs a
  /// sync header. Read-read overlap is not a hazard. A full tracker is
  /// treated as a hazard: correctness over throughput.
  pub fn validate(&mut self, start: usize, end: usize,
                  read_only: bool) -> bool {
    if self.states.is_empty() {
      // Tracking disabled; every dispatch synchronizes.
      return true;
    }

    let mut flush = false;
    for s in self.states[..self.end].iter() {
      if start < s.end && s.start < end && !(read_only && s.read_only) {
        flush = true;
        break;
      }
    }
    if self.num == self.states.len() {
      flush = true;
    }

    if flush {
      // The sync header orders against all prior kernels; only the
      // current kernel's own ranges stay live.
      self.states.copy_within(self.end..self.num, 0);
      self.num -= self.end;
      self.end = 0;
    }

    if self.num < self.states.len() {
      self.states[self.num] = MemoryState { start, end, read_only };
      self.num += 1;
    }
    flush
  }

  /// Forgets everything; used after a queue drain.
  pub fn clear(&mut self) {
    self.num = 0;
    self.end = 0;
  }

  pub fn tracked(&self) -> usize {
    self.num
  }
}

struct ProfilingSignal {
  signal: Signal,
  submitted_at: Option<Instant>,
}

/// One virtual GPU: an AQL queue plus the state that orders work on it.
/// Not `Sync`; each host queue worker owns one.
pub struct VirtualGPU {
  dev: Arc<Device>,
  queue: UserQueue,
  barrier_signal: Signal,
  signals: Vec<ProfilingSignal>,
  signal_cursor: usize,
  profiling: bool,
  kernarg_buf: PoolPtr,
  kernarg_offset: usize,
  mem_dep: MemoryDependency,
  aql_header: u16,
  pending_dispatch: bool,
  deferred_bufs: Vec<PoolPtr>,
  drains: usize,
}

impl VirtualGPU {
  pub(crate) fn new(dev: Arc<Device>) -> Result<VirtualGPU> {
    let settings = dev.settings();
    let queue = dev.agent().new_kernel_queue(settings.queue_size_log2)?;
    let kernarg_buf = dev.kernarg_pool()
      .alloc(settings.kernarg_pool_size)
      .map_err(|_| Error::OutOfResources )?;
    let signals = (0..settings.signal_pool_size.max(1))
      .map(|_| ProfilingSignal {
        signal: Signal::new(0),
        submitted_at: None,
      })
      .collect();

    Ok(VirtualGPU {
      mem_dep: MemoryDependency::new(settings.num_mem_dependencies),
      dev,
      queue,
      barrier_signal: Signal::new(0),
      signals,
      signal_cursor: 0,
      profiling: false,
      kernarg_buf,
      kernarg_offset: 0,
      aql_header: Self::dispatch_header_no_sync(),
      pending_dispatch: false,
      deferred_bufs: Vec::new(),
      drains: 0,
    })
  }

  pub fn dev(&self) -> &Arc<Device> {
    &self.dev
  }
  pub fn queue(&self) -> &UserQueue {
    &self.queue
  }
  pub fn enable_profiling(&mut self, on: bool) {
    self.profiling = on;
  }
  /// Queue drains issued so far; the kernarg wrap test hinges on this.
  pub fn drains(&self) -> usize {
    self.drains
  }
  pub fn mem_dep(&self) -> &MemoryDependency {
    &self.mem_dep
  }

  pub fn dispatch_header_no_sync() -> u16 {
    packet::header(PacketType::KernelDispatch, FenceScope::None,
                   FenceScope::None, false)
  }
  pub fn dispatch_header_sync() -> u16 {
    packet::header(PacketType::KernelDispatch, FenceScope::System,
                   FenceScope::System, true)
  }

  /// Forces the next dispatch to carry a full sync header. Blit code
  /// calls this when it cannot prove an access is safe.
  pub fn set_aql_header_sync(&mut self) {
    self.aql_header = Self::dispatch_header_sync();
  }

  /// Examines every argument of an upcoming dispatch: synchronizes stale
  /// device shadows from the host, records device writes and runs the
  /// ranges through the hazard tracker, deciding the dispatch header.
  pub fn process_mem_objects(&mut self, kernel: &Kernel,
                             params: &LaunchParams) -> Result<()> {
    self.aql_header = Self::dispatch_header_no_sync();
    self.mem_dep.new_kernel();
    let mut sync = kernel.has_global_stores;
    let dev = self.dev.clone();

    for arg in params.args.iter() {
      let (id, write) = match arg {
        KernelArg::Mem { id, write } => (*id, *write),
        KernelArg::Svm { ptr, mem, write } => {
          match mem {
            Some(id) => (*id, *write),
            None => {
              if !dev.settings().fine_grain_system {
                return Err(Error::InvalidKernelArgs);
              }
              // Unknown extent; order against everything.
              trace!(ptr, "raw svm pointer, forcing sync");
              sync = true;
              continue;
            },
          }
        },
        KernelArg::Value(_) => {
          continue;
        },
      };

      let mem = dev.get_memory(id)?;
      dev.sync_cache_from_host(&mem)?;
      if write {
        dev.mark_device_write(&mem)?;
      }
      let (start, end) = mem.dev_range();
      if self.mem_dep.validate(start, end, !write) {
        sync = true;
      }
    }

    if sync {
      self.set_aql_header_sync();
    }
    Ok(())
  }

  /// The complete dispatch path: memory processing, argument marshaling,
  /// workgroup selection, grid splitting and packet submission.
  pub fn submit_kernel_internal(&mut self, sizes: &NdRange,
                                kernel: &Kernel,
                                params: &LaunchParams) -> Result<()> {
    self.process_mem_objects(kernel, params)?;

    let wg = self.pick_workgroup(sizes, kernel);
    let (block, implicit_off) = marshal_args(&self.dev, params)?;

    // Per-dimension sub-grid size: the largest workgroup multiple that
    // fits the packet's 32 bit grid field.
    let mut chunk = [0u64; 3];
    for d in 0..3 {
      let w = wg[d] as u64;
      chunk[d] = (MAX_GRID_DIM_SIZE / w * w).max(w);
    }

    let mut z0 = 0;
    while z0 < sizes.global[2] {
      let gz = chunk[2].min(sizes.global[2] - z0);
      let mut y0 = 0;
      while y0 < sizes.global[1] {
        let gy = chunk[1].min(sizes.global[1] - y0);
        let mut x0 = 0;
        while x0 < sizes.global[0] {
          let gx = chunk[0].min(sizes.global[0] - x0);

          // Each sub-dispatch gets its own kernarg block; the hidden
          // offset words differ.
          let off = self.alloc_kernarg(block.len(),
                                       kernel.kernarg_align)?;
          let kptr = self.kernarg_buf.offset(off);
          unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), kptr,
                                          block.len());
          }
          let offsets = [
            sizes.offset[0] + x0,
            sizes.offset[1] + y0,
            sizes.offset[2] + z0,
          ];
          for (i, o) in offsets.iter().enumerate() {
            unsafe {
              std::ptr::copy_nonoverlapping(
                o.to_le_bytes().as_ptr(),
                kptr.add(implicit_off + i * 8), 8);
            }
          }

          self.enqueue_dispatch(kernel, sizes.dims, [gx, gy, gz], wg,
                                kptr as u64);
          x0 += gx;
        }
        y0 += gy;
      }
      z0 += gz;
    }
    Ok(())
  }

  /// Blit-path dispatch: ranges are already known, arguments are a
  /// prebuilt block, the grid is always packet-sized.
  pub(crate) fn dispatch_blit_kernel(&mut self, kernel: &Kernel,
                                     dims: u16, grid: [u64; 3],
                                     args: &[u8],
                                     ranges: &[(usize, usize, bool)])
    -> Result<()>
  {
    self.aql_header = Self::dispatch_header_no_sync();
    self.mem_dep.new_kernel();
    let mut sync = false;
    for &(start, end, read_only) in ranges {
      if self.mem_dep.validate(start, end, read_only) {
        sync = true;
      }
    }
    if sync {
      self.set_aql_header_sync();
    }

    let off = self.alloc_kernarg(args.len(), kernel.kernarg_align)?;
    let kptr = self.kernarg_buf.offset(off);
    unsafe {
      std::ptr::copy_nonoverlapping(args.as_ptr(), kptr, args.len());
    }

    let range = NdRange {
      dims,
      global: grid,
      offset: [0; 3],
      local: None,
    };
    let wg = self.pick_workgroup(&range, kernel);
    self.enqueue_dispatch(kernel, dims, grid, wg, kptr as u64);
    Ok(())
  }

  fn pick_workgroup(&self, sizes: &NdRange, kernel: &Kernel) -> [u16; 3] {
    let wg = sizes.local
      .or(kernel.compiled_workgroup_size)
      .unwrap_or(match sizes.dims {
        1 => [256, 1, 1],
        2 => [16, 16, 1],
        _ => [8, 8, 4],
      });
    // Never larger than the grid itself.
    let mut out = [1u16; 3];
    for d in 0..3 {
      out[d] = (wg[d] as u64).min(sizes.global[d].max(1)) as u16;
    }
    out
  }

  fn enqueue_dispatch(&mut self, kernel: &Kernel, dims: u16,
                      grid: [u64; 3], wg: [u16; 3], kernarg: u64) {
    debug_assert!(grid.iter().all(|&g| g <= MAX_GRID_DIM_SIZE ));
    let completion = if self.profiling {
      self.next_profiling_signal()
    } else {
      0
    };
    let d = KernelDispatch {
      setup_dims: dims,
      workgroup_size: wg,
      grid_size: [grid[0] as u32, grid[1] as u32, grid[2] as u32],
      private_segment_size: kernel.private_segment_size,
      group_segment_size: kernel.group_segment_size,
      kernel_object: kernel.object.0,
      kernarg_address: kernarg,
      completion_signal: completion,
    };
    trace!(kernel = %kernel.name, hdr = self.aql_header,
           "submitting dispatch");
    self.queue.enqueue_kernel_dispatch(self.aql_header, &d);
    self.pending_dispatch = true;
  }

  /// Recycles the next pooled completion signal, waiting out its
  /// previous use.
  fn next_profiling_signal(&mut self) -> u64 {
    let i = self.signal_cursor;
    self.signal_cursor = (i + 1) % self.signals.len();
    let s = &mut self.signals[i];
    s.signal.wait_scacquire(ConditionOrdering::Equal, 0, None,
                            WaitState::Blocked);
    s.signal.silent_store_relaxed(1);
    s.submitted_at = Some(Instant::now());
    s.signal.raw_handle()
  }

  /// Bump allocation from the kernarg ring. Wrapping requires a queue
  /// drain: earlier regions may still be read by in-flight packets.
  fn alloc_kernarg(&mut self, bytes: usize, align: usize)
    -> Result<usize>
  {
    let align = align.max(16);
    let mut off = round_up(self.kernarg_offset, align);
    if off + bytes > self.kernarg_buf.len() {
      debug!(bytes, "kernarg ring wrap");
      self.release_gpu_memory_fence()?;
      off = 0;
      if bytes > self.kernarg_buf.len() {
        return Err(Error::OutOfResources);
      }
    }
    self.kernarg_offset = off + bytes;
    Ok(off)
  }

  /// Drains the queue: a system-scope barrier packet, waited to
  /// completion. Afterward every prior store is host-visible, the
  /// tracker and kernarg ring are empty and deferred staging buffers go
  /// back to their pool.
  pub fn release_gpu_memory_fence(&mut self) -> Result<()> {
    if self.pending_dispatch {
      self.barrier_signal.silent_store_relaxed(1);
      let b = BarrierAnd {
        dep_signals: [0; 5],
        completion_signal: self.barrier_signal.raw_handle(),
      };
      self.queue.enqueue_barrier_and(
        packet::header(PacketType::BarrierAnd, FenceScope::System,
                       FenceScope::System, true), &b);
      self.barrier_signal.wait_scacquire(ConditionOrdering::Equal, 0,
                                         None, WaitState::Blocked);
      self.pending_dispatch = false;
      self.drains += 1;
      self.mem_dep.clear();
      self.kernarg_offset = 0;
    }
    for buf in self.deferred_bufs.drain(..) {
      self.dev.release_xfer_buf(buf);
    }
    Ok(())
  }

  /// Defers returning a staging buffer until in-flight packets that may
  /// reference it have retired.
  pub(crate) fn add_deferred_buf(&mut self, buf: PoolPtr) {
    self.deferred_bufs.push(buf);
  }
}

impl Drop for VirtualGPU {
  fn drop(&mut self) {
    let _ = self.release_gpu_memory_fence();
    let _ = self.dev.kernarg_pool().free(self.kernarg_buf);
  }
}

fn marshal_args(dev: &Device, params: &LaunchParams)
  -> Result<(Vec<u8>, usize)>
{
  let mut block: Vec<u8> = Vec::with_capacity(64);
  for arg in params.args.iter() {
    match arg {
      KernelArg::Mem { id, .. } => {
        let mem = dev.get_memory(*id)?;
        push_aligned(&mut block, &(mem.dev_addr() as u64).to_le_bytes(),
                     8);
      },
      KernelArg::Svm { ptr, .. } => {
        push_aligned(&mut block, &(*ptr as u64).to_le_bytes(), 8);
      },
      KernelArg::Value(bytes) => {
        let align = bytes.len().next_power_of_two().max(1).min(16);
        push_aligned(&mut block, bytes, align);
      },
    }
  }
  let implicit_off = round_up(block.len(), 8);
  block.resize(implicit_off + IMPLICIT_ARGS_SIZE, 0);
  Ok((block, implicit_off))
}

fn push_aligned(block: &mut Vec<u8>, bytes: &[u8], align: usize) {
  let off = round_up(block.len(), align);
  block.resize(off, 0);
  block.extend_from_slice(bytes);
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn read_read_overlap_is_not_a_hazard() {
    let mut dep = MemoryDependency::new(8);
    dep.new_kernel();
    assert!(!dep.validate(0x1000, 0x2000, true));
    dep.new_kernel();
    assert!(!dep.validate(0x1800, 0x2800, true));
    assert_eq!(dep.tracked(), 2);
  }

  #[test]
  fn write_overlap_is_a_hazard() {
    let mut dep = MemoryDependency::new(8);
    dep.new_kernel();
    assert!(!dep.validate(0x1000, 0x2000, false));
    dep.new_kernel();
    assert!(dep.validate(0x1800, 0x2800, true));
  }

  #[test]
  fn disjoint_writes_do_not_flush() {
    let mut dep = MemoryDependency::new(8);
    dep.new_kernel();
    assert!(!dep.validate(0x1000, 0x2000, false));
    dep.new_kernel();
    assert!(!dep.validate(0x2000, 0x3000, false));
  }

  #[test]
  fn current_kernel_entries_survive_flush() {
    let mut dep = MemoryDependency::new(8);
    dep.new_kernel();
    assert!(!dep.validate(0x1000, 0x2000, false));
    dep.new_kernel();
    // Own first range, then a hazard against the prior kernel.
    assert!(!dep.validate(0x8000, 0x9000, false));
    assert!(dep.validate(0x1000, 0x1100, false));
    // Prior kernel's range dropped; both of ours kept.
    assert_eq!(dep.tracked(), 2);
    // Re-validating the prior range now sees no hazard from it.
    dep.new_kernel();
    assert!(dep.validate(0x8000, 0x8100, false));
  }

  #[test]
  fn full_tracker_goes_conservative() {
    let mut dep = MemoryDependency::new(2);
    dep.new_kernel();
    assert!(!dep.validate(0x1000, 0x1100, true));
    dep.new_kernel();
    assert!(!dep.validate(0x2000, 0x2100, true));
    dep.new_kernel();
    // Disjoint and read-only, but the table is full.
    assert!(dep.validate(0x3000, 0x3100, true));
  }

  #[test]
  fn zero_capacity_always_syncs() {
    let mut dep = MemoryDependency::new(0);
    dep.new_kernel();
    assert!(dep.validate(0x1000, 0x1100, true));
  }
}
