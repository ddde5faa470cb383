
//! Dispatch-path behavior observed through the queue's header log:
//! fence placement, hazard tracking, kernarg ring wrapping and grid
//! splitting.

use std::sync::Arc;

use parking_lot::Mutex;

use hal::packet::{header_barrier, header_scacquire, header_screlease,
                  header_type, FenceScope, PacketType};

use rocl_device::kernel::KernelArg;
use rocl_device::{Device, Kernel, LaunchParams, NdRange, Platform,
                  Settings, VirtualGPU};

fn setup(settings: Settings) -> (Platform, Arc<Device>, VirtualGPU) {
  let p = Platform::new().unwrap();
  let d = Device::new(&p, settings).unwrap();
  let gpu = d.create_virtual_gpu().unwrap();
  (p, d, gpu)
}

fn noop_kernel(dev: &Device) -> Kernel {
  Kernel::new("noop", dev.agent().register_kernel(|_| { }))
}

fn dispatch_headers(gpu: &VirtualGPU) -> Vec<u16> {
  gpu.queue().header_log().into_iter()
    .filter(|&h| header_type(h) == Some(PacketType::KernelDispatch) )
    .collect()
}

fn assert_no_sync(h: u16) {
  assert!(!header_barrier(h));
  assert_eq!(header_scacquire(h), FenceScope::None);
  assert_eq!(header_screlease(h), FenceScope::None);
}

fn assert_sync(h: u16) {
  assert!(header_barrier(h));
  assert_eq!(header_scacquire(h), FenceScope::System);
  assert_eq!(header_screlease(h), FenceScope::System);
}

#[test]
fn independent_writes_stay_unfenced() {
  let (p, d, mut gpu) = setup(Settings::default());
  let k = noop_kernel(&d);
  let a = p.arena().create_buffer(4096).unwrap();
  let b = p.arena().create_buffer(4096).unwrap();

  for id in [a, b].iter() {
    let params = LaunchParams::new(vec![KernelArg::mem(*id)]);
    gpu.submit_kernel_internal(&NdRange::one(64), &k, &params).unwrap();
  }
  gpu.release_gpu_memory_fence().unwrap();

  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 2);
  assert_no_sync(hdrs[0]);
  assert_no_sync(hdrs[1]);
}

#[test]
fn read_after_write_forces_sync_header() {
  let (p, d, mut gpu) = setup(Settings::default());
  let k = noop_kernel(&d);
  let a = p.arena().create_buffer(4096).unwrap();

  let w = LaunchParams::new(vec![KernelArg::mem(a)]);
  gpu.submit_kernel_internal(&NdRange::one(64), &k, &w).unwrap();
  let r = LaunchParams::new(vec![KernelArg::mem_read_only(a)]);
  gpu.submit_kernel_internal(&NdRange::one(64), &k, &r).unwrap();
  gpu.release_gpu_memory_fence().unwrap();

  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 2);
  assert_no_sync(hdrs[0]);
  assert_sync(hdrs[1]);
}

#[test]
fn read_after_read_stays_unfenced() {
  let (p, d, mut gpu) = setup(Settings::default());
  let k = noop_kernel(&d);
  let a = p.arena().create_buffer(4096).unwrap();

  for _ in 0..2 {
    let params = LaunchParams::new(vec![KernelArg::mem_read_only(a)]);
    gpu.submit_kernel_internal(&NdRange::one(64), &k, &params).unwrap();
  }
  gpu.release_gpu_memory_fence().unwrap();

  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 2);
  assert_no_sync(hdrs[0]);
  assert_no_sync(hdrs[1]);
}

#[test]
fn full_tracker_forces_sync_dispatch() {
  let settings = Settings {
    num_mem_dependencies: 1,
    ..Settings::default()
  };
  let (p, d, mut gpu) = setup(settings);
  let k = noop_kernel(&d);
  let a = p.arena().create_buffer(4096).unwrap();
  let b = p.arena().create_buffer(4096).unwrap();

  for id in [a, b].iter() {
    let params = LaunchParams::new(vec![KernelArg::mem(*id)]);
    gpu.submit_kernel_internal(&NdRange::one(64), &k, &params).unwrap();
  }
  gpu.release_gpu_memory_fence().unwrap();

  // Disjoint ranges, but the second one no longer fits the tracker.
  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 2);
  assert_no_sync(hdrs[0]);
  assert_sync(hdrs[1]);
}

#[test]
fn global_stores_always_sync() {
  let (_p, d, mut gpu) = setup(Settings::default());
  let mut k = noop_kernel(&d);
  k.has_global_stores = true;

  let params = LaunchParams::default();
  gpu.submit_kernel_internal(&NdRange::one(1), &k, &params).unwrap();
  gpu.release_gpu_memory_fence().unwrap();

  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 1);
  assert_sync(hdrs[0]);
}

#[test]
fn kernarg_ring_wrap_drains_exactly_once() {
  let settings = Settings {
    kernarg_pool_size: 256,
    ..Settings::default()
  };
  let (_p, d, mut gpu) = setup(settings);
  let k = noop_kernel(&d);

  // An argless dispatch takes 24 bytes at 16 byte alignment; eight fit
  // the 256 byte ring, the ninth wraps.
  for _ in 0..8 {
    gpu.submit_kernel_internal(&NdRange::one(1), &k,
                               &LaunchParams::default()).unwrap();
  }
  assert_eq!(gpu.drains(), 0);
  gpu.submit_kernel_internal(&NdRange::one(1), &k,
                             &LaunchParams::default()).unwrap();
  assert_eq!(gpu.drains(), 1);
}

#[test]
fn oversized_kernarg_block_is_rejected() {
  let settings = Settings {
    kernarg_pool_size: 64,
    ..Settings::default()
  };
  let (_p, d, mut gpu) = setup(settings);
  let k = noop_kernel(&d);

  let big = vec![0u8; 256];
  let params = LaunchParams::new(vec![
    KernelArg::Value(smallvec::SmallVec::from_slice(&big)),
  ]);
  assert!(gpu.submit_kernel_internal(&NdRange::one(1), &k, &params)
    .is_err());
}

#[test]
fn huge_grid_splits_with_rewritten_offsets() {
  let (_p, d, mut gpu) = setup(Settings::default());

  let log = Arc::new(Mutex::new(Vec::new()));
  let sink = log.clone();
  let object = d.agent().register_kernel(move |disp| {
    let p = disp.kernarg_address as *const u8;
    let mut offs = [0u64; 3];
    for (i, o) in offs.iter_mut().enumerate() {
      let mut raw = [0u8; 8];
      unsafe {
        std::ptr::copy_nonoverlapping(p.add(i * 8), raw.as_mut_ptr(), 8);
      }
      *o = u64::from_le_bytes(raw);
    }
    sink.lock().push((disp.grid_size, offs));
  });
  let k = Kernel::new("probe", object);

  let global = 0x1_0000_0000u64;
  gpu.submit_kernel_internal(&NdRange::one(global), &k,
                             &LaunchParams::default()).unwrap();
  gpu.release_gpu_memory_fence().unwrap();

  // Largest workgroup multiple below the 32 bit grid limit, then the
  // remainder, each seeing its own global offset.
  let chunk = 0xFFFF_FFFFu64 / 256 * 256;
  let seen = log.lock().clone();
  assert_eq!(seen.len(), 2);
  assert_eq!(seen[0].0[0] as u64, chunk);
  assert_eq!(seen[0].1, [0, 0, 0]);
  assert_eq!(seen[1].0[0] as u64, global - chunk);
  assert_eq!(seen[1].1, [chunk, 0, 0]);

  let total: u64 = seen.iter().map(|(g, _)| g[0] as u64 ).sum();
  assert_eq!(total, global);
}

#[test]
fn raw_svm_pointer_requires_fine_grain_system() {
  let (_p, d, mut gpu) = setup(Settings::default());
  let k = noop_kernel(&d);
  let params = LaunchParams::new(vec![KernelArg::Svm {
    ptr: 0x1000,
    mem: None,
    write: false,
  }]);
  assert!(gpu.submit_kernel_internal(&NdRange::one(1), &k, &params)
    .is_err());
}

#[test]
fn raw_svm_pointer_syncs_when_allowed() {
  let settings = Settings {
    fine_grain_system: true,
    ..Settings::default()
  };
  let (_p, d, mut gpu) = setup(settings);
  let k = noop_kernel(&d);
  let backing = [0u64; 8];
  let params = LaunchParams::new(vec![KernelArg::Svm {
    ptr: backing.as_ptr() as usize,
    mem: None,
    write: false,
  }]);
  gpu.submit_kernel_internal(&NdRange::one(1), &k, &params).unwrap();
  gpu.release_gpu_memory_fence().unwrap();

  let hdrs = dispatch_headers(&gpu);
  assert_eq!(hdrs.len(), 1);
  assert_sync(hdrs[0]);
}
