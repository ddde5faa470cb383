
//! The built-in blit kernel set.
//!
//! These are the device-resident kernels the kernel blit path dispatches:
//! registered against the agent at device bring-up, reached only through
//! AQL packets, never called directly. Each one reads a `#[repr(C)]`
//! argument block from the packet's kernarg address, which is exactly the
//! layout the kernel blit code marshals.

use tracing::error;

use hal::Agent;
use hal::packet::{KernelDispatch, PacketSlot, PACKET_SIZE};
use hal::signal::SignalRef;

use crate::kernel::Kernel;

pub(crate) const MAX_FILL_PATTERN: usize = 128;

#[repr(C)]
pub(crate) struct CopyBufferArgs {
  pub src: u64,
  pub dst: u64,
  pub size: u64,
}

/// Origins are byte offsets of the window start; `region[0]` is in
/// bytes. Pitches are `[row, slice]`.
#[repr(C)]
pub(crate) struct CopyBufferRectArgs {
  pub src: u64,
  pub dst: u64,
  pub src_origin: u64,
  pub dst_origin: u64,
  pub src_pitch: [u64; 2],
  pub dst_pitch: [u64; 2],
  pub region: [u64; 3],
  pub elem: u64,
}

#[repr(C)]
pub(crate) struct FillBufferArgs {
  pub dst: u64,
  pub offset: u64,
  pub pattern_size: u64,
  /// Whole patterns to store; a trailing partial pattern is never
  /// written.
  pub count: u64,
  pub pattern: [u8; MAX_FILL_PATTERN],
}

/// Origins are in pixels; `region[0]` too.
#[repr(C)]
pub(crate) struct CopyImageArgs {
  pub src: u64,
  pub dst: u64,
  pub elem: u64,
  pub src_pitch: [u64; 2],
  pub dst_pitch: [u64; 2],
  pub src_origin: [u64; 3],
  pub dst_origin: [u64; 3],
  pub region: [u64; 3],
}

#[repr(C)]
pub(crate) struct CopyImageBufferArgs {
  pub image: u64,
  pub buffer: u64,
  pub elem: u64,
  pub pitch: [u64; 2],
  pub origin: [u64; 3],
  pub region: [u64; 3],
  pub buffer_offset: u64,
  /// Nonzero: image to buffer; zero: buffer to image.
  pub to_buffer: u64,
}

#[repr(C)]
pub(crate) struct FillImageArgs {
  pub dst: u64,
  pub elem: u64,
  pub pitch: [u64; 2],
  pub origin: [u64; 3],
  pub region: [u64; 3],
  pub pixel: [u8; 16],
}

/// `packets` points at `count` dispatch-shaped 64 byte records.
#[repr(C)]
pub(crate) struct SchedulerArgs {
  pub packets: u64,
  pub count: u64,
}

unsafe fn args<'a, T>(d: &KernelDispatch) -> &'a T {
  &*(d.kernarg_address as *const T)
}

fn copy_buffer_body(a: &CopyBufferArgs) {
  unsafe {
    std::ptr::copy_nonoverlapping(a.src as *const u8, a.dst as *mut u8,
                                  a.size as usize);
  }
}

fn copy_buffer_rect_body(a: &CopyBufferRectArgs) {
  debug_assert_eq!(a.region[0] % a.elem, 0);
  for z in 0..a.region[2] {
    for y in 0..a.region[1] {
      let s = a.src + a.src_origin
        + y * a.src_pitch[0] + z * a.src_pitch[1];
      let d = a.dst + a.dst_origin
        + y * a.dst_pitch[0] + z * a.dst_pitch[1];
      unsafe {
        std::ptr::copy_nonoverlapping(s as *const u8, d as *mut u8,
                                      a.region[0] as usize);
      }
    }
  }
}

fn fill_buffer_body(a: &FillBufferArgs) {
  let n = a.pattern_size as usize;
  for i in 0..a.count {
    unsafe {
      let d = (a.dst + a.offset + i * a.pattern_size) as *mut u8;
      std::ptr::copy_nonoverlapping(a.pattern.as_ptr(), d, n);
    }
  }
}

fn copy_image_body(a: &CopyImageArgs) {
  let row = a.region[0] * a.elem;
  for z in 0..a.region[2] {
    for y in 0..a.region[1] {
      let s = a.src
        + (a.src_origin[0]) * a.elem
        + (a.src_origin[1] + y) * a.src_pitch[0]
        + (a.src_origin[2] + z) * a.src_pitch[1];
      let d = a.dst
        + (a.dst_origin[0]) * a.elem
        + (a.dst_origin[1] + y) * a.dst_pitch[0]
        + (a.dst_origin[2] + z) * a.dst_pitch[1];
      unsafe {
        std::ptr::copy_nonoverlapping(s as *const u8, d as *mut u8,
                                      row as usize);
      }
    }
  }
}

fn copy_image_buffer_body(a: &CopyImageBufferArgs) {
  let row = a.region[0] * a.elem;
  let mut buf = a.buffer + a.buffer_offset;
  for z in 0..a.region[2] {
    for y in 0..a.region[1] {
      let img = a.image
        + a.origin[0] * a.elem
        + (a.origin[1] + y) * a.pitch[0]
        + (a.origin[2] + z) * a.pitch[1];
      unsafe {
        if a.to_buffer != 0 {
          std::ptr::copy_nonoverlapping(img as *const u8,
                                        buf as *mut u8, row as usize);
        } else {
          std::ptr::copy_nonoverlapping(buf as *const u8,
                                        img as *mut u8, row as usize);
        }
      }
      buf += row;
    }
  }
}

fn fill_image_body(a: &FillImageArgs) {
  let elem = a.elem as usize;
  for z in 0..a.region[2] {
    for y in 0..a.region[1] {
      let row = a.dst
        + a.origin[0] * a.elem
        + (a.origin[1] + y) * a.pitch[0]
        + (a.origin[2] + z) * a.pitch[1];
      for x in 0..a.region[0] {
        unsafe {
          std::ptr::copy_nonoverlapping(a.pixel.as_ptr(),
                                        (row + x * a.elem) as *mut u8,
                                        elem);
        }
      }
    }
  }
}

fn scheduler_body(agent: &Agent, a: &SchedulerArgs) {
  for i in 0..a.count {
    let mut slot = PacketSlot::INVALID;
    unsafe {
      let src = (a.packets + i * PACKET_SIZE as u64) as *const u8;
      std::ptr::copy_nonoverlapping(src, slot.0.as_mut_ptr(),
                                    PACKET_SIZE);
    }
    let d = KernelDispatch::decode(&slot);
    match agent.lookup_kernel(d.kernel_object) {
      Some(child) => {
        child(&d);
      },
      None => {
        error!(object = d.kernel_object,
               "scheduler: unknown child kernel object");
      },
    }
    if let Some(s) = SignalRef::from_handle(d.completion_signal) {
      s.subtract_screlease(1);
    }
  }
}

/// The registered blit kernel set for one agent.
#[derive(Clone, Debug)]
pub(crate) struct BlitKernels {
  pub copy_buffer: Kernel,
  pub copy_buffer_rect: Kernel,
  pub copy_buffer_rect_aligned4: Kernel,
  pub copy_buffer_rect_aligned16: Kernel,
  pub fill_buffer: Kernel,
  pub copy_image: Kernel,
  pub copy_image_1d_array: Kernel,
  pub copy_image_buffer: Kernel,
  pub fill_image: Kernel,
  pub scheduler: Kernel,
}

pub(crate) fn create_blit_kernels(agent: &Agent) -> BlitKernels {
  let k = |name: &str, object| Kernel::new(name, object);

  let copy_buffer = k("copy_buffer", agent.register_kernel(|d| {
    copy_buffer_body(unsafe { args(d) });
  }));
  let copy_buffer_rect = k("copy_buffer_rect",
                           agent.register_kernel(|d| {
    copy_buffer_rect_body(unsafe { args(d) });
  }));
  let copy_buffer_rect_aligned4 = k("copy_buffer_rect_aligned4",
                                    agent.register_kernel(|d| {
    let a: &CopyBufferRectArgs = unsafe { args(d) };
    debug_assert_eq!(a.elem, 4);
    copy_buffer_rect_body(a);
  }));
  let copy_buffer_rect_aligned16 = k("copy_buffer_rect_aligned16",
                                     agent.register_kernel(|d| {
    let a: &CopyBufferRectArgs = unsafe { args(d) };
    debug_assert_eq!(a.elem, 16);
    copy_buffer_rect_body(a);
  }));
  let fill_buffer = k("fill_buffer", agent.register_kernel(|d| {
    fill_buffer_body(unsafe { args(d) });
  }));
  let copy_image = k("copy_image", agent.register_kernel(|d| {
    copy_image_body(unsafe { args(d) });
  }));
  // 1D arrays address layers through the slice pitch; the caller folds
  // the layer index into origin[2], so the body is shared.
  let copy_image_1d_array = k("copy_image_1d_array",
                              agent.register_kernel(|d| {
    copy_image_body(unsafe { args(d) });
  }));
  let copy_image_buffer = k("copy_image_buffer",
                            agent.register_kernel(|d| {
    copy_image_buffer_body(unsafe { args(d) });
  }));
  let fill_image = k("fill_image", agent.register_kernel(|d| {
    fill_image_body(unsafe { args(d) });
  }));
  let scheduler = {
    let agent2 = agent.clone();
    k("scheduler", agent.register_kernel(move |d| {
      scheduler_body(&agent2, unsafe { args(d) });
    }))
  };

  BlitKernels {
    copy_buffer,
    copy_buffer_rect,
    copy_buffer_rect_aligned4,
    copy_buffer_rect_aligned16,
    fill_buffer,
    copy_image,
    copy_image_1d_array,
    copy_image_buffer,
    fill_image,
    scheduler,
  }
}
