
//! The blit engine: every data-movement path of the device.
//!
//! One flat strategy table replaces a manager-class hierarchy: each
//! transfer kind holds an ordered candidate list over the three
//! strategies (kernel dispatch, DMA engine, host memcpy), selected at
//! construction from the device settings. A strategy returns `Ok(true)`
//! when it handled the transfer, `Ok(false)` to pass to the next
//! candidate and `Err` for a real failure, which is never papered over
//! by falling back.
//!
//! Ordering: the kernel strategy rides the AQL queue and needs no
//! preliminary drain; the DMA and host strategies run outside the queue,
//! so the engine drains it first.

use smallvec::SmallVec;
use tracing::error;

use hal::Context;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::BlitKernels;
use crate::memory::{FillColor, Memory};
use crate::settings::Settings;
use crate::virtual_gpu::VirtualGPU;

pub mod dma;
pub mod host;
pub mod kernel;

use self::dma::DmaBlit;
use self::host::HostBlit;
use self::kernel::KernelBlit;

/// Copies at or below this spin on the completion signal; larger ones
/// block.
pub const SPIN_WAIT_MAX_BYTES: usize = 4 * 1024 * 1024;
/// Host ranges are pinned at this alignment.
pub const PINNED_MEMORY_ALIGNMENT: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
  Kernel,
  Dma,
  Host,
}

type Candidates = SmallVec<[Strategy; 3]>;

/// A rectangular window into a linear buffer: byte pitches plus the byte
/// offset of the window origin.
#[derive(Clone, Copy, Debug)]
pub struct BufferRect {
  pub row_pitch: usize,
  pub slice_pitch: usize,
  pub start: usize,
}

impl BufferRect {
  /// Zero pitches mean packed. Pitches smaller than the window are
  /// rejected.
  pub fn new(origin: [usize; 3], region: [usize; 3],
             row_pitch: usize, slice_pitch: usize) -> Result<BufferRect> {
    if region.iter().any(|&r| r == 0 ) {
      return Err(Error::InvalidValue);
    }
    let row = if row_pitch == 0 { region[0] } else { row_pitch };
    let slice = if slice_pitch == 0 { row * region[1] } else { slice_pitch };
    if row < region[0] || slice < row * (region[1] - 1) + region[0] {
      return Err(Error::InvalidValue);
    }
    Ok(BufferRect {
      row_pitch: row,
      slice_pitch: slice,
      start: origin[0] + origin[1] * row + origin[2] * slice,
    })
  }

  #[inline(always)]
  pub fn offset(&self, y: usize, z: usize) -> usize {
    self.start + y * self.row_pitch + z * self.slice_pitch
  }

  /// Bytes from the window start to one past its last byte.
  pub fn extent(&self, region: [usize; 3]) -> usize {
    self.offset(region[1] - 1, region[2] - 1) + region[0] - self.start
  }
}

/// Whole patterns that fit `size`; a trailing partial pattern is skipped
/// and logged, never partially stored.
pub(crate) fn fill_pattern_count(size: usize, pattern: usize) -> usize {
  let count = size / pattern;
  let rem = size % pattern;
  if rem != 0 {
    error!(size, pattern, rem,
           "fill size is not a pattern multiple; truncating");
  }
  count
}

struct Plan {
  read_buffer: Candidates,
  write_buffer: Candidates,
  copy_buffer: Candidates,
  read_buffer_rect: Candidates,
  write_buffer_rect: Candidates,
  copy_buffer_rect: Candidates,
  read_image: Candidates,
  write_image: Candidates,
  copy_image: Candidates,
  copy_image_to_buffer: Candidates,
  copy_buffer_to_image: Candidates,
  fill_buffer: Candidates,
  fill_image: Candidates,
}

impl Plan {
  fn new(s: &Settings) -> Plan {
    fn list(dma: bool, kernel: bool) -> Candidates {
      let mut c = Candidates::new();
      if dma {
        c.push(Strategy::Dma);
      }
      if kernel {
        c.push(Strategy::Kernel);
      }
      c.push(Strategy::Host);
      c
    }
    Plan {
      read_buffer: list(!s.disable_read_buffer, false),
      write_buffer: list(!s.disable_write_buffer, false),
      copy_buffer: list(!s.disable_copy_buffer, true),
      read_buffer_rect: list(!s.disable_read_buffer_rect, false),
      write_buffer_rect: list(!s.disable_write_buffer_rect, false),
      copy_buffer_rect: list(!s.disable_copy_buffer_rect, true),
      read_image: list(s.image_dma && !s.disable_read_image, true),
      write_image: list(s.image_dma && !s.disable_write_image, true),
      copy_image: list(false, true),
      copy_image_to_buffer: list(false, true),
      copy_buffer_to_image: list(false, true),
      fill_buffer: list(false, true),
      fill_image: list(false, true),
    }
  }
}

pub struct BlitEngine {
  plan: Plan,
  host: HostBlit,
  dma: DmaBlit,
  kernel: KernelBlit,
}

macro_rules! run_candidates {
  ($self:ident, $gpu:ident, $list:ident,
   kernel: $k:expr, dma: $d:expr, host: $h:expr) => {
    for &strat in $self.plan.$list.iter() {
      let handled: bool = match strat {
        Strategy::Kernel => {
          let r: Result<bool> = $k;
          r?
        },
        Strategy::Dma => {
          // DMA runs outside the queue; prior packets must retire.
          $gpu.release_gpu_memory_fence()?;
          let r: Result<bool> = $d;
          r?
        },
        Strategy::Host => {
          $gpu.release_gpu_memory_fence()?;
          let r: Result<bool> = $h;
          r?
        },
      };
      if handled {
        return Ok(());
      }
    }
    return Err(Error::InvalidOperation);
  };
}

impl BlitEngine {
  pub(crate) fn create(settings: &Settings, ctx: &Context,
                       kernels: BlitKernels) -> Result<BlitEngine> {
    Ok(BlitEngine {
      plan: Plan::new(settings),
      host: HostBlit::new(),
      dma: DmaBlit::new(settings, ctx.clone()),
      kernel: KernelBlit::new(kernels, settings.sync_blit),
    })
  }

  /// Device window to host memory.
  pub unsafe fn read_buffer(&self, dev: &Device, gpu: &mut VirtualGPU,
                            src: &Memory, dst: *mut u8, origin: usize,
                            size: usize) -> Result<()> {
    check_window(origin, size, src.size())?;
    run_candidates!(self, gpu, read_buffer,
      kernel: Ok(false),
      dma: self.dma.read_buffer(dev, src, dst, origin, size),
      host: self.host.read_buffer(src, dst, origin, size));
  }

  /// Host memory to a device window.
  pub unsafe fn write_buffer(&self, dev: &Device, gpu: &mut VirtualGPU,
                             src: *const u8, dst: &Memory, origin: usize,
                             size: usize) -> Result<()> {
    check_window(origin, size, dst.size())?;
    run_candidates!(self, gpu, write_buffer,
      kernel: Ok(false),
      dma: self.dma.write_buffer(dev, src, dst, origin, size),
      host: self.host.write_buffer(src, dst, origin, size));
  }

  pub fn copy_buffer(&self, gpu: &mut VirtualGPU, src: &Memory,
                     dst: &Memory, src_origin: usize, dst_origin: usize,
                     size: usize) -> Result<()> {
    check_window(src_origin, size, src.size())?;
    check_window(dst_origin, size, dst.size())?;
    run_candidates!(self, gpu, copy_buffer,
      kernel: self.kernel.copy_buffer(gpu, src, dst, src_origin,
                                      dst_origin, size),
      dma: self.dma.copy_buffer(src, dst, src_origin, dst_origin, size),
      host: self.host.copy_buffer(src, dst, src_origin, dst_origin,
                                  size));
  }

  pub unsafe fn read_buffer_rect(&self, dev: &Device,
                                 gpu: &mut VirtualGPU, src: &Memory,
                                 dst: *mut u8, buf_rect: &BufferRect,
                                 host_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<()> {
    check_window(buf_rect.start, buf_rect.extent(region), src.size())?;
    run_candidates!(self, gpu, read_buffer_rect,
      kernel: Ok(false),
      dma: self.dma.read_buffer_rect(dev, src, dst, buf_rect, host_rect,
                                     region),
      host: self.host.read_buffer_rect(src, dst, buf_rect, host_rect,
                                       region));
  }

  pub unsafe fn write_buffer_rect(&self, dev: &Device,
                                  gpu: &mut VirtualGPU, src: *const u8,
                                  dst: &Memory, host_rect: &BufferRect,
                                  buf_rect: &BufferRect,
                                  region: [usize; 3]) -> Result<()> {
    check_window(buf_rect.start, buf_rect.extent(region), dst.size())?;
    run_candidates!(self, gpu, write_buffer_rect,
      kernel: Ok(false),
      dma: self.dma.write_buffer_rect(dev, src, dst, host_rect, buf_rect,
                                      region),
      host: self.host.write_buffer_rect(src, dst, host_rect, buf_rect,
                                        region));
  }

  pub fn copy_buffer_rect(&self, gpu: &mut VirtualGPU, src: &Memory,
                          dst: &Memory, src_rect: &BufferRect,
                          dst_rect: &BufferRect, region: [usize; 3])
    -> Result<()>
  {
    check_window(src_rect.start, src_rect.extent(region), src.size())?;
    check_window(dst_rect.start, dst_rect.extent(region), dst.size())?;
    run_candidates!(self, gpu, copy_buffer_rect,
      kernel: self.kernel.copy_buffer_rect(gpu, src, dst, src_rect,
                                           dst_rect, region),
      dma: self.dma.copy_buffer_rect(src, dst, src_rect, dst_rect,
                                     region),
      host: self.host.copy_buffer_rect(src, dst, src_rect, dst_rect,
                                       region));
  }

  pub fn fill_buffer(&self, gpu: &mut VirtualGPU, dst: &Memory,
                     pattern: &[u8], origin: usize, size: usize)
    -> Result<()>
  {
    check_window(origin, size, dst.size())?;
    run_candidates!(self, gpu, fill_buffer,
      kernel: self.kernel.fill_buffer(gpu, dst, pattern, origin, size),
      dma: Ok(false),
      host: self.host.fill_buffer(dst, pattern, origin, size));
  }

  pub unsafe fn read_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                           src: &Memory, dst: *mut u8,
                           origin: [usize; 3], region: [usize; 3],
                           row_pitch: usize, slice_pitch: usize)
    -> Result<()>
  {
    let (row_pitch, slice_pitch) =
      resolve_host_pitches(src, region, row_pitch, slice_pitch)?;
    run_candidates!(self, gpu, read_image,
      kernel: self.kernel.read_image(dev, gpu, src, dst, origin, region,
                                     row_pitch, slice_pitch),
      dma: self.dma.read_image(dev, src, dst, origin, region, row_pitch,
                               slice_pitch),
      host: self.host.read_image(src, dst, origin, region, row_pitch,
                                 slice_pitch));
  }

  pub unsafe fn write_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                            src: *const u8, dst: &Memory,
                            origin: [usize; 3], region: [usize; 3],
                            row_pitch: usize, slice_pitch: usize)
    -> Result<()>
  {
    let (row_pitch, slice_pitch) =
      resolve_host_pitches(dst, region, row_pitch, slice_pitch)?;
    run_candidates!(self, gpu, write_image,
      kernel: self.kernel.write_image(dev, gpu, src, dst, origin, region,
                                      row_pitch, slice_pitch),
      dma: self.dma.write_image(dev, src, dst, origin, region, row_pitch,
                                slice_pitch),
      host: self.host.write_image(src, dst, origin, region, row_pitch,
                                  slice_pitch));
  }

  pub fn copy_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                    src: &Memory, dst: &Memory, src_origin: [usize; 3],
                    dst_origin: [usize; 3], region: [usize; 3])
    -> Result<()>
  {
    run_candidates!(self, gpu, copy_image,
      kernel: self.kernel.copy_image(dev, gpu, src, dst, src_origin,
                                     dst_origin, region),
      dma: Ok(false),
      host: self.host.copy_image(src, dst, src_origin, dst_origin,
                                 region));
  }

  pub fn copy_image_to_buffer(&self, dev: &Device, gpu: &mut VirtualGPU,
                              src: &Memory, dst: &Memory,
                              origin: [usize; 3], region: [usize; 3],
                              dst_origin: usize) -> Result<()> {
    run_candidates!(self, gpu, copy_image_to_buffer,
      kernel: self.kernel.copy_image_to_buffer(dev, gpu, src, dst,
                                               origin, region,
                                               dst_origin),
      dma: Ok(false),
      host: self.host.copy_image_to_buffer(src, dst, origin, region,
                                           dst_origin));
  }

  pub fn copy_buffer_to_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                              src: &Memory, dst: &Memory,
                              src_origin: usize, origin: [usize; 3],
                              region: [usize; 3]) -> Result<()> {
    run_candidates!(self, gpu, copy_buffer_to_image,
      kernel: self.kernel.copy_buffer_to_image(dev, gpu, src, dst,
                                               src_origin, origin,
                                               region),
      dma: Ok(false),
      host: self.host.copy_buffer_to_image(src, dst, src_origin, origin,
                                           region));
  }

  pub fn fill_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                    dst: &Memory, color: &FillColor, origin: [usize; 3],
                    region: [usize; 3]) -> Result<()> {
    run_candidates!(self, gpu, fill_image,
      kernel: self.kernel.fill_image(dev, gpu, dst, color, origin,
                                     region),
      dma: Ok(false),
      host: self.host.fill_image(dst, color, origin, region));
  }
}

fn check_window(origin: usize, size: usize, total: usize) -> Result<()> {
  if size == 0 || origin + size > total {
    return Err(Error::InvalidValue);
  }
  Ok(())
}

fn resolve_host_pitches(image: &Memory, region: [usize; 3],
                        row_pitch: usize, slice_pitch: usize)
  -> Result<(usize, usize)>
{
  let desc = image.image_desc().ok_or(Error::InvalidMemObject)?;
  let elem = desc.format.elem_size();
  if region.iter().any(|&r| r == 0 ) {
    return Err(Error::InvalidValue);
  }
  let row = if row_pitch == 0 { region[0] * elem } else { row_pitch };
  let slice = if slice_pitch == 0 { row * region[1] } else { slice_pitch };
  if row < region[0] * elem || slice < row * region[1] {
    return Err(Error::InvalidValue);
  }
  Ok((row, slice))
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn buffer_rect_packed_pitches() {
    let r = BufferRect::new([4, 2, 1], [8, 4, 2], 0, 0).unwrap();
    assert_eq!(r.row_pitch, 8);
    assert_eq!(r.slice_pitch, 32);
    assert_eq!(r.start, 4 + 2 * 8 + 32);
    assert_eq!(r.offset(1, 1), r.start + 8 + 32);
  }

  #[test]
  fn buffer_rect_rejects_short_pitches() {
    assert!(BufferRect::new([0; 3], [16, 2, 1], 8, 0).is_err());
    assert!(BufferRect::new([0; 3], [8, 4, 2], 16, 24).is_err());
  }

  #[test]
  fn fill_count_truncates_to_whole_patterns() {
    assert_eq!(fill_pattern_count(64, 16), 4);
    assert_eq!(fill_pattern_count(65, 16), 4);
    assert_eq!(fill_pattern_count(8, 16), 0);
  }

  #[test]
  fn plan_drops_dma_when_disabled() {
    let mut s = Settings::default();
    s.disable_copy_buffer = true;
    let p = Plan::new(&s);
    assert_eq!(&p.copy_buffer[..], &[Strategy::Kernel, Strategy::Host]);
    let p = Plan::new(&Settings::default());
    assert_eq!(&p.copy_buffer[..],
               &[Strategy::Dma, Strategy::Kernel, Strategy::Host]);
  }
}
