
//! The kernel strategy: blits as AQL dispatches of the built-in kernel
//! set. These ride the queue, so consecutive blits pipeline under the
//! dependency tracker; a transfer-ops lock keeps argument marshaling and
//! dispatch atomic per engine.
//!
//! Image formats the kernels cannot address natively (sRGB, the
//! normalized 8/16 bit types, half float, packed 101010) are handled by
//! dispatching against a bit-compatible uint view of the same storage.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::{self, BlitKernels, CopyBufferArgs,
                     CopyBufferRectArgs, CopyImageArgs,
                     CopyImageBufferArgs, FillBufferArgs, FillImageArgs};
use crate::memory::{pack_color, ChannelOrder, ChannelType, FillColor,
                    ImageFormat, ImageGeometry, Memory};
use crate::virtual_gpu::VirtualGPU;

use super::{fill_pattern_count, BufferRect};

/// Formats the blit kernels do not sample or store natively.
pub(crate) fn format_rejected(f: ImageFormat) -> bool {
  if f.order == ChannelOrder::SRgba {
    return true;
  }
  matches!(f.ty,
           ChannelType::Snorm8 | ChannelType::Snorm16
           | ChannelType::Unorm16 | ChannelType::Half
           | ChannelType::Unorm101010)
}

/// The bit-compatible uint format a rejected format is viewed as. The
/// pixel size never changes, so the reinterpretation is a pure relabel.
pub(crate) fn reinterpret_format(f: ImageFormat) -> ImageFormat {
  if f.ty == ChannelType::Unorm101010 {
    return ImageFormat::new(ChannelOrder::R, ChannelType::Uint32);
  }
  let order = match f.order {
    ChannelOrder::SRgba => ChannelOrder::Rgba,
    o => o,
  };
  let ty = match f.ty {
    ChannelType::Unorm8 | ChannelType::Snorm8 => ChannelType::Uint8,
    ChannelType::Unorm16 | ChannelType::Snorm16
    | ChannelType::Half => ChannelType::Uint16,
    t => t,
  };
  ImageFormat::new(order, ty)
}

fn as_bytes<T>(v: &T) -> &[u8] {
  unsafe {
    std::slice::from_raw_parts(v as *const T as *const u8,
                               std::mem::size_of::<T>())
  }
}

pub(crate) struct KernelBlit {
  kernels: BlitKernels,
  // Marshal-and-dispatch is one critical section per engine.
  lock: Mutex<()>,
  sync: bool,
}

impl KernelBlit {
  pub(crate) fn new(kernels: BlitKernels, sync: bool) -> KernelBlit {
    KernelBlit {
      kernels,
      lock: Mutex::new(()),
      sync,
    }
  }

  /// With synchronous-operation semantics the queue drains after every
  /// blit; otherwise blits pipeline and later fences settle them.
  fn synchronize(&self, gpu: &mut VirtualGPU) -> Result<()> {
    if self.sync {
      gpu.release_gpu_memory_fence()?;
    }
    Ok(())
  }

  pub(crate) fn copy_buffer(&self, gpu: &mut VirtualGPU, src: &Memory,
                            dst: &Memory, src_origin: usize,
                            dst_origin: usize, size: usize)
    -> Result<bool>
  {
    let _g = self.lock.lock();
    let args = CopyBufferArgs {
      src: (src.dev_addr() + src_origin) as u64,
      dst: (dst.dev_addr() + dst_origin) as u64,
      size: size as u64,
    };
    let ranges = [
      (src.dev_addr() + src_origin, src.dev_addr() + src_origin + size,
       true),
      (dst.dev_addr() + dst_origin, dst.dev_addr() + dst_origin + size,
       false),
    ];
    gpu.dispatch_blit_kernel(&self.kernels.copy_buffer, 1,
                             [size as u64, 1, 1], as_bytes(&args),
                             &ranges)?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  pub(crate) fn copy_buffer_rect(&self, gpu: &mut VirtualGPU,
                                 src: &Memory, dst: &Memory,
                                 src_rect: &BufferRect,
                                 dst_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<bool> {
    let _g = self.lock.lock();
    let aligned = |elem: usize| {
      (src.dev_addr() + src_rect.start) % elem == 0
        && (dst.dev_addr() + dst_rect.start) % elem == 0
        && src_rect.row_pitch % elem == 0
        && dst_rect.row_pitch % elem == 0
        && region[0] % elem == 0
    };
    let (kernel, elem) = if aligned(16) {
      (&self.kernels.copy_buffer_rect_aligned16, 16u64)
    } else if aligned(4) {
      (&self.kernels.copy_buffer_rect_aligned4, 4)
    } else {
      (&self.kernels.copy_buffer_rect, 1)
    };

    let args = CopyBufferRectArgs {
      src: src.dev_addr() as u64,
      dst: dst.dev_addr() as u64,
      src_origin: src_rect.start as u64,
      dst_origin: dst_rect.start as u64,
      src_pitch: [src_rect.row_pitch as u64, src_rect.slice_pitch as u64],
      dst_pitch: [dst_rect.row_pitch as u64, dst_rect.slice_pitch as u64],
      region: [region[0] as u64, region[1] as u64, region[2] as u64],
      elem,
    };
    let ranges = [
      whole_range(src, true),
      whole_range(dst, false),
    ];
    gpu.dispatch_blit_kernel(kernel, 3,
                             [(region[0] as u64) / elem,
                              region[1] as u64, region[2] as u64],
                             as_bytes(&args), &ranges)?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  pub(crate) fn fill_buffer(&self, gpu: &mut VirtualGPU, dst: &Memory,
                            pattern: &[u8], origin: usize, size: usize)
    -> Result<bool>
  {
    if pattern.is_empty() || pattern.len() > kernels::MAX_FILL_PATTERN {
      return Err(Error::InvalidValue);
    }
    let _g = self.lock.lock();
    let count = fill_pattern_count(size, pattern.len());
    if count == 0 {
      return Ok(true);
    }
    let mut args = FillBufferArgs {
      dst: dst.dev_addr() as u64,
      offset: origin as u64,
      pattern_size: pattern.len() as u64,
      count: count as u64,
      pattern: [0; kernels::MAX_FILL_PATTERN],
    };
    args.pattern[..pattern.len()].copy_from_slice(pattern);
    let ranges = [
      (dst.dev_addr() + origin,
       dst.dev_addr() + origin + count * pattern.len(), false),
    ];
    gpu.dispatch_blit_kernel(&self.kernels.fill_buffer, 1,
                             [count as u64, 1, 1], as_bytes(&args),
                             &ranges)?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  pub(crate) fn copy_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                           src: &Memory, dst: &Memory,
                           src_origin: [usize; 3],
                           dst_origin: [usize; 3], region: [usize; 3])
    -> Result<bool>
  {
    if rejected_view(src) || rejected_view(dst) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let src_view = self.view_if_rejected(dev, src)?;
    let dst_view = self.view_if_rejected(dev, dst)?;
    let s = src_view.as_deref().unwrap_or(src);
    let d = dst_view.as_deref().unwrap_or(dst);

    let r = self.copy_image_locked(gpu, s, d, src_origin, dst_origin,
                                   region);
    self.drop_view(dev, src_view);
    self.drop_view(dev, dst_view);
    r?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  fn copy_image_locked(&self, gpu: &mut VirtualGPU, src: &Memory,
                       dst: &Memory, src_origin: [usize; 3],
                       dst_origin: [usize; 3], region: [usize; 3])
    -> Result<()>
  {
    let sd = *src.image_desc().ok_or(Error::InvalidMemObject)?;
    let dd = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = sd.format.elem_size();
    if elem != dd.format.elem_size() {
      return Err(Error::UnsupportedImageFormat);
    }
    let layered = sd.geometry == ImageGeometry::OneDArray
      || dd.geometry == ImageGeometry::OneDArray;
    let kernel = if layered {
      &self.kernels.copy_image_1d_array
    } else {
      &self.kernels.copy_image
    };

    let u3 = |v: [usize; 3]| [v[0] as u64, v[1] as u64, v[2] as u64];
    let args = CopyImageArgs {
      src: src.dev_addr() as u64,
      dst: dst.dev_addr() as u64,
      elem: elem as u64,
      src_pitch: [sd.row_pitch as u64, sd.slice_pitch as u64],
      dst_pitch: [dd.row_pitch as u64, dd.slice_pitch as u64],
      src_origin: u3(src_origin),
      dst_origin: u3(dst_origin),
      region: u3(region),
    };
    let ranges = [
      whole_range(src, true),
      whole_range(dst, false),
    ];
    gpu.dispatch_blit_kernel(kernel, 3, u3(region), as_bytes(&args),
                             &ranges)
  }

  pub(crate) fn copy_image_to_buffer(&self, dev: &Device,
                                     gpu: &mut VirtualGPU, src: &Memory,
                                     dst: &Memory, origin: [usize; 3],
                                     region: [usize; 3],
                                     dst_origin: usize) -> Result<bool> {
    if rejected_view(src) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let view = self.view_if_rejected(dev, src)?;
    let s = view.as_deref().unwrap_or(src);
    let r = self.image_buffer_locked(gpu, s, dst.dev_addr() + dst_origin,
                                     whole_range(dst, false), origin,
                                     region, true);
    self.drop_view(dev, view);
    r?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  pub(crate) fn copy_buffer_to_image(&self, dev: &Device,
                                     gpu: &mut VirtualGPU, src: &Memory,
                                     dst: &Memory, src_origin: usize,
                                     origin: [usize; 3],
                                     region: [usize; 3]) -> Result<bool> {
    if rejected_view(dst) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let view = self.view_if_rejected(dev, dst)?;
    let d = view.as_deref().unwrap_or(dst);
    let r = self.image_buffer_locked(gpu, d, src.dev_addr() + src_origin,
                                     whole_range(src, true), origin,
                                     region, false);
    self.drop_view(dev, view);
    r?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  fn image_buffer_locked(&self, gpu: &mut VirtualGPU, image: &Memory,
                         buffer_addr: usize,
                         buffer_range: (usize, usize, bool),
                         origin: [usize; 3], region: [usize; 3],
                         to_buffer: bool) -> Result<()> {
    let desc = *image.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    let u3 = |v: [usize; 3]| [v[0] as u64, v[1] as u64, v[2] as u64];
    let args = CopyImageBufferArgs {
      image: image.dev_addr() as u64,
      buffer: buffer_addr as u64,
      elem: elem as u64,
      pitch: [desc.row_pitch as u64, desc.slice_pitch as u64],
      origin: u3(origin),
      region: u3(region),
      buffer_offset: 0,
      to_buffer: to_buffer as u64,
    };
    let ranges = [
      whole_range(image, to_buffer),
      buffer_range,
    ];
    gpu.dispatch_blit_kernel(&self.kernels.copy_image_buffer, 3,
                             u3(region), as_bytes(&args), &ranges)
  }

  pub(crate) fn fill_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                           dst: &Memory, color: &FillColor,
                           origin: [usize; 3], region: [usize; 3])
    -> Result<bool>
  {
    if rejected_view(dst) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let desc = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    // Quantization, sRGB encoding included, happens host side against
    // the declared format; the kernel stores raw pixels.
    let px = pack_color(desc.format, color)?;

    let view = if format_rejected(desc.format) {
      self.view_if_rejected(dev, dst)?
    } else {
      None
    };
    let d = view.as_deref().unwrap_or(dst);
    let vdesc = *d.image_desc().ok_or(Error::InvalidMemObject)?;

    let mut pixel = [0u8; 16];
    pixel[..px.len()].copy_from_slice(&px);
    let u3 = |v: [usize; 3]| [v[0] as u64, v[1] as u64, v[2] as u64];
    let args = FillImageArgs {
      dst: d.dev_addr() as u64,
      elem: vdesc.format.elem_size() as u64,
      pitch: [vdesc.row_pitch as u64, vdesc.slice_pitch as u64],
      origin: u3(origin),
      region: u3(region),
      pixel,
    };
    let ranges = [whole_range(d, false)];
    let r = gpu.dispatch_blit_kernel(&self.kernels.fill_image, 3,
                                     u3(region), as_bytes(&args),
                                     &ranges);
    self.drop_view(dev, view);
    r?;
    self.synchronize(gpu)?;
    Ok(true)
  }

  /// Image read staged through a pooled buffer: device-side pack into
  /// the staging buffer, drain, then a pitched host copy out.
  pub(crate) fn read_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                           src: &Memory, dst: *mut u8,
                           origin: [usize; 3], region: [usize; 3],
                           row_pitch: usize, slice_pitch: usize)
    -> Result<bool>
  {
    if rejected_view(src) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let view = self.view_if_rejected(dev, src)?;
    let s = view.as_deref().unwrap_or(src);
    let desc = *s.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    let row = region[0] * elem;
    let total = row * region[1] * region[2];

    let buf = dev.acquire_xfer_buf()?;
    if total > buf.len() {
      dev.release_xfer_buf(buf);
      self.drop_view(dev, view);
      return Ok(false);
    }

    let r = self.image_buffer_locked(
      gpu, s, buf.addr(), (buf.addr(), buf.addr() + total, false),
      origin, region, true);
    self.drop_view(dev, view);
    if let Err(e) = r {
      dev.release_xfer_buf(buf);
      return Err(e);
    }
    // The packed pixels must land before the host copies them out.
    gpu.release_gpu_memory_fence()?;

    for z in 0..region[2] {
      for y in 0..region[1] {
        unsafe {
          let s = buf.offset((z * region[1] + y) * row);
          std::ptr::copy_nonoverlapping(
            s as *const u8,
            dst.add(y * row_pitch + z * slice_pitch), row);
        }
      }
    }
    dev.release_xfer_buf(buf);
    Ok(true)
  }

  /// Image write staged in: host pitched copy into the staging buffer,
  /// then a device-side unpack. The buffer is handed back only after
  /// the next drain, since the dispatch may still be in flight.
  pub(crate) fn write_image(&self, dev: &Device, gpu: &mut VirtualGPU,
                            src: *const u8, dst: &Memory,
                            origin: [usize; 3], region: [usize; 3],
                            row_pitch: usize, slice_pitch: usize)
    -> Result<bool>
  {
    if rejected_view(dst) {
      return Ok(false);
    }
    let _g = self.lock.lock();
    let view = self.view_if_rejected(dev, dst)?;
    let d = view.as_deref().unwrap_or(dst);
    let desc = *d.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    let row = region[0] * elem;
    let total = row * region[1] * region[2];

    let buf = dev.acquire_xfer_buf()?;
    if total > buf.len() {
      dev.release_xfer_buf(buf);
      self.drop_view(dev, view);
      return Ok(false);
    }
    for z in 0..region[2] {
      for y in 0..region[1] {
        unsafe {
          std::ptr::copy_nonoverlapping(
            src.add(y * row_pitch + z * slice_pitch),
            buf.offset((z * region[1] + y) * row), row);
        }
      }
    }

    let r = self.image_buffer_locked(
      gpu, d, buf.addr(), (buf.addr(), buf.addr() + total, true),
      origin, region, false);
    self.drop_view(dev, view);
    if let Err(e) = r {
      dev.release_xfer_buf(buf);
      return Err(e);
    }
    gpu.add_deferred_buf(buf);
    self.synchronize(gpu)?;
    Ok(true)
  }

  /// A bit-compatible uint view of `mem` when its format is rejected;
  /// `None` when the kernels take it as is. Callers check
  /// `rejected_view` first; views cannot be re-viewed.
  fn view_if_rejected(&self, dev: &Device, mem: &Memory)
    -> Result<Option<Arc<Memory>>>
  {
    let desc = mem.image_desc().ok_or(Error::InvalidMemObject)?;
    if !format_rejected(desc.format) {
      return Ok(None);
    }
    let alt = reinterpret_format(desc.format);
    let id = dev.arena().create_image_view(mem.id(), alt)?;
    let view = dev.get_memory(id)?;
    Ok(Some(view))
  }

  fn drop_view(&self, dev: &Device, view: Option<Arc<Memory>>) {
    if let Some(view) = view {
      let id = view.id();
      drop(view);
      let _ = dev.free_memory(id);
      let _ = dev.arena().release(id);
    }
  }
}

fn whole_range(mem: &Memory, read_only: bool) -> (usize, usize, bool) {
  let (start, end) = mem.dev_range();
  (start, end, read_only)
}

/// A rejected format on a memory that is already a view cannot be viewed
/// again; the kernel strategy declines and the next layer handles the
/// bytes directly.
fn rejected_view(mem: &Memory) -> bool {
  match mem.image_desc() {
    Some(desc) => format_rejected(desc.format) && mem.is_view(),
    None => false,
  }
}
