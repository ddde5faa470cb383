
//! The host strategy: plain CPU loops over device memory. Always
//! applicable; the last candidate of every list. The engine drains the
//! queue before calling in here, so the bytes it touches are settled.

use crate::error::{Error, Result};
use crate::memory::{pack_color, FillColor, Memory};

use super::{fill_pattern_count, BufferRect};

pub(crate) struct HostBlit;

impl HostBlit {
  pub(crate) fn new() -> HostBlit {
    HostBlit
  }

  pub(crate) fn read_buffer(&self, src: &Memory, dst: *mut u8,
                            origin: usize, size: usize) -> Result<bool> {
    unsafe {
      std::ptr::copy_nonoverlapping(src.dev_ptr().add(origin) as *const u8,
                                    dst, size);
    }
    Ok(true)
  }

  pub(crate) fn write_buffer(&self, src: *const u8, dst: &Memory,
                             origin: usize, size: usize) -> Result<bool> {
    unsafe {
      std::ptr::copy_nonoverlapping(src, dst.dev_ptr().add(origin), size);
    }
    Ok(true)
  }

  pub(crate) fn copy_buffer(&self, src: &Memory, dst: &Memory,
                            src_origin: usize, dst_origin: usize,
                            size: usize) -> Result<bool> {
    unsafe {
      std::ptr::copy_nonoverlapping(
        src.dev_ptr().add(src_origin) as *const u8,
        dst.dev_ptr().add(dst_origin), size);
    }
    Ok(true)
  }

  fn rect_loop<F>(&self, region: [usize; 3], mut f: F)
    where F: FnMut(usize, usize),
  {
    for z in 0..region[2] {
      for y in 0..region[1] {
        f(y, z);
      }
    }
  }

  pub(crate) fn read_buffer_rect(&self, src: &Memory, dst: *mut u8,
                                 buf_rect: &BufferRect,
                                 host_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<bool> {
    self.rect_loop(region, |y, z| unsafe {
      std::ptr::copy_nonoverlapping(
        src.dev_ptr().add(buf_rect.offset(y, z)) as *const u8,
        dst.add(host_rect.offset(y, z)), region[0]);
    });
    Ok(true)
  }

  pub(crate) fn write_buffer_rect(&self, src: *const u8, dst: &Memory,
                                  host_rect: &BufferRect,
                                  buf_rect: &BufferRect,
                                  region: [usize; 3]) -> Result<bool> {
    self.rect_loop(region, |y, z| unsafe {
      std::ptr::copy_nonoverlapping(
        src.add(host_rect.offset(y, z)),
        dst.dev_ptr().add(buf_rect.offset(y, z)), region[0]);
    });
    Ok(true)
  }

  pub(crate) fn copy_buffer_rect(&self, src: &Memory, dst: &Memory,
                                 src_rect: &BufferRect,
                                 dst_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<bool> {
    self.rect_loop(region, |y, z| unsafe {
      std::ptr::copy_nonoverlapping(
        src.dev_ptr().add(src_rect.offset(y, z)) as *const u8,
        dst.dev_ptr().add(dst_rect.offset(y, z)), region[0]);
    });
    Ok(true)
  }

  pub(crate) fn fill_buffer(&self, dst: &Memory, pattern: &[u8],
                            origin: usize, size: usize) -> Result<bool> {
    if pattern.is_empty() {
      return Err(Error::InvalidValue);
    }
    let count = fill_pattern_count(size, pattern.len());
    for i in 0..count {
      unsafe {
        std::ptr::copy_nonoverlapping(
          pattern.as_ptr(),
          dst.dev_ptr().add(origin + i * pattern.len()), pattern.len());
      }
    }
    Ok(true)
  }

  pub(crate) fn read_image(&self, src: &Memory, dst: *mut u8,
                           origin: [usize; 3], region: [usize; 3],
                           row_pitch: usize, slice_pitch: usize)
    -> Result<bool>
  {
    let desc = *src.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    self.rect_loop(region, |y, z| unsafe {
      let s = src.dev_ptr()
        .add(desc.pixel_offset([origin[0], origin[1] + y, origin[2] + z]));
      std::ptr::copy_nonoverlapping(
        s as *const u8,
        dst.add(y * row_pitch + z * slice_pitch), region[0] * elem);
    });
    Ok(true)
  }

  pub(crate) fn write_image(&self, src: *const u8, dst: &Memory,
                            origin: [usize; 3], region: [usize; 3],
                            row_pitch: usize, slice_pitch: usize)
    -> Result<bool>
  {
    let desc = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    self.rect_loop(region, |y, z| unsafe {
      let d = dst.dev_ptr()
        .add(desc.pixel_offset([origin[0], origin[1] + y, origin[2] + z]));
      std::ptr::copy_nonoverlapping(
        src.add(y * row_pitch + z * slice_pitch), d, region[0] * elem);
    });
    Ok(true)
  }

  pub(crate) fn copy_image(&self, src: &Memory, dst: &Memory,
                           src_origin: [usize; 3], dst_origin: [usize; 3],
                           region: [usize; 3]) -> Result<bool> {
    let sd = *src.image_desc().ok_or(Error::InvalidMemObject)?;
    let dd = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = sd.format.elem_size();
    if elem != dd.format.elem_size() {
      return Err(Error::UnsupportedImageFormat);
    }
    self.rect_loop(region, |y, z| unsafe {
      let s = src.dev_ptr().add(sd.pixel_offset(
        [src_origin[0], src_origin[1] + y, src_origin[2] + z]));
      let d = dst.dev_ptr().add(dd.pixel_offset(
        [dst_origin[0], dst_origin[1] + y, dst_origin[2] + z]));
      std::ptr::copy_nonoverlapping(s as *const u8, d, region[0] * elem);
    });
    Ok(true)
  }

  pub(crate) fn copy_image_to_buffer(&self, src: &Memory, dst: &Memory,
                                     origin: [usize; 3],
                                     region: [usize; 3],
                                     dst_origin: usize) -> Result<bool> {
    let desc = *src.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    let row = region[0] * elem;
    let mut out = dst_origin;
    for z in 0..region[2] {
      for y in 0..region[1] {
        unsafe {
          let s = src.dev_ptr().add(desc.pixel_offset(
            [origin[0], origin[1] + y, origin[2] + z]));
          std::ptr::copy_nonoverlapping(s as *const u8,
                                        dst.dev_ptr().add(out), row);
        }
        out += row;
      }
    }
    Ok(true)
  }

  pub(crate) fn copy_buffer_to_image(&self, src: &Memory, dst: &Memory,
                                     src_origin: usize,
                                     origin: [usize; 3],
                                     region: [usize; 3]) -> Result<bool> {
    let desc = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    let elem = desc.format.elem_size();
    let row = region[0] * elem;
    let mut inp = src_origin;
    for z in 0..region[2] {
      for y in 0..region[1] {
        unsafe {
          let d = dst.dev_ptr().add(desc.pixel_offset(
            [origin[0], origin[1] + y, origin[2] + z]));
          std::ptr::copy_nonoverlapping(
            src.dev_ptr().add(inp) as *const u8, d, row);
        }
        inp += row;
      }
    }
    Ok(true)
  }

  pub(crate) fn fill_image(&self, dst: &Memory, color: &FillColor,
                           origin: [usize; 3], region: [usize; 3])
    -> Result<bool>
  {
    let desc = *dst.image_desc().ok_or(Error::InvalidMemObject)?;
    let px = pack_color(desc.format, color)?;
    let elem = desc.format.elem_size();
    self.rect_loop(region, |y, z| {
      for x in 0..region[0] {
        unsafe {
          let d = dst.dev_ptr().add(desc.pixel_offset(
            [origin[0] + x, origin[1] + y, origin[2] + z]));
          std::ptr::copy_nonoverlapping(px.as_ptr(), d, elem);
        }
      }
    });
    Ok(true)
  }
}
