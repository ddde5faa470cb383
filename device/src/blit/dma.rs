
//! The DMA strategy: transfers through the copy engine.
//!
//! Host-bound transfers either pin the user range in chunks (large
//! transfers) or bounce through pooled staging buffers (small ones).
//! Completion waits spin for small copies and block for anything above
//! `SPIN_WAIT_MAX_BYTES`.

use parking_lot::Mutex;
use tracing::trace;

use hal::signal::{ConditionOrdering, Signal, WaitState};
use hal::Context;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::settings::Settings;

use super::{BufferRect, SPIN_WAIT_MAX_BYTES};

pub(crate) struct DmaBlit {
  ctx: Context,
  // One reusable completion signal; serializes this engine's copies.
  completion: Mutex<Signal>,
  pinned_xfer_size: usize,
  pinned_min_xfer_size: usize,
  staged_xfer_size: usize,
}

impl DmaBlit {
  pub(crate) fn new(settings: &Settings, ctx: Context) -> DmaBlit {
    DmaBlit {
      ctx,
      completion: Mutex::new(Signal::new(0)),
      pinned_xfer_size: settings.pinned_xfer_size.max(4096),
      pinned_min_xfer_size: settings.pinned_min_xfer_size,
      staged_xfer_size: settings.staged_xfer_size.max(4096),
    }
  }

  fn wait(signal: &Signal, bytes: usize) {
    let state = if bytes <= SPIN_WAIT_MAX_BYTES {
      WaitState::Active
    } else {
      WaitState::Blocked
    };
    signal.wait_scacquire(ConditionOrdering::Equal, 0, None, state);
  }

  /// One synchronous engine copy.
  fn copy(&self, dst: *mut u8, src: *const u8, bytes: usize)
    -> Result<()>
  {
    let sig = self.completion.lock();
    sig.silent_store_relaxed(1);
    unsafe {
      self.ctx.async_copy(dst, src, bytes, &[], sig.as_ref())?;
    }
    Self::wait(&sig, bytes);
    Ok(())
  }

  /// One synchronous pitched copy of `rows` rows.
  fn copy_rect(&self, dst: *mut u8, dst_pitch: usize, src: *const u8,
               src_pitch: usize, row_bytes: usize, rows: usize)
    -> Result<()>
  {
    let sig = self.completion.lock();
    sig.silent_store_relaxed(1);
    unsafe {
      self.ctx.async_copy_rect(dst, dst_pitch, src, src_pitch,
                               row_bytes, rows, &[], sig.as_ref())?;
    }
    Self::wait(&sig, row_bytes * rows);
    Ok(())
  }

  pub(crate) fn read_buffer(&self, dev: &Device, src: &Memory,
                            dst: *mut u8, origin: usize, size: usize)
    -> Result<bool>
  {
    if src.flags().host_memory_direct_access {
      return Ok(false);
    }
    if size >= self.pinned_min_xfer_size {
      self.pinned_to_host(dev, src.dev_ptr().add_checked(origin)?, dst,
                          size)?;
    } else {
      self.staged_to_host(dev, src.dev_ptr().add_checked(origin)?, dst,
                          size)?;
    }
    Ok(true)
  }

  pub(crate) fn write_buffer(&self, dev: &Device, src: *const u8,
                             dst: &Memory, origin: usize, size: usize)
    -> Result<bool>
  {
    if dst.flags().host_memory_direct_access {
      return Ok(false);
    }
    if size >= self.pinned_min_xfer_size {
      self.pinned_from_host(dev, src, dst.dev_ptr().add_checked(origin)?,
                            size)?;
    } else {
      self.staged_from_host(dev, src, dst.dev_ptr().add_checked(origin)?,
                            size)?;
    }
    Ok(true)
  }

  /// Device to host through chunked pins of the destination.
  fn pinned_to_host(&self, dev: &Device, src: *const u8, dst: *mut u8,
                    size: usize) -> Result<()> {
    let mut done = 0;
    while done < size {
      let chunk = self.pinned_xfer_size.min(size - done);
      let (pinned, delta) = dev.pin_host_range(
        unsafe { dst.add(done) }, chunk)?;
      trace!(chunk, delta, "pinned read chunk");
      let r = self.copy(unsafe { pinned.as_ptr().add(delta) },
                        unsafe { src.add(done) }, chunk);
      dev.unpin(pinned);
      r?;
      done += chunk;
    }
    Ok(())
  }

  fn pinned_from_host(&self, dev: &Device, src: *const u8, dst: *mut u8,
                      size: usize) -> Result<()> {
    let mut done = 0;
    while done < size {
      let chunk = self.pinned_xfer_size.min(size - done);
      let (pinned, delta) = dev.pin_host_range(
        unsafe { src.add(done) as *mut u8 }, chunk)?;
      trace!(chunk, delta, "pinned write chunk");
      let r = self.copy(unsafe { dst.add(done) },
                        unsafe { pinned.as_ptr().add(delta) as *const u8 },
                        chunk);
      dev.unpin(pinned);
      r?;
      done += chunk;
    }
    Ok(())
  }

  /// Device to host bounced through a pooled staging buffer.
  fn staged_to_host(&self, dev: &Device, src: *const u8, dst: *mut u8,
                    size: usize) -> Result<()> {
    let buf = dev.acquire_xfer_buf()?;
    let step = self.staged_xfer_size.min(buf.len());
    let mut done = 0;
    while done < size {
      let chunk = step.min(size - done);
      let r = self.copy(buf.as_ptr(), unsafe { src.add(done) }, chunk);
      if let Err(e) = r {
        dev.release_xfer_buf(buf);
        return Err(e);
      }
      unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr() as *const u8,
                                      dst.add(done), chunk);
      }
      done += chunk;
    }
    dev.release_xfer_buf(buf);
    Ok(())
  }

  fn staged_from_host(&self, dev: &Device, src: *const u8, dst: *mut u8,
                      size: usize) -> Result<()> {
    let buf = dev.acquire_xfer_buf()?;
    let step = self.staged_xfer_size.min(buf.len());
    let mut done = 0;
    while done < size {
      let chunk = step.min(size - done);
      unsafe {
        std::ptr::copy_nonoverlapping(src.add(done),
                                      buf.as_ptr(), chunk);
      }
      let r = self.copy(unsafe { dst.add(done) },
                        buf.as_ptr() as *const u8, chunk);
      if let Err(e) = r {
        dev.release_xfer_buf(buf);
        return Err(e);
      }
      done += chunk;
    }
    dev.release_xfer_buf(buf);
    Ok(())
  }

  pub(crate) fn copy_buffer(&self, src: &Memory, dst: &Memory,
                            src_origin: usize, dst_origin: usize,
                            size: usize) -> Result<bool> {
    self.copy(dst.dev_ptr().add_checked(dst_origin)?,
              src.dev_ptr().add_checked(src_origin)? as *const u8,
              size)?;
    Ok(true)
  }

  pub(crate) fn read_buffer_rect(&self, dev: &Device, src: &Memory,
                                 dst: *mut u8, buf_rect: &BufferRect,
                                 host_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<bool> {
    if src.flags().host_memory_direct_access {
      return Ok(false);
    }
    let extent = host_rect.offset(region[1] - 1, region[2] - 1)
      + region[0];
    let (pinned, delta) = dev.pin_host_range(dst, extent)?;
    let base = unsafe { pinned.as_ptr().add(delta) };
    for z in 0..region[2] {
      let r = self.copy_rect(
        unsafe { base.add(host_rect.offset(0, z)) },
        host_rect.row_pitch,
        unsafe {
          src.dev_ptr().add(buf_rect.offset(0, z)) as *const u8
        },
        buf_rect.row_pitch, region[0], region[1]);
      if let Err(e) = r {
        dev.unpin(pinned);
        return Err(e);
      }
    }
    dev.unpin(pinned);
    Ok(true)
  }

  pub(crate) fn write_buffer_rect(&self, dev: &Device, src: *const u8,
                                  dst: &Memory, host_rect: &BufferRect,
                                  buf_rect: &BufferRect,
                                  region: [usize; 3]) -> Result<bool> {
    if dst.flags().host_memory_direct_access {
      return Ok(false);
    }
    let extent = host_rect.offset(region[1] - 1, region[2] - 1)
      + region[0];
    let (pinned, delta) = dev.pin_host_range(src as *mut u8, extent)?;
    let base = unsafe { pinned.as_ptr().add(delta) };
    for z in 0..region[2] {
      let r = self.copy_rect(
        unsafe { dst.dev_ptr().add(buf_rect.offset(0, z)) },
        buf_rect.row_pitch,
        unsafe { base.add(host_rect.offset(0, z)) as *const u8 },
        host_rect.row_pitch, region[0], region[1]);
      if let Err(e) = r {
        dev.unpin(pinned);
        return Err(e);
      }
    }
    dev.unpin(pinned);
    Ok(true)
  }

  /// Device-to-device rect; the engine requires 4 byte alignment on
  /// every address and pitch, otherwise pass on.
  pub(crate) fn copy_buffer_rect(&self, src: &Memory, dst: &Memory,
                                 src_rect: &BufferRect,
                                 dst_rect: &BufferRect,
                                 region: [usize; 3]) -> Result<bool> {
    let aligned = |v: usize| v % 4 == 0;
    if !aligned(region[0])
      || !aligned(src.dev_addr() + src_rect.start)
      || !aligned(dst.dev_addr() + dst_rect.start)
      || !aligned(src_rect.row_pitch) || !aligned(dst_rect.row_pitch)
      || !aligned(src_rect.slice_pitch) || !aligned(dst_rect.slice_pitch)
    {
      return Ok(false);
    }
    for z in 0..region[2] {
      self.copy_rect(
        unsafe { dst.dev_ptr().add(dst_rect.offset(0, z)) },
        dst_rect.row_pitch,
        unsafe { src.dev_ptr().add(src_rect.offset(0, z)) as *const u8 },
        src_rect.row_pitch, region[0], region[1])?;
    }
    Ok(true)
  }

  /// Straight pitched image read; a byte mover, so any format goes.
  pub(crate) fn read_image(&self, dev: &Device, src: &Memory,
                           dst: *mut u8, origin: [usize; 3],
                           region: [usize; 3], row_pitch: usize,
                           slice_pitch: usize) -> Result<bool> {
    let desc = match src.image_desc() {
      Some(d) => *d,
      None => {
        return Err(Error::InvalidMemObject);
      },
    };
    if src.flags().host_memory_direct_access {
      return Ok(false);
    }
    let elem = desc.format.elem_size();
    let extent = (region[2] - 1) * slice_pitch
      + (region[1] - 1) * row_pitch + region[0] * elem;
    let (pinned, delta) = dev.pin_host_range(dst, extent)?;
    let base = unsafe { pinned.as_ptr().add(delta) };
    for z in 0..region[2] {
      let s = src.dev_ptr().add_checked(desc.pixel_offset(
        [origin[0], origin[1], origin[2] + z]))?;
      let r = self.copy_rect(unsafe { base.add(z * slice_pitch) },
                             row_pitch, s as *const u8, desc.row_pitch,
                             region[0] * elem, region[1]);
      if let Err(e) = r {
        dev.unpin(pinned);
        return Err(e);
      }
    }
    dev.unpin(pinned);
    Ok(true)
  }

  pub(crate) fn write_image(&self, dev: &Device, src: *const u8,
                            dst: &Memory, origin: [usize; 3],
                            region: [usize; 3], row_pitch: usize,
                            slice_pitch: usize) -> Result<bool> {
    let desc = match dst.image_desc() {
      Some(d) => *d,
      None => {
        return Err(Error::InvalidMemObject);
      },
    };
    if dst.flags().host_memory_direct_access {
      return Ok(false);
    }
    let elem = desc.format.elem_size();
    let extent = (region[2] - 1) * slice_pitch
      + (region[1] - 1) * row_pitch + region[0] * elem;
    let (pinned, delta) = dev.pin_host_range(src as *mut u8, extent)?;
    let base = unsafe { pinned.as_ptr().add(delta) };
    for z in 0..region[2] {
      let d = dst.dev_ptr().add_checked(desc.pixel_offset(
        [origin[0], origin[1], origin[2] + z]))?;
      let r = self.copy_rect(d, desc.row_pitch,
                             unsafe {
                               base.add(z * slice_pitch) as *const u8
                             },
                             row_pitch, region[0] * elem, region[1]);
      if let Err(e) = r {
        dev.unpin(pinned);
        return Err(e);
      }
    }
    dev.unpin(pinned);
    Ok(true)
  }
}

/// Checked pointer offset; keeps arithmetic audits in one place.
trait PtrExt {
  fn add_checked(self, bytes: usize) -> Result<*mut u8>;
}
impl PtrExt for *mut u8 {
  fn add_checked(self, bytes: usize) -> Result<*mut u8> {
    (self as usize).checked_add(bytes)
      .map(|p| p as *mut u8 )
      .ok_or(Error::InvalidValue)
  }
}
