
//! Memory objects and the host/device cache-coherence protocol.
//!
//! A `MemObject` is the owning, device-agnostic side: host backing store
//! plus a versioned coherence record. Each device keeps a `Memory` shadow
//! holding the device-local allocation and the version it last observed.
//! The rules:
//!
//!  - a host write bumps the owner version and clears the last writer;
//!  - a device write bumps the version and records that device as last
//!    writer, leaving the host copy stale;
//!  - `sync_cache_from_host` copies host to device only when the shadow
//!    version lags and this device is not already the last writer;
//!  - `sync_host_from_cache` writes back only when this device is the
//!    last writer.
//!
//! Views (sub-buffers, format-reinterpret image views) own no storage;
//! every coherence operation delegates to the root object, parent first.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::trace;

use hal::{MemoryPool, PoolPtr};
use hal::pool::PinnedPtr;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemId(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelOrder {
  R,
  Rg,
  Rgba,
  Bgra,
  SRgba,
}
impl ChannelOrder {
  pub fn channels(&self) -> usize {
    match self {
      ChannelOrder::R => 1,
      ChannelOrder::Rg => 2,
      ChannelOrder::Rgba | ChannelOrder::Bgra | ChannelOrder::SRgba => 4,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelType {
  Unorm8,
  Snorm8,
  Unorm16,
  Snorm16,
  Uint8,
  Uint16,
  Uint32,
  Sint8,
  Sint16,
  Sint32,
  Half,
  Float,
  Unorm101010,
}
impl ChannelType {
  /// Bytes per channel. `Unorm101010` packs the whole pixel; see
  /// `ImageFormat::elem_size`.
  pub fn bytes(&self) -> usize {
    match self {
      ChannelType::Unorm8 | ChannelType::Snorm8
      | ChannelType::Uint8 | ChannelType::Sint8 => 1,
      ChannelType::Unorm16 | ChannelType::Snorm16
      | ChannelType::Uint16 | ChannelType::Sint16
      | ChannelType::Half => 2,
      ChannelType::Uint32 | ChannelType::Sint32
      | ChannelType::Float | ChannelType::Unorm101010 => 4,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ImageFormat {
  pub order: ChannelOrder,
  pub ty: ChannelType,
}
impl ImageFormat {
  pub fn new(order: ChannelOrder, ty: ChannelType) -> Self {
    ImageFormat { order, ty }
  }
  /// Bytes per pixel.
  pub fn elem_size(&self) -> usize {
    match self.ty {
      ChannelType::Unorm101010 => 4,
      ty => self.order.channels() * ty.bytes(),
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ImageGeometry {
  OneD,
  TwoD,
  ThreeD,
  /// `height` is the layer count; `slice_pitch` is the layer stride.
  OneDArray,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
  pub geometry: ImageGeometry,
  pub format: ImageFormat,
  pub width: usize,
  pub height: usize,
  pub depth: usize,
  /// Bytes per row; zero means packed.
  pub row_pitch: usize,
  /// Bytes per slice (or layer); zero means packed.
  pub slice_pitch: usize,
}

impl ImageDesc {
  pub fn new_1d(format: ImageFormat, width: usize) -> Self {
    ImageDesc {
      geometry: ImageGeometry::OneD,
      format, width, height: 1, depth: 1,
      row_pitch: 0, slice_pitch: 0,
    }
  }
  pub fn new_2d(format: ImageFormat, width: usize, height: usize) -> Self {
    ImageDesc {
      geometry: ImageGeometry::TwoD,
      format, width, height, depth: 1,
      row_pitch: 0, slice_pitch: 0,
    }
  }
  pub fn new_3d(format: ImageFormat, width: usize, height: usize,
                depth: usize) -> Self {
    ImageDesc {
      geometry: ImageGeometry::ThreeD,
      format, width, height, depth,
      row_pitch: 0, slice_pitch: 0,
    }
  }
  pub fn new_1d_array(format: ImageFormat, width: usize,
                      layers: usize) -> Self {
    ImageDesc {
      geometry: ImageGeometry::OneDArray,
      format, width, height: layers, depth: 1,
      row_pitch: 0, slice_pitch: 0,
    }
  }

  /// Fills in packed pitches and validates explicit ones.
  pub(crate) fn resolve(mut self) -> Result<ImageDesc> {
    if self.width == 0 || self.height == 0 || self.depth == 0 {
      return Err(Error::InvalidValue);
    }
    let row = self.width * self.format.elem_size();
    if self.row_pitch == 0 {
      self.row_pitch = row;
    } else if self.row_pitch < row {
      return Err(Error::InvalidValue);
    }
    let slice = match self.geometry {
      ImageGeometry::OneD | ImageGeometry::OneDArray => self.row_pitch,
      _ => self.row_pitch * self.height,
    };
    if self.slice_pitch == 0 {
      self.slice_pitch = slice;
    } else if self.slice_pitch < slice {
      return Err(Error::InvalidValue);
    }
    Ok(self)
  }

  pub fn byte_size(&self) -> usize {
    match self.geometry {
      ImageGeometry::OneD => self.row_pitch,
      ImageGeometry::TwoD => self.row_pitch * self.height,
      ImageGeometry::ThreeD => self.slice_pitch * self.depth,
      ImageGeometry::OneDArray => self.slice_pitch * self.height,
    }
  }

  /// Byte offset of a pixel coordinate.
  pub fn pixel_offset(&self, origin: [usize; 3]) -> usize {
    origin[0] * self.format.elem_size()
      + origin[1] * self.row_pitch
      + origin[2] * self.slice_pitch
  }
}

/// A fill color, typed the way the API hands it over.
#[derive(Clone, Copy, Debug)]
pub enum FillColor {
  Float([f32; 4]),
  Sint([i32; 4]),
  Uint([u32; 4]),
}

/// Packs a fill color into one pixel of `format`. sRGB channels are
/// transfer-encoded before quantization; alpha stays linear.
pub fn pack_color(format: ImageFormat, color: &FillColor)
  -> Result<SmallVec<[u8; 16]>>
{
  let mut out = SmallVec::new();
  let srgb = format.order == ChannelOrder::SRgba;

  if format.ty == ChannelType::Unorm101010 {
    let f = match color {
      FillColor::Float(f) => f,
      _ => {
        return Err(Error::InvalidValue);
      },
    };
    let q = |c: f32| -> u32 {
      (c.max(0.0).min(1.0) * 1023.0 + 0.5) as u32
    };
    let bits = (q(f[0]) << 20) | (q(f[1]) << 10) | q(f[2]);
    out.extend_from_slice(&bits.to_le_bytes());
    return Ok(out);
  }

  // Source channel per output position.
  let channels: &[usize] = match format.order {
    ChannelOrder::R => &[0],
    ChannelOrder::Rg => &[0, 1],
    ChannelOrder::Rgba | ChannelOrder::SRgba => &[0, 1, 2, 3],
    ChannelOrder::Bgra => &[2, 1, 0, 3],
  };

  for (pos, &ch) in channels.iter().enumerate() {
    match (format.ty, color) {
      (ChannelType::Unorm8, FillColor::Float(f)) => {
        let c = if srgb && pos < 3 { srgb_encode(f[ch]) } else { f[ch] };
        out.push((c.max(0.0).min(1.0) * 255.0 + 0.5) as u8);
      },
      (ChannelType::Snorm8, FillColor::Float(f)) => {
        let v = (f[ch].max(-1.0).min(1.0) * 127.0).round() as i8;
        out.push(v as u8);
      },
      (ChannelType::Unorm16, FillColor::Float(f)) => {
        let v = (f[ch].max(0.0).min(1.0) * 65535.0 + 0.5) as u16;
        out.extend_from_slice(&v.to_le_bytes());
      },
      (ChannelType::Snorm16, FillColor::Float(f)) => {
        let v = (f[ch].max(-1.0).min(1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
      },
      (ChannelType::Half, FillColor::Float(f)) => {
        out.extend_from_slice(&f32_to_f16(f[ch]).to_le_bytes());
      },
      (ChannelType::Float, FillColor::Float(f)) => {
        out.extend_from_slice(&f[ch].to_le_bytes());
      },
      (ChannelType::Uint8, FillColor::Uint(u)) => {
        out.push(u[ch].min(u8::max_value() as u32) as u8);
      },
      (ChannelType::Uint16, FillColor::Uint(u)) => {
        let v = u[ch].min(u16::max_value() as u32) as u16;
        out.extend_from_slice(&v.to_le_bytes());
      },
      (ChannelType::Uint32, FillColor::Uint(u)) => {
        out.extend_from_slice(&u[ch].to_le_bytes());
      },
      (ChannelType::Sint8, FillColor::Sint(s)) => {
        let v = s[ch].max(i8::min_value() as i32)
          .min(i8::max_value() as i32) as i8;
        out.push(v as u8);
      },
      (ChannelType::Sint16, FillColor::Sint(s)) => {
        let v = s[ch].max(i16::min_value() as i32)
          .min(i16::max_value() as i32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
      },
      (ChannelType::Sint32, FillColor::Sint(s)) => {
        out.extend_from_slice(&s[ch].to_le_bytes());
      },
      _ => {
        return Err(Error::InvalidValue);
      },
    }
  }
  Ok(out)
}

/// Linear-to-sRGB transfer function, the piecewise approximation with a
/// 5/12 power segment. Maps 0.5 to 188/255.
pub(crate) fn srgb_encode(c: f32) -> f32 {
  if c <= 0.0031308 {
    12.92 * c
  } else {
    1.055 * c.max(0.0).powf(5.0 / 12.0) - 0.055
  }
}

pub(crate) fn f32_to_f16(v: f32) -> u16 {
  let bits = v.to_bits();
  let sign = ((bits >> 16) & 0x8000) as u16;
  let exp = ((bits >> 23) & 0xff) as i32 - 127 + 15;
  let man = bits & 0x7f_ffff;
  if exp >= 0x1f {
    return sign | 0x7c00;
  }
  if exp <= 0 {
    if exp < -10 {
      return sign;
    }
    let man = man | 0x80_0000;
    return sign | (man >> (14 - exp)) as u16;
  }
  sign | ((exp as u32) << 10 | (man >> 13)) as u16
}

#[derive(Clone, Debug)]
pub enum MemKind {
  Buffer,
  Image(ImageDesc),
  View {
    parent: MemId,
    offset: usize,
    /// Reinterpreted image layout for format views; `None` for
    /// sub-buffers.
    image: Option<ImageDesc>,
  },
}

pub(crate) struct CoherenceState {
  pub version: u64,
  pub last_writer: Option<DeviceId>,
}

/// The owning side of an allocation. Shared across devices.
pub struct MemObject {
  id: MemId,
  size: usize,
  kind: MemKind,
  host: Option<PoolPtr>,
  pub(crate) state: Mutex<CoherenceState>,
}

impl MemObject {
  pub fn id(&self) -> MemId {
    self.id
  }
  pub fn size(&self) -> usize {
    self.size
  }
  pub fn kind(&self) -> &MemKind {
    &self.kind
  }
  pub fn is_view(&self) -> bool {
    matches!(self.kind, MemKind::View { .. })
  }
  pub fn image_desc(&self) -> Option<&ImageDesc> {
    match &self.kind {
      MemKind::Image(desc) => Some(desc),
      MemKind::View { image: Some(desc), .. } => Some(desc),
      _ => None,
    }
  }
  pub fn version(&self) -> u64 {
    self.state.lock().version
  }
  pub fn last_writer(&self) -> Option<DeviceId> {
    self.state.lock().last_writer
  }
}

/// The object registry: creates, resolves and destroys mem objects.
/// Owned by the platform; devices hold an `Arc`.
pub struct MemoryArena {
  host_pool: MemoryPool,
  objects: RwLock<HashMap<u32, Arc<MemObject>>>,
  next: AtomicU32,
}

impl MemoryArena {
  pub(crate) fn new(host_pool: MemoryPool) -> Arc<MemoryArena> {
    Arc::new(MemoryArena {
      host_pool,
      objects: RwLock::new(HashMap::new()),
      next: AtomicU32::new(1),
    })
  }

  fn insert(&self, size: usize, kind: MemKind,
            host: Option<PoolPtr>) -> MemId {
    let id = MemId(self.next.fetch_add(1, Ordering::Relaxed));
    let obj = Arc::new(MemObject {
      id, size, kind, host,
      state: Mutex::new(CoherenceState {
        version: 0,
        last_writer: None,
      }),
    });
    trace!(id = id.0, size, "mem object created");
    self.objects.write().insert(id.0, obj);
    id
  }

  pub fn create_buffer(&self, size: usize) -> Result<MemId> {
    if size == 0 {
      return Err(Error::InvalidValue);
    }
    let host = self.host_pool.alloc(size)
      .map_err(|_| Error::MemObjectAllocationFailure )?;
    Ok(self.insert(size, MemKind::Buffer, Some(host)))
  }

  /// Buffer with initial contents; counts as a host write.
  pub fn create_buffer_init(&self, data: &[u8]) -> Result<MemId> {
    let id = self.create_buffer(data.len())?;
    let obj = self.get(id)?;
    let host = obj.host.as_ref()
      .ok_or(Error::InvalidMemObject)?;
    unsafe {
      std::ptr::copy_nonoverlapping(data.as_ptr(), host.as_ptr(),
                                    data.len());
    }
    self.mark_host_write(id)?;
    Ok(id)
  }

  pub fn create_image(&self, desc: ImageDesc) -> Result<MemId> {
    let desc = desc.resolve()?;
    let size = desc.byte_size();
    let host = self.host_pool.alloc(size)
      .map_err(|_| Error::MemObjectAllocationFailure )?;
    Ok(self.insert(size, MemKind::Image(desc), Some(host)))
  }

  /// A sub-buffer window into `parent`. Owns no storage.
  pub fn create_sub_buffer(&self, parent: MemId, offset: usize,
                           size: usize) -> Result<MemId> {
    let p = self.get(parent)?;
    if p.is_view() || offset + size > p.size() || size == 0 {
      return Err(Error::InvalidValue);
    }
    Ok(self.insert(size, MemKind::View {
      parent, offset, image: None,
    }, None))
  }

  /// A bit-compatible reinterpretation of an image under another format.
  /// The pixel size must not change; the view shares the parent's bytes.
  pub fn create_image_view(&self, parent: MemId, format: ImageFormat)
    -> Result<MemId>
  {
    let p = self.get(parent)?;
    let desc = match p.kind() {
      MemKind::Image(desc) => *desc,
      _ => {
        return Err(Error::InvalidMemObject);
      },
    };
    if format.elem_size() != desc.format.elem_size() {
      return Err(Error::UnsupportedImageFormat);
    }
    let mut view_desc = desc;
    view_desc.format = format;
    Ok(self.insert(p.size(), MemKind::View {
      parent,
      offset: 0,
      image: Some(view_desc),
    }, None))
  }

  pub fn get(&self, id: MemId) -> Result<Arc<MemObject>> {
    self.objects.read().get(&id.0).cloned()
      .ok_or(Error::InvalidMemObject)
  }

  /// Root object and the accumulated byte offset of `obj` inside it.
  pub(crate) fn root_of(&self, obj: &Arc<MemObject>)
    -> Result<(Arc<MemObject>, usize)>
  {
    let mut cur = obj.clone();
    let mut off = 0;
    while let MemKind::View { parent, offset, .. } = cur.kind {
      off += offset;
      cur = self.get(parent)?;
    }
    Ok((cur, off))
  }

  /// Host backing pointer, views resolved through their root.
  pub fn host_ptr(&self, obj: &Arc<MemObject>) -> Result<*mut u8> {
    let (root, off) = self.root_of(obj)?;
    let host = root.host.as_ref()
      .ok_or(Error::InvalidMemObject)?;
    Ok(host.offset(off))
  }

  /// Records a host-side write: device shadows become stale.
  pub fn mark_host_write(&self, id: MemId) -> Result<()> {
    let obj = self.get(id)?;
    let (root, _) = self.root_of(&obj)?;
    let mut st = root.state.lock();
    st.version += 1;
    st.last_writer = None;
    Ok(())
  }

  /// Drops the object. The caller is responsible for freeing device
  /// shadows first.
  pub fn release(&self, id: MemId) -> Result<()> {
    let obj = self.objects.write().remove(&id.0)
      .ok_or(Error::InvalidMemObject)?;
    if let Some(host) = obj.host {
      self.host_pool.free(host)?;
    }
    Ok(())
  }

  pub fn live_objects(&self) -> usize {
    self.objects.read().len()
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryFlags {
  /// Device accesses the host backing directly; no separate copy.
  pub host_memory_direct_access: bool,
  /// The host backing is pinned for the DMA engine.
  pub pinned_memory_alloced: bool,
}

/// Map bookkeeping. Mapped pointers come straight from the owner's host
/// backing store; only the refcounts live here.
pub(crate) struct IndirectMap {
  pub count: u32,
  pub writers: u32,
}

/// A device's shadow of a `MemObject`: the device-local bytes plus the
/// owner version they correspond to. Views share the root's allocation.
pub struct Memory {
  owner: Arc<MemObject>,
  root: Arc<MemObject>,
  root_offset: usize,
  dev: PoolPtr,
  size: usize,
  flags: Mutex<MemoryFlags>,
  /// Owner version this shadow last synchronized to. Meaningful on the
  /// root shadow only; view shadows delegate.
  pub(crate) version: Mutex<u64>,
  pub(crate) pinned: Mutex<Option<PinnedPtr>>,
  pub(crate) indirect: Mutex<IndirectMap>,
}

impl Memory {
  pub(crate) fn new(owner: Arc<MemObject>, root: Arc<MemObject>,
                    root_offset: usize, dev: PoolPtr, size: usize) -> Self {
    Memory {
      owner, root, root_offset, dev, size,
      flags: Mutex::new(MemoryFlags::default()),
      version: Mutex::new(0),
      pinned: Mutex::new(None),
      indirect: Mutex::new(IndirectMap {
        count: 0,
        writers: 0,
      }),
    }
  }

  pub fn id(&self) -> MemId {
    self.owner.id()
  }
  pub fn owner(&self) -> &Arc<MemObject> {
    &self.owner
  }
  pub(crate) fn root(&self) -> &Arc<MemObject> {
    &self.root
  }
  pub fn is_view(&self) -> bool {
    self.owner.is_view()
  }
  pub fn size(&self) -> usize {
    self.size
  }
  pub fn image_desc(&self) -> Option<&ImageDesc> {
    self.owner.image_desc()
  }
  pub fn flags(&self) -> MemoryFlags {
    *self.flags.lock()
  }
  pub(crate) fn set_pinned(&self, pinned: PinnedPtr) {
    *self.pinned.lock() = Some(pinned);
    self.flags.lock().pinned_memory_alloced = true;
  }
  pub(crate) fn take_pinned(&self) -> Option<PinnedPtr> {
    self.flags.lock().pinned_memory_alloced = false;
    self.pinned.lock().take()
  }

  pub fn dev_ptr(&self) -> *mut u8 {
    self.dev.offset(self.root_offset)
  }
  pub fn dev_addr(&self) -> usize {
    self.dev_ptr() as usize
  }
  /// Device address range, for hazard tracking.
  pub fn dev_range(&self) -> (usize, usize) {
    let a = self.dev_addr();
    (a, a + self.size)
  }
  /// The root allocation, handed back to the pool on teardown.
  pub(crate) fn dev_alloc(&self) -> PoolPtr {
    self.dev
  }

  pub(crate) fn host_nonnull(&self, arena: &MemoryArena)
    -> Result<NonNull<u8>>
  {
    let p = arena.host_ptr(&self.owner)?;
    NonNull::new(p).ok_or(Error::InvalidMemObject)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use hal::Context;

  fn arena() -> Arc<MemoryArena> {
    let ctx = Context::new(0).unwrap();
    let pool = ctx.cpu_agent()
      .find_pool(|f| f.fine_grained() )
      .unwrap();
    MemoryArena::new(pool)
  }

  #[test]
  fn buffer_create_release() {
    let a = arena();
    let id = a.create_buffer(4096).unwrap();
    let obj = a.get(id).unwrap();
    assert_eq!(obj.size(), 4096);
    assert_eq!(obj.version(), 0);
    a.release(id).unwrap();
    assert_eq!(a.live_objects(), 0);
    assert!(a.get(id).is_err());
  }

  #[test]
  fn host_write_bumps_root_version() {
    let a = arena();
    let id = a.create_buffer(1024).unwrap();
    let sub = a.create_sub_buffer(id, 256, 128).unwrap();

    a.mark_host_write(sub).unwrap();
    assert_eq!(a.get(id).unwrap().version(), 1);
    assert_eq!(a.get(id).unwrap().last_writer(), None);
  }

  #[test]
  fn sub_buffer_resolves_through_root() {
    let a = arena();
    let id = a.create_buffer(1024).unwrap();
    let sub = a.create_sub_buffer(id, 100, 24).unwrap();
    let obj = a.get(sub).unwrap();

    let root_ptr = a.host_ptr(&a.get(id).unwrap()).unwrap();
    let sub_ptr = a.host_ptr(&obj).unwrap();
    assert_eq!(sub_ptr as usize - root_ptr as usize, 100);

    assert!(a.create_sub_buffer(id, 1020, 8).is_err());
  }

  #[test]
  fn image_view_requires_same_elem_size() {
    let a = arena();
    let fmt = ImageFormat::new(ChannelOrder::SRgba, ChannelType::Unorm8);
    let img = a.create_image(ImageDesc::new_2d(fmt, 16, 16)).unwrap();

    let ok = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Uint8);
    let v = a.create_image_view(img, ok).unwrap();
    assert_eq!(a.get(v).unwrap().image_desc().unwrap().format, ok);

    let bad = ImageFormat::new(ChannelOrder::R, ChannelType::Uint8);
    assert!(a.create_image_view(img, bad).is_err());
  }

  #[test]
  fn image_pitches_resolve_packed() {
    let a = arena();
    let fmt = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float);
    let img = a.create_image(ImageDesc::new_3d(fmt, 8, 4, 2)).unwrap();
    let obj = a.get(img).unwrap();
    let desc = obj.image_desc().unwrap();
    assert_eq!(desc.row_pitch, 8 * 16);
    assert_eq!(desc.slice_pitch, 8 * 16 * 4);
    assert_eq!(obj.size(), 8 * 16 * 4 * 2);
  }

  #[test]
  fn srgb_half_encodes_as_188() {
    let fmt = ImageFormat::new(ChannelOrder::SRgba, ChannelType::Unorm8);
    let px = pack_color(fmt, &FillColor::Float([0.5, 0.0, 1.0, 0.5]))
      .unwrap();
    assert_eq!(px[0], 188);
    assert_eq!(px[1], 0);
    assert_eq!(px[2], 255);
    // alpha is not transfer-encoded
    assert_eq!(px[3], 128);
  }

  #[test]
  fn bgra_swizzles() {
    let fmt = ImageFormat::new(ChannelOrder::Bgra, ChannelType::Unorm8);
    let px = pack_color(fmt, &FillColor::Float([1.0, 0.5, 0.0, 1.0]))
      .unwrap();
    assert_eq!(&px[..], &[0, 128, 255, 255]);
  }

  #[test]
  fn unorm_101010_packs_pixel() {
    let fmt = ImageFormat::new(ChannelOrder::Rgba,
                               ChannelType::Unorm101010);
    assert_eq!(fmt.elem_size(), 4);
    let px = pack_color(fmt, &FillColor::Float([1.0, 0.0, 1.0, 0.0]))
      .unwrap();
    let bits = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
    assert_eq!(bits, (1023 << 20) | 1023);
  }
}
