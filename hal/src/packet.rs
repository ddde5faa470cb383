
//! AQL packet layout.
//!
//! Every slot in a user queue is a 64 byte record the command processor
//! parses directly; the field offsets and header bit positions below are
//! the published packet format and must not change. Header bits are
//! expressed as explicit shift/mask constants; bit-field structs have
//! implementation defined layout and are not usable for a hardware ABI.

use std::sync::atomic::{AtomicU32, Ordering};

pub const PACKET_SIZE: usize = 64;

// Header bit positions.
pub const HEADER_TYPE: u32 = 0;
pub const HEADER_TYPE_WIDTH: u32 = 8;
pub const HEADER_BARRIER: u32 = 8;
pub const HEADER_SCACQUIRE_FENCE_SCOPE: u32 = 9;
pub const HEADER_SCRELEASE_FENCE_SCOPE: u32 = 11;
pub const HEADER_FENCE_SCOPE_WIDTH: u32 = 2;

// Dispatch setup bits.
pub const SETUP_DIMENSIONS: u32 = 0;
pub const SETUP_DIMENSIONS_WIDTH: u32 = 2;

// Kernel dispatch packet field offsets.
pub const DISPATCH_SETUP: usize = 2;
pub const DISPATCH_WORKGROUP_SIZE_X: usize = 4;
pub const DISPATCH_WORKGROUP_SIZE_Y: usize = 6;
pub const DISPATCH_WORKGROUP_SIZE_Z: usize = 8;
pub const DISPATCH_GRID_SIZE_X: usize = 12;
pub const DISPATCH_GRID_SIZE_Y: usize = 16;
pub const DISPATCH_GRID_SIZE_Z: usize = 20;
pub const DISPATCH_PRIVATE_SEGMENT_SIZE: usize = 24;
pub const DISPATCH_GROUP_SEGMENT_SIZE: usize = 28;
pub const DISPATCH_KERNEL_OBJECT: usize = 32;
pub const DISPATCH_KERNARG_ADDRESS: usize = 40;
pub const DISPATCH_COMPLETION_SIGNAL: usize = 56;

// Barrier-AND packet field offsets.
pub const BARRIER_AND_DEP_SIGNALS: usize = 8;
pub const BARRIER_AND_DEP_COUNT: usize = 5;
pub const BARRIER_AND_COMPLETION_SIGNAL: usize = 56;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PacketType {
  VendorSpecific,
  Invalid,
  KernelDispatch,
  BarrierAnd,
  AgentDispatch,
  BarrierOr,
}
impl PacketType {
  #[inline(always)]
  pub fn as_u16(self) -> u16 {
    match self {
      PacketType::VendorSpecific => 0,
      PacketType::Invalid => 1,
      PacketType::KernelDispatch => 2,
      PacketType::BarrierAnd => 3,
      PacketType::AgentDispatch => 4,
      PacketType::BarrierOr => 5,
    }
  }
  pub fn from_u16(v: u16) -> Option<PacketType> {
    let t = match v {
      0 => PacketType::VendorSpecific,
      1 => PacketType::Invalid,
      2 => PacketType::KernelDispatch,
      3 => PacketType::BarrierAnd,
      4 => PacketType::AgentDispatch,
      5 => PacketType::BarrierOr,
      _ => {
        return None;
      },
    };
    Some(t)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FenceScope {
  None,
  Agent,
  System,
}
impl FenceScope {
  #[inline(always)]
  pub fn as_u16(self) -> u16 {
    match self {
      FenceScope::None => 0,
      FenceScope::Agent => 1,
      FenceScope::System => 2,
    }
  }
  pub fn from_u16(v: u16) -> FenceScope {
    match v & ((1 << HEADER_FENCE_SCOPE_WIDTH) - 1) {
      1 => FenceScope::Agent,
      2 => FenceScope::System,
      _ => FenceScope::None,
    }
  }
}

/// Builds a packet header word.
pub fn header(ty: PacketType,
              scacquire: FenceScope,
              screlease: FenceScope,
              barrier: bool) -> u16 {
  let mut header = ty.as_u16() << HEADER_TYPE;
  header |= scacquire.as_u16() << HEADER_SCACQUIRE_FENCE_SCOPE;
  header |= screlease.as_u16() << HEADER_SCRELEASE_FENCE_SCOPE;
  header |= (barrier as u16) << HEADER_BARRIER;
  header
}

#[inline(always)]
pub fn header_type(h: u16) -> Option<PacketType> {
  PacketType::from_u16((h >> HEADER_TYPE) & ((1 << HEADER_TYPE_WIDTH) - 1))
}
#[inline(always)]
pub fn header_barrier(h: u16) -> bool {
  (h >> HEADER_BARRIER) & 1 != 0
}
#[inline(always)]
pub fn header_scacquire(h: u16) -> FenceScope {
  FenceScope::from_u16(h >> HEADER_SCACQUIRE_FENCE_SCOPE)
}
#[inline(always)]
pub fn header_screlease(h: u16) -> FenceScope {
  FenceScope::from_u16(h >> HEADER_SCRELEASE_FENCE_SCOPE)
}

/// One ring slot. 64 byte aligned so a slot never straddles cachelines.
#[repr(C, align(64))]
pub struct PacketSlot(pub [u8; PACKET_SIZE]);

impl PacketSlot {
  pub const INVALID: PacketSlot =
    PacketSlot([0; PACKET_SIZE]);

  #[inline(always)]
  fn write_u16(&mut self, offset: usize, v: u16) {
    self.0[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
  }
  #[inline(always)]
  fn write_u32(&mut self, offset: usize, v: u32) {
    self.0[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
  }
  #[inline(always)]
  fn write_u64(&mut self, offset: usize, v: u64) {
    self.0[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
  }

  #[inline(always)]
  pub fn read_u16(&self, offset: usize) -> u16 {
    let mut b = [0; 2];
    b.copy_from_slice(&self.0[offset..offset + 2]);
    u16::from_le_bytes(b)
  }
  #[inline(always)]
  pub fn read_u32(&self, offset: usize) -> u32 {
    let mut b = [0; 4];
    b.copy_from_slice(&self.0[offset..offset + 4]);
    u32::from_le_bytes(b)
  }
  #[inline(always)]
  pub fn read_u64(&self, offset: usize) -> u64 {
    let mut b = [0; 8];
    b.copy_from_slice(&self.0[offset..offset + 8]);
    u64::from_le_bytes(b)
  }

  /// Atomically release-stores the first packet word (header + setup).
  /// The consumer acquire-loads the same word; publishing the header last
  /// is what makes the rest of the payload visible.
  #[inline]
  pub fn store_header_rel(&self, header: u16, setup: u16) {
    let word = header as u32 | ((setup as u32) << 16);
    let p = self as *const PacketSlot as *const AtomicU32;
    unsafe { (*p).store(word, Ordering::Release) };
  }
  #[inline]
  pub fn load_header_acq(&self) -> (u16, u16) {
    let p = self as *const PacketSlot as *const AtomicU32;
    let word = unsafe { (*p).load(Ordering::Acquire) };
    (word as u16, (word >> 16) as u16)
  }
}

/// Kernel dispatch payload; everything but the header word.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelDispatch {
  pub setup_dims: u16,
  pub workgroup_size: [u16; 3],
  pub grid_size: [u32; 3],
  pub private_segment_size: u32,
  pub group_segment_size: u32,
  pub kernel_object: u64,
  pub kernarg_address: u64,
  pub completion_signal: u64,
}

impl KernelDispatch {
  /// Writes the payload fields. The header word is stored separately, last.
  pub fn write_payload(&self, slot: &mut PacketSlot) {
    slot.write_u16(DISPATCH_WORKGROUP_SIZE_X, self.workgroup_size[0]);
    slot.write_u16(DISPATCH_WORKGROUP_SIZE_Y, self.workgroup_size[1]);
    slot.write_u16(DISPATCH_WORKGROUP_SIZE_Z, self.workgroup_size[2]);
    slot.write_u32(DISPATCH_GRID_SIZE_X, self.grid_size[0]);
    slot.write_u32(DISPATCH_GRID_SIZE_Y, self.grid_size[1]);
    slot.write_u32(DISPATCH_GRID_SIZE_Z, self.grid_size[2]);
    slot.write_u32(DISPATCH_PRIVATE_SEGMENT_SIZE, self.private_segment_size);
    slot.write_u32(DISPATCH_GROUP_SEGMENT_SIZE, self.group_segment_size);
    slot.write_u64(DISPATCH_KERNEL_OBJECT, self.kernel_object);
    slot.write_u64(DISPATCH_KERNARG_ADDRESS, self.kernarg_address);
    slot.write_u64(DISPATCH_COMPLETION_SIGNAL, self.completion_signal);
  }

  pub fn decode(slot: &PacketSlot) -> KernelDispatch {
    KernelDispatch {
      setup_dims: (slot.read_u16(DISPATCH_SETUP) >> SETUP_DIMENSIONS)
        & ((1 << SETUP_DIMENSIONS_WIDTH) - 1),
      workgroup_size: [
        slot.read_u16(DISPATCH_WORKGROUP_SIZE_X),
        slot.read_u16(DISPATCH_WORKGROUP_SIZE_Y),
        slot.read_u16(DISPATCH_WORKGROUP_SIZE_Z),
      ],
      grid_size: [
        slot.read_u32(DISPATCH_GRID_SIZE_X),
        slot.read_u32(DISPATCH_GRID_SIZE_Y),
        slot.read_u32(DISPATCH_GRID_SIZE_Z),
      ],
      private_segment_size: slot.read_u32(DISPATCH_PRIVATE_SEGMENT_SIZE),
      group_segment_size: slot.read_u32(DISPATCH_GROUP_SEGMENT_SIZE),
      kernel_object: slot.read_u64(DISPATCH_KERNEL_OBJECT),
      kernarg_address: slot.read_u64(DISPATCH_KERNARG_ADDRESS),
      completion_signal: slot.read_u64(DISPATCH_COMPLETION_SIGNAL),
    }
  }
}

/// Barrier-AND payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarrierAnd {
  pub dep_signals: [u64; BARRIER_AND_DEP_COUNT],
  pub completion_signal: u64,
}

impl BarrierAnd {
  pub fn write_payload(&self, slot: &mut PacketSlot) {
    for (i, dep) in self.dep_signals.iter().enumerate() {
      slot.write_u64(BARRIER_AND_DEP_SIGNALS + i * 8, *dep);
    }
    slot.write_u64(BARRIER_AND_COMPLETION_SIGNAL, self.completion_signal);
  }

  pub fn decode(slot: &PacketSlot) -> BarrierAnd {
    let mut dep_signals = [0; BARRIER_AND_DEP_COUNT];
    for (i, dep) in dep_signals.iter_mut().enumerate() {
      *dep = slot.read_u64(BARRIER_AND_DEP_SIGNALS + i * 8);
    }
    BarrierAnd {
      dep_signals,
      completion_signal: slot.read_u64(BARRIER_AND_COMPLETION_SIGNAL),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::mem::{align_of, size_of};

  #[test]
  fn slot_layout() {
    assert_eq!(size_of::<PacketSlot>(), PACKET_SIZE);
    assert_eq!(align_of::<PacketSlot>(), 64);
  }

  #[test]
  fn header_round_trip() {
    let h = header(PacketType::KernelDispatch,
                   FenceScope::System,
                   FenceScope::Agent,
                   true);
    assert_eq!(header_type(h), Some(PacketType::KernelDispatch));
    assert!(header_barrier(h));
    assert_eq!(header_scacquire(h), FenceScope::System);
    assert_eq!(header_screlease(h), FenceScope::Agent);

    let h = header(PacketType::BarrierAnd,
                   FenceScope::None,
                   FenceScope::None,
                   false);
    assert_eq!(header_type(h), Some(PacketType::BarrierAnd));
    assert!(!header_barrier(h));
  }

  #[test]
  fn header_bit_positions() {
    // Hardware parses these; spot-check the raw encoding.
    let h = header(PacketType::KernelDispatch,
                   FenceScope::System,
                   FenceScope::System,
                   true);
    assert_eq!(h, 2 | (1 << 8) | (2 << 9) | (2 << 11));
  }

  #[test]
  fn dispatch_round_trip() {
    let d = KernelDispatch {
      setup_dims: 3,
      workgroup_size: [64, 2, 1],
      grid_size: [1024, 8, 2],
      private_segment_size: 128,
      group_segment_size: 2048,
      kernel_object: 0xdead_beef_cafe,
      kernarg_address: 0x1000,
      completion_signal: 0x2000,
    };
    let mut slot = PacketSlot::INVALID;
    d.write_payload(&mut slot);
    slot.store_header_rel(header(PacketType::KernelDispatch,
                                 FenceScope::None,
                                 FenceScope::None,
                                 false),
                          d.setup_dims << SETUP_DIMENSIONS);

    let (h, _) = slot.load_header_acq();
    assert_eq!(header_type(h), Some(PacketType::KernelDispatch));
    let back = KernelDispatch::decode(&slot);
    assert_eq!(back.workgroup_size, d.workgroup_size);
    assert_eq!(back.grid_size, d.grid_size);
    assert_eq!(back.kernel_object, d.kernel_object);
    assert_eq!(back.kernarg_address, d.kernarg_address);
    assert_eq!(back.completion_signal, d.completion_signal);
    assert_eq!(back.setup_dims, 3);

    // Field offsets are ABI; check a couple against the raw bytes.
    assert_eq!(slot.read_u32(12), 1024);
    assert_eq!(slot.read_u64(32), 0xdead_beef_cafe);
    assert_eq!(slot.read_u64(56), 0x2000);
  }

  #[test]
  fn barrier_round_trip() {
    let b = BarrierAnd {
      dep_signals: [1, 2, 3, 0, 0],
      completion_signal: 77,
    };
    let mut slot = PacketSlot::INVALID;
    b.write_payload(&mut slot);
    let back = BarrierAnd::decode(&slot);
    assert_eq!(back.dep_signals, b.dep_signals);
    assert_eq!(back.completion_signal, 77);
  }
}
