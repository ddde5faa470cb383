
//! Kernel descriptors and launch geometry.

use smallvec::SmallVec;

use hal::KernelObject;

use crate::memory::MemId;

/// Bytes of hidden kernarg trailer: three `u64` global offset words,
/// rewritten per sub-dispatch when a grid is split.
pub const IMPLICIT_ARGS_SIZE: usize = 24;

/// A loaded kernel: the code handle plus the dispatch metadata the
/// runtime needs to build packets for it.
#[derive(Clone, Debug)]
pub struct Kernel {
  pub name: String,
  pub object: KernelObject,
  /// `reqd_work_group_size`, when the kernel was compiled with one.
  pub compiled_workgroup_size: Option<[u16; 3]>,
  pub private_segment_size: u32,
  pub group_segment_size: u32,
  pub kernarg_align: usize,
  /// Kernel writes program-scope globals; every dispatch of it must
  /// carry a full sync header.
  pub has_global_stores: bool,
}

impl Kernel {
  pub fn new<S: Into<String>>(name: S, object: KernelObject) -> Kernel {
    Kernel {
      name: name.into(),
      object,
      compiled_workgroup_size: None,
      private_segment_size: 0,
      group_segment_size: 0,
      kernarg_align: 16,
      has_global_stores: false,
    }
  }
}

#[derive(Clone, Debug)]
pub enum KernelArg {
  /// A mem object argument; `write` if the kernel may store through it.
  Mem {
    id: MemId,
    write: bool,
  },
  /// A raw SVM pointer, optionally backed by a known mem object.
  Svm {
    ptr: usize,
    mem: Option<MemId>,
    write: bool,
  },
  /// Plain value bytes, copied into the kernarg block.
  Value(SmallVec<[u8; 16]>),
}

impl KernelArg {
  pub fn mem(id: MemId) -> KernelArg {
    KernelArg::Mem { id, write: true }
  }
  pub fn mem_read_only(id: MemId) -> KernelArg {
    KernelArg::Mem { id, write: false }
  }
  pub fn value<T: Copy>(v: &T) -> KernelArg {
    let bytes = unsafe {
      std::slice::from_raw_parts(v as *const T as *const u8,
                                 std::mem::size_of::<T>())
    };
    KernelArg::Value(SmallVec::from_slice(bytes))
  }
}

#[derive(Clone, Debug, Default)]
pub struct LaunchParams {
  pub args: Vec<KernelArg>,
}

impl LaunchParams {
  pub fn new(args: Vec<KernelArg>) -> Self {
    LaunchParams { args }
  }
}

/// An ND launch geometry. Global sizes are 64 bit; dimensions above the
/// packet's 32 bit grid field get split at dispatch.
#[derive(Clone, Copy, Debug)]
pub struct NdRange {
  pub dims: u16,
  pub global: [u64; 3],
  pub offset: [u64; 3],
  pub local: Option<[u16; 3]>,
}

impl NdRange {
  pub fn one(x: u64) -> NdRange {
    NdRange {
      dims: 1,
      global: [x, 1, 1],
      offset: [0; 3],
      local: None,
    }
  }
  pub fn two(x: u64, y: u64) -> NdRange {
    NdRange {
      dims: 2,
      global: [x, y, 1],
      offset: [0; 3],
      local: None,
    }
  }
  pub fn three(x: u64, y: u64, z: u64) -> NdRange {
    NdRange {
      dims: 3,
      global: [x, y, z],
      offset: [0; 3],
      local: None,
    }
  }
  pub fn with_offset(mut self, offset: [u64; 3]) -> NdRange {
    self.offset = offset;
    self
  }
  pub fn with_local(mut self, local: [u16; 3]) -> NdRange {
    self.local = Some(local);
    self
  }
}

#[inline(always)]
pub(crate) fn round_up(v: usize, to: usize) -> usize {
  (v + to - 1) / to * to
}
