
//! The device layer: AQL dispatch, the blit engine and host/device
//! cache coherence on top of `rocl-hal`.
//!
//! The shape of the runtime:
//!
//! * [`device::Platform`] owns the context and the mem object arena.
//! * [`device::Device`] is one GPU: pools, blit kernels, per-device
//!   shadows of arena objects.
//! * [`virtual_gpu::VirtualGPU`] is one AQL software queue with its
//!   kernarg ring and hazard tracker; never shared across threads.
//! * [`blit::BlitEngine`] routes every transfer through an ordered
//!   strategy table (kernel dispatch, DMA engine, host memcpy).
//! * [`queue::HostQueue`] is the in-order command queue the embedder
//!   drives, one worker thread per queue.

pub mod blit;
pub mod device;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod queue;
pub mod settings;
pub mod virtual_gpu;

mod kernels;

pub use crate::device::{Device, Platform};
pub use crate::error::{Error, Result};
pub use crate::kernel::{Kernel, KernelArg, LaunchParams, NdRange};
pub use crate::memory::{ChannelOrder, ChannelType, FillColor,
                        ImageDesc, ImageFormat, MemId};
pub use crate::queue::{Event, HostQueue};
pub use crate::settings::Settings;
pub use crate::virtual_gpu::VirtualGPU;
