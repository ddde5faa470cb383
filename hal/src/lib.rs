
//! The hardware-queue ABI layer: AQL packet layout, signals, user-mode
//! queues with the index-based doorbell protocol, agents and memory pools.
//!
//! The packet layout, header bit positions and the producer/consumer ring
//! protocol are bit-exact per the published HSA packet format; the command
//! processor behind each queue is a host thread, so the whole dispatch
//! pipeline runs in-process. Kernel objects are registered host functions
//! keyed by a `u64` code handle, the same shape a finalized code object
//! handle has on real hardware.

pub mod agent;
pub mod error;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod signal;

mod sdma;

pub use crate::agent::{Agent, DeviceType, KernelObject, };
pub use crate::error::Error;
pub use crate::pool::{GlobalFlags, MemoryPool, PoolPtr, Segment, };
pub use crate::queue::UserQueue;
pub use crate::signal::{Signal, SignalRef, Value, ConditionOrdering, WaitState, };

use std::sync::Arc;

use crate::sdma::SdmaEngine;

/// Process-wide runtime context. The analogue of `hsa_init`: constructed
/// once by the embedder and passed by reference, never a global.
#[derive(Clone)]
pub struct Context {
  inner: Arc<ContextInner>,
}

struct ContextInner {
  agents: Vec<Agent>,
  sdma: SdmaEngine,
}

impl Context {
  /// Builds a context with one CPU agent and `gpus` GPU agents.
  pub fn new(gpus: usize) -> Result<Self, Error> {
    let mut agents = Vec::with_capacity(gpus + 1);
    agents.push(Agent::new_cpu(0));
    for i in 0..gpus {
      agents.push(Agent::new_gpu(1 + i as u32));
    }

    Ok(Context {
      inner: Arc::new(ContextInner {
        agents,
        sdma: SdmaEngine::spawn()?,
      }),
    })
  }

  pub fn agents(&self) -> &[Agent] {
    &self.inner.agents
  }
  pub fn cpu_agent(&self) -> &Agent {
    self.inner.agents.iter()
      .find(|a| a.device_type() == DeviceType::Cpu )
      .expect("context always holds a cpu agent")
  }
  pub fn gpu_agents(&self) -> impl Iterator<Item = &Agent> {
    self.inner.agents.iter()
      .filter(|a| a.device_type() == DeviceType::Gpu )
  }

  /// Asynchronous copy between any two agent-visible allocations, executed
  /// by the copy engine. `deps` are waited to zero before the copy starts;
  /// `completion` is decremented once after the copy retires.
  ///
  /// Unsafe: both ranges must stay valid until the completion signal is
  /// observed at zero.
  pub unsafe fn async_copy(&self, dst: *mut u8, src: *const u8, bytes: usize,
                           deps: &[SignalRef], completion: SignalRef)
    -> Result<(), Error>
  {
    self.inner.sdma.submit_linear(dst, src, bytes, deps, completion)
  }

  /// Asynchronous pitched 2D copy: `rows` rows of `row_bytes`, with
  /// independent source/destination pitches. The analogue of
  /// `hsa_amd_memory_async_copy_rect`.
  pub unsafe fn async_copy_rect(&self, dst: *mut u8, dst_pitch: usize,
                                src: *const u8, src_pitch: usize,
                                row_bytes: usize, rows: usize,
                                deps: &[SignalRef], completion: SignalRef)
    -> Result<(), Error>
  {
    self.inner.sdma.submit_rect(dst, dst_pitch, src, src_pitch,
                                row_bytes, rows, deps, completion)
  }
}
