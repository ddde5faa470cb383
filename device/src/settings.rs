
//! Device tunables. Everything here is a construction-time knob; no
//! environment reads, the embedder builds a `Settings` and hands it to
//! `Device::new`.

/// Transfer-path and queue sizing knobs.
///
/// The `disable_*` flags remove the DMA engine from the candidate list of
/// the corresponding transfer kind, forcing the kernel or host path.
#[derive(Clone, Debug)]
pub struct Settings {
  /// Chunk size for pinned host transfers.
  pub pinned_xfer_size: usize,
  /// Below this, pinning costs more than staging; staged path is used.
  pub pinned_min_xfer_size: usize,
  /// Chunk size for staged (bounce buffer) transfers.
  pub staged_xfer_size: usize,
  /// Size of each pooled staging buffer.
  pub xfer_buf_size: usize,
  /// Allow the DMA engine to move image data directly.
  pub image_dma: bool,
  /// Drain the queue after every kernel-path blit.
  pub sync_blit: bool,
  /// Capacity of the per-virtual-GPU memory dependency tracker. Zero
  /// disables tracking; every dispatch then carries a full sync header.
  pub num_mem_dependencies: usize,
  /// Kernel queue depth, log2 packets.
  pub queue_size_log2: usize,
  /// Kernarg ring capacity per virtual GPU.
  pub kernarg_pool_size: usize,
  /// Completion signals kept per virtual GPU for profiled dispatches.
  pub signal_pool_size: usize,
  /// Accept raw SVM pointers with no backing mem object.
  pub fine_grain_system: bool,

  pub disable_read_buffer: bool,
  pub disable_write_buffer: bool,
  pub disable_copy_buffer: bool,
  pub disable_read_buffer_rect: bool,
  pub disable_write_buffer_rect: bool,
  pub disable_copy_buffer_rect: bool,
  pub disable_read_image: bool,
  pub disable_write_image: bool,
}

impl Default for Settings {
  fn default() -> Settings {
    Settings {
      pinned_xfer_size: 4 * 1024 * 1024,
      pinned_min_xfer_size: 512 * 1024,
      staged_xfer_size: 1024 * 1024,
      xfer_buf_size: 1024 * 1024,
      image_dma: true,
      sync_blit: false,
      num_mem_dependencies: 64,
      queue_size_log2: 10,
      kernarg_pool_size: 64 * 1024,
      signal_pool_size: 32,
      fine_grain_system: false,

      disable_read_buffer: false,
      disable_write_buffer: false,
      disable_copy_buffer: false,
      disable_read_buffer_rect: false,
      disable_write_buffer_rect: false,
      disable_copy_buffer_rect: false,
      disable_read_image: false,
      disable_write_image: false,
    }
  }
}
