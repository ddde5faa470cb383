
//! End-to-end transfers through a host queue: buffer and image blits,
//! fills, maps and event ordering.

use std::sync::Arc;

use rocl_device::blit::BufferRect;
use rocl_device::memory::ImageDesc;
use rocl_device::queue::cl;
use rocl_device::{ChannelOrder, ChannelType, Device, FillColor,
                  HostQueue, ImageFormat, MemId, Platform, Settings};

fn setup(settings: Settings) -> (Platform, Arc<Device>, HostQueue) {
  let p = Platform::new().unwrap();
  let d = Device::new(&p, settings).unwrap();
  let q = d.create_host_queue().unwrap();
  (p, d, q)
}

fn write_read_roundtrip(p: &Platform, q: &HostQueue, len: usize) {
  let buf = p.arena().create_buffer(len).unwrap();
  let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8 ).collect();
  let mut out = vec![0u8; len];

  unsafe {
    q.enqueue_write_buffer(data.as_ptr(), buf, 0, len, &[]).unwrap();
    let ev = q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, len, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, data);
}

#[test]
fn staged_write_read_roundtrip() {
  let (p, _d, q) = setup(Settings::default());
  // Below the pinned threshold, so the staged DMA path runs.
  write_read_roundtrip(&p, &q, 4096);
}

#[test]
fn pinned_write_read_roundtrip() {
  let (p, _d, q) = setup(Settings::default());
  // Above the pinned threshold; chunked pinned transfers.
  write_read_roundtrip(&p, &q, 600 * 1024);
}

#[test]
fn host_path_write_read_roundtrip() {
  let settings = Settings {
    disable_read_buffer: true,
    disable_write_buffer: true,
    ..Settings::default()
  };
  let (p, _d, q) = setup(settings);
  write_read_roundtrip(&p, &q, 4096);
}

fn copy_roundtrip(p: &Platform, q: &HostQueue) {
  let len = 1024usize;
  let src = p.arena().create_buffer(len).unwrap();
  let dst = p.arena().create_buffer(len).unwrap();
  let data: Vec<u8> = (0..len).map(|i| (i ^ 0x5a) as u8 ).collect();
  let mut out = vec![0u8; len];

  unsafe {
    q.enqueue_write_buffer(data.as_ptr(), src, 0, len, &[]).unwrap();
  }
  q.enqueue_copy_buffer(src, dst, 0, 0, len, &[]).unwrap();
  unsafe {
    let ev = q.enqueue_read_buffer(dst, out.as_mut_ptr(), 0, len, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, data);
}

#[test]
fn dma_copy_roundtrip() {
  let (p, _d, q) = setup(Settings::default());
  copy_roundtrip(&p, &q);
}

#[test]
fn kernel_copy_roundtrip() {
  let settings = Settings {
    disable_copy_buffer: true,
    ..Settings::default()
  };
  let (p, _d, q) = setup(settings);
  copy_roundtrip(&p, &q);
}

#[test]
fn multi_chunk_pinned_roundtrip() {
  let (p, _d, q) = setup(Settings::default());
  // Three pin chunks at the default 4 MiB chunk size.
  write_read_roundtrip(&p, &q, 10 * 1024 * 1024);
}

#[test]
fn copy_fallback_matrix_is_byte_identical() {
  // Sizes straddling the pinned threshold, DMA on vs off: the output
  // must not depend on which strategy ran.
  let sizes = [1usize, 512 * 1024, 512 * 1024 + 1, 5 * 1024 * 1024];
  for &len in &sizes {
    let data: Vec<u8> = (0..len).map(|i| (i as u8) ^ 0x3c ).collect();
    let mut outs = Vec::new();
    for &disable in &[false, true] {
      let settings = Settings {
        disable_copy_buffer: disable,
        ..Settings::default()
      };
      let (p, _d, q) = setup(settings);
      let src = p.arena().create_buffer(len).unwrap();
      let dst = p.arena().create_buffer(len).unwrap();
      let mut out = vec![0u8; len];
      unsafe {
        q.enqueue_write_buffer(data.as_ptr(), src, 0, len, &[]).unwrap();
      }
      q.enqueue_copy_buffer(src, dst, 0, 0, len, &[]).unwrap();
      unsafe {
        let ev = q.enqueue_read_buffer(dst, out.as_mut_ptr(), 0, len,
                                       &[]).unwrap();
        assert_eq!(ev.wait(), cl::CL_COMPLETE);
      }
      outs.push(out);
    }
    assert_eq!(outs[0], data, "len {}", len);
    assert_eq!(outs[0], outs[1], "len {}", len);
  }
}

#[test]
fn copy_at_offsets() {
  let (p, _d, q) = setup(Settings::default());
  let src = p.arena().create_buffer(64).unwrap();
  let dst = p.arena().create_buffer(64).unwrap();
  let data: Vec<u8> = (0..64).collect();
  let mut out = vec![0u8; 16];

  unsafe {
    q.enqueue_write_buffer(data.as_ptr(), src, 0, 64, &[]).unwrap();
  }
  q.enqueue_fill_buffer(dst, &[0xee], 0, 64, &[]).unwrap();
  q.enqueue_copy_buffer(src, dst, 8, 32, 16, &[]).unwrap();
  unsafe {
    let ev = q.enqueue_read_buffer(dst, out.as_mut_ptr(), 32, 16, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, (8..24).collect::<Vec<u8>>());
}

#[test]
fn fill_truncates_partial_trailing_pattern() {
  let (p, _d, q) = setup(Settings::default());
  let buf = p.arena().create_buffer(8).unwrap();
  let init = [0xffu8; 8];
  let mut out = [0u8; 8];

  unsafe {
    q.enqueue_write_buffer(init.as_ptr(), buf, 0, 8, &[]).unwrap();
  }
  // Two whole patterns fit; the trailing 2 bytes must stay untouched.
  q.enqueue_fill_buffer(buf, &[1, 2, 3], 0, 8, &[]).unwrap();
  unsafe {
    let ev = q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, 8, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, [1, 2, 3, 1, 2, 3, 0xff, 0xff]);
}

#[test]
fn copy_buffer_rect_repacks_rows() {
  let (p, _d, q) = setup(Settings::default());
  let src = p.arena().create_buffer(64).unwrap();
  let dst = p.arena().create_buffer(64).unwrap();
  let data: Vec<u8> = (0..64).collect();
  let mut out = vec![0u8; 16];

  unsafe {
    q.enqueue_write_buffer(data.as_ptr(), src, 0, 64, &[]).unwrap();
  }
  let region = [8, 2, 1];
  let src_rect = BufferRect::new([0, 0, 0], region, 16, 0).unwrap();
  let dst_rect = BufferRect::new([0, 0, 0], region, 8, 0).unwrap();
  q.enqueue_copy_buffer_rect(src, dst, src_rect, dst_rect, region, &[])
    .unwrap();
  unsafe {
    let ev = q.enqueue_read_buffer(dst, out.as_mut_ptr(), 0, 16, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  let mut expect: Vec<u8> = (0..8).collect();
  expect.extend(16..24);
  assert_eq!(out, expect);
}

#[test]
fn image_write_read_roundtrip() {
  let (p, _d, q) = setup(Settings::default());
  let fmt = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Uint8);
  let img = p.arena().create_image(ImageDesc::new_2d(fmt, 4, 2)).unwrap();

  let data: Vec<u8> = (0..32).collect();
  let mut out = vec![0u8; 32];
  unsafe {
    q.enqueue_write_image(data.as_ptr(), img, [0; 3], [4, 2, 1], 16, 32,
                          &[]).unwrap();
    let ev = q.enqueue_read_image(img, out.as_mut_ptr(), [0; 3],
                                  [4, 2, 1], 16, 32, &[]).unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, data);
}

#[test]
fn image_host_pitch_variants() {
  let (p, _d, q) = setup(Settings::default());
  let fmt = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Uint8);
  let img = p.arena().create_image(ImageDesc::new_2d(fmt, 4, 2)).unwrap();

  // Write from a host buffer with 24 byte rows holding 16 byte pixels;
  // the 8 pad bytes per row must never reach the image.
  let mut padded = vec![0xccu8; 48];
  for y in 0..2 {
    for x in 0..16 {
      padded[y * 24 + x] = (y * 16 + x) as u8;
    }
  }
  let mut out = vec![0u8; 32];
  unsafe {
    q.enqueue_write_image(padded.as_ptr(), img, [0; 3], [4, 2, 1], 24,
                          48, &[]).unwrap();
    // Zero pitches read back packed.
    let ev = q.enqueue_read_image(img, out.as_mut_ptr(), [0; 3],
                                  [4, 2, 1], 0, 0, &[]).unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, (0..32).collect::<Vec<u8>>());
}

#[test]
fn srgb_fill_encodes_the_midpoint() {
  let (p, _d, q) = setup(Settings::default());
  let fmt = ImageFormat::new(ChannelOrder::SRgba, ChannelType::Unorm8);
  let img = p.arena().create_image(ImageDesc::new_2d(fmt, 2, 2)).unwrap();

  q.enqueue_fill_image(img, FillColor::Float([0.5, 0.5, 0.5, 0.5]),
                       [0; 3], [2, 2, 1], &[]).unwrap();
  let mut out = [0u8; 16];
  unsafe {
    let ev = q.enqueue_read_image(img, out.as_mut_ptr(), [0; 3],
                                  [2, 2, 1], 8, 16, &[]).unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  // Linear 0.5 transfer-encodes to 188; alpha stays linear at 128.
  for px in out.chunks(4) {
    assert_eq!(px, [188, 188, 188, 128]);
  }
}

#[test]
fn fill_on_rejected_format_view_falls_back() {
  let (p, _d, q) = setup(Settings::default());
  let base = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Unorm8);
  let img = p.arena().create_image(ImageDesc::new_2d(base, 2, 2)).unwrap();
  // An sRGB relabel of the same storage. The blit kernels reject sRGB
  // and cannot re-view a view, so the host layer must take over.
  let srgb = ImageFormat::new(ChannelOrder::SRgba, ChannelType::Unorm8);
  let view = p.arena().create_image_view(img, srgb).unwrap();

  let ev = q.enqueue_fill_image(view, FillColor::Float([0.5; 4]),
                                [0; 3], [2, 2, 1], &[]).unwrap();
  assert_eq!(ev.wait(), cl::CL_COMPLETE);

  // Read through the root: same bytes, linear labels.
  let mut out = [0u8; 16];
  unsafe {
    let ev = q.enqueue_read_image(img, out.as_mut_ptr(), [0; 3],
                                  [2, 2, 1], 8, 16, &[]).unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  for px in out.chunks(4) {
    assert_eq!(px, [188, 188, 188, 128]);
  }
}

#[test]
fn image_to_buffer_and_back() {
  let (p, _d, q) = setup(Settings::default());
  let fmt = ImageFormat::new(ChannelOrder::R, ChannelType::Uint32);
  let img = p.arena().create_image(ImageDesc::new_2d(fmt, 4, 4)).unwrap();
  let buf = p.arena().create_buffer(64).unwrap();

  let data: Vec<u8> = (0..64).collect();
  unsafe {
    q.enqueue_write_image(data.as_ptr(), img, [0; 3], [4, 4, 1], 16, 64,
                          &[]).unwrap();
  }
  q.enqueue_copy_image_to_buffer(img, buf, [0; 3], [4, 4, 1], 0, &[])
    .unwrap();

  let mut out = vec![0u8; 64];
  unsafe {
    let ev = q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, 64, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out, data);

  let img2 = p.arena().create_image(ImageDesc::new_2d(fmt, 4, 4)).unwrap();
  q.enqueue_copy_buffer_to_image(buf, img2, 0, [0; 3], [4, 4, 1], &[])
    .unwrap();
  let mut out2 = vec![0u8; 64];
  unsafe {
    let ev = q.enqueue_read_image(img2, out2.as_mut_ptr(), [0; 3],
                                  [4, 4, 1], 16, 64, &[]).unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out2, data);
}

#[test]
fn map_write_unmap_flows_to_device() {
  let (p, _d, q) = setup(Settings::default());
  let buf = p.arena().create_buffer(16).unwrap();

  let map = q.enqueue_map(buf, true, &[]).unwrap();
  assert_eq!(map.wait(), cl::CL_COMPLETE);
  let ptr = map.mapped_ptr();
  assert!(!ptr.is_null());
  for i in 0..16 {
    unsafe { *ptr.add(i) = i as u8 };
  }
  q.enqueue_unmap(buf, &[]).unwrap();

  let mut out = [0u8; 16];
  unsafe {
    let ev = q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, 16, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert_eq!(out[..], (0..16).collect::<Vec<u8>>()[..]);
}

#[test]
fn wait_list_error_poisons_dependents() {
  let (p, _d, q) = setup(Settings::default());
  let buf = p.arena().create_buffer(16).unwrap();

  // Bogus mem object; the command itself fails.
  let bad = q.enqueue_fill_buffer(MemId(0xdead_beef), &[0], 0, 1, &[])
    .unwrap();
  assert_eq!(bad.wait(), cl::CL_INVALID_MEM_OBJECT);

  let mut out = [0u8; 16];
  let gated = unsafe {
    q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, 16,
                          &[bad.clone()]).unwrap()
  };
  assert_eq!(gated.wait(),
             cl::CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);

  // The queue itself stays usable.
  q.finish().unwrap();
}

#[test]
fn finish_orders_everything_before_it() {
  let (p, _d, q) = setup(Settings::default());
  let buf = p.arena().create_buffer(256).unwrap();
  let data = [9u8; 256];
  unsafe {
    q.enqueue_write_buffer(data.as_ptr(), buf, 0, 256, &[]).unwrap();
  }
  q.enqueue_fill_buffer(buf, &[3], 0, 128, &[]).unwrap();
  q.finish().unwrap();

  let mut out = [0u8; 256];
  unsafe {
    let ev = q.enqueue_read_buffer(buf, out.as_mut_ptr(), 0, 256, &[])
      .unwrap();
    assert_eq!(ev.wait(), cl::CL_COMPLETE);
  }
  assert!(out[..128].iter().all(|&b| b == 3 ));
  assert!(out[128..].iter().all(|&b| b == 9 ));
}
