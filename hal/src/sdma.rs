
//! The copy (SDMA) engine: a dedicated worker that retires async-copy
//! requests in submission order, waiting any dependent signals to zero
//! first and decrementing the completion signal when the bytes have landed.

use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::Error;
use crate::signal::{ConditionOrdering, SignalRef, WaitState};

enum Job {
  Linear {
    dst: usize,
    src: usize,
    bytes: usize,
    deps: SmallVec<[u64; 4]>,
    completion: u64,
  },
  Rect {
    dst: usize,
    dst_pitch: usize,
    src: usize,
    src_pitch: usize,
    row_bytes: usize,
    rows: usize,
    deps: SmallVec<[u64; 4]>,
    completion: u64,
  },
  Quit,
}

pub(crate) struct SdmaEngine {
  tx: Mutex<Sender<Job>>,
  worker: Option<JoinHandle<()>>,
}

impl SdmaEngine {
  pub(crate) fn spawn() -> Result<Self, Error> {
    let (tx, rx) = channel();
    let worker = thread::Builder::new()
      .name("rocl-sdma".into())
      .spawn(move || {
        while let Ok(job) = rx.recv() {
          match job {
            Job::Linear { dst, src, bytes, deps, completion } => {
              wait_deps(&deps);
              trace!(bytes, "sdma linear copy");
              unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8,
                                              dst as *mut u8, bytes);
              }
              retire(completion);
            },
            Job::Rect { dst, dst_pitch, src, src_pitch,
                        row_bytes, rows, deps, completion } => {
              wait_deps(&deps);
              trace!(row_bytes, rows, "sdma rect copy");
              for row in 0..rows {
                unsafe {
                  let s = (src + row * src_pitch) as *const u8;
                  let d = (dst + row * dst_pitch) as *mut u8;
                  std::ptr::copy_nonoverlapping(s, d, row_bytes);
                }
              }
              retire(completion);
            },
            Job::Quit => {
              debug!("sdma engine quitting");
              break;
            },
          }
        }
      })
      .map_err(|_| Error::OutOfResources )?;

    Ok(SdmaEngine {
      tx: Mutex::new(tx),
      worker: Some(worker),
    })
  }

  pub(crate) unsafe fn submit_linear(&self, dst: *mut u8, src: *const u8,
                                     bytes: usize, deps: &[SignalRef],
                                     completion: SignalRef)
    -> Result<(), Error>
  {
    let job = Job::Linear {
      dst: dst as usize,
      src: src as usize,
      bytes,
      deps: deps.iter().map(|d| d.raw_handle() ).collect(),
      completion: completion.raw_handle(),
    };
    self.tx.lock().send(job)
      .map_err(|_| Error::General )
  }

  pub(crate) unsafe fn submit_rect(&self, dst: *mut u8, dst_pitch: usize,
                                   src: *const u8, src_pitch: usize,
                                   row_bytes: usize, rows: usize,
                                   deps: &[SignalRef], completion: SignalRef)
    -> Result<(), Error>
  {
    if row_bytes > dst_pitch || row_bytes > src_pitch {
      return Err(Error::InvalidArgument);
    }
    let job = Job::Rect {
      dst: dst as usize,
      dst_pitch,
      src: src as usize,
      src_pitch,
      row_bytes,
      rows,
      deps: deps.iter().map(|d| d.raw_handle() ).collect(),
      completion: completion.raw_handle(),
    };
    self.tx.lock().send(job)
      .map_err(|_| Error::General )
  }
}

fn wait_deps(deps: &[u64]) {
  for &dep in deps {
    if let Some(s) = SignalRef::from_handle(dep) {
      s.wait_scacquire(ConditionOrdering::Equal, 0, None,
                       WaitState::Blocked);
    }
  }
}

fn retire(completion: u64) {
  std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
  if let Some(s) = SignalRef::from_handle(completion) {
    s.subtract_screlease(1);
  }
}

impl Drop for SdmaEngine {
  fn drop(&mut self) {
    let _ = self.tx.lock().send(Job::Quit);
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::signal::Signal;

  #[test]
  fn linear_copy_retires_completion() {
    let engine = SdmaEngine::spawn().unwrap();
    let src = vec![7u8; 4096];
    let mut dst = vec![0u8; 4096];
    let done = Signal::new(1);
    unsafe {
      engine.submit_linear(dst.as_mut_ptr(), src.as_ptr(), 4096,
                           &[], done.as_ref()).unwrap();
    }
    done.wait_scacquire(ConditionOrdering::Equal, 0, None,
                        WaitState::Blocked);
    assert!(dst.iter().all(|&b| b == 7 ));
  }

  #[test]
  fn rect_copy_respects_pitches() {
    let engine = SdmaEngine::spawn().unwrap();
    let src = (0..64u8).collect::<Vec<_>>(); // 4 rows of 16
    let mut dst = vec![0u8; 8 * 32];
    let done = Signal::new(1);
    unsafe {
      engine.submit_rect(dst.as_mut_ptr(), 32, src.as_ptr(), 16,
                         16, 4, &[], done.as_ref()).unwrap();
    }
    done.wait_scacquire(ConditionOrdering::Equal, 0, None,
                        WaitState::Blocked);
    for row in 0..4 {
      assert_eq!(&dst[row * 32..row * 32 + 16],
                 &src[row * 16..row * 16 + 16]);
      assert!(dst[row * 32 + 16..row * 32 + 32].iter().all(|&b| b == 0 ));
    }
  }

  #[test]
  fn copy_waits_for_deps() {
    let engine = SdmaEngine::spawn().unwrap();
    let src = vec![3u8; 64];
    let mut dst = vec![0u8; 64];
    let gate = Signal::new(1);
    let done = Signal::new(1);
    unsafe {
      engine.submit_linear(dst.as_mut_ptr(), src.as_ptr(), 64,
                           &[gate.as_ref()], done.as_ref()).unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(done.load_scacquire(), 1);
    gate.subtract_screlease(1);
    done.wait_scacquire(ConditionOrdering::Equal, 0, None,
                        WaitState::Blocked);
    assert_eq!(dst[0], 3);
  }
}
