
//! Signals: hardware-visible atomic counters with wait/wake semantics.
//!
//! A signal's handle is an opaque nonzero `u64` suitable for embedding in
//! a packet: a generation-tagged slot index into the process-wide handle
//! table, never a pointer. Dropping the owning `Signal` retires the
//! handle, so a stale handle in a still-inflight packet resolves to
//! nothing instead of touching freed storage.

use std::sync::Arc;
use std::sync::atomic::{fence, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Condvar, Mutex};

pub type Value = i64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConditionOrdering {
  Equal,
  NotEqual,
  Less,
  GreaterEqual,
}
impl ConditionOrdering {
  #[inline(always)]
  pub fn satisfied(&self, observed: Value, compare: Value) -> bool {
    match self {
      ConditionOrdering::Equal => observed == compare,
      ConditionOrdering::NotEqual => observed != compare,
      ConditionOrdering::Less => observed < compare,
      ConditionOrdering::GreaterEqual => observed >= compare,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum WaitState {
  /// The waiter may be descheduled by the OS.
  Blocked,
  /// Spin. Lower wakeup latency, burns a core.
  Active,
}

#[doc(hidden)]
pub struct SignalInner {
  value: AtomicI64,
  lock: Mutex<()>,
  cond: Condvar,
}

impl std::fmt::Debug for SignalInner {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "SignalInner({})", self.value.load(Ordering::Relaxed))
  }
}

// The handle table. A handle is `(generation << 32) | (slot + 1)`; the
// generation bumps on every retire, so a reused slot never resurrects a
// stale handle. Handle zero is never issued; packets use it for "no
// signal".
struct HandleSlot {
  generation: u32,
  signal: Option<Arc<SignalInner>>,
}

struct HandleTable {
  slots: Vec<HandleSlot>,
  free: Vec<u32>,
}

static HANDLES: Mutex<HandleTable> = const_mutex(HandleTable {
  slots: Vec::new(),
  free: Vec::new(),
});

fn register(signal: Arc<SignalInner>) -> u64 {
  let mut table = HANDLES.lock();
  let index = match table.free.pop() {
    Some(index) => index,
    None => {
      table.slots.push(HandleSlot {
        generation: 0,
        signal: None,
      });
      (table.slots.len() - 1) as u32
    },
  };
  let slot = &mut table.slots[index as usize];
  slot.signal = Some(signal);
  ((slot.generation as u64) << 32) | (index as u64 + 1)
}

fn lookup(handle: u64) -> Option<Arc<SignalInner>> {
  let index = (handle as u32).checked_sub(1)? as usize;
  let generation = (handle >> 32) as u32;
  let table = HANDLES.lock();
  let slot = table.slots.get(index)?;
  if slot.generation != generation {
    return None;
  }
  slot.signal.clone()
}

fn retire(handle: u64) {
  let index = match (handle as u32).checked_sub(1) {
    Some(index) => index,
    None => return,
  };
  let generation = (handle >> 32) as u32;
  let mut table = HANDLES.lock();
  match table.slots.get_mut(index as usize) {
    Some(slot) if slot.generation == generation => {
      slot.signal = None;
      slot.generation = slot.generation.wrapping_add(1);
    },
    _ => return,
  }
  table.free.push(index);
}

#[derive(Debug)]
pub struct Signal {
  inner: Arc<SignalInner>,
  handle: u64,
}

impl Signal {
  pub fn new(initial: Value) -> Self {
    let inner = Arc::new(SignalInner {
      value: AtomicI64::new(initial),
      lock: Mutex::new(()),
      cond: Condvar::new(),
    });
    let handle = register(inner.clone());
    Signal { inner, handle }
  }

  #[inline(always)]
  pub fn as_ref(&self) -> SignalRef {
    SignalRef {
      inner: self.inner.clone(),
      handle: self.handle,
    }
  }

  /// The opaque handle written into packet completion/dep fields.
  /// Never zero; a zero handle in a packet means "no signal".
  #[inline(always)]
  pub fn raw_handle(&self) -> u64 {
    self.handle
  }
}

impl Drop for Signal {
  fn drop(&mut self) {
    retire(self.handle);
  }
}

/// An owned view of a signal, from its owner or rehydrated from a packet
/// handle. Holding one keeps the signal's storage alive, though its
/// handle goes stale once the owning `Signal` drops.
// Every accessor lives on the view; `Signal` forwards.
#[derive(Clone, Debug)]
pub struct SignalRef {
  inner: Arc<SignalInner>,
  handle: u64,
}

impl SignalRef {
  /// Resolves a packet handle through the handle table. `None` for the
  /// zero handle and for handles whose signal has since been dropped.
  pub fn from_handle(handle: u64) -> Option<SignalRef> {
    let inner = lookup(handle)?;
    Some(SignalRef { inner, handle })
  }

  #[inline(always)]
  pub fn raw_handle(&self) -> u64 {
    self.handle
  }

  #[inline(always)]
  pub fn load_scacquire(&self) -> Value {
    self.inner.value.load(Ordering::Acquire)
  }
  #[inline(always)]
  pub fn load_relaxed(&self) -> Value {
    self.inner.value.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn store_screlease(&self, val: Value) {
    self.inner.value.store(val, Ordering::Release);
    self.wake();
  }
  /// Store without waking blocked waiters. For reinitializing a signal
  /// known to have no waiters.
  #[inline]
  pub fn silent_store_relaxed(&self, val: Value) {
    self.inner.value.store(val, Ordering::Relaxed);
  }

  #[inline]
  pub fn subtract_screlease(&self, val: Value) {
    self.inner.value.fetch_sub(val, Ordering::AcqRel);
    self.wake();
  }
  #[inline]
  pub fn add_screlease(&self, val: Value) {
    self.inner.value.fetch_add(val, Ordering::AcqRel);
    self.wake();
  }
  #[inline]
  pub fn exchange_scacq_screl(&self, val: Value) -> Value {
    let old = self.inner.value.swap(val, Ordering::AcqRel);
    self.wake();
    old
  }

  fn wake(&self) {
    // Take the waiter lock so a concurrent waiter can't miss the update
    // between its value check and its sleep.
    let _g = self.inner.lock.lock();
    self.inner.cond.notify_all();
  }

  /// Waits until `condition(value, compare)` holds or the timeout expires,
  /// returning the last observed value either way. No memory ordering is
  /// implied; see `wait_scacquire`.
  pub fn wait_relaxed(&self, condition: ConditionOrdering, compare: Value,
                      timeout_hint: Option<Duration>,
                      wait_state_hint: WaitState) -> Value {
    let deadline = timeout_hint.map(|t| Instant::now() + t );

    match wait_state_hint {
      WaitState::Active => {
        loop {
          let v = self.inner.value.load(Ordering::Relaxed);
          if condition.satisfied(v, compare) {
            return v;
          }
          if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
              return v;
            }
          }
          std::hint::spin_loop();
        }
      },
      WaitState::Blocked => {
        let mut g = self.inner.lock.lock();
        loop {
          let v = self.inner.value.load(Ordering::Relaxed);
          if condition.satisfied(v, compare) {
            return v;
          }
          match deadline {
            Some(deadline) => {
              if self.inner.cond.wait_until(&mut g, deadline).timed_out() {
                return self.inner.value.load(Ordering::Relaxed);
              }
            },
            None => {
              self.inner.cond.wait(&mut g);
            },
          }
        }
      },
    }
  }

  /// `wait_relaxed` plus an acquire fence once the condition is satisfied,
  /// so device writes published before the signal update are visible.
  pub fn wait_scacquire(&self, condition: ConditionOrdering, compare: Value,
                        timeout_hint: Option<Duration>,
                        wait_state_hint: WaitState) -> Value {
    let v = self.wait_relaxed(condition, compare, timeout_hint,
                              wait_state_hint);
    fence(Ordering::Acquire);
    v
  }
}

macro_rules! forward {
  ($($f:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty,)*) => (
    impl Signal {
      $(
      #[inline(always)]
      pub fn $f(&self, $($arg: $ty),*) -> $ret {
        self.as_ref().$f($($arg),*)
      }
      )*
    }
  )
}
forward! {
  load_scacquire() -> Value,
  load_relaxed() -> Value,
  store_screlease(val: Value) -> (),
  silent_store_relaxed(val: Value) -> (),
  subtract_screlease(val: Value) -> (),
  add_screlease(val: Value) -> (),
  exchange_scacq_screl(val: Value) -> Value,
}
impl Signal {
  #[inline(always)]
  pub fn wait_relaxed(&self, condition: ConditionOrdering, compare: Value,
                      timeout_hint: Option<Duration>,
                      wait_state_hint: WaitState) -> Value {
    self.as_ref().wait_relaxed(condition, compare, timeout_hint,
                               wait_state_hint)
  }
  #[inline(always)]
  pub fn wait_scacquire(&self, condition: ConditionOrdering, compare: Value,
                        timeout_hint: Option<Duration>,
                        wait_state_hint: WaitState) -> Value {
    self.as_ref().wait_scacquire(condition, compare, timeout_hint,
                                 wait_state_hint)
  }
}
