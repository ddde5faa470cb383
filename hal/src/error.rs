use std::fmt;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Error {
  General,
  InvalidAgent,
  InvalidAllocation,
  InvalidArgument,
  InvalidKernelObject,
  InvalidPacketFormat,
  InvalidQueue,
  InvalidQueueCreation,
  InvalidSignal,
  OutOfResources,
  QueueFull,
  ResourceFree,
}

impl std::error::Error for Error { }
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
