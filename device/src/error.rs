use std::fmt;

use crate::queue::cl;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Error {
  Hal(hal::Error),
  OutOfResources,
  MemObjectAllocationFailure,
  InvalidOperation,
  InvalidValue,
  InvalidMemObject,
  InvalidKernelArgs,
  UnsupportedImageFormat,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// The OpenCL status code reported on the originating command.
  pub fn cl_status(&self) -> i32 {
    match self {
      Error::Hal(_) | Error::OutOfResources => cl::CL_OUT_OF_RESOURCES,
      Error::MemObjectAllocationFailure => cl::CL_MEM_OBJECT_ALLOCATION_FAILURE,
      Error::InvalidOperation | Error::UnsupportedImageFormat =>
        cl::CL_INVALID_OPERATION,
      Error::InvalidValue => cl::CL_INVALID_VALUE,
      Error::InvalidMemObject => cl::CL_INVALID_MEM_OBJECT,
      Error::InvalidKernelArgs => cl::CL_INVALID_KERNEL_ARGS,
    }
  }
}

impl From<hal::Error> for Error {
  fn from(e: hal::Error) -> Error {
    Error::Hal(e)
  }
}

impl std::error::Error for Error { }
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
