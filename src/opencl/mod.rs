//! Device memory management
//!
//! [`Buffer`] owns exactly one device allocation. The allocation and the
//! transfers go through two small traits so that the same buffer type works
//! on an OpenCL device (feature `opencl`) and on the host-memory backend in
//! [`host`].
//!
//! The memory handle type of each backend releases its allocation when
//! dropped. `Buffer` is neither `Clone` nor `Copy`, so a handle has exactly
//! one owner at any time and is released exactly once: moving a buffer
//! transfers the handle, and the moved-from binding is statically dead.

pub mod buffer;
pub mod host;

#[cfg(feature = "opencl")]
pub mod device;

pub use buffer::Buffer;
#[cfg(feature = "opencl")]
pub use device::{OclCommandQueue, OclContext};
pub use host::{HostContext, HostMemory, HostQueue};

use crate::error::Result;

/// Allocates device memory.
pub trait ContextManager {
    /// Owned handle to one allocation. Dropping it releases the allocation.
    type Memory;

    /// Allocates `size` bytes, uploading `data` at creation when given.
    ///
    /// `data`, if present, has exactly `size` bytes.
    fn create_buffer(&self, size: usize, read_only: bool, data: Option<&[u8]>)
        -> Result<Self::Memory>;
}

/// Blocking host/device transfers.
///
/// Both calls return only after the device finished the copy. An `Err`
/// means nothing was transferred.
pub trait CommandQueueManager {
    type Memory;

    fn enqueue_write_buffer(&self, memory: &Self::Memory, data: &[u8]) -> Result<()>;

    fn enqueue_read_buffer(&self, memory: &Self::Memory, data: &mut [u8]) -> Result<()>;
}
