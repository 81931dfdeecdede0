//! OpenCL backend built on `ocl`.
//!
//! `ocl::Buffer` releases its `cl_mem` when the last reference is dropped,
//! and `Buffer<ocl::Buffer<u8>>` never clones it, so the handle is released
//! exactly once.

use ocl::{flags::MemFlags, Context, Device, Platform, Queue};
use tracing::{debug, error};

use crate::error::{NnError, Result};
use crate::opencl::{CommandQueueManager, ContextManager};

fn device_error(what: &str, err: ocl::Error) -> NnError {
    error!(error = %err, "{}", what);
    NnError::Device(format!("{}: {}", what, err))
}

/// OpenCL context bound to one device.
#[derive(Debug, Clone)]
pub struct OclContext {
    context: Context,
    device: Device,
}

impl OclContext {
    /// Context on the first device of the default platform.
    pub fn first_device() -> Result<Self> {
        let platform = Platform::default();
        let device =
            Device::first(platform).map_err(|e| device_error("no OpenCL device available", e))?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| device_error("cannot create OpenCL context", e))?;
        debug!(device = ?device.name().ok(), "OpenCL context created");
        Ok(Self { context, device })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// In-order command queue on this context's device.
    pub fn create_queue(&self) -> Result<OclCommandQueue> {
        let queue = Queue::new(&self.context, self.device, None)
            .map_err(|e| device_error("cannot create command queue", e))?;
        Ok(OclCommandQueue { queue })
    }
}

impl ContextManager for OclContext {
    type Memory = ocl::Buffer<u8>;

    fn create_buffer(
        &self,
        size: usize,
        read_only: bool,
        data: Option<&[u8]>,
    ) -> Result<ocl::Buffer<u8>> {
        let flags = if read_only {
            MemFlags::new().read_only()
        } else {
            MemFlags::new().read_write()
        };
        let mut builder = ocl::Buffer::<u8>::builder()
            .context(&self.context)
            .flags(flags)
            .len(size);
        if let Some(bytes) = data {
            builder = builder.copy_host_slice(bytes);
        }
        builder
            .build()
            .map_err(|e| device_error("cannot allocate device buffer", e))
    }
}

/// Blocking command queue.
#[derive(Debug, Clone)]
pub struct OclCommandQueue {
    queue: Queue,
}

impl OclCommandQueue {
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl CommandQueueManager for OclCommandQueue {
    type Memory = ocl::Buffer<u8>;

    fn enqueue_write_buffer(&self, memory: &ocl::Buffer<u8>, data: &[u8]) -> Result<()> {
        memory
            .write(data)
            .queue(&self.queue)
            .enq()
            .map_err(|e| device_error("enqueue write buffer failed", e))
    }

    fn enqueue_read_buffer(&self, memory: &ocl::Buffer<u8>, data: &mut [u8]) -> Result<()> {
        memory
            .read(data)
            .queue(&self.queue)
            .enq()
            .map_err(|e| device_error("enqueue read buffer failed", e))
    }
}
