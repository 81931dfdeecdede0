//! Move-only device buffer.

use tracing::{debug, error};

use crate::error::{NnError, Result};
use crate::opencl::{CommandQueueManager, ContextManager};

/// One device allocation of a fixed byte size.
///
/// # Example
///
/// ```
/// use ondevice_trainer::opencl::{Buffer, HostContext, HostQueue};
///
/// let context = HostContext::new();
/// let queue = HostQueue::new();
///
/// let first = Buffer::new(&context, 16, false, None).unwrap();
/// first.write_f32(&queue, &[1.0, 2.0, 3.0, 4.0]).unwrap();
///
/// let second = first; // ownership moves; `first` can no longer be used
/// let mut back = [0.0f32; 4];
/// second.read_f32(&queue, &mut back).unwrap();
/// assert_eq!(back, [1.0, 2.0, 3.0, 4.0]);
///
/// drop(second);
/// assert_eq!(context.released(), 1);
/// ```
#[derive(Debug)]
pub struct Buffer<M> {
    memory: M,
    size: usize,
    read_only: bool,
}

impl<M> Buffer<M> {
    /// Allocates `size` bytes through `context`.
    ///
    /// # Errors
    ///
    /// - [`NnError::InvalidParameter`] if `size` is zero or `data` is not
    ///   exactly `size` bytes long
    /// - [`NnError::Device`] if the allocation or the initial upload fails
    pub fn new<C>(context: &C, size: usize, read_only: bool, data: Option<&[u8]>) -> Result<Self>
    where
        C: ContextManager<Memory = M>,
    {
        if size == 0 {
            error!("buffer size must be greater than 0");
            return Err(NnError::invalid("buffer size must be greater than 0"));
        }
        if let Some(bytes) = data {
            check_len(size, bytes.len())?;
        }
        let memory = context.create_buffer(size, read_only, data)?;
        debug!(size, read_only, uploaded = data.is_some(), "device buffer created");
        Ok(Self {
            memory,
            size,
            read_only,
        })
    }

    /// Copies `data` into the buffer, blocking until done.
    ///
    /// Nothing is written unless `data` spans the whole buffer.
    pub fn write_data<Q>(&self, queue: &Q, data: &[u8]) -> Result<()>
    where
        Q: CommandQueueManager<Memory = M>,
    {
        check_len(self.size, data.len())?;
        queue.enqueue_write_buffer(&self.memory, data).map_err(|e| {
            error!(size = self.size, error = %e, "device write failed");
            e
        })
    }

    /// Copies the buffer into `data`, blocking until done.
    pub fn read_data<Q>(&self, queue: &Q, data: &mut [u8]) -> Result<()>
    where
        Q: CommandQueueManager<Memory = M>,
    {
        check_len(self.size, data.len())?;
        queue.enqueue_read_buffer(&self.memory, data).map_err(|e| {
            error!(size = self.size, error = %e, "device read failed");
            e
        })
    }

    pub fn write_f32<Q>(&self, queue: &Q, data: &[f32]) -> Result<()>
    where
        Q: CommandQueueManager<Memory = M>,
    {
        self.write_data(queue, bytemuck::cast_slice(data))
    }

    pub fn read_f32<Q>(&self, queue: &Q, data: &mut [f32]) -> Result<()>
    where
        Q: CommandQueueManager<Memory = M>,
    {
        self.read_data(queue, bytemuck::cast_slice_mut(data))
    }

    /// Backend handle, for kernel argument binding.
    pub fn handle(&self) -> &M {
        &self.memory
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn check_len(size: usize, len: usize) -> Result<()> {
    if size != len {
        error!(size, len, "host data does not match the buffer size");
        return Err(NnError::invalid(format!(
            "host data is {} bytes, buffer is {} bytes",
            len, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opencl::{HostContext, HostQueue};

    #[test]
    fn test_zero_size_rejected() {
        let context = HostContext::new();
        assert!(Buffer::new(&context, 0, false, None).is_err());
        assert_eq!(context.allocated(), 0);
    }

    #[test]
    fn test_initial_data_is_uploaded() {
        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = Buffer::new(&context, 3, true, Some(&[7, 8, 9])).unwrap();
        assert!(buffer.is_read_only());

        let mut back = [0u8; 3];
        buffer.read_data(&queue, &mut back).unwrap();
        assert_eq!(back, [7, 8, 9]);
    }

    #[test]
    fn test_initial_data_length_checked() {
        let context = HostContext::new();
        assert!(Buffer::new(&context, 4, false, Some(&[1, 2])).is_err());
        assert_eq!(context.allocated(), 0);
    }

    #[test]
    fn test_partial_write_rejected() {
        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = Buffer::new(&context, 4, false, Some(&[1, 2, 3, 4])).unwrap();
        assert!(buffer.write_data(&queue, &[9, 9]).is_err());

        let mut back = [0u8; 4];
        buffer.read_data(&queue, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
    }
}
