//! Host-memory backend
//!
//! Allocations are plain byte vectors. Every context keeps a ledger of how
//! many allocations it handed out and how many were released, which makes
//! ownership bugs (leaks, double releases) observable in tests. Both the
//! context and the queue can be told to fail, to exercise error paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::{NnError, Result};
use crate::opencl::{CommandQueueManager, ContextManager};

#[derive(Debug, Default)]
struct Ledger {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

/// One host allocation. Dropping it records the release in its ledger.
#[derive(Debug)]
pub struct HostMemory {
    id: usize,
    bytes: Mutex<Vec<u8>>,
    ledger: Arc<Ledger>,
}

impl HostMemory {
    /// Allocation number within its context, starting at 0.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Allocation size in bytes. A poisoned allocation still reports its size.
    pub fn len(&self) -> usize {
        match self.bytes.lock() {
            Ok(bytes) => bytes.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        self.bytes
            .lock()
            .map_err(|_| NnError::Device(format!("host allocation {} is poisoned", self.id)))
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
        trace!(id = self.id, "host allocation released");
    }
}

/// Allocator for [`HostMemory`].
#[derive(Debug, Default)]
pub struct HostContext {
    ledger: Arc<Ledger>,
    fail_allocations: AtomicBool,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following allocation fail until reset.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Number of allocations handed out so far.
    pub fn allocated(&self) -> usize {
        self.ledger.allocated.load(Ordering::SeqCst)
    }

    /// Number of allocations released so far.
    pub fn released(&self) -> usize {
        self.ledger.released.load(Ordering::SeqCst)
    }

    /// Allocations currently alive.
    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

impl ContextManager for HostContext {
    type Memory = HostMemory;

    fn create_buffer(&self, size: usize, _read_only: bool, data: Option<&[u8]>) -> Result<HostMemory> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(NnError::Device(format!("allocation of {} bytes failed", size)));
        }
        let bytes = match data {
            Some(src) => src.to_vec(),
            None => vec![0u8; size],
        };
        let id = self.ledger.allocated.fetch_add(1, Ordering::SeqCst);
        trace!(id, size, "host allocation created");
        Ok(HostMemory {
            id,
            bytes: Mutex::new(bytes),
            ledger: Arc::clone(&self.ledger),
        })
    }
}

/// Synchronous transfer queue for [`HostMemory`].
#[derive(Debug, Default)]
pub struct HostQueue {
    fail_transfers: AtomicBool,
}

impl HostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following transfer fail until reset.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Locks `memory` for a transfer of `len` bytes.
    fn check<'a>(&self, memory: &'a HostMemory, len: usize) -> Result<MutexGuard<'a, Vec<u8>>> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(NnError::Device(format!(
                "transfer on allocation {} failed",
                memory.id
            )));
        }
        let bytes = memory.lock()?;
        if bytes.len() != len {
            return Err(NnError::Device(format!(
                "transfer of {} bytes on allocation {} of {} bytes",
                len,
                memory.id,
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

impl CommandQueueManager for HostQueue {
    type Memory = HostMemory;

    fn enqueue_write_buffer(&self, memory: &HostMemory, data: &[u8]) -> Result<()> {
        self.check(memory, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn enqueue_read_buffer(&self, memory: &HostMemory, data: &mut [u8]) -> Result<()> {
        let bytes = self.check(memory, data.len())?;
        data.copy_from_slice(&bytes);
        Ok(())
    }
}
