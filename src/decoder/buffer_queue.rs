//! Empty-buffer hand-off queue.
//!
//! The queue holds the ids of shared buffers nobody is writing to. The dispatch
//! thread pushes ids as downstream consumers release them; the acquisition
//! thread pops an id, fills the slot, and announces it as ready. The lock is held
//! only for the `VecDeque` operation, never while resolving an address.

use parking_lot::Mutex;
use shared_buffer::{BufferAddress, BufferId, SharedBufferManager};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// FIFO of free buffer ids backed by a shared buffer region.
#[derive(Debug)]
pub struct BufferQueue {
    manager: Arc<SharedBufferManager>,
    queue: Mutex<VecDeque<BufferId>>,
}

impl BufferQueue {
    /// Empty queue resolving ids through `manager`
    #[must_use]
    pub fn new(manager: Arc<SharedBufferManager>) -> Self {
        let capacity = manager.num_buffers();
        Self {
            manager,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append `id` to the tail.
    pub fn push(&self, id: BufferId) {
        self.queue.lock().push_back(id);
    }

    /// Pop the head and resolve its address. Never blocks on an empty queue.
    #[must_use]
    pub fn try_pop(&self) -> Option<(BufferId, BufferAddress<'_>)> {
        let id = self.queue.lock().pop_front()?;
        match self.manager.buffer_address(id) {
            Some(addr) => Some((id, addr)),
            None => {
                warn!(buffer_id = id, "Discarding buffer id outside the shared buffer region");
                None
            }
        }
    }

    /// Number of queued ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no id is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop every queued id, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }

    /// Pool the queued ids belong to
    #[must_use]
    pub fn manager(&self) -> &Arc<SharedBufferManager> {
        &self.manager
    }
}
