//! Shared frame buffer region for the frame receiver.
//!
//! A [`SharedBufferManager`] owns one contiguous, zero-filled region split into
//! `num_buffers` slots of `buffer_size` bytes. Slots are identified by a
//! [`BufferId`] and resolved to a [`BufferAddress`] in O(1).
//!
//! # Ownership Model
//!
//! The manager does not track who is writing to which slot. Exclusive access is
//! the job of the caller's hand-off protocol: in the receiver, a slot id is
//! either sitting in the decoder's empty-buffer queue, held by the acquisition
//! thread while it fills the slot, or held downstream until it is released.
//! Only the current holder may read or write through the address, which is why
//! the accessors on [`BufferAddress`] are `unsafe`.
//!
//! # Example
//!
//! ```
//! use shared_buffer::SharedBufferManager;
//!
//! let manager = SharedBufferManager::new("frames", 4, 1024).unwrap();
//! let mut addr = manager.buffer_address(2).unwrap();
//!
//! // SAFETY: nothing else holds slot 2 in this example.
//! unsafe { addr.as_mut_slice()[0] = 42 };
//! assert_eq!(unsafe { addr.as_slice()[0] }, 42);
//! ```

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Identifier of a slot in the shared buffer region.
pub type BufferId = usize;

static NEXT_MANAGER_ID: AtomicUsize = AtomicUsize::new(1);

/// Errors raised while creating a buffer region.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Zero buffers, zero-sized buffers, or a region too large to address.
    #[error("invalid shared buffer geometry: {num_buffers} buffers of {buffer_size} bytes")]
    InvalidGeometry {
        num_buffers: usize,
        buffer_size: usize,
    },
}

/// Contiguous region of equally sized frame buffers.
pub struct SharedBufferManager {
    name: String,
    manager_id: usize,
    num_buffers: usize,
    buffer_size: usize,
    /// Base of the leaked `Box<[u8]>`, reclaimed in `Drop`.
    region: NonNull<u8>,
    region_len: usize,
}

// SAFETY: The manager itself never reads or writes slot contents after
// construction; it only hands out addresses. Concurrent slot access is
// serialised by the buffer ownership protocol documented on `BufferAddress`.
unsafe impl Send for SharedBufferManager {}
unsafe impl Sync for SharedBufferManager {}

impl SharedBufferManager {
    /// Allocate a region of `num_buffers * buffer_size` zeroed bytes.
    pub fn new(
        name: impl Into<String>,
        num_buffers: usize,
        buffer_size: usize,
    ) -> Result<Self, PoolError> {
        let geometry_error = PoolError::InvalidGeometry {
            num_buffers,
            buffer_size,
        };
        if num_buffers == 0 || buffer_size == 0 {
            return Err(geometry_error);
        }
        let region_len = num_buffers
            .checked_mul(buffer_size)
            .ok_or(geometry_error)?;

        let region: &'static mut [u8] = Box::leak(vec![0u8; region_len].into_boxed_slice());
        let region = NonNull::from(region).cast::<u8>();

        let name = name.into();
        let manager_id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);

        info!(
            name = %name,
            manager_id,
            num_buffers,
            buffer_size,
            total_mb = region_len as f64 / (1024.0 * 1024.0),
            "Shared buffer region created"
        );

        Ok(Self {
            name,
            manager_id,
            num_buffers,
            buffer_size,
            region,
            region_len,
        })
    }

    /// Resolve a buffer id to its address. `None` if the id is outside the region.
    #[must_use]
    pub fn buffer_address(&self, id: BufferId) -> Option<BufferAddress<'_>> {
        if !self.contains(id) {
            return None;
        }
        // SAFETY: id < num_buffers, so the offset stays inside the region.
        let ptr = unsafe { self.region.add(id * self.buffer_size) };
        Some(BufferAddress {
            id,
            ptr,
            len: self.buffer_size,
            _region: PhantomData,
        })
    }

    /// Whether `id` names a slot of this region.
    #[must_use]
    pub fn contains(&self, id: BufferId) -> bool {
        id < self.num_buffers
    }

    /// Region name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process-unique identifier of this region.
    #[must_use]
    pub fn manager_id(&self) -> usize {
        self.manager_id
    }

    /// Number of buffers
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Size of one buffer in bytes
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl std::fmt::Debug for SharedBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferManager")
            .field("name", &self.name)
            .field("manager_id", &self.manager_id)
            .field("num_buffers", &self.num_buffers)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl Drop for SharedBufferManager {
    fn drop(&mut self) {
        debug!(name = %self.name, manager_id = self.manager_id, "Releasing shared buffer region");
        // SAFETY: region/region_len come from the Box<[u8]> leaked in `new`,
        // and no BufferAddress can outlive `self`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.region.as_ptr(),
                self.region_len,
            )));
        }
    }
}

/// Address of one slot, borrowed from its [`SharedBufferManager`].
///
/// # Safety
///
/// Reading or writing through the address is only sound while the caller holds
/// ownership of the slot id. The manager cannot check this.
#[derive(Debug, Clone, Copy)]
pub struct BufferAddress<'a> {
    id: BufferId,
    ptr: NonNull<u8>,
    len: usize,
    _region: PhantomData<&'a SharedBufferManager>,
}

impl BufferAddress<'_> {
    /// Buffer id
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Slot size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the slot contents.
    ///
    /// # Safety
    ///
    /// No other thread may write to this slot for the lifetime of the slice.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Mutable view of the slot contents.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the slot id.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_geometry() {
        assert_eq!(
            SharedBufferManager::new("bad", 0, 16).unwrap_err(),
            PoolError::InvalidGeometry {
                num_buffers: 0,
                buffer_size: 16
            }
        );
        assert!(SharedBufferManager::new("bad", 4, 0).is_err());
        assert!(SharedBufferManager::new("bad", usize::MAX, 2).is_err());
    }

    #[test]
    fn addresses_are_contiguous_slots() {
        let manager = SharedBufferManager::new("slots", 3, 64).unwrap();
        let base = manager.buffer_address(0).unwrap().as_ptr() as usize;
        for id in 0..3 {
            let addr = manager.buffer_address(id).unwrap();
            assert_eq!(addr.id(), id);
            assert_eq!(addr.len(), 64);
            assert_eq!(addr.as_ptr() as usize, base + id * 64);
        }
    }

    #[test]
    fn out_of_range_id_has_no_address() {
        let manager = SharedBufferManager::new("range", 2, 8).unwrap();
        assert!(manager.buffer_address(2).is_none());
        assert!(!manager.contains(2));
        assert!(manager.contains(1));
    }

    #[test]
    fn writes_are_visible_through_a_fresh_address() {
        let manager = SharedBufferManager::new("rw", 2, 8).unwrap();
        let mut addr = manager.buffer_address(1).unwrap();
        unsafe { addr.as_mut_slice().copy_from_slice(&[7u8; 8]) };

        let again = manager.buffer_address(1).unwrap();
        assert_eq!(unsafe { again.as_slice() }, &[7u8; 8]);
        let other = manager.buffer_address(0).unwrap();
        assert_eq!(unsafe { other.as_slice() }, &[0u8; 8]);
    }

    #[test]
    fn manager_ids_are_unique() {
        let a = SharedBufferManager::new("a", 1, 1).unwrap();
        let b = SharedBufferManager::new("b", 1, 1).unwrap();
        assert_ne!(a.manager_id(), b.manager_id());
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn manager_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedBufferManager>();
    }
}
