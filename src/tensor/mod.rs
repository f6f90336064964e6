//! Tensor backing storage
//!
//! Batch columns live in contiguous, cache-line aligned host allocations.
//! Keys flagged `pinned` get their pages locked so a consumer can issue
//! asynchronous device copies straight out of the buffer; the allocation is
//! never relocated for its whole lifetime, which is what makes handing out
//! raw pointers to the consumer side sound.

use std::alloc::{ alloc_zeroed, dealloc, Layout };
use std::ptr::NonNull;

use static_assertions::const_assert;
use tracing::debug;

use crate::constants::TENSOR_ALIGNMENT;
use crate::error::{ ConvoyError, Result };

const_assert!(TENSOR_ALIGNMENT.is_power_of_two());

/// A contiguous, aligned, optionally page-locked host allocation.
///
/// The buffer starts zero-filled. Mutation goes through raw pointers and is
/// serialized externally by the batch slot state machine: exactly one thread
/// writes while the slot is `Filling`, exactly one reads while it is
/// `InFlight`, and the slot's atomic state transitions provide the
/// Acquire/Release edges between them.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    pinned: bool,
}

// SAFETY: the raw pointer is safe to share between threads because all access
// is gated by the owning slot's atomic state machine; the allocation is never
// resized or moved, and Drop is the only deallocation path.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Allocate `len` zeroed bytes, cache-line aligned.
    ///
    /// With `pinned` set the pages are locked via `mlock`; failure to lock is
    /// tolerated (the copy still works, just not asynchronously) and logged.
    pub fn alloc(len: usize, pinned: bool) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), TENSOR_ALIGNMENT).map_err(|_|
            ConvoyError::memory(format!("invalid tensor layout of {len} bytes"))
        )?;

        let ptr = unsafe {
            // SAFETY: layout has non-zero size and a valid power-of-two align
            alloc_zeroed(layout)
        };
        let ptr = NonNull::new(ptr).ok_or_else(||
            ConvoyError::memory(format!("failed to allocate {len} tensor bytes"))
        )?;

        if pinned {
            let rc = unsafe {
                // SAFETY: ptr/len describe the allocation we just made
                libc::mlock(ptr.as_ptr() as *const libc::c_void, len.max(1))
            };
            if rc != 0 {
                debug!(len, "mlock failed, buffer stays pageable");
            }
        }

        Ok(Self { ptr, len, pinned })
    }

    /// Raw read pointer to the start of the buffer
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Raw write pointer to the start of the buffer.
    ///
    /// Writing through this pointer is only valid while the caller holds the
    /// exclusive fill side of the slot handoff.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Allocation size in bytes
    pub fn len_bytes(&self) -> usize {
        self.len
    }

    /// Whether the pages were requested page-locked
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Zero the whole buffer
    pub(crate) fn clear(&self) {
        unsafe {
            // SAFETY: the full range belongs to this allocation; the caller
            // holds the exclusive fill side of the slot handoff
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len);
        }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let layout = match Layout::from_size_align(self.len.max(1), TENSOR_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        unsafe {
            // SAFETY: same layout the buffer was allocated with
            if self.pinned {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.len.max(1));
            }
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len)
            .field("pinned", &self.pinned)
            .finish()
    }
}
