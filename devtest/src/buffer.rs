// Copyright 2026 Oxide Computer Company
use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/*
 * A fixed-size, zero-initialised heap buffer whose start address satisfies
 * the alignment that O_DIRECT I/O demands of user memory.
 *
 * Neither the size nor the alignment can change after construction, and the
 * allocation never moves, so a raw pointer into it stays valid for as long as
 * the buffer lives.  That property is what lets the kernel DMA into it while
 * the owning block operation is parked in the reactor.
 */
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation, like a Box<[u8]>.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only hands out &[u8].
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocates `len` zero bytes aligned to `align`.
    ///
    /// # Panics
    /// - `len` is zero
    /// - `align` is not a power of two
    ///
    /// Allocation failure aborts the process, as it does for `Vec`.
    pub fn new(len: usize, align: usize) -> AlignedBuf {
        assert!(len > 0, "zero-length aligned buffer");
        let layout = Layout::from_size_align(len, align)
            .unwrap_or_else(|e| panic!("bad buffer layout {len}/{align}: {e}"));

        // SAFETY: layout has a non-zero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        AlignedBuf { ptr, layout }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len())
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
