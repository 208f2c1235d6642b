use core::{alloc::Layout, ptr::NonNull};
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use virtual_buffer::{align_up, page_size, Allocation};

/// Backing regions at least this large are committed as whole pages and
/// advised towards huge pages instead of going through the heap.
const HUGE_PAGE_THRESHOLD: usize = 2 * 1024 * 1024;

/// One contiguous zero-initialized allocation backing the slot array.
pub(crate) struct Region {
    kind: Kind,
}

enum Kind {
    /// Ordinary zeroed heap allocation.
    Heap { ptr: NonNull<u8>, layout: Layout },
    /// Reserved-and-committed virtual memory; committed pages come back
    /// zeroed from the kernel.
    Mapped { allocation: Allocation },
}

impl Region {
    /// Allocates a zero-initialized region for `layout`.
    ///
    /// # Panics
    ///
    /// Panics if the allocation fails.
    pub(crate) fn zeroed(layout: Layout) -> Self {
        if layout.size() >= HUGE_PAGE_THRESHOLD && layout.align() <= page_size() {
            if let Ok(region) = Self::mapped(layout.size()) {
                return region;
            }
        }

        // SAFETY: the slot array always contains at least the sentinel
        // record, so `layout` is never zero-sized.
        let ptr = unsafe { alloc_zeroed(layout) };

        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Region {
            kind: Kind::Heap { ptr, layout },
        }
    }

    fn mapped(size: usize) -> Result<Self, virtual_buffer::Error> {
        let size = align_up(size, page_size());
        let allocation = Allocation::new(size)?;

        allocation.commit(allocation.ptr(), size)?;

        // Advisory; a kernel without transparent huge pages just returns
        // an error.
        #[cfg(target_os = "linux")]
        // SAFETY: the range was committed above and is exclusively ours.
        unsafe {
            libc::madvise(allocation.ptr().cast(), size, libc::MADV_HUGEPAGE);
        }

        Ok(Region {
            kind: Kind::Mapped { allocation },
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match &self.kind {
            Kind::Heap { ptr, .. } => ptr.as_ptr(),
            Kind::Mapped { allocation } => allocation.ptr(),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Kind::Heap { ptr, layout } = &self.kind {
            // SAFETY: the pointer was allocated in `zeroed` with this same
            // layout.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}
