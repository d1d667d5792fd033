use std::alloc::Layout;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;
use tracing::trace;

use crate::runtime::error::{CafError, CafResult};

/// Alignment of every coarray allocation; wide enough for 16-byte reals,
/// 128-bit integers and the 4-byte synchronization cells.
pub const ALLOCATION_ALIGN: usize = 16;

/// Source of coarray storage. Swapping the implementation lets tests observe
/// and fail allocations without touching call sites.
pub trait Allocator: Send + Sync {
    /// Returns zero-filled storage for `layout`, or `None` when exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same layout.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Storage from the C heap. Blocks handed to compiled code are released by
/// it with `free`, so the C entry points allocate through this.
pub struct MallocAllocator;

impl Allocator for MallocAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let align = layout.align().max(mem::size_of::<*mut c_void>());
        let mut block: *mut c_void = ptr::null_mut();
        if unsafe { libc::posix_memalign(&mut block, align, layout.size()) } != 0 {
            return None;
        }
        let block = NonNull::new(block as *mut u8)?;
        unsafe { ptr::write_bytes(block.as_ptr(), 0, layout.size()) };
        Some(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { libc::free(ptr.as_ptr() as *mut c_void) }
    }
}

/// Counts live allocations and can be told to fail after a number of
/// successful ones.
#[derive(Default)]
pub struct TrackingAllocator {
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    total: AtomicUsize,
    fail_after: Option<usize>,
}

impl TrackingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `successes` allocations, then refuses every further request.
    pub fn failing_after(successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            ..Self::default()
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn total_allocations(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Allocator for TrackingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if let Some(limit) = self.fail_after {
            if self.total.load(Ordering::SeqCst) >= limit {
                return None;
            }
        }
        let ptr = SystemAllocator.allocate(layout)?;
        self.total.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(layout.size(), Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(layout.size(), Ordering::SeqCst);
        unsafe { SystemAllocator.deallocate(ptr, layout) }
    }
}

/// Uniquely owned, zero-initialized block; released on drop.
pub struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
    allocator: Arc<dyn Allocator>,
}

// SAFETY: the block is exclusively owned, like a `Box<[u8]>`.
unsafe impl Send for Allocation {}

impl Allocation {
    pub fn new(allocator: &Arc<dyn Allocator>, len: usize) -> CafResult<Self> {
        let layout = Layout::from_size_align(len.max(1), ALLOCATION_ALIGN)
            .map_err(|_| CafError::allocation(len))?;
        let ptr = allocator
            .allocate(layout)
            .ok_or_else(|| CafError::allocation(len))?;
        trace!(bytes = len, "allocated coarray block");
        Ok(Self {
            ptr,
            layout,
            len,
            allocator: Arc::clone(allocator),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gives up ownership of the block. It must later be released through
    /// the allocator it came from.
    pub fn into_raw(self) -> NonNull<u8> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the handle is read exactly once.
        drop(unsafe { ptr::read(&this.allocator) });
        this.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        trace!(bytes = self.len, "released coarray block");
        unsafe { self.allocator.deallocate(self.ptr, self.layout) }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Storage behind a token: either owned by the runtime or lent by the caller.
#[derive(Debug)]
pub enum Memory {
    Owned(Allocation),
    Borrowed { ptr: NonNull<u8>, len: usize },
}

impl Memory {
    pub fn as_ptr(&self) -> *mut u8 {
        match self {
            Memory::Owned(allocation) => allocation.as_ptr(),
            Memory::Borrowed { ptr, .. } => ptr.as_ptr(),
        }
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        match self {
            Memory::Owned(allocation) => allocation.as_non_null(),
            Memory::Borrowed { ptr, .. } => *ptr,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Memory::Owned(allocation) => allocation.len(),
            Memory::Borrowed { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Memory::Owned(_))
    }
}
