extern crate alloc;

use core::{alloc::Layout, ptr::NonNull};

use crate::{layout_for, AllocError, PAGE_SIZE};

/// Allocates the stack from the global allocator. There is no guard page.
pub(crate) fn map(size: usize) -> Result<(NonNull<u8>, usize, usize), AllocError> {
    let layout = layout_for(size)?;
    // SAFETY: `layout` has a non-zero size, at least `MIN_STACK_SIZE`.
    let pointer = unsafe { alloc::alloc::alloc(layout) };
    match NonNull::new(pointer) {
        Some(pointer) => Ok((pointer, layout.size(), 0)),
        None => Err(AllocError {
            size: layout.size(),
        }),
    }
}

/// # Safety
///
/// `mapping` and `len` must come from the same successful [`map`].
pub(crate) unsafe fn unmap(mapping: NonNull<u8>, len: usize) {
    // SAFETY: `map` allocated exactly this size with page alignment.
    unsafe {
        let layout = Layout::from_size_align_unchecked(len, PAGE_SIZE);
        alloc::alloc::dealloc(mapping.as_ptr(), layout)
    }
}
