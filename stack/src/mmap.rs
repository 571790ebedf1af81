use core::ptr::{self, NonNull};

use crate::{AllocError, PAGE_SIZE};

fn page_size() -> usize {
    // SAFETY: `sysconf` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => PAGE_SIZE,
    }
}

/// Maps at least `size` writable bytes above one inaccessible guard page.
///
/// Returns the start of the mapping, its total length and the guard length.
pub(crate) fn map(size: usize) -> Result<(NonNull<u8>, usize, usize), AllocError> {
    let page = page_size();
    let error = AllocError { size };
    let usable = size.checked_add(page - 1).ok_or(error)? & !(page - 1);
    let len = usable.checked_add(page).ok_or(error)?;

    // OpenBSD requires MAP_STACK on anything that is used as a stack.
    cfg_if::cfg_if! {
        if #[cfg(target_os = "openbsd")] {
            let flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
        } else {
            let flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        }
    }

    // SAFETY: A fresh anonymous mapping that nothing else refers to.
    unsafe {
        let mapping = libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, flags, -1, 0);
        if mapping == libc::MAP_FAILED {
            return Err(error);
        }
        let Some(mapping) = NonNull::new(mapping.cast::<u8>()) else {
            return Err(error);
        };

        // Everything but the lowest page becomes writable.
        let usable_start = mapping.as_ptr().add(page).cast();
        if libc::mprotect(usable_start, usable, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            unmap(mapping, len);
            return Err(error);
        }
        Ok((mapping, len, page))
    }
}

/// # Safety
///
/// `mapping` and `len` must come from the same successful [`map`].
pub(crate) unsafe fn unmap(mapping: NonNull<u8>, len: usize) {
    // SAFETY: See above.
    let ret = unsafe { libc::munmap(mapping.as_ptr().cast(), len) };
    debug_assert_eq!(ret, 0);
}
