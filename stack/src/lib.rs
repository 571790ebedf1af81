#![cfg_attr(not(test), no_std)]
#![deny(future_incompatible)]
#![deny(rust_2018_idioms)]
//! This module tackles with stacks.
//!
//! We have [a stack structure](Stack) that keeps track of its own memory, plus
//! the sizing rules every execution unit goes through before its stack is
//! allocated.

use core::{alloc::Layout, fmt, ptr::NonNull};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod mmap;
        use self::mmap as sys;
    } else {
        mod heap;
        use self::heap as sys;
    }
}

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The smallest stack a unit is ever given, not counting the guard page.
/// Requests below this are raised.
pub const MIN_STACK_SIZE: usize = 8 * PAGE_SIZE;

/// The stack size used when the caller does not ask for one.
pub const DEFAULT_STACK_SIZE: usize = 64 * PAGE_SIZE;

/// Applies the floor and rounds `size` up to a whole number of pages.
///
/// A `size` of zero means "no preference" and yields [`MIN_STACK_SIZE`].
pub const fn adjust(size: usize) -> usize {
    let size = if size < MIN_STACK_SIZE {
        MIN_STACK_SIZE
    } else {
        size
    };
    match size.checked_add(PAGE_SIZE - 1) {
        Some(padded) => padded & !(PAGE_SIZE - 1),
        None => usize::MAX & !(PAGE_SIZE - 1),
    }
}

/// The layout a stack of the requested size is allocated with.
pub fn layout_for(size: usize) -> Result<Layout, AllocError> {
    let size = adjust(size);
    Layout::from_size_align(size, PAGE_SIZE).map_err(|_| AllocError { size })
}

/// The error returned when a stack buffer cannot be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub size: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate a stack of {} bytes", self.size)
    }
}

impl core::error::Error for AllocError {}

/// The raw stack structure.
///
/// The structure owns its memory, and frees the memory when it's dropped. The
/// user should not regard this as some sort of plain old data: the buffer is
/// never moved or resized for the whole life of the value.
///
/// On unix the buffer is mapped with `mmap`, and the page right below
/// [`Stack::base`] is left inaccessible, so running off the end of the stack
/// faults at once instead of overwriting other memory.
pub struct Stack {
    mapping: NonNull<u8>,
    mapped: usize,
    guard: usize,
}

impl Stack {
    /// Allocates a new [`Stack`] with at least `size` usable bytes.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        let (mapping, mapped, guard) = sys::map(adjust(size))?;
        Ok(Stack {
            mapping,
            mapped,
            guard,
        })
    }

    /// The lowest usable address. Any guard page lies below it.
    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: The guard is a prefix of the mapping.
        unsafe { self.mapping.add(self.guard) }
    }

    /// The number of usable bytes above [`Stack::base`].
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("size", &self.size())
            .field("guard", &self.guard)
            .finish()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: Both values came from `sys::map` in `Stack::new`.
        unsafe { sys::unmap(self.mapping, self.mapped) }
    }
}
