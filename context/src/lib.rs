#![deny(future_incompatible)]
#![deny(rust_2018_idioms)]
//! Platform context switching.
//!
//! Every backend implements [`Switch`], which saves the executing machine
//! context into one slot and restores another. Exactly one backend is compiled
//! in and exported as [`Platform`]: POSIX user-level contexts on unix, OS fiber
//! objects on Windows.

use std::{io, ptr::NonNull};

use strand_stack::AllocError;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod ucx;
        /// The backend selected for this target.
        pub type Platform = ucx::Ucontext;
    } else if #[cfg(windows)] {
        pub mod fiber;
        /// The backend selected for this target.
        pub type Platform = fiber::Fiber;
    } else {
        compile_error!("strand supports only unix (ucontext) and windows (fibers) targets");
    }
}

/// The saved-context type of the selected backend.
pub type Context = <Platform as Switch>::Context;

/// The function a fresh context starts executing on its first switch-in.
///
/// It receives the `arg` given to [`Switch::new_on`] and must never return:
/// a finished context leaves by switching away for the last time.
pub type Entry = unsafe fn(arg: *mut ()) -> !;

#[derive(Debug, thiserror::Error)]
pub enum NewError {
    #[error(transparent)]
    Stack(#[from] AllocError),
    #[error("platform context primitive failed: {0}")]
    Os(#[from] io::Error),
}

/// The generic symmetric context-switching trait.
///
/// # Safety
///
/// Implementors must hand out contexts that stay bound to their own stack for
/// their whole life, and [`Switch::switch`] must resume exactly the location
/// last saved into the target.
pub unsafe trait Switch: Copy + Default {
    /// The saved execution state, bound to a specific stack. Dropping it
    /// releases that stack.
    type Context: 'static;

    /// Turns the calling thread's own stack into a context that other
    /// contexts can switch back to.
    fn adopt(&self) -> Result<Self::Context, NewError>;

    /// Creates a new context on top of a fresh stack of at least `stack_size`
    /// bytes. Switching into it for the first time calls `entry(arg)`.
    ///
    /// # Safety
    ///
    /// `arg` must stay valid for as long as the returned context may be
    /// switched into.
    unsafe fn new_on(
        &self,
        stack_size: usize,
        entry: Entry,
        arg: *mut (),
    ) -> Result<Self::Context, NewError>;

    /// Saves the executing state into `from` and continues from `to`.
    ///
    /// Returns only when something later switches back into `from`.
    ///
    /// # Safety
    ///
    /// `from` must describe the context executing right now on this thread,
    /// and both pointers must stay valid across the switch.
    unsafe fn switch(
        &self,
        from: NonNull<Self::Context>,
        to: NonNull<Self::Context>,
    ) -> io::Result<()>;

    /// Gives an adopted thread context back to the OS.
    ///
    /// # Safety
    ///
    /// `root` must come from [`Switch::adopt`] on this thread and must be the
    /// context executing right now.
    unsafe fn release(&self, root: Self::Context);
}
