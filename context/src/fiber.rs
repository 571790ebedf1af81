use core::{
    ffi::c_void,
    ptr::{self, NonNull},
};
use std::io;

use windows_sys::Win32::System::Threading::{
    ConvertFiberToThread, ConvertThreadToFiberEx, CreateFiberEx, DeleteFiber, SwitchToFiber,
    FIBER_FLAG_FLOAT_SWITCH,
};

use crate::{Entry, NewError, Switch};

struct Start {
    entry: Entry,
    arg: *mut (),
}

/// A Windows fiber handle. The OS owns the fiber's stack and frees it in
/// `DeleteFiber`.
#[derive(Debug)]
pub struct Fcx {
    handle: NonNull<c_void>,
    start: Option<Box<Start>>,
    adopted: bool,
}

impl core::fmt::Debug for Start {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Start").field("arg", &self.arg).finish()
    }
}

impl Drop for Fcx {
    fn drop(&mut self) {
        // An adopted thread is converted back in `release`, never deleted.
        if !self.adopted {
            // SAFETY: `handle` came from `CreateFiberEx` and is not running.
            unsafe { DeleteFiber(self.handle.as_ptr() as _) }
        }
    }
}

unsafe extern "system" fn start(param: *mut c_void) {
    // SAFETY: `param` is the boxed `Start` owned by the fiber's `Fcx`.
    let start = unsafe { &*param.cast::<Start>() };
    // SAFETY: `arg` is kept valid by the caller of `new_on`.
    unsafe { (start.entry)(start.arg) }
}

/// Windows [fibers](https://learn.microsoft.com/en-us/windows/win32/procthread/fibers).
#[derive(Debug, Copy, Clone, Default)]
pub struct Fiber;

unsafe impl Switch for Fiber {
    type Context = Fcx;

    fn adopt(&self) -> Result<Fcx, NewError> {
        // SAFETY: Plain FFI call without pointer arguments.
        let handle = unsafe { ConvertThreadToFiberEx(ptr::null(), FIBER_FLAG_FLOAT_SWITCH) };
        match NonNull::new(handle as *mut c_void) {
            Some(handle) => {
                log::debug!("converted thread to fiber {handle:p}");
                Ok(Fcx {
                    handle,
                    start: None,
                    adopted: true,
                })
            }
            None => Err(io::Error::last_os_error().into()),
        }
    }

    unsafe fn new_on(
        &self,
        stack_size: usize,
        entry: Entry,
        arg: *mut (),
    ) -> Result<Fcx, NewError> {
        let size = strand_stack::layout_for(stack_size)?.size();
        let start_info = Box::new(Start { entry, arg });
        let param: *const Start = &*start_info;

        // SAFETY: `param` is boxed and kept alongside the fiber handle.
        let handle = unsafe {
            CreateFiberEx(0, size, FIBER_FLAG_FLOAT_SWITCH, Some(start), param as _)
        };
        match NonNull::new(handle as *mut c_void) {
            Some(handle) => Ok(Fcx {
                handle,
                start: Some(start_info),
                adopted: false,
            }),
            None => Err(io::Error::last_os_error().into()),
        }
    }

    unsafe fn switch(&self, _from: NonNull<Fcx>, to: NonNull<Fcx>) -> io::Result<()> {
        // SAFETY: The caller guarantees `to` is valid; the OS saves `_from`.
        unsafe { SwitchToFiber((*to.as_ptr()).handle.as_ptr() as _) };
        Ok(())
    }

    unsafe fn release(&self, root: Fcx) {
        // SAFETY: The caller guarantees `root` is the running, adopted fiber.
        if unsafe { ConvertFiberToThread() } == 0 {
            log::warn!(
                "failed to convert fiber back to thread: {}",
                io::Error::last_os_error()
            );
        } else {
            log::debug!("converted fiber {:p} back to thread", root.handle);
        }
        drop(root)
    }
}
