use core::{
    ffi::c_void,
    fmt, mem,
    ptr::{self, NonNull},
};
use std::io;

use libc::ucontext_t;
use strand_stack::Stack;

use crate::{Entry, NewError, Switch};

/// The boxed part of a context. `ucontext_t` may point into itself once
/// saved, so it never moves after `getcontext`.
struct Frame {
    ucx: ucontext_t,
    stack: Option<Stack>,
    start: Option<(Entry, *mut ())>,
}

impl Frame {
    fn boxed(stack: Option<Stack>, start: Option<(Entry, *mut ())>) -> Box<Frame> {
        Box::new(Frame {
            // SAFETY: `ucontext_t` is plain old data; `getcontext` or
            // `swapcontext` fills it before it is ever resumed.
            ucx: unsafe { mem::zeroed() },
            stack,
            start,
        })
    }
}

/// A saved `ucontext_t` together with the stack it runs on, which is `None`
/// for an adopted thread.
pub struct Ucx {
    frame: Box<Frame>,
}

impl Ucx {
    /// # Safety
    ///
    /// `this` must point to a live `Ucx`.
    unsafe fn ucx(this: NonNull<Ucx>) -> *mut ucontext_t {
        // SAFETY: See above.
        unsafe { ptr::addr_of_mut!((*this.as_ptr()).frame.ucx) }
    }
}

impl fmt::Debug for Ucx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ucx")
            .field("frame", &ptr::addr_of!(*self.frame))
            .field("stack", &self.frame.stack)
            .finish()
    }
}

extern "C" fn start(frame: *mut c_void) {
    // SAFETY: `frame` is the boxed frame registered in `new_on`, which lives as
    // long as its context.
    let start = unsafe { (*frame.cast::<Frame>()).start.take() };
    match start {
        // SAFETY: `arg` is kept valid by the caller of `new_on`.
        Some((entry, arg)) => unsafe { entry(arg) },
        None => std::process::abort(),
    }
}

/// The POSIX library's [`makecontext`](https://man7.org/linux/man-pages/man3/makecontext.3.html) series functions.
#[derive(Debug, Copy, Clone, Default)]
pub struct Ucontext;

unsafe impl Switch for Ucontext {
    type Context = Ucx;

    fn adopt(&self) -> Result<Ucx, NewError> {
        let mut frame = Frame::boxed(None, None);
        // SAFETY: `frame.ucx` is a valid, boxed `ucontext_t`.
        let status = unsafe { libc::getcontext(ptr::addr_of_mut!(frame.ucx)) };
        if status != 0 {
            return Err(io::Error::last_os_error().into());
        }
        log::debug!("adopted thread context {:p}", ptr::addr_of!(*frame));
        Ok(Ucx { frame })
    }

    unsafe fn new_on(
        &self,
        stack_size: usize,
        entry: Entry,
        arg: *mut (),
    ) -> Result<Ucx, NewError> {
        let stack = Stack::new(stack_size)?;
        let (sp, size) = (stack.base(), stack.size());

        let mut frame = Frame::boxed(Some(stack), Some((entry, arg)));
        let frame_ptr: *mut Frame = ptr::addr_of_mut!(*frame);
        // SAFETY: `frame_ptr` points to the boxed frame above, which is not moved
        // again for the life of the context.
        unsafe {
            let ucx = ptr::addr_of_mut!((*frame_ptr).ucx);
            if libc::getcontext(ucx) != 0 {
                return Err(io::Error::last_os_error().into());
            }
            (*ucx).uc_stack.ss_sp = sp.as_ptr().cast();
            (*ucx).uc_stack.ss_size = size;
            (*ucx).uc_link = ptr::null_mut();

            libc::makecontext(
                ucx,
                mem::transmute::<extern "C" fn(*mut c_void), extern "C" fn()>(start),
                1,
                frame_ptr.cast::<c_void>(),
            );
        }

        Ok(Ucx { frame })
    }

    unsafe fn switch(&self, from: NonNull<Ucx>, to: NonNull<Ucx>) -> io::Result<()> {
        // SAFETY: `from` is the executing context and `to` was filled by either
        // `makecontext` or a previous `swapcontext`.
        let status = unsafe { libc::swapcontext(Ucx::ucx(from), Ucx::ucx(to)) };
        match status {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    unsafe fn release(&self, root: Ucx) {
        log::debug!("released thread context {:p}", ptr::addr_of!(*root.frame));
        drop(root)
    }
}
