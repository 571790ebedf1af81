use std::mem;

use strand_stack::DEFAULT_STACK_SIZE;

use crate::{unit::Body, Error, Handle, Payload, Scope};

/// The builder for the initialization of some execution unit.
#[derive(Debug, Clone, Copy)]
pub struct Builder {
    stack_size: usize,
}

impl Builder {
    /// Initiate a builder for a unit with some defaults.
    pub const fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Set the size of the stack the unit will run on. Sizes below
    /// [`MIN_STACK_SIZE`](strand_stack::MIN_STACK_SIZE), including 0, are
    /// raised to it.
    pub const fn stack_size(self, stack_size: usize) -> Self {
        Builder { stack_size }
    }

    /// Create an execution unit in `scope`.
    ///
    /// Unlike [`Scope::resume`], the body will not be executed upon creation.
    pub fn spawn<F>(self, scope: &Scope, body: F) -> Result<Handle, Error>
    where
        F: FnOnce(&Scope) -> Option<Payload> + 'static,
    {
        // SAFETY: The body is `'static`.
        unsafe { self.spawn_unchecked(scope, body) }
    }

    /// Like [`Builder::spawn`], but leave the lifetime check on the body to
    /// the caller.
    ///
    /// # Safety
    ///
    /// The body must outlive the unit's execution: the unit must finish, or be
    /// removed before it starts, before anything the body borrows goes away.
    pub unsafe fn spawn_unchecked<'a, F>(self, scope: &Scope, body: F) -> Result<Handle, Error>
    where
        F: FnOnce(&Scope) -> Option<Payload> + 'a,
    {
        let body: Box<dyn FnOnce(&Scope) -> Option<Payload> + 'a> = Box::new(body);
        // SAFETY: Only the lifetime is erased; see above.
        let body = unsafe { mem::transmute::<_, Body>(body) };
        scope.insert(body, self.stack_size)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}
