//! The control-transfer protocol between two units.
//!
//! ```text
//!        root                           unit
//! ---------------------------------------------------------
//!   resume(u, None) ------------> trampoline: Created -> Running
//!          * ```````````````````` body(scope)
//!          * ```````````````````````` |
//!   None <- resume <------------- yield_(None)      -> R1
//!          | ```````````````````````` *
//!   resume(u, R1) --------------> yield_() returns R1
//!          * ```````````````````````` |
//!   Y <- resume <---------------- yield_(Y)         -> R2
//!          | ```````````````````````` *
//!   resume(u, R2) --------------> yield_() returns R2
//!          * ```````````````````` body returns C
//!          * ```````````````````` Running -> Finished
//!   C <- resume <---------------- final transfer, never resumed again
//! ```

use std::{
    panic::{self, AssertUnwindSafe},
    ptr,
};

use strand_context::{Platform, Switch};

use crate::{
    payload::Panic,
    unit::{State, Unit},
    Error, Payload, Scope,
};

impl Scope {
    /// Moves control and an optional payload from `from` to `to`.
    ///
    /// Returns when some later transfer comes back to `from`, carrying the
    /// payload deposited for `from` in the meantime.
    ///
    /// # Safety
    ///
    /// `from` must be the unit executing right now on this thread, and both
    /// units must stay alive until control comes back to `from`.
    pub(crate) unsafe fn transfer(
        &self,
        from: &Unit,
        to: &Unit,
        payload: Option<Payload>,
    ) -> Result<Option<Payload>, Error> {
        assert!(
            !ptr::eq(from, to),
            "unit {} attempted to transfer control to itself",
            from.id()
        );
        debug_assert!(self.is_current(from));

        match to.state() {
            State::Finished => return Err(Error::ResumeOfFinished(to.id())),
            State::Created if payload.is_some() => {
                return Err(Error::InvalidPayloadToUnstarted(to.id()));
            }
            _ => {}
        }

        let (Some(src), Some(dst)) = (from.context(), to.context()) else {
            fatal!(
                "transfer from unit {} to unit {} without a saved context",
                from.id(),
                to.id()
            )
        };

        log::trace!("transfer {} -> {}", from.id(), to.id());
        self.set_current(to);
        if let Some(payload) = payload {
            to.deposit(payload);
        }

        // SAFETY: `src` belongs to the executing unit and the caller keeps both
        // units alive.
        if let Err(err) = unsafe { Platform::default().switch(src, dst) } {
            fatal!(
                "failed to switch from unit {} to unit {}: {err}",
                from.id(),
                to.id()
            )
        }

        Ok(from.collect())
    }
}

/// The first code every unit runs, on its own stack.
///
/// # Safety
///
/// `arg` must point to the `Unit` whose context is being entered.
pub(crate) unsafe fn trampoline(arg: *mut ()) -> ! {
    // SAFETY: See above. The unit is owned by its registry's table and cannot
    // be removed while `Running`.
    let unit = unsafe { &*arg.cast::<Unit>() };
    // SAFETY: The registry is alive, since it just switched into this unit.
    let Some(scope) = (unsafe { unit.scope() }) else {
        fatal!("unit {} entered without a registry", unit.id())
    };
    if unit.id().is_root() || !scope.is_current(unit) {
        fatal!("unit {} entered out of turn", unit.id())
    }

    let outcome = run(scope, unit);
    unit.set_state(State::Finished);
    log::debug!("unit {} finished", unit.id());

    // SAFETY: The root unit is owned by the registry and outlives this transfer.
    let _ = unsafe { scope.transfer(unit, scope.root(), outcome) };
    fatal!("finished unit {} was resumed", unit.id())
}

/// Runs the body to completion. Everything it owns is dropped before the
/// final transfer leaves this stack for good.
fn run(scope: &Scope, unit: &Unit) -> Option<Payload> {
    unit.set_state(State::Running);
    let body = unit.take_body()?;
    log::debug!("unit {} started", unit.id());

    // Unwinding cannot cross the context boundary; stop it here.
    match panic::catch_unwind(AssertUnwindSafe(|| body(scope))) {
        Ok(ret) => ret,
        Err(cause) => Some(Payload::new(Panic::new(unit.id(), cause))),
    }
}

/// Converts the final handoff of a panicked body into its error.
pub(crate) fn check_panicked(received: Option<Payload>) -> Result<Option<Payload>, Error> {
    match received {
        Some(payload) if payload.is::<Panic>() => match payload.downcast::<Panic>() {
            Ok(panic) => Err(panic.into_error()),
            Err(payload) => Ok(Some(payload)),
        },
        other => Ok(other),
    }
}
