use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    ptr::{self, NonNull},
    rc::{Rc, Weak},
};

use strand_context::{Context, NewError, Platform, Switch};

use crate::{transfer::trampoline, Payload, Scope};

/// The identity of an execution unit within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub(crate) u32);

impl UnitId {
    /// The id reserved for the root unit, i.e. the registry thread's own stack.
    pub const ROOT: UnitId = UnitId(1);

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_root(self) -> bool {
        self.0 == UnitId::ROOT.0
    }
}

impl From<u32> for UnitId {
    fn from(id: u32) -> Self {
        UnitId(id)
    }
}

impl From<UnitId> for u32 {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The lifecycle of an execution unit.
///
/// `Running` covers both "executing right now" and "suspended mid-body".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Finished,
}

pub(crate) type Body = Box<dyn FnOnce(&Scope) -> Option<Payload>>;

pub(crate) struct Unit {
    id: UnitId,
    state: Cell<State>,
    context: UnsafeCell<Option<Context>>,
    body: Cell<Option<Body>>,
    slot: Cell<Option<Payload>>,
    scope: Cell<*const Scope>,
}

impl Unit {
    pub(crate) fn root() -> Unit {
        Unit {
            id: UnitId::ROOT,
            state: Cell::new(State::Running),
            context: UnsafeCell::new(None),
            body: Cell::new(None),
            slot: Cell::new(None),
            scope: Cell::new(ptr::null()),
        }
    }

    /// Allocates the unit's stack and prepares a context that enters the
    /// trampoline on its first switch-in.
    pub(crate) fn new(
        id: UnitId,
        scope: &Scope,
        body: Body,
        stack_size: usize,
    ) -> Result<Rc<Unit>, NewError> {
        let unit = Rc::new(Unit {
            id,
            state: Cell::new(State::Created),
            context: UnsafeCell::new(None),
            body: Cell::new(Some(body)),
            slot: Cell::new(None),
            scope: Cell::new(ptr::from_ref(scope)),
        });

        // The `Rc` allocation never moves, so the trampoline can keep a raw
        // pointer to it for as long as the unit exists.
        let arg = Rc::as_ptr(&unit).cast_mut().cast::<()>();
        // SAFETY: See above.
        let context = unsafe { Platform::default().new_on(stack_size, trampoline, arg)? };
        unit.install_context(context);
        Ok(unit)
    }

    pub(crate) fn id(&self) -> UnitId {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state)
    }

    pub(crate) fn take_body(&self) -> Option<Body> {
        self.body.take()
    }

    /// Puts `payload` in this unit's slot for it to collect when it next runs.
    pub(crate) fn deposit(&self, payload: Payload) {
        if let Some(stale) = self.slot.replace(Some(payload)) {
            log::warn!(
                "unit {}: unread payload of type `{}` overwritten",
                self.id,
                stale.type_name()
            );
        }
    }

    pub(crate) fn collect(&self) -> Option<Payload> {
        self.slot.take()
    }

    pub(crate) fn context(&self) -> Option<NonNull<Context>> {
        // SAFETY: The context is only touched by the unit's own thread and no
        // reference to it outlives this call.
        unsafe { (*self.context.get()).as_mut().map(NonNull::from) }
    }

    pub(crate) fn install_context(&self, context: Context) {
        // SAFETY: Same as `Unit::context`.
        unsafe { *self.context.get() = Some(context) }
    }

    pub(crate) fn take_context(&self) -> Option<Context> {
        // SAFETY: Same as `Unit::context`.
        unsafe { (*self.context.get()).take() }
    }

    /// # Safety
    ///
    /// The owning registry must still be alive, which holds for every unit
    /// reachable from that registry.
    pub(crate) unsafe fn scope<'a>(&self) -> Option<&'a Scope> {
        // SAFETY: See above.
        unsafe { self.scope.get().as_ref() }
    }

    pub(crate) fn belongs_to(&self, scope: &Scope) -> bool {
        ptr::eq(self.scope.get(), scope)
    }

    /// Cuts the unit loose from its registry, which is going away.
    pub(crate) fn detach(&self) {
        self.scope.set(ptr::null())
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        if !self.id.is_root() {
            log::debug!("destroy unit {} ({:?})", self.id, self.state.get());
        }
    }
}

/// A non-owning reference to a unit created by some [`Scope`].
///
/// The registry keeps the unit alive; a handle only names it. Once the unit is
/// removed or its registry is dropped, resuming through the handle reports
/// [`Error::UnknownIdentity`](crate::Error::UnknownIdentity).
#[derive(Clone)]
pub struct Handle {
    id: UnitId,
    unit: Weak<Unit>,
}

impl Handle {
    pub(crate) fn new(unit: &Rc<Unit>) -> Self {
        Handle {
            id: unit.id(),
            unit: Rc::downgrade(unit),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The unit's current state, or `None` once the unit has been dropped.
    pub fn state(&self) -> Option<State> {
        self.unit.upgrade().map(|unit| unit.state())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state(), Some(State::Finished))
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<Unit>> {
        self.unit.upgrade()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
