use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    mem::{self, ManuallyDrop},
    ops::Deref,
    ptr::{self, NonNull},
    rc::Rc,
};

use strand_context::{Platform, Switch};
use strand_stack::DEFAULT_STACK_SIZE;

use crate::{
    transfer::check_panicked,
    unit::{Body, Handle, State, Unit, UnitId},
    Builder, Error, Payload,
};

/// Something [`Scope::resume`] can look a unit up by.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Id(UnitId),
    Handle(&'a Handle),
}

impl From<UnitId> for Target<'_> {
    fn from(id: UnitId) -> Self {
        Target::Id(id)
    }
}

impl<'a> From<&'a Handle> for Target<'a> {
    fn from(handle: &'a Handle) -> Self {
        Target::Handle(handle)
    }
}

/// The per-thread state shared by a registry and the bodies of its units.
///
/// A scope is reached through its owning [`Registry`] (which derefs to it) or
/// through the `&Scope` argument every unit body receives. It holds the root
/// unit standing for the thread's own stack, the pointer to whichever unit is
/// executing, and the table of created units.
///
/// A scope never leaves the thread that created its registry.
pub struct Scope {
    root: Unit,
    current: Cell<Option<NonNull<Unit>>>,
    table: RefCell<BTreeMap<UnitId, Rc<Unit>>>,
    last_id: Cell<u32>,
    stack_size: usize,
}

impl Scope {
    fn new(stack_size: usize) -> Self {
        Scope {
            root: Unit::root(),
            current: Cell::new(None),
            table: RefCell::new(BTreeMap::new()),
            last_id: Cell::new(UnitId::ROOT.get()),
            stack_size,
        }
    }

    /// A builder carrying this scope's default stack size.
    pub fn builder(&self) -> Builder {
        Builder::new().stack_size(self.stack_size)
    }

    /// The stack size units get unless their builder says otherwise.
    pub fn default_stack_size(&self) -> usize {
        self.stack_size
    }

    /// Creates a unit from `body` without starting it.
    pub fn create<F>(&self, body: F) -> Result<Handle, Error>
    where
        F: FnOnce(&Scope) -> Option<Payload> + 'static,
    {
        self.builder().spawn(self, body)
    }

    pub(crate) fn insert(&self, body: Body, stack_size: usize) -> Result<Handle, Error> {
        let id = self.next_id();
        let unit = Unit::new(id, self, body, stack_size)?;
        log::debug!("created unit {id} with a {stack_size} byte stack request");

        let handle = Handle::new(&unit);
        self.table.borrow_mut().insert(id, unit);
        Ok(handle)
    }

    /// Hands control and `payload` to a unit, returning what it hands back
    /// when it next yields or finishes.
    ///
    /// A unit that has not started yet must be resumed with `None`; it reads
    /// its first input through its first [`Scope::yield_`].
    pub fn resume<'a>(
        &self,
        target: impl Into<Target<'a>>,
        payload: Option<Payload>,
    ) -> Result<Option<Payload>, Error> {
        let unit = self.lookup(target.into())?;
        let from = self.enter()?;
        // SAFETY: `from` is the executing unit, and `unit` is kept alive by the
        // reference counted above.
        let received = unsafe { self.transfer(from, &unit, payload) }?;
        check_panicked(received)
    }

    /// Suspends the executing unit and hands `payload` to the root, returning
    /// whatever the unit is resumed with next.
    pub fn yield_(&self, payload: Option<Payload>) -> Result<Option<Payload>, Error> {
        let from = match self.current.get() {
            // SAFETY: The executing unit is alive; a `Running` unit cannot be
            // removed from the table.
            Some(current) if !ptr::eq(current.as_ptr(), &self.root) => unsafe { current.as_ref() },
            _ => return Err(Error::YieldFromRoot),
        };
        // SAFETY: See above. The root is owned by `self`.
        unsafe { self.transfer(from, &self.root, payload) }
    }

    /// The id of the unit whose code is executing right now.
    pub fn current_id(&self) -> UnitId {
        match self.current.get() {
            // SAFETY: Same as in `Scope::yield_`.
            Some(current) => unsafe { current.as_ref() }.id(),
            None => UnitId::ROOT,
        }
    }

    pub fn state(&self, id: UnitId) -> Option<State> {
        if id.is_root() {
            return Some(self.root.state());
        }
        self.table.borrow().get(&id).map(|unit| unit.state())
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.table.borrow().contains_key(&id)
    }

    /// The number of units in the table, not counting the root.
    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// The ids of all units in the table, in ascending order.
    pub fn ids(&self) -> Vec<UnitId> {
        self.table.borrow().keys().copied().collect()
    }

    /// Drops a unit that is either not started or finished, freeing its stack.
    ///
    /// A unit suspended mid-body still has live frames on its stack and is
    /// refused with [`Error::Suspended`].
    pub fn remove(&self, id: UnitId) -> Result<(), Error> {
        let mut table = self.table.borrow_mut();
        match table.get(&id).map(|unit| unit.state()) {
            None => Err(Error::UnknownIdentity(id)),
            Some(State::Running) => Err(Error::Suspended(id)),
            Some(_) => {
                let unit = table.remove(&id);
                // The body of an unstarted unit may run arbitrary drop code.
                drop(table);
                drop(unit);
                Ok(())
            }
        }
    }

    pub(crate) fn root(&self) -> &Unit {
        &self.root
    }

    pub(crate) fn is_current(&self, unit: &Unit) -> bool {
        self.current
            .get()
            .is_some_and(|current| ptr::eq(current.as_ptr(), unit))
    }

    pub(crate) fn set_current(&self, unit: &Unit) {
        self.current.set(Some(NonNull::from(unit)))
    }

    fn lookup(&self, target: Target<'_>) -> Result<Rc<Unit>, Error> {
        match target {
            Target::Id(id) if id.is_root() => Err(Error::RootNotResumable),
            Target::Id(id) => self
                .table
                .borrow()
                .get(&id)
                .cloned()
                .ok_or(Error::UnknownIdentity(id)),
            Target::Handle(handle) => handle
                .upgrade()
                .filter(|unit| unit.belongs_to(self))
                .ok_or(Error::UnknownIdentity(handle.id())),
        }
    }

    /// Returns the executing unit, adopting the calling thread as the root on
    /// first use.
    fn enter(&self) -> Result<&Unit, Error> {
        if let Some(current) = self.current.get() {
            // SAFETY: Same as in `Scope::yield_`.
            return Ok(unsafe { current.as_ref() });
        }

        let context = Platform::default().adopt()?;
        self.root.install_context(context);
        self.set_current(&self.root);
        log::debug!("adopted the calling thread as unit {}", UnitId::ROOT);
        Ok(&self.root)
    }

    /// Picks the next id, skipping 0, the root's id and ids still in use once
    /// the counter has wrapped around.
    fn next_id(&self) -> UnitId {
        let table = self.table.borrow();
        loop {
            let id = self.last_id.get().wrapping_add(1);
            self.last_id.set(id);

            let id = UnitId(id);
            if id.get() != 0 && !id.is_root() && !table.contains_key(&id) {
                return id;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_id(&self, id: u32) {
        self.last_id.set(id)
    }

    fn at_root(&self) -> bool {
        match self.current.get() {
            Some(current) => ptr::eq(current.as_ptr(), &self.root),
            None => true,
        }
    }
}

/// The owner of a thread's [`Scope`].
///
/// Create one registry per thread that runs units. Dropping it drops every
/// unit that is not started or already finished. Units suspended mid-body
/// cannot be torn down safely: their stacks, and everything their frames own,
/// are leaked.
///
/// A unit that has not started takes no payload: prime it with
/// `resume(unit, None)` and it receives its first input as the return value
/// of its first [`Scope::yield_`].
pub struct Registry {
    scope: ManuallyDrop<Box<Scope>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::with_stack_size(DEFAULT_STACK_SIZE)
    }

    /// A registry whose units get `stack_size` byte stacks by default. The
    /// stack floor still applies.
    pub fn with_stack_size(stack_size: usize) -> Self {
        Registry {
            scope: ManuallyDrop::new(Box::new(Scope::new(stack_size))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Deref for Registry {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let scope: &Scope = &self.scope;
        if !scope.at_root() {
            log::error!(
                "registry dropped while unit {} is executing; leaking it",
                scope.current_id()
            );
            return;
        }

        let units = mem::take(&mut *scope.table.borrow_mut());
        for (id, unit) in units {
            unit.detach();
            if unit.state() == State::Running {
                log::warn!("leaking unit {id}, which is suspended mid-body");
                mem::forget(unit);
            }
        }

        if let Some(root) = scope.root.take_context() {
            // SAFETY: The root was adopted on this thread and is executing.
            unsafe { Platform::default().release(root) };
        }
        // SAFETY: `scope` is not used after this point.
        unsafe { ManuallyDrop::drop(&mut self.scope) }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    fn ints(payload: Option<Payload>) -> i32 {
        payload.unwrap().take::<i32>().unwrap()
    }

    #[test]
    fn round_trip() {
        let registry = Registry::new();
        let unit = registry
            .create(|scope| {
                let input: i32 = scope.yield_(None).unwrap().unwrap().take().unwrap();
                let reply = scope.yield_(Some(Payload::new("ack"))).unwrap();
                assert_eq!(reply.unwrap().take::<&str>().unwrap(), "ready");
                Some(Payload::new(input * 2))
            })
            .unwrap();
        assert_eq!(unit.state(), Some(State::Created));

        assert!(registry.resume(&unit, None).unwrap().is_none());
        assert_eq!(unit.state(), Some(State::Running));

        let ack = registry.resume(&unit, Some(Payload::new(42))).unwrap();
        assert_eq!(ack.unwrap().take::<&str>().unwrap(), "ack");

        let doubled = registry.resume(&unit, Some(Payload::new("ready"))).unwrap();
        assert_eq!(ints(doubled), 84);
        assert!(unit.is_finished());

        let again = registry.resume(&unit, Some(Payload::new(0)));
        assert!(matches!(again, Err(Error::ResumeOfFinished(id)) if id == unit.id()));
    }

    #[test]
    fn unstarted_rejects_payload() {
        let registry = Registry::new();
        let unit = registry.create(|_| Some(Payload::new(1))).unwrap();

        let err = registry.resume(&unit, Some(Payload::new(5))).unwrap_err();
        assert!(matches!(err, Error::InvalidPayloadToUnstarted(id) if id == unit.id()));
        assert_eq!(unit.state(), Some(State::Created));

        assert_eq!(ints(registry.resume(&unit, None).unwrap()), 1);
    }

    #[test]
    fn finished_fails_every_time() {
        let registry = Registry::new();
        let unit = registry.create(|_| None).unwrap();
        assert!(registry.resume(unit.id(), None).unwrap().is_none());
        for _ in 0..3 {
            assert!(matches!(
                registry.resume(unit.id(), None),
                Err(Error::ResumeOfFinished(_))
            ));
            assert!(matches!(
                registry.resume(&unit, Some(Payload::new(()))),
                Err(Error::ResumeOfFinished(_))
            ));
        }
    }

    #[test]
    fn exactly_once() {
        let registry = Registry::new();
        let unit = registry
            .create(|scope| {
                let first = scope.yield_(Some(Payload::new(String::from("once")))).unwrap();
                assert!(first.is_none());
                let second = scope.yield_(None).unwrap();
                assert!(second.is_none());
                None
            })
            .unwrap();

        let value = registry.resume(&unit, None).unwrap();
        assert_eq!(value.unwrap().take::<String>().unwrap(), "once");
        assert!(registry.resume(&unit, None).unwrap().is_none());
        assert!(registry.resume(&unit, None).unwrap().is_none());
        assert!(unit.is_finished());
    }

    #[test]
    fn generator() {
        let registry = Registry::new();
        let unit = registry
            .create(|scope| {
                let mut total = 0;
                for i in 0..100 {
                    let r = scope.yield_(Some(Payload::new(i))).unwrap();
                    total += ints(r);
                }
                Some(Payload::new(total))
            })
            .unwrap();

        assert_eq!(ints(registry.resume(&unit, None).unwrap()), 0);
        for i in 1..100 {
            assert_eq!(ints(registry.resume(&unit, Some(Payload::new(1))).unwrap()), i);
        }
        assert_eq!(ints(registry.resume(&unit, Some(Payload::new(1))).unwrap()), 100);
    }

    #[test]
    fn current_id() {
        let registry = Registry::new();
        assert_eq!(registry.current_id(), UnitId::ROOT);

        let unit = registry
            .create(|scope| {
                let me = scope.current_id();
                scope.yield_(Some(Payload::new(me))).unwrap();
                Some(Payload::new(scope.current_id()))
            })
            .unwrap();

        let seen = registry.resume(&unit, None).unwrap().unwrap();
        assert_eq!(seen.take::<UnitId>().unwrap(), unit.id());
        assert_eq!(registry.current_id(), UnitId::ROOT);

        let seen = registry.resume(&unit, None).unwrap().unwrap();
        assert_eq!(seen.take::<UnitId>().unwrap(), unit.id());
        assert_eq!(registry.current_id(), UnitId::ROOT);
    }

    #[test]
    fn distinct_increasing_ids() {
        let registry = Registry::new();
        let a = registry.create(|_| None).unwrap();
        let b = registry.create(|_| None).unwrap();
        assert_eq!(a.id(), UnitId::from(2));
        assert!(b.id() > a.id());
        assert_eq!(registry.ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn ids_wrap_around() {
        let registry = Registry::new();
        let live = registry.create(|_| None).unwrap();
        assert_eq!(live.id(), UnitId::from(2));

        registry.set_last_id(u32::MAX - 1);
        let last = registry.create(|_| None).unwrap();
        assert_eq!(last.id(), UnitId::from(u32::MAX));

        // 0 is never used, 1 is the root and 2 is still in the table.
        let wrapped = registry.create(|_| None).unwrap();
        assert_eq!(wrapped.id(), UnitId::from(3));
        assert_ne!(wrapped.id(), UnitId::ROOT);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn bad_targets() {
        let registry = Registry::new();
        assert!(matches!(
            registry.resume(UnitId::from(99), None),
            Err(Error::UnknownIdentity(id)) if id == UnitId::from(99)
        ));
        assert!(matches!(
            registry.resume(UnitId::ROOT, None),
            Err(Error::RootNotResumable)
        ));
        assert!(matches!(registry.yield_(None), Err(Error::YieldFromRoot)));

        let other = Registry::new();
        let foreign = other.create(|_| None).unwrap();
        assert!(matches!(
            registry.resume(&foreign, None),
            Err(Error::UnknownIdentity(_))
        ));
    }

    #[test]
    fn removal() {
        let registry = Registry::new();
        let dropped = Rc::new(());
        let keep = dropped.clone();

        let a = registry.create(|_| Some(Payload::new('a'))).unwrap();
        let b = registry
            .create(move |_| {
                let _keep = keep;
                None
            })
            .unwrap();
        let c = registry
            .create(|scope| {
                scope.yield_(None).unwrap();
                Some(Payload::new('c'))
            })
            .unwrap();

        // Never started: dropping it releases its body.
        registry.remove(b.id()).unwrap();
        assert_eq!(Rc::strong_count(&dropped), 1);
        assert_eq!(b.state(), None);
        assert!(matches!(
            registry.resume(&b, None),
            Err(Error::UnknownIdentity(_))
        ));

        assert!(registry.resume(&c, None).unwrap().is_none());
        assert!(matches!(registry.remove(c.id()), Err(Error::Suspended(_))));

        let got = registry.resume(&a, None).unwrap().unwrap();
        assert_eq!(got.take::<char>().unwrap(), 'a');
        let got = registry.resume(&c, None).unwrap().unwrap();
        assert_eq!(got.take::<char>().unwrap(), 'c');

        registry.remove(a.id()).unwrap();
        registry.remove(c.id()).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove(a.id()),
            Err(Error::UnknownIdentity(_))
        ));
    }

    #[test]
    fn panicking_body() {
        let registry = Registry::new();
        let unit = registry
            .builder()
            .stack_size(1 << 20)
            .spawn(&registry, |scope| {
                scope.yield_(None).unwrap();
                panic!("body failed");
            })
            .unwrap();

        assert!(registry.resume(&unit, None).unwrap().is_none());
        match registry.resume(&unit, None) {
            Err(Error::Panicked { id, message }) => {
                assert_eq!(id, unit.id());
                assert_eq!(message, "body failed");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(unit.is_finished());
        assert_eq!(registry.current_id(), UnitId::ROOT);
        assert!(matches!(
            registry.resume(&unit, None),
            Err(Error::ResumeOfFinished(_))
        ));
    }

    #[test]
    fn stack_allocation_failure() {
        let registry = Registry::new();
        let failed = registry
            .builder()
            .stack_size(usize::MAX)
            .spawn(&registry, |_| None);
        assert!(matches!(failed, Err(Error::Create(_))));
        assert_eq!(registry.len(), 0);

        let unit = registry.create(|_| Some(Payload::new(7))).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(ints(registry.resume(&unit, None).unwrap()), 7);
        assert!(unit.is_finished());
    }

    #[test]
    fn self_transfer_is_a_bug() {
        let registry = Registry::new();
        let unit = registry
            .builder()
            .stack_size(1 << 20)
            .spawn(&registry, |scope| {
                let me = scope.current_id();
                let _ = scope.resume(me, None);
                None
            })
            .unwrap();

        let err = registry.resume(&unit, None).unwrap_err();
        assert!(matches!(err, Error::Panicked { id, .. } if id == unit.id()));
    }

    #[test]
    fn nested_units_yield_to_root() {
        let registry = Registry::new();
        let outer = registry
            .create(|scope| {
                let inner = scope
                    .create(|scope| {
                        assert_ne!(scope.current_id(), UnitId::ROOT);
                        Some(Payload::new("from inner"))
                    })
                    .unwrap();
                // The inner unit finishes into the root, not into us; we only
                // continue once the root resumes us again.
                let back = scope.resume(&inner, None).unwrap();
                assert!(inner.is_finished());
                Some(Payload::new(back.unwrap().take::<&str>().unwrap().len()))
            })
            .unwrap();

        let got = registry.resume(&outer, None).unwrap().unwrap();
        assert_eq!(got.take::<&str>().unwrap(), "from inner");
        assert_eq!(outer.state(), Some(State::Running));
        assert_eq!(registry.len(), 2);

        let got = registry.resume(&outer, Some(Payload::new("to outer"))).unwrap();
        assert_eq!(got.unwrap().take::<usize>().unwrap(), "to outer".len());
        assert!(outer.is_finished());
    }

    #[test]
    fn borrowed_body() {
        let counter = Cell::new(0);
        let registry = Registry::new();
        // SAFETY: The unit finishes before `counter` goes out of scope.
        let unit = unsafe {
            registry.builder().spawn_unchecked(&registry, |scope| {
                for _ in 0..10 {
                    counter.set(counter.get() + 1);
                    scope.yield_(None).unwrap();
                }
                None
            })
        }
        .unwrap();

        while !unit.is_finished() {
            registry.resume(&unit, None).unwrap();
        }
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn teardown() {
        let created = Rc::new(());
        let suspended = Rc::new(());
        let finished = Rc::new(());

        let registry = Registry::new();
        let keep = created.clone();
        let never = registry
            .create(move |_| {
                let _keep = keep;
                None
            })
            .unwrap();

        let keep = suspended.clone();
        let parked = registry
            .create(move |scope| {
                let _keep = keep;
                scope.yield_(None).unwrap();
                None
            })
            .unwrap();

        let keep = finished.clone();
        let done = registry
            .create(move |_| {
                let _keep = keep;
                None
            })
            .unwrap();

        registry.resume(&parked, None).unwrap();
        registry.resume(&done, None).unwrap();
        drop(registry);

        assert_eq!(never.state(), None);
        assert_eq!(done.state(), None);
        assert_eq!(Rc::strong_count(&created), 1);
        assert_eq!(Rc::strong_count(&finished), 1);

        // The suspended unit's frames were never unwound.
        assert_eq!(parked.state(), Some(State::Running));
        assert_eq!(Rc::strong_count(&suspended), 2);
    }

    #[test]
    fn many_units_interleaved() {
        let registry = Registry::with_stack_size(0);
        assert_eq!(registry.default_stack_size(), 0);

        let units: Vec<_> = (0..16)
            .map(|n| {
                registry
                    .create(move |scope| {
                        let mut acc = n;
                        for _ in 0..4 {
                            acc += ints(scope.yield_(Some(Payload::new(acc))).unwrap());
                        }
                        Some(Payload::new(acc))
                    })
                    .unwrap()
            })
            .collect();

        for (n, unit) in units.iter().enumerate() {
            assert_eq!(ints(registry.resume(unit, None).unwrap()), n as i32);
        }
        for round in 1..=4 {
            for (n, unit) in units.iter().enumerate() {
                let got = ints(registry.resume(unit, Some(Payload::new(1))).unwrap());
                assert_eq!(got, n as i32 + round);
            }
        }
        assert!(units.iter().all(Handle::is_finished));
    }
}
