use std::{
    any::{type_name, Any},
    fmt,
};

use crate::{Error, UnitId};

/// A type-erased value in transit between two units.
///
/// A payload is moved into the receiving side's slot on every handoff and
/// taken out exactly once, so it is never shared between the two sides.
pub struct Payload {
    value: Box<dyn Any>,
    type_name: &'static str,
}

impl Payload {
    pub fn new<T: Any>(value: T) -> Self {
        Payload {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// The name of the type this payload was created from.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Unboxes the value, handing the payload back if it holds another type.
    pub fn downcast<T: Any>(self) -> Result<T, Payload> {
        let Payload { value, type_name } = self;
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Payload { value, type_name }),
        }
    }

    /// Like [`Payload::downcast`], but reports a mismatch as an [`Error`].
    pub fn take<T: Any>(self) -> Result<T, Error> {
        self.downcast().map_err(|payload| Error::PayloadType {
            expected: type_name::<T>(),
            found: payload.type_name,
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.type_name).finish()
    }
}

/// The outcome a body that panicked hands over in its final transfer.
pub(crate) struct Panic {
    id: UnitId,
    message: String,
}

impl Panic {
    pub(crate) fn new(id: UnitId, cause: Box<dyn Any + Send>) -> Self {
        let message = match cause.downcast::<String>() {
            Ok(message) => *message,
            Err(cause) => match cause.downcast_ref::<&'static str>() {
                Some(message) => message.to_string(),
                None => "Box<dyn Any>".to_string(),
            },
        };
        Panic { id, message }
    }

    pub(crate) fn into_error(self) -> Error {
        Error::Panicked {
            id: self.id,
            message: self.message,
        }
    }
}
