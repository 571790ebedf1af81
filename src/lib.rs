//! **STRAND**s: stackful, symmetric execution units for one thread.

pub use strand_context as context;
pub use strand_ful::{Builder, Error, Handle, Payload, Registry, Scope, State, Target, UnitId};
pub use strand_stack as stack;
