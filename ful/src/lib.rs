#![deny(future_incompatible)]
#![deny(rust_2018_idioms)]
//! Stackful, symmetric execution units.
//!
//! A [`Registry`] owns the units of one thread. Each unit runs a body on its
//! own stack, and control moves between the thread's original stack (the
//! root) and the units through [`Scope::resume`] and [`Scope::yield_`], each
//! handoff carrying an optional [`Payload`] in the style of a two-way
//! generator.
//!
//! ```no_run
//! use strand_ful::{Payload, Registry};
//!
//! let registry = Registry::new();
//! let unit = registry
//!     .create(|scope| {
//!         let input: i32 = scope.yield_(None).ok()??.take().ok()?;
//!         Some(Payload::new(input * 2))
//!     })
//!     .unwrap();
//!
//! registry.resume(&unit, None).unwrap();
//! let doubled = registry.resume(&unit, Some(Payload::new(21))).unwrap();
//! assert_eq!(doubled.unwrap().take::<i32>().unwrap(), 42);
//! ```

/// Logs and aborts. For failures that leave the machine state untrustworthy.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("{message}");
        eprintln!("fatal: {message}");
        std::process::abort()
    }};
}

mod builder;
mod error;
mod payload;
mod registry;
mod transfer;
mod unit;

pub use self::{
    builder::Builder,
    error::Error,
    payload::Payload,
    registry::{Registry, Scope, Target},
    unit::{Handle, State, UnitId},
};
