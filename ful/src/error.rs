use strand_context::NewError;

use crate::UnitId;

/// Recoverable failures reported to the caller of [`Scope::resume`] and
/// friends.
///
/// Transferring a unit to itself is a logic bug and panics instead, and a
/// failing platform context switch aborts the process.
///
/// [`Scope::resume`]: crate::Scope::resume
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unit {0} has already finished")]
    ResumeOfFinished(UnitId),
    #[error("unit {0} has not started yet and cannot receive a value")]
    InvalidPayloadToUnstarted(UnitId),
    #[error("no unit with id {0}")]
    UnknownIdentity(UnitId),
    #[error("the root unit cannot be resumed directly")]
    RootNotResumable,
    #[error("yield is only possible from inside a running unit")]
    YieldFromRoot,
    #[error("unit {0} is suspended mid-body")]
    Suspended(UnitId),
    #[error("unit {id} panicked: {message}")]
    Panicked { id: UnitId, message: String },
    #[error("expected a payload of type `{expected}`, found `{found}`")]
    PayloadType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("failed to create an execution unit")]
    Create(#[from] NewError),
}
