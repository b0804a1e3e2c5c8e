//! The convergence engine: operation algebra, per-replica history, and the
//! replica-local document controller.

mod controller;
mod history;
mod operation;

pub use controller::{DocumentController, Subscription};
pub use history::{ApplyOutcome, DocumentState, History, HistoryError, MAX_HISTORY, MAX_UNDO};
pub use operation::{OpKind, Operation, OperationId, Origin, OtError, UserId};
