#![forbid(unsafe_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod ot;
pub mod protocol;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};

// Re-export the engine types most embedders need at the crate root.
pub use crate::client::{ClientEvent, DocumentClient};
pub use crate::ot::{
    DocumentController, DocumentState, History, OpKind, Operation, OperationId, Origin, UserId,
};
pub use crate::protocol::{Message, MessageType};
pub use crate::server::{DocumentId, Engine, OperationManager, SessionId, SessionRegistry};
