//! Server core: the per-document sequencer, the session registry, the frame
//! dispatcher, and the TCP runtime that ties them together.

mod handlers;
mod registry;
mod run;
mod sequencer;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use handlers::{Engine, Outbound, Recipient};
pub use registry::{RegistryError, SessionId, SessionRegistry, SessionState, StackEntry};
pub use run::{Server, ServerError, ServerHandle, run};
pub use sequencer::{CanonicalOp, OperationManager, OperationTail, SequencerError};

/// Names one shared document on the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
