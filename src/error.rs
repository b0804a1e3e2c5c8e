use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::ot::{HistoryError, OtError};
use crate::protocol::{FrameError, ProtocolError};
use crate::server::{RegistryError, SequencerError, ServerError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Ot(#[from] OtError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, Error>;
