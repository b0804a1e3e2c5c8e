//! Wire protocol: line-delimited JSON frames keyed by a numeric type code.

mod frame;
mod message;

pub use frame::{FrameError, FrameReader, FrameWriter};
pub use message::{
    AuthPayload, Body, DocPayload, EditPayload, Family, Header, Message, MessageType,
    PresencePayload, ProtocolError, SyncPayload, SystemPayload,
};
