//! Client-side network glue: drives a [`DocumentController`] over a TCP
//! connection to the server.
//!
//! Keeps one operation in flight at a time; later local edits queue and
//! are sent, in their current transformed forms, as acknowledgements come
//! back. Incoming canonical operations rebase against the unacknowledged
//! window; anything unrecoverable falls back to a full resync.

use std::collections::VecDeque;
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::ot::{
    DocumentController, DocumentState, HistoryError, OpKind, Operation, OperationId, Origin,
    UserId,
};
use crate::protocol::{
    AuthPayload, Body, DocPayload, EditPayload, FrameError, FrameReader, FrameWriter, Header,
    Message, MessageType, ProtocolError, SyncPayload,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("no document open")]
    NoDocument,
}

/// What the server told us, surfaced to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The document changed, locally visible content and version.
    ContentChanged { content: String, version: u64 },
    /// One of our own operations was sequenced.
    Acknowledged { revision: u64 },
    UserJoined(String),
    UserLeft(String),
    CursorMoved { username: String, position: usize },
    EditRejected { message: String },
    /// The server shipped a fresh snapshot; local history was discarded.
    Resynced { version: u64 },
    Disconnected,
}

struct OpenDocument {
    id: String,
    ctl: DocumentController,
    /// Unacknowledged operation ids, oldest first; the front has been sent.
    pending: VecDeque<OperationId>,
    acked_revision: u64,
}

pub struct DocumentClient {
    writer: FrameWriter<TcpStream>,
    reader: FrameReader<BufReader<TcpStream>>,
    user: UserId,
    session_id: String,
    seq: u64,
    doc: Option<OpenDocument>,
    events: VecDeque<ClientEvent>,
}

impl DocumentClient {
    /// Connect and log in. Fails if the username is taken.
    pub fn connect(addr: impl ToSocketAddrs, username: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let mut client = Self {
            writer: FrameWriter::new(stream.try_clone()?, 1 << 20),
            reader: FrameReader::new(BufReader::new(stream), 1 << 20),
            user: UserId::new(username),
            session_id: String::new(),
            seq: 0,
            doc: None,
            events: VecDeque::new(),
        };

        client.send(
            MessageType::AuthLogin,
            Body::Auth(AuthPayload {
                username: username.to_string(),
                error_message: None,
            }),
        )?;
        let reply = client.await_any(&[MessageType::AuthSuccess, MessageType::AuthFailure])?;
        if reply.kind == MessageType::AuthFailure {
            let reason = reply
                .auth()
                .and_then(|p| p.error_message.clone())
                .unwrap_or_else(|| "authentication refused".to_string());
            return Err(ClientError::LoginFailed(reason));
        }
        client.session_id = reply.header.session_id.clone();
        Ok(client)
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Create a document on the server.
    pub fn create_document(
        &mut self,
        id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        self.send(
            MessageType::DocCreate,
            Body::Document(DocPayload {
                document_id: id.to_string(),
                document_name: Some(name.to_string()),
                document_content: Some(content.to_string()),
                ..Default::default()
            }),
        )?;
        let reply = self.await_any(&[MessageType::DocResponse])?;
        Self::check_doc_reply(&reply)
    }

    /// Open a document and start editing at the server's current state.
    pub fn open(&mut self, id: &str) -> Result<(String, u64), ClientError> {
        self.send(
            MessageType::DocOpen,
            Body::Document(DocPayload {
                document_id: id.to_string(),
                ..Default::default()
            }),
        )?;
        let reply = self.await_any(&[MessageType::DocResponse])?;
        Self::check_doc_reply(&reply)?;
        let payload = reply.document().expect("document body");
        let content = payload.document_content.clone().unwrap_or_default();
        let version = payload.document_version.unwrap_or_default();

        self.doc = Some(OpenDocument {
            id: id.to_string(),
            ctl: DocumentController::new(self.user.clone(), content.clone()),
            pending: VecDeque::new(),
            acked_revision: version,
        });
        Ok((content, version))
    }

    pub fn insert(&mut self, position: usize, text: &str) -> Result<String, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        let op = doc.ctl.insert(position, text)?;
        self.enqueue(op.id)
    }

    pub fn delete(&mut self, position: usize, length: usize) -> Result<String, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        let op = doc.ctl.delete(position, length)?;
        self.enqueue(op.id)
    }

    /// Replace a range atomically (a composite of delete + insert).
    pub fn replace(
        &mut self,
        position: usize,
        length: usize,
        text: &str,
    ) -> Result<String, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        let op = doc.ctl.replace(position, length, text)?;
        self.enqueue(op.id)
    }

    /// Undo our youngest operation; the transformed inverse is shipped to
    /// the server like any other edit. `Ok(false)` when there is nothing
    /// to undo.
    pub fn undo(&mut self) -> Result<bool, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        let Some(op) = doc.ctl.undo() else {
            return Ok(false);
        };
        self.enqueue(op.id)?;
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        let Some(op) = doc.ctl.redo() else {
            return Ok(false);
        };
        self.enqueue(op.id)?;
        Ok(true)
    }

    pub fn content(&self) -> Result<String, ClientError> {
        Ok(self.doc.as_ref().ok_or(ClientError::NoDocument)?.ctl.content())
    }

    pub fn can_undo(&self) -> bool {
        self.doc.as_ref().is_some_and(|d| d.ctl.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.doc.as_ref().is_some_and(|d| d.ctl.can_redo())
    }

    /// Block for the next server event.
    pub fn next_event(&mut self) -> Result<ClientEvent, ClientError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            let message = self.read_message()?;
            self.process(message)?;
        }
    }

    /// Pump events until the document reaches `version` on this replica.
    pub fn sync_to(&mut self, version: u64) -> Result<(), ClientError> {
        loop {
            let doc = self.doc.as_ref().ok_or(ClientError::NoDocument)?;
            if doc.acked_revision >= version && doc.pending.is_empty() {
                return Ok(());
            }
            let message = self.read_message()?;
            self.process(message)?;
        }
    }

    fn enqueue(&mut self, id: OperationId) -> Result<String, ClientError> {
        let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
        doc.pending.push_back(id);
        let content = doc.ctl.content();
        if doc.pending.len() == 1 {
            self.send_front()?;
        }
        Ok(content)
    }

    /// Ship the oldest unacknowledged operation in its current form.
    fn send_front(&mut self) -> Result<(), ClientError> {
        let doc = self.doc.as_ref().ok_or(ClientError::NoDocument)?;
        let window = doc.ctl.unacknowledged(doc.pending.len());
        let Some(front) = window.first() else {
            return Ok(());
        };
        let kind = match &front.kind {
            OpKind::Insert { .. } => MessageType::EditInsert,
            OpKind::Delete { .. } => MessageType::EditDelete,
            OpKind::Composite { .. } => MessageType::EditReplace,
        };
        let payload = EditPayload {
            document_id: doc.id.clone(),
            document_version: doc.acked_revision,
            operation_id: front.id.to_string(),
            operation: Some(front.kind.clone()),
            ..Default::default()
        };
        self.send(kind, Body::Edit(payload))
    }

    fn process(&mut self, message: Message) -> Result<(), ClientError> {
        match (message.kind, &message.body) {
            (MessageType::EditApply, Body::Edit(payload)) => self.on_edit_apply(payload.clone()),
            (MessageType::EditReject, Body::Edit(payload)) => {
                let reason = payload
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "edit rejected".to_string());
                tracing::warn!(op = %payload.operation_id, "edit rejected: {reason}");
                self.events.push_back(ClientEvent::EditRejected { message: reason });
                self.request_resync()
            }
            (MessageType::SyncState, Body::Sync(payload)) => {
                let content = payload.document_state.clone().unwrap_or_default();
                let version = payload.to_version.unwrap_or_default();
                let doc = self.doc.as_mut().ok_or(ClientError::NoDocument)?;
                doc.ctl.restore(DocumentState::new(content.clone(), version));
                doc.pending.clear();
                doc.acked_revision = version;
                self.events.push_back(ClientEvent::Resynced { version });
                self.events.push_back(ClientEvent::ContentChanged { content, version });
                Ok(())
            }
            (MessageType::PresenceJoin, Body::Presence(payload)) => {
                self.events
                    .push_back(ClientEvent::UserJoined(payload.username.clone()));
                Ok(())
            }
            (MessageType::PresenceLeave, Body::Presence(payload)) => {
                self.events
                    .push_back(ClientEvent::UserLeft(payload.username.clone()));
                Ok(())
            }
            (MessageType::PresenceCursor, Body::Presence(payload)) => {
                if let Some(position) = payload.cursor_position {
                    self.events.push_back(ClientEvent::CursorMoved {
                        username: payload.username.clone(),
                        position,
                    });
                }
                Ok(())
            }
            (MessageType::SysDisconnect, _) => {
                self.events.push_back(ClientEvent::Disconnected);
                Ok(())
            }
            (kind, _) => {
                tracing::debug!(kind = kind.code(), "ignoring frame");
                Ok(())
            }
        }
    }

    fn on_edit_apply(&mut self, payload: EditPayload) -> Result<(), ClientError> {
        let Some(doc) = self.doc.as_mut() else {
            return Ok(());
        };
        if payload.document_id != doc.id {
            return Ok(());
        }
        let revision = payload.document_version;
        doc.acked_revision = revision;

        let id: OperationId = match payload.operation_id.parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!("broadcast with unparsable operation id, resyncing");
                return self.request_resync();
            }
        };

        if doc.pending.front() == Some(&id) {
            doc.pending.pop_front();
            self.events.push_back(ClientEvent::Acknowledged { revision });
            if !self.doc.as_ref().is_some_and(|d| d.pending.is_empty()) {
                self.send_front()?;
            }
            return Ok(());
        }

        let Some(kind) = payload.operation else {
            tracing::warn!("broadcast without an operation record, resyncing");
            return self.request_resync();
        };
        let op = Operation::new(kind, id, Origin::Remote);
        let source_version = doc.ctl.version() - doc.pending.len() as u64;
        match doc.ctl.apply_remote(op, source_version) {
            Ok(()) => {
                self.events.push_back(ClientEvent::ContentChanged {
                    content: doc.ctl.content(),
                    version: doc.ctl.version(),
                });
                Ok(())
            }
            Err(err) if err.requires_resync() => {
                tracing::warn!("replica diverged ({err}), requesting full state");
                self.request_resync()
            }
            Err(err) => Err(err.into()),
        }
    }

    fn request_resync(&mut self) -> Result<(), ClientError> {
        let doc = self.doc.as_ref().ok_or(ClientError::NoDocument)?;
        let payload = SyncPayload {
            document_id: doc.id.clone(),
            ..Default::default()
        };
        self.send(MessageType::SyncRequest, Body::Sync(payload))
    }

    fn check_doc_reply(reply: &Message) -> Result<(), ClientError> {
        let payload = reply.document().expect("document body");
        if payload.success == Some(false) {
            return Err(ClientError::RequestFailed(
                payload
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "request refused".to_string()),
            ));
        }
        Ok(())
    }

    /// Read frames, queuing side traffic as events, until one of `kinds`.
    fn await_any(&mut self, kinds: &[MessageType]) -> Result<Message, ClientError> {
        loop {
            let message = self.read_message()?;
            if kinds.contains(&message.kind) {
                return Ok(message);
            }
            self.process(message)?;
        }
    }

    fn read_message(&mut self) -> Result<Message, ClientError> {
        let line = self
            .reader
            .read_next()?
            .ok_or(ClientError::ConnectionClosed)?;
        Ok(Message::decode(&line)?)
    }

    fn send(&mut self, kind: MessageType, body: Body) -> Result<(), ClientError> {
        self.seq += 1;
        let message = Message::new(
            kind,
            Header {
                client_id: self.user.as_str().to_string(),
                session_id: self.session_id.clone(),
                sequence_number: self.seq,
                timestamp: wall_clock_ms(),
            },
            body,
        );
        self.writer.write_frame(&message.encode()?)?;
        Ok(())
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
