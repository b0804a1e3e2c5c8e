//! Frame dispatch: turns one inbound message into the set of outbound
//! frames it causes. All I/O stays in the runtime; this layer is pure
//! state transitions over the registry and the sequencer, which keeps it
//! testable without sockets.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Limits;
use crate::ot::{OpKind, Operation, OperationId, Origin, UserId};
use crate::protocol::{
    AuthPayload, Body, DocPayload, EditPayload, Header, Message, MessageType, PresencePayload,
    SyncPayload, SystemPayload,
};

use super::registry::{SessionId, SessionRegistry, StackEntry};
use super::sequencer::{CanonicalOp, OperationManager, SequencerError};
use super::DocumentId;

#[derive(Debug, Clone)]
pub enum Recipient {
    Session(SessionId),
    Sessions(Vec<SessionId>),
}

/// What the runtime must do after a message has been handled.
#[derive(Debug, Clone)]
pub enum Outbound {
    Send { to: Recipient, message: Message },
    Close { session: SessionId },
}

impl Outbound {
    fn to_session(session: SessionId, message: Message) -> Self {
        Outbound::Send {
            to: Recipient::Session(session),
            message,
        }
    }
}

pub struct Engine {
    pub registry: SessionRegistry,
    pub manager: OperationManager,
    out_seq: AtomicU64,
}

impl Engine {
    pub fn new(limits: &Limits) -> Self {
        Self {
            registry: SessionRegistry::new(limits.max_undo),
            manager: OperationManager::new(limits.max_history),
            out_seq: AtomicU64::new(0),
        }
    }

    /// Register a new connection and hand back its session id.
    pub fn connect(&self, now_ms: u64) -> SessionId {
        let session = SessionId::generate();
        self.registry.create(session, now_ms);
        tracing::info!(session = %session, "session connected");
        session
    }

    /// Tear down a session that dropped its connection.
    pub fn disconnect(&self, session: SessionId, now_ms: u64) -> Vec<Outbound> {
        let (username, docs) = self.registry.close(session);
        tracing::info!(session = %session, open_docs = docs.len(), "session closed");
        let username = username.map(|u| u.as_str().to_string());
        docs.into_iter()
            .filter_map(|doc| {
                self.presence_broadcast(
                    MessageType::PresenceLeave,
                    &doc,
                    session,
                    username.clone(),
                    now_ms,
                )
            })
            .collect()
    }

    /// Reap idle sessions; each reaped session gets a disconnect notice and
    /// a socket close.
    pub fn cleanup_idle(&self, max_idle_secs: u64, now_ms: u64) -> Vec<Outbound> {
        let reaped = self.registry.cleanup_idle(max_idle_secs, now_ms);
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "reaped idle sessions");
        }
        reaped
            .into_iter()
            .flat_map(|session| {
                [
                    Outbound::to_session(
                        session,
                        self.system_message(
                            MessageType::SysDisconnect,
                            session,
                            "idle timeout",
                            now_ms,
                        ),
                    ),
                    Outbound::Close { session },
                ]
            })
            .collect()
    }

    /// Dispatch one inbound frame.
    pub fn handle(&self, session: SessionId, message: Message, now_ms: u64) -> Vec<Outbound> {
        if self.registry.state(session).is_err() {
            // No record for this session: tell the peer and hang up.
            return vec![
                Outbound::to_session(
                    session,
                    self.system_message(
                        MessageType::SysDisconnect,
                        session,
                        "unknown session",
                        now_ms,
                    ),
                ),
                Outbound::Close { session },
            ];
        }
        self.registry.touch(session, now_ms);

        match (message.kind, message.body) {
            (MessageType::AuthLogin | MessageType::AuthRegister, Body::Auth(payload)) => {
                self.handle_login(session, payload, now_ms)
            }
            (MessageType::AuthLogout, Body::Auth(_)) => self.handle_logout(session, now_ms),
            (kind, Body::Document(payload)) => self.handle_document(session, kind, payload, now_ms),
            (kind @ (MessageType::EditInsert
            | MessageType::EditDelete
            | MessageType::EditReplace), Body::Edit(payload)) => {
                self.handle_edit(session, kind, payload, now_ms)
            }
            (MessageType::SyncRequest, Body::Sync(payload)) => {
                self.handle_sync_request(session, payload, now_ms)
            }
            (MessageType::SyncAck, Body::Sync(_)) => Vec::new(),
            (kind @ (MessageType::PresenceJoin
            | MessageType::PresenceLeave
            | MessageType::PresenceCursor
            | MessageType::PresenceSelection
            | MessageType::PresenceUpdate), Body::Presence(payload)) => {
                self.handle_presence(session, kind, payload, now_ms)
            }
            (MessageType::SysHeartbeat, Body::System(_)) => vec![Outbound::to_session(
                session,
                self.system_message(MessageType::SysHeartbeat, session, "", now_ms),
            )],
            (MessageType::SysDisconnect, Body::System(_)) => {
                let mut out = self.disconnect(session, now_ms);
                out.push(Outbound::Close { session });
                out
            }
            (kind, _) => {
                tracing::debug!(session = %session, kind = kind.code(), "ignoring frame");
                Vec::new()
            }
        }
    }

    /// Server-mediated undo: pop the user's youngest canonical operation,
    /// rebase its inverse through everything sequenced since, and process
    /// it as a new operation. The caller broadcasts the result.
    pub fn undo_for(
        &self,
        session: SessionId,
        _now_ms: u64,
    ) -> crate::Result<Option<(DocumentId, CanonicalOp)>> {
        let Some(entry) = self.registry.take_undo(session)? else {
            return Ok(None);
        };
        let user = self.registry.username(session)?;
        let mut inverse = entry.op.inverse()?;
        inverse.id = OperationId::new(user, self.registry.next_op_seq(session)?);
        inverse.origin = Origin::LocalUndo;

        let canonical = self.manager.process(&entry.document, inverse, entry.revision)?;
        self.registry.push_redo(
            session,
            StackEntry {
                document: entry.document.clone(),
                op: canonical.op.inverse()?,
                revision: canonical.revision,
            },
        )?;
        self.registry.record_ack(
            session,
            StackEntry {
                document: entry.document.clone(),
                op: canonical.op.clone(),
                revision: canonical.revision,
            },
            false,
        )?;
        Ok(Some((entry.document, canonical)))
    }

    /// Server-mediated redo: re-process the inverse of the youngest undo.
    pub fn redo_for(
        &self,
        session: SessionId,
        _now_ms: u64,
    ) -> crate::Result<Option<(DocumentId, CanonicalOp)>> {
        let Some(entry) = self.registry.take_redo(session)? else {
            return Ok(None);
        };
        let user = self.registry.username(session)?;
        let mut op = entry.op;
        op.id = OperationId::new(user, self.registry.next_op_seq(session)?);
        op.origin = Origin::LocalRedo;

        let canonical = self.manager.process(&entry.document, op, entry.revision)?;
        self.registry.push_undo(
            session,
            StackEntry {
                document: entry.document.clone(),
                op: canonical.op.clone(),
                revision: canonical.revision,
            },
        )?;
        self.registry.record_ack(
            session,
            StackEntry {
                document: entry.document.clone(),
                op: canonical.op.clone(),
                revision: canonical.revision,
            },
            false,
        )?;
        Ok(Some((entry.document, canonical)))
    }

    /// The canonical-edit broadcast for every session with the document
    /// open, the author included (their copy is the ack).
    pub fn edit_broadcast(
        &self,
        document: &DocumentId,
        canonical: &CanonicalOp,
        author: &UserId,
        now_ms: u64,
    ) -> Outbound {
        let targets = self.registry.sessions_on_document(document);
        Outbound::Send {
            to: Recipient::Sessions(targets),
            message: Message::new(
                MessageType::EditApply,
                Header {
                    client_id: author.as_str().to_string(),
                    session_id: String::new(),
                    sequence_number: self.next_out_seq(),
                    timestamp: now_ms,
                },
                Body::Edit(EditPayload {
                    document_id: document.as_str().to_string(),
                    document_version: canonical.revision,
                    operation_id: canonical.op.id.to_string(),
                    operation: Some(canonical.op.kind.clone()),
                    success: Some(true),
                    ..Default::default()
                }),
            ),
        }
    }

    fn handle_login(
        &self,
        session: SessionId,
        payload: AuthPayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        if payload.username.is_empty() {
            return vec![self.auth_reply(
                session,
                MessageType::AuthFailure,
                &payload.username,
                Some("username must not be empty".to_string()),
                now_ms,
            )];
        }
        match self.registry.authenticate(session, &payload.username, now_ms) {
            Ok(user) => {
                tracing::info!(session = %session, user = %user, "authenticated");
                vec![self.auth_reply(session, MessageType::AuthSuccess, user.as_str(), None, now_ms)]
            }
            Err(err) => vec![self.auth_reply(
                session,
                MessageType::AuthFailure,
                &payload.username,
                Some(err.to_string()),
                now_ms,
            )],
        }
    }

    fn handle_logout(&self, session: SessionId, now_ms: u64) -> Vec<Outbound> {
        let username = self.registry.username(session).ok();
        let docs = self.registry.logout(session).unwrap_or_default();
        let mut out: Vec<Outbound> = docs
            .into_iter()
            .filter_map(|doc| {
                self.presence_broadcast(
                    MessageType::PresenceLeave,
                    &doc,
                    session,
                    username.as_ref().map(|u| u.as_str().to_string()),
                    now_ms,
                )
            })
            .collect();
        out.push(self.auth_reply(
            session,
            MessageType::AuthSuccess,
            username.as_ref().map(|u| u.as_str()).unwrap_or_default(),
            None,
            now_ms,
        ));
        out
    }

    fn handle_document(
        &self,
        session: SessionId,
        kind: MessageType,
        payload: DocPayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let doc = DocumentId::new(&payload.document_id);
        match kind {
            MessageType::DocCreate => {
                let name = payload
                    .document_name
                    .clone()
                    .unwrap_or_else(|| payload.document_id.clone());
                let initial = payload.document_content.clone().unwrap_or_default();
                let result = self.manager.create_document(doc.clone(), name, initial);
                vec![self.doc_result_reply(session, &payload.document_id, result, now_ms)]
            }
            MessageType::DocOpen => self.handle_doc_open(session, doc, payload, now_ms),
            MessageType::DocClose => {
                let username = self.registry.username(session).ok();
                let _ = self.registry.close_document(session, &doc);
                let mut out = Vec::new();
                if let Some(broadcast) = self.presence_broadcast(
                    MessageType::PresenceLeave,
                    &doc,
                    session,
                    username.map(|u| u.as_str().to_string()),
                    now_ms,
                ) {
                    out.push(broadcast);
                }
                out.push(self.doc_result_reply(session, &payload.document_id, Ok(()), now_ms));
                out
            }
            MessageType::DocList => {
                let list = self
                    .manager
                    .list_documents()
                    .into_iter()
                    .map(|(id, _)| id.as_str().to_string())
                    .collect();
                vec![Outbound::to_session(
                    session,
                    Message::new(
                        MessageType::DocResponse,
                        self.reply_header(session, now_ms),
                        Body::Document(DocPayload {
                            document_list: list,
                            success: Some(true),
                            ..Default::default()
                        }),
                    ),
                )]
            }
            MessageType::DocInfo => {
                let reply = match (self.manager.document_name(&doc), self.manager.snapshot(&doc))
                {
                    (Ok(name), Ok(state)) => DocPayload {
                        document_id: payload.document_id.clone(),
                        document_name: Some(name),
                        document_version: Some(state.version),
                        success: Some(true),
                        ..Default::default()
                    },
                    (Err(err), _) | (_, Err(err)) => DocPayload {
                        document_id: payload.document_id.clone(),
                        success: Some(false),
                        error_message: Some(err.to_string()),
                        ..Default::default()
                    },
                };
                vec![Outbound::to_session(
                    session,
                    Message::new(
                        MessageType::DocResponse,
                        self.reply_header(session, now_ms),
                        Body::Document(reply),
                    ),
                )]
            }
            MessageType::DocDelete => {
                let result = self.manager.delete_document(&doc);
                vec![self.doc_result_reply(session, &payload.document_id, result, now_ms)]
            }
            MessageType::DocRename => {
                let result = match payload.document_name.clone() {
                    Some(name) => self.manager.rename_document(&doc, name),
                    None => Err(SequencerError::DocumentUnknown(doc.clone())),
                };
                vec![self.doc_result_reply(session, &payload.document_id, result, now_ms)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_doc_open(
        &self,
        session: SessionId,
        doc: DocumentId,
        payload: DocPayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let snapshot = match self.manager.snapshot(&doc) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return vec![self.doc_result_reply(session, &payload.document_id, Err(err), now_ms)];
            }
        };
        if let Err(err) = self.registry.open_document(session, doc.clone()) {
            return vec![Outbound::to_session(
                session,
                Message::new(
                    MessageType::DocResponse,
                    self.reply_header(session, now_ms),
                    Body::Document(DocPayload {
                        document_id: payload.document_id.clone(),
                        success: Some(false),
                        error_message: Some(err.to_string()),
                        ..Default::default()
                    }),
                ),
            )];
        }

        let username = self.registry.username(session).ok();
        let mut out = vec![Outbound::to_session(
            session,
            Message::new(
                MessageType::DocResponse,
                self.reply_header(session, now_ms),
                Body::Document(DocPayload {
                    document_id: payload.document_id.clone(),
                    document_name: self.manager.document_name(&doc).ok(),
                    document_content: Some(snapshot.content),
                    document_version: Some(snapshot.version),
                    success: Some(true),
                    ..Default::default()
                }),
            ),
        )];
        if let Some(broadcast) = self.presence_broadcast(
            MessageType::PresenceJoin,
            &doc,
            session,
            username.map(|u| u.as_str().to_string()),
            now_ms,
        ) {
            out.push(broadcast);
        }
        out
    }

    fn handle_edit(
        &self,
        session: SessionId,
        kind: MessageType,
        payload: EditPayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let user = match self.registry.username(session) {
            Ok(user) => user,
            Err(err) => {
                return vec![self.edit_reject(session, &payload, err.to_string(), now_ms)];
            }
        };

        let op_kind = match Self::edit_op_kind(kind, &payload) {
            Some(op_kind) => op_kind,
            None => {
                return vec![self.edit_reject(
                    session,
                    &payload,
                    "edit frame is missing required fields".to_string(),
                    now_ms,
                )];
            }
        };

        let id = match payload.operation_id.parse::<OperationId>() {
            Ok(id) if id.author == user => id,
            Ok(_) => {
                return vec![self.edit_reject(
                    session,
                    &payload,
                    "operation id does not belong to this user".to_string(),
                    now_ms,
                )];
            }
            Err(err) => {
                return vec![self.edit_reject(session, &payload, err.to_string(), now_ms)];
            }
        };

        let doc = DocumentId::new(&payload.document_id);
        match self.registry.note_edit_base(session, &doc, payload.document_version) {
            Ok(true) => {}
            Ok(false) => {
                return vec![self.edit_reject(
                    session,
                    &payload,
                    "base revision went backwards".to_string(),
                    now_ms,
                )];
            }
            Err(err) => {
                return vec![self.edit_reject(session, &payload, err.to_string(), now_ms)];
            }
        }

        let op = Operation::new(op_kind, id, Origin::Local);
        match self.manager.process(&doc, op, payload.document_version) {
            Ok(canonical) => {
                let entry = StackEntry {
                    document: doc.clone(),
                    op: canonical.op.clone(),
                    revision: canonical.revision,
                };
                if let Err(err) = self.registry.record_ack(session, entry, true) {
                    tracing::warn!(session = %session, "ack bookkeeping failed: {err}");
                }
                vec![self.edit_broadcast(&doc, &canonical, &user, now_ms)]
            }
            Err(err) => {
                tracing::debug!(session = %session, document = %doc, "edit rejected: {err}");
                vec![self.edit_reject(session, &payload, err.to_string(), now_ms)]
            }
        }
    }

    fn edit_op_kind(kind: MessageType, payload: &EditPayload) -> Option<OpKind> {
        if let Some(op) = payload.operation.clone() {
            return Some(op);
        }
        match kind {
            MessageType::EditInsert => Some(OpKind::insert(
                payload.position?,
                payload.text.clone()?,
            )),
            MessageType::EditDelete => Some(OpKind::delete(payload.position?, payload.length?)),
            MessageType::EditReplace => {
                let position = payload.position?;
                Some(OpKind::composite(vec![
                    OpKind::delete(position, payload.length?),
                    OpKind::insert(position, payload.text.clone()?),
                ]))
            }
            _ => None,
        }
    }

    fn handle_sync_request(
        &self,
        session: SessionId,
        payload: SyncPayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let doc = DocumentId::new(&payload.document_id);
        // No fromVersion means a cold resync: ship the whole state.
        let Some(from) = payload.from_version else {
            let reply = match self.manager.snapshot(&doc) {
                Ok(state) => Message::new(
                    MessageType::SyncState,
                    self.reply_header(session, now_ms),
                    Body::Sync(SyncPayload {
                        document_id: payload.document_id.clone(),
                        to_version: Some(state.version),
                        document_state: Some(state.content),
                        success: Some(true),
                        ..Default::default()
                    }),
                ),
                Err(err) => self.sync_failure(session, &payload.document_id, err, now_ms),
            };
            return vec![Outbound::to_session(session, reply)];
        };
        let reply = match self.manager.operations_since(&doc, from) {
            Ok(tail) => Message::new(
                MessageType::SyncResponse,
                self.reply_header(session, now_ms),
                Body::Sync(SyncPayload {
                    document_id: payload.document_id.clone(),
                    from_version: Some(tail.from),
                    to_version: Some(tail.to),
                    operations: tail.ops.iter().map(|op| op.kind.to_wire()).collect(),
                    success: Some(true),
                    ..Default::default()
                }),
            ),
            // Too far behind for an incremental tail: ship the whole state.
            Err(SequencerError::BaseEvicted { .. } | SequencerError::RevisionInFuture { .. }) => {
                match self.manager.snapshot(&doc) {
                    Ok(state) => Message::new(
                        MessageType::SyncState,
                        self.reply_header(session, now_ms),
                        Body::Sync(SyncPayload {
                            document_id: payload.document_id.clone(),
                            to_version: Some(state.version),
                            document_state: Some(state.content),
                            success: Some(true),
                            ..Default::default()
                        }),
                    ),
                    Err(err) => self.sync_failure(session, &payload.document_id, err, now_ms),
                }
            }
            Err(err) => self.sync_failure(session, &payload.document_id, err, now_ms),
        };
        vec![Outbound::to_session(session, reply)]
    }

    fn handle_presence(
        &self,
        session: SessionId,
        kind: MessageType,
        payload: PresencePayload,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let doc = DocumentId::new(&payload.document_id);
        let username = self
            .registry
            .username(session)
            .map(|u| u.as_str().to_string())
            .unwrap_or(payload.username.clone());
        let targets: Vec<SessionId> = self
            .registry
            .sessions_on_document(&doc)
            .into_iter()
            .filter(|s| *s != session)
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }
        vec![Outbound::Send {
            to: Recipient::Sessions(targets),
            message: Message::new(
                kind,
                Header {
                    client_id: username.clone(),
                    session_id: String::new(),
                    sequence_number: self.next_out_seq(),
                    timestamp: now_ms,
                },
                Body::Presence(PresencePayload {
                    username,
                    ..payload
                }),
            ),
        }]
    }

    fn presence_broadcast(
        &self,
        kind: MessageType,
        doc: &DocumentId,
        from: SessionId,
        username: Option<String>,
        now_ms: u64,
    ) -> Option<Outbound> {
        let targets: Vec<SessionId> = self
            .registry
            .sessions_on_document(doc)
            .into_iter()
            .filter(|s| *s != from)
            .collect();
        if targets.is_empty() {
            return None;
        }
        Some(Outbound::Send {
            to: Recipient::Sessions(targets),
            message: Message::new(
                kind,
                Header {
                    client_id: username.clone().unwrap_or_default(),
                    session_id: String::new(),
                    sequence_number: self.next_out_seq(),
                    timestamp: now_ms,
                },
                Body::Presence(PresencePayload {
                    document_id: doc.as_str().to_string(),
                    username: username.unwrap_or_default(),
                    ..Default::default()
                }),
            ),
        })
    }

    fn edit_reject(
        &self,
        session: SessionId,
        payload: &EditPayload,
        error: String,
        now_ms: u64,
    ) -> Outbound {
        Outbound::to_session(
            session,
            Message::new(
                MessageType::EditReject,
                self.reply_header(session, now_ms),
                Body::Edit(EditPayload {
                    document_id: payload.document_id.clone(),
                    document_version: payload.document_version,
                    operation_id: payload.operation_id.clone(),
                    success: Some(false),
                    error_message: Some(error),
                    ..Default::default()
                }),
            ),
        )
    }

    fn doc_result_reply(
        &self,
        session: SessionId,
        document_id: &str,
        result: Result<(), SequencerError>,
        now_ms: u64,
    ) -> Outbound {
        let payload = match result {
            Ok(()) => DocPayload {
                document_id: document_id.to_string(),
                success: Some(true),
                ..Default::default()
            },
            Err(err) => DocPayload {
                document_id: document_id.to_string(),
                success: Some(false),
                error_message: Some(err.to_string()),
                ..Default::default()
            },
        };
        Outbound::to_session(
            session,
            Message::new(
                MessageType::DocResponse,
                self.reply_header(session, now_ms),
                Body::Document(payload),
            ),
        )
    }

    fn sync_failure(
        &self,
        session: SessionId,
        document_id: &str,
        err: SequencerError,
        now_ms: u64,
    ) -> Message {
        Message::new(
            MessageType::SyncResponse,
            self.reply_header(session, now_ms),
            Body::Sync(SyncPayload {
                document_id: document_id.to_string(),
                success: Some(false),
                error_message: Some(err.to_string()),
                ..Default::default()
            }),
        )
    }

    fn auth_reply(
        &self,
        session: SessionId,
        kind: MessageType,
        username: &str,
        error: Option<String>,
        now_ms: u64,
    ) -> Outbound {
        Outbound::to_session(
            session,
            Message::new(
                kind,
                self.reply_header(session, now_ms),
                Body::Auth(AuthPayload {
                    username: username.to_string(),
                    error_message: error,
                }),
            ),
        )
    }

    fn system_message(
        &self,
        kind: MessageType,
        session: SessionId,
        text: &str,
        now_ms: u64,
    ) -> Message {
        Message::new(
            kind,
            self.reply_header(session, now_ms),
            Body::System(SystemPayload {
                message: if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                },
            }),
        )
    }

    fn reply_header(&self, session: SessionId, now_ms: u64) -> Header {
        Header {
            client_id: String::new(),
            session_id: session.to_string(),
            sequence_number: self.next_out_seq(),
            timestamp: now_ms,
        }
    }

    fn next_out_seq(&self) -> u64 {
        self.out_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;

    fn engine() -> Engine {
        Engine::new(&Limits::default())
    }

    fn login(engine: &Engine, name: &str) -> SessionId {
        let session = engine.connect(0);
        let replies = engine.handle(
            session,
            Message::new(
                MessageType::AuthLogin,
                Header::default(),
                Body::Auth(AuthPayload {
                    username: name.into(),
                    error_message: None,
                }),
            ),
            0,
        );
        assert!(matches!(
            &replies[0],
            Outbound::Send { message, .. } if message.kind == MessageType::AuthSuccess
        ));
        session
    }

    fn open(engine: &Engine, session: SessionId, doc: &str) {
        let replies = engine.handle(
            session,
            Message::new(
                MessageType::DocOpen,
                Header::default(),
                Body::Document(DocPayload {
                    document_id: doc.into(),
                    ..Default::default()
                }),
            ),
            0,
        );
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.document().unwrap().success, Some(true));
    }

    fn insert_frame(doc: &str, op_id: &str, base: u64, position: usize, text: &str) -> Message {
        Message::new(
            MessageType::EditInsert,
            Header::default(),
            Body::Edit(EditPayload {
                document_id: doc.into(),
                document_version: base,
                operation_id: op_id.into(),
                position: Some(position),
                text: Some(text.into()),
                ..Default::default()
            }),
        )
    }

    fn setup_doc(engine: &Engine, doc: &str, content: &str) {
        engine
            .manager
            .create_document(DocumentId::new(doc), doc, content)
            .unwrap();
    }

    #[test]
    fn login_open_edit_round_trip() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");

        let replies = engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "hi"), 1);
        assert_eq!(replies.len(), 1);
        let Outbound::Send { to, message } = &replies[0] else {
            panic!("expected broadcast");
        };
        assert_eq!(message.kind, MessageType::EditApply);
        let edit = message.edit().unwrap();
        assert_eq!(edit.document_version, 1);
        assert_eq!(edit.operation_id, "alice#1");
        assert_eq!(edit.operation, Some(OpKind::insert(0, "hi")));
        let Recipient::Sessions(targets) = to else {
            panic!("expected fan-out");
        };
        assert_eq!(targets, &vec![alice]);
    }

    #[test]
    fn duplicate_usernames_are_refused() {
        let engine = engine();
        login(&engine, "alice");
        let second = engine.connect(0);
        let replies = engine.handle(
            second,
            Message::new(
                MessageType::AuthLogin,
                Header::default(),
                Body::Auth(AuthPayload {
                    username: "alice".into(),
                    error_message: None,
                }),
            ),
            0,
        );
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::AuthFailure);
        assert!(message.auth().unwrap().error_message.is_some());
    }

    #[test]
    fn edits_fan_out_to_everyone_on_the_document() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        let bob = login(&engine, "bob");
        open(&engine, alice, "doc");
        open(&engine, bob, "doc");

        let replies = engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "x"), 1);
        let Outbound::Send { to: Recipient::Sessions(targets), .. } = &replies[0] else {
            panic!("expected fan-out");
        };
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&alice));
        assert!(targets.contains(&bob));
    }

    #[test]
    fn rejection_goes_only_to_the_originator_with_the_id_echoed() {
        let engine = engine();
        setup_doc(&engine, "doc", "ab");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");

        let frame = Message::new(
            MessageType::EditDelete,
            Header::default(),
            Body::Edit(EditPayload {
                document_id: "doc".into(),
                document_version: 0,
                operation_id: "alice#1".into(),
                position: Some(0),
                length: Some(10),
                ..Default::default()
            }),
        );
        let replies = engine.handle(alice, frame, 1);
        assert_eq!(replies.len(), 1);
        let Outbound::Send { to: Recipient::Session(target), message } = &replies[0] else {
            panic!("expected direct reply");
        };
        assert_eq!(*target, alice);
        assert_eq!(message.kind, MessageType::EditReject);
        let edit = message.edit().unwrap();
        assert_eq!(edit.operation_id, "alice#1");
        assert_eq!(edit.success, Some(false));
    }

    #[test]
    fn spoofed_operation_ids_are_rejected() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");
        let replies = engine.handle(alice, insert_frame("doc", "bob#1", 0, 0, "x"), 1);
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::EditReject);
    }

    #[test]
    fn future_base_revision_is_rejected_with_sync_hint() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");
        let replies = engine.handle(alice, insert_frame("doc", "alice#1", 9, 0, "x"), 1);
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::EditReject);
    }

    #[test]
    fn base_revisions_may_not_go_backwards() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");

        engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "a"), 1);
        engine.handle(alice, insert_frame("doc", "alice#2", 1, 1, "b"), 2);
        let replies = engine.handle(alice, insert_frame("doc", "alice#3", 0, 0, "c"), 3);
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::EditReject);
    }

    #[test]
    fn sync_request_returns_the_operation_tail() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");
        engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "a"), 1);
        engine.handle(alice, insert_frame("doc", "alice#2", 1, 1, "b"), 2);

        let replies = engine.handle(
            alice,
            Message::new(
                MessageType::SyncRequest,
                Header::default(),
                Body::Sync(SyncPayload {
                    document_id: "doc".into(),
                    from_version: Some(1),
                    ..Default::default()
                }),
            ),
            3,
        );
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::SyncResponse);
        let sync = message.sync().unwrap();
        assert_eq!(sync.from_version, Some(1));
        assert_eq!(sync.to_version, Some(2));
        assert_eq!(sync.operations.len(), 1);
    }

    #[test]
    fn sync_request_far_behind_gets_a_full_state() {
        let limits = Limits {
            max_history: 1,
            ..Limits::default()
        };
        let engine = Engine::new(&limits);
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");
        engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "a"), 1);
        engine.handle(alice, insert_frame("doc", "alice#2", 1, 1, "b"), 2);

        let replies = engine.handle(
            alice,
            Message::new(
                MessageType::SyncRequest,
                Header::default(),
                Body::Sync(SyncPayload {
                    document_id: "doc".into(),
                    from_version: Some(0),
                    ..Default::default()
                }),
            ),
            3,
        );
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::SyncState);
        let sync = message.sync().unwrap();
        assert_eq!(sync.document_state.as_deref(), Some("ab"));
        assert_eq!(sync.to_version, Some(2));
    }

    #[test]
    fn sync_request_without_a_base_gets_the_full_state() {
        let engine = engine();
        setup_doc(&engine, "doc", "hello");
        let alice = login(&engine, "alice");
        open(&engine, alice, "doc");

        let replies = engine.handle(
            alice,
            Message::new(
                MessageType::SyncRequest,
                Header::default(),
                Body::Sync(SyncPayload {
                    document_id: "doc".into(),
                    ..Default::default()
                }),
            ),
            1,
        );
        let Outbound::Send { message, .. } = &replies[0] else {
            panic!("expected reply");
        };
        assert_eq!(message.kind, MessageType::SyncState);
        assert_eq!(message.sync().unwrap().document_state.as_deref(), Some("hello"));
    }

    #[test]
    fn unknown_sessions_are_disconnected() {
        let engine = engine();
        let ghost = SessionId::generate();
        let replies = engine.handle(
            ghost,
            Message::new(
                MessageType::SysHeartbeat,
                Header::default(),
                Body::System(SystemPayload::default()),
            ),
            0,
        );
        assert!(matches!(
            &replies[0],
            Outbound::Send { message, .. } if message.kind == MessageType::SysDisconnect
        ));
        assert!(matches!(replies[1], Outbound::Close { .. }));
    }

    #[test]
    fn presence_updates_reach_other_participants_only() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        let bob = login(&engine, "bob");
        open(&engine, alice, "doc");
        open(&engine, bob, "doc");

        let replies = engine.handle(
            alice,
            Message::new(
                MessageType::PresenceCursor,
                Header::default(),
                Body::Presence(PresencePayload {
                    document_id: "doc".into(),
                    cursor_position: Some(3),
                    ..Default::default()
                }),
            ),
            1,
        );
        let Outbound::Send { to: Recipient::Sessions(targets), message } = &replies[0] else {
            panic!("expected broadcast");
        };
        assert_eq!(targets, &vec![bob]);
        // The server stamps the authenticated username on the way through.
        let Body::Presence(presence) = &message.body else {
            panic!("presence body");
        };
        assert_eq!(presence.username, "alice");
        assert_eq!(presence.cursor_position, Some(3));
    }

    #[test]
    fn server_side_undo_rebases_through_later_operations() {
        let engine = engine();
        setup_doc(&engine, "doc", "");
        let alice = login(&engine, "alice");
        let bob = login(&engine, "bob");
        open(&engine, alice, "doc");
        open(&engine, bob, "doc");

        // Alice writes "hello"; Bob appends " world" on top of it.
        engine.handle(alice, insert_frame("doc", "alice#1", 0, 0, "hello"), 1);
        engine.handle(bob, insert_frame("doc", "bob#1", 1, 5, " world"), 2);

        let (doc, canonical) = engine.undo_for(alice, 3).unwrap().unwrap();
        assert_eq!(doc, DocumentId::new("doc"));
        assert_eq!(canonical.revision, 3);
        assert_eq!(
            engine.manager.snapshot(&doc).unwrap().content,
            " world"
        );
        assert_eq!(canonical.op.origin, Origin::LocalUndo);

        // Redo brings "hello" back, transformed into place.
        let (_, redone) = engine.redo_for(alice, 4).unwrap().unwrap();
        assert_eq!(redone.revision, 4);
        assert_eq!(
            engine.manager.snapshot(&doc).unwrap().content,
            "hello world"
        );
    }

    #[test]
    fn undo_with_nothing_to_undo_is_none() {
        let engine = engine();
        let alice = login(&engine, "alice");
        assert!(engine.undo_for(alice, 0).unwrap().is_none());
    }

    #[test]
    fn idle_cleanup_emits_disconnects_and_closes() {
        let engine = engine();
        let alice = login(&engine, "alice");
        let out = engine.cleanup_idle(3600, 3_600_001);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Outbound::Send { message, .. } if message.kind == MessageType::SysDisconnect
        ));
        assert!(matches!(out[1], Outbound::Close { session } if session == alice));
        assert_eq!(engine.registry.session_count(), 0);
    }
}
