//! Per-user session state: authentication, open-document membership, idle
//! reaping, and the server-side undo/redo stacks.
//!
//! Time never comes from a hidden clock; callers pass `now_ms` so tests and
//! the runtime control it the same way.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use super::DocumentId;
use crate::ot::{Operation, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown session {0}")]
    SessionUnknown(SessionId),

    #[error("session {0} is not authenticated")]
    NotAuthenticated(SessionId),

    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
}

/// One entry of a server-side undo/redo stack: a canonical operation, the
/// document it belongs to, and the revision it was sequenced at.
#[derive(Debug, Clone)]
pub struct StackEntry {
    pub document: DocumentId,
    pub op: Operation,
    pub revision: u64,
}

struct SessionRecord {
    state: SessionState,
    username: Option<UserId>,
    last_activity_ms: u64,
    open_docs: BTreeSet<DocumentId>,
    last_ack_revision: u64,
    undo_stack: Vec<StackEntry>,
    redo_stack: Vec<StackEntry>,
    /// Sequence source for server-generated operations (undo inverses).
    op_seq: u64,
    /// Highest base revision submitted per document; edits may not go
    /// backwards from it.
    edit_bases: HashMap<DocumentId, u64>,
}

pub struct SessionRegistry {
    inner: Mutex<HashMap<SessionId, SessionRecord>>,
    max_undo: usize,
}

impl SessionRegistry {
    pub fn new(max_undo: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_undo,
        }
    }

    /// Register a freshly connected session.
    pub fn create(&self, session: SessionId, now_ms: u64) {
        self.lock().insert(
            session,
            SessionRecord {
                state: SessionState::Connecting,
                username: None,
                last_activity_ms: now_ms,
                open_docs: BTreeSet::new(),
                last_ack_revision: 0,
                undo_stack: Vec::new(),
                redo_stack: Vec::new(),
                op_seq: 0,
                edit_bases: HashMap::new(),
            },
        );
    }

    pub fn state(&self, session: SessionId) -> Result<SessionState, RegistryError> {
        Ok(self.record(&mut self.lock(), session)?.state)
    }

    pub fn is_username_available(&self, name: &str) -> bool {
        !self
            .lock()
            .values()
            .any(|r| r.state == SessionState::Authenticated && r.username.as_ref().is_some_and(|u| u.as_str() == name))
    }

    /// Bind a unique username to the session. Names are held until the
    /// session closes.
    pub fn authenticate(
        &self,
        session: SessionId,
        name: &str,
        now_ms: u64,
    ) -> Result<UserId, RegistryError> {
        let mut inner = self.lock();
        let taken = inner.values().any(|r| {
            r.state == SessionState::Authenticated
                && r.username.as_ref().is_some_and(|u| u.as_str() == name)
        });
        let record = self.record(&mut inner, session)?;
        record.state = SessionState::Authenticating;
        if taken {
            return Err(RegistryError::UsernameTaken(name.to_string()));
        }
        let user = UserId::new(name);
        record.username = Some(user.clone());
        record.state = SessionState::Authenticated;
        record.last_activity_ms = now_ms;
        Ok(user)
    }

    /// Release the username and document memberships but keep the session
    /// connected. Returns the documents that lost a participant.
    pub fn logout(&self, session: SessionId) -> Result<Vec<DocumentId>, RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        record.username = None;
        record.state = SessionState::Connecting;
        record.undo_stack.clear();
        record.redo_stack.clear();
        Ok(std::mem::take(&mut record.open_docs).into_iter().collect())
    }

    /// Remove the session entirely. Returns who it was and the documents it
    /// had open, for leave notices.
    pub fn close(&self, session: SessionId) -> (Option<UserId>, Vec<DocumentId>) {
        match self.lock().remove(&session) {
            Some(record) => (record.username, record.open_docs.into_iter().collect()),
            None => (None, Vec::new()),
        }
    }

    pub fn username(&self, session: SessionId) -> Result<UserId, RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        record
            .username
            .clone()
            .ok_or(RegistryError::NotAuthenticated(session))
    }

    pub fn touch(&self, session: SessionId, now_ms: u64) {
        if let Some(record) = self.lock().get_mut(&session) {
            record.last_activity_ms = now_ms;
        }
    }

    pub fn open_document(
        &self,
        session: SessionId,
        document: DocumentId,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        if record.username.is_none() {
            return Err(RegistryError::NotAuthenticated(session));
        }
        record.open_docs.insert(document);
        Ok(())
    }

    pub fn close_document(
        &self,
        session: SessionId,
        document: &DocumentId,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        self.record(&mut inner, session)?.open_docs.remove(document);
        Ok(())
    }

    /// Sessions that currently have `document` open, for edit fan-out.
    pub fn sessions_on_document(&self, document: &DocumentId) -> Vec<SessionId> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.open_docs.contains(document))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Usernames of everyone on `document`, sorted for stable output.
    pub fn users_on_document(&self, document: &DocumentId) -> Vec<String> {
        let mut users: Vec<String> = self
            .lock()
            .values()
            .filter(|r| r.open_docs.contains(document))
            .filter_map(|r| r.username.as_ref().map(|u| u.as_str().to_string()))
            .collect();
        users.sort();
        users
    }

    /// Remove every session idle longer than `max_idle_secs`. Returns the
    /// reaped ids so the runtime can close their sockets; the count the
    /// caller reports is `len()` of that.
    pub fn cleanup_idle(&self, max_idle_secs: u64, now_ms: u64) -> Vec<SessionId> {
        let cutoff = now_ms.saturating_sub(max_idle_secs.saturating_mul(1000));
        let mut inner = self.lock();
        let reaped: Vec<SessionId> = inner
            .iter()
            .filter(|(_, r)| r.last_activity_ms < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &reaped {
            inner.remove(id);
        }
        reaped
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Record a sequenced operation for its author: advance the ack
    /// watermark and, for plain edits, push onto the server-side undo
    /// stack (a fresh edit invalidates any redo).
    pub fn record_ack(
        &self,
        session: SessionId,
        entry: StackEntry,
        undoable: bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        record.last_ack_revision = entry.revision;
        // Server-generated ids continue after the author's own sequence.
        record.op_seq = record.op_seq.max(entry.op.id.seq);
        if undoable {
            record.redo_stack.clear();
            record.undo_stack.push(entry);
            if record.undo_stack.len() > self.max_undo {
                record.undo_stack.remove(0);
            }
        }
        Ok(())
    }

    pub fn last_ack_revision(&self, session: SessionId) -> Result<u64, RegistryError> {
        Ok(self.record(&mut self.lock(), session)?.last_ack_revision)
    }

    pub fn take_undo(&self, session: SessionId) -> Result<Option<StackEntry>, RegistryError> {
        Ok(self.record(&mut self.lock(), session)?.undo_stack.pop())
    }

    pub fn take_redo(&self, session: SessionId) -> Result<Option<StackEntry>, RegistryError> {
        Ok(self.record(&mut self.lock(), session)?.redo_stack.pop())
    }

    pub fn push_undo(&self, session: SessionId, entry: StackEntry) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        record.undo_stack.push(entry);
        if record.undo_stack.len() > self.max_undo {
            record.undo_stack.remove(0);
        }
        Ok(())
    }

    pub fn push_redo(&self, session: SessionId, entry: StackEntry) -> Result<(), RegistryError> {
        self.record(&mut self.lock(), session)?.redo_stack.push(entry);
        Ok(())
    }

    /// Enforce that a session's edit base revisions never go backwards on a
    /// document. Returns `false` (and leaves the watermark alone) when the
    /// submitted base regresses.
    pub fn note_edit_base(
        &self,
        session: SessionId,
        document: &DocumentId,
        base: u64,
    ) -> Result<bool, RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        let watermark = record.edit_bases.entry(document.clone()).or_insert(0);
        if base < *watermark {
            return Ok(false);
        }
        *watermark = base;
        Ok(true)
    }

    /// Next sequence number for a server-generated operation by this user.
    pub fn next_op_seq(&self, session: SessionId) -> Result<u64, RegistryError> {
        let mut inner = self.lock();
        let record = self.record(&mut inner, session)?;
        record.op_seq += 1;
        Ok(record.op_seq)
    }

    fn record<'a>(
        &self,
        inner: &'a mut MutexGuard<'_, HashMap<SessionId, SessionRecord>>,
        session: SessionId,
    ) -> Result<&'a mut SessionRecord, RegistryError> {
        inner
            .get_mut(&session)
            .ok_or(RegistryError::SessionUnknown(session))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionRecord>> {
        self.inner.lock().expect("session registry lock poisoned")
    }
}
