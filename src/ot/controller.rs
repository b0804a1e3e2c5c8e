//! Replica-local coordinator: turns UI intents into operations, routes
//! local and remote operations through the history, and notifies listeners.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::history::{ApplyOutcome, DocumentState, History, HistoryError};
use super::operation::{OpKind, Operation, OperationId, Origin, UserId};

type ChangeListener = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Handle returned by [`DocumentController::subscribe`]; pass it back to
/// [`DocumentController::unsubscribe`] to stop receiving change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

pub struct DocumentController {
    user: UserId,
    history: History,
    op_seq: AtomicU64,
    listener_seq: AtomicU64,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
}

impl DocumentController {
    pub fn new(user: UserId, initial: impl Into<String>) -> Self {
        Self {
            user,
            history: History::new(initial),
            op_seq: AtomicU64::new(0),
            listener_seq: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Insert `text` so its first byte lands at `position`. Returns the
    /// recorded operation, ready to ship to the server.
    pub fn insert(
        &self,
        position: usize,
        text: impl Into<String>,
    ) -> Result<Operation, HistoryError> {
        self.apply_local(OpKind::insert(position, text))
    }

    /// Remove `length` bytes starting at `position`.
    pub fn delete(&self, position: usize, length: usize) -> Result<Operation, HistoryError> {
        self.apply_local(OpKind::delete(position, length))
    }

    /// Replace `length` bytes at `position` with `text`, atomically.
    pub fn replace(
        &self,
        position: usize,
        length: usize,
        text: impl Into<String>,
    ) -> Result<Operation, HistoryError> {
        self.apply_local(OpKind::composite(vec![
            OpKind::delete(position, length),
            OpKind::insert(position, text.into()),
        ]))
    }

    fn apply_local(&self, kind: OpKind) -> Result<Operation, HistoryError> {
        let op = Operation::new(kind, self.next_id(), Origin::Local);
        let outcome = self.history.apply_local(op)?;
        self.emit(&outcome);
        Ok(outcome.op)
    }

    /// Undo this user's youngest operation. The returned operation is the
    /// transformed inverse, tagged `LocalUndo` and linked to the operation
    /// it reverses; broadcast it like any other edit.
    pub fn undo(&self) -> Option<Operation> {
        let outcome = self.history.undo(self.next_id())?;
        self.emit(&outcome);
        Some(outcome.op)
    }

    pub fn redo(&self) -> Option<Operation> {
        let outcome = self.history.redo(self.next_id())?;
        self.emit(&outcome);
        Some(outcome.op)
    }

    /// Apply a canonical operation broadcast by the server. A returned
    /// error with [`HistoryError::requires_resync`] means this replica must
    /// request a full snapshot.
    pub fn apply_remote(&self, op: Operation, source_version: u64) -> Result<(), HistoryError> {
        let outcome = self.history.apply_remote(op, source_version)?;
        self.emit(&outcome);
        Ok(())
    }

    pub fn content(&self) -> String {
        self.history.content()
    }

    pub fn version(&self) -> u64 {
        self.history.version()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Current forms of the newest `count` operations, for a transport
    /// tracking its unacknowledged window.
    pub fn unacknowledged(&self, count: usize) -> Vec<Operation> {
        self.history.unacknowledged(count)
    }

    pub fn snapshot(&self) -> DocumentState {
        self.history.snapshot()
    }

    pub fn restore(&self, state: DocumentState) {
        self.history.restore(state);
        let version = self.history.version();
        let content = self.history.content();
        for listener in self.current_listeners() {
            listener(&content, version);
        }
    }

    /// Register a change listener; it is invoked with `(content, version)`
    /// after every successful apply, outside the history lock.
    pub fn subscribe(&self, listener: impl Fn(&str, u64) + Send + Sync + 'static) -> Subscription {
        let id = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push((id, Arc::new(listener)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|(id, _)| *id != subscription.0);
    }

    fn next_id(&self) -> OperationId {
        let seq = self.op_seq.fetch_add(1, Ordering::Relaxed) + 1;
        OperationId::new(self.user.clone(), seq)
    }

    // Events are delivered after the history lock has been released; the
    // listener list is snapshotted so a callback may subscribe/unsubscribe
    // without deadlocking.
    fn emit(&self, outcome: &ApplyOutcome) {
        for listener in self.current_listeners() {
            listener(&outcome.content, outcome.version);
        }
    }

    fn current_listeners(&self) -> Vec<ChangeListener> {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}
