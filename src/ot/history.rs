//! Per-replica document history: the applied log, the undo/redo stacks, and
//! the version counter, all guarded by one lock.
//!
//! The history owns the rebase logic: a remote operation is fold-transformed
//! through the tail of the applied log before it touches the document, and
//! both user stacks are transformed against it afterwards so a later undo
//! still targets the right region.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use super::operation::{Operation, OperationId, Origin, OtError};

pub const MAX_HISTORY: usize = 1000;
pub const MAX_UNDO: usize = 1000;

/// Content plus the number of operations that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub content: String,
    pub version: u64,
}

impl DocumentState {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }
}

/// What a successful apply produced: the operation as recorded (deletes
/// carry their captured text, remote operations their rebased positions)
/// plus the state snapshot to report to listeners.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub op: Operation,
    pub content: String,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Op(#[from] OtError),

    #[error("remote operation base version {base} is ahead of local version {version}")]
    SourceAhead { base: u64, version: u64 },

    #[error("remote operation base version {base} predates retained history (oldest {floor})")]
    StaleBase { base: u64, floor: u64 },

    #[error("remote operation failed to apply after rebase: {source}")]
    Desynced {
        #[source]
        source: OtError,
    },
}

impl HistoryError {
    /// True when the replica can no longer converge incrementally and must
    /// request a full snapshot from the server.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            HistoryError::StaleBase { .. } | HistoryError::Desynced { .. }
        )
    }
}

pub struct History {
    inner: Mutex<Inner>,
}

struct Inner {
    content: String,
    version: u64,
    /// Version preceding `applied[0]`; eviction advances it so version
    /// numbering is unaffected by the bounded log.
    floor: u64,
    applied: VecDeque<Operation>,
    undo_stack: VecDeque<Operation>,
    redo_stack: VecDeque<Operation>,
    max_log: usize,
    max_undo: usize,
}

impl History {
    pub fn new(initial: impl Into<String>) -> Self {
        Self::with_limits(initial, MAX_HISTORY, MAX_UNDO)
    }

    pub fn with_limits(initial: impl Into<String>, max_log: usize, max_undo: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                content: initial.into(),
                version: 0,
                floor: 0,
                applied: VecDeque::new(),
                undo_stack: VecDeque::new(),
                redo_stack: VecDeque::new(),
                max_log,
                max_undo,
            }),
        }
    }

    /// Apply an operation authored on this replica.
    ///
    /// On failure nothing changes: not the content, not the version, not the
    /// stacks. On success the inverse is pushed for undo (local origin only)
    /// and the redo stack is cleared.
    pub fn apply_local(&self, mut op: Operation) -> Result<ApplyOutcome, HistoryError> {
        let mut inner = self.lock();
        op.apply(&mut inner.content)?;

        if op.origin == Origin::Local {
            let mut inverse = op.inverse()?;
            inverse.origin = Origin::LocalUndo;
            inner.redo_stack.clear();
            inner.undo_stack.push_back(inverse);
            inner.trim_undo();
        }

        inner.record(op.clone());
        Ok(inner.outcome(op))
    }

    /// Rebase and apply an operation from the server.
    ///
    /// `source_version` is the local version the operation was created
    /// against; everything after it in the applied log is this replica's
    /// unacknowledged work. The operation is folded through that suffix
    /// pairwise: it advances past each entry while the entry is rewritten
    /// to apply after it. The incoming operation is then recorded *before*
    /// the rewritten suffix, so unacknowledged operations always stay at
    /// the tail and the next remote folds against their current forms.
    /// Afterwards both user stacks are transformed so their entries stay
    /// aligned with the new content.
    pub fn apply_remote(
        &self,
        op: Operation,
        source_version: u64,
    ) -> Result<ApplyOutcome, HistoryError> {
        let mut inner = self.lock();
        if source_version > inner.version {
            return Err(HistoryError::SourceAhead {
                base: source_version,
                version: inner.version,
            });
        }
        if source_version < inner.floor {
            return Err(HistoryError::StaleBase {
                base: source_version,
                floor: inner.floor,
            });
        }

        let start = (source_version - inner.floor) as usize;
        let mut folded = op.clone();
        let mut rewritten = Vec::with_capacity(inner.applied.len() - start);
        for entry in inner.applied.iter().skip(start) {
            rewritten.push(entry.transform(&folded));
            folded = folded.transform(entry);
        }

        folded
            .apply(&mut inner.content)
            .map_err(|source| HistoryError::Desynced { source })?;

        for (offset, entry) in rewritten.into_iter().enumerate() {
            inner.applied[start + offset] = entry;
        }
        inner.applied.insert(start, op);
        inner.version += 1;
        while inner.applied.len() > inner.max_log {
            inner.applied.pop_front();
            inner.floor += 1;
        }

        for entry in inner.undo_stack.iter_mut() {
            *entry = entry.transform(&folded);
        }
        for entry in inner.redo_stack.iter_mut() {
            *entry = entry.transform(&folded);
        }

        Ok(inner.outcome(folded))
    }

    /// Undo the youngest local operation. The stored inverse has already
    /// been transformed against everything that arrived since, so applying
    /// it yields "what the document would be had the operation never
    /// happened". Returns the applied inverse, stamped with `id`, ready to
    /// broadcast.
    pub fn undo(&self, id: OperationId) -> Option<ApplyOutcome> {
        let mut inner = self.lock();
        let mut inverse = inner.undo_stack.pop_back()?;
        inverse.id = id;
        inverse.origin = Origin::LocalUndo;
        if inverse.apply(&mut inner.content).is_err() {
            inner.undo_stack.push_back(inverse);
            return None;
        }

        // Undoing the inverse brings the original back: that is the redo.
        let mut redo = inverse
            .inverse()
            .expect("inverse of an applied operation is total");
        redo.origin = Origin::LocalRedo;
        redo.related = inverse.related.clone();
        inner.redo_stack.push_back(redo);

        inner.record(inverse.clone());
        Some(inner.outcome(inverse))
    }

    /// Re-apply the youngest undone operation.
    pub fn redo(&self, id: OperationId) -> Option<ApplyOutcome> {
        let mut inner = self.lock();
        let mut redo = inner.redo_stack.pop_back()?;
        redo.id = id;
        redo.origin = Origin::LocalRedo;
        if redo.apply(&mut inner.content).is_err() {
            inner.redo_stack.push_back(redo);
            return None;
        }

        let mut inverse = redo
            .inverse()
            .expect("inverse of an applied operation is total");
        inverse.origin = Origin::LocalUndo;
        inverse.related = redo.related.clone();
        inner.undo_stack.push_back(inverse);
        inner.trim_undo();

        inner.record(redo.clone());
        Some(inner.outcome(redo))
    }

    /// Current forms of the newest `count` applied operations, oldest
    /// first: the unacknowledged window a transport still has in flight,
    /// kept up to date as remote operations land.
    pub fn unacknowledged(&self, count: usize) -> Vec<Operation> {
        let inner = self.lock();
        let skip = inner.applied.len().saturating_sub(count);
        inner.applied.iter().skip(skip).cloned().collect()
    }

    pub fn content(&self) -> String {
        self.lock().content.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn can_undo(&self) -> bool {
        !self.lock().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.lock().redo_stack.is_empty()
    }

    pub fn snapshot(&self) -> DocumentState {
        let inner = self.lock();
        DocumentState::new(inner.content.clone(), inner.version)
    }

    /// Replace the whole state, e.g. from a server Sync-State round-trip.
    /// History and both stacks refer to content that no longer exists, so
    /// they are discarded.
    pub fn restore(&self, state: DocumentState) {
        let mut inner = self.lock();
        inner.content = state.content;
        inner.version = state.version;
        inner.floor = state.version;
        inner.applied.clear();
        inner.undo_stack.clear();
        inner.redo_stack.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("history lock poisoned")
    }
}

impl Inner {
    fn record(&mut self, op: Operation) {
        self.applied.push_back(op);
        self.version += 1;
        while self.applied.len() > self.max_log {
            self.applied.pop_front();
            self.floor += 1;
        }
    }

    fn trim_undo(&mut self) {
        while self.undo_stack.len() > self.max_undo {
            self.undo_stack.pop_front();
        }
    }

    fn outcome(&self, op: Operation) -> ApplyOutcome {
        ApplyOutcome {
            op,
            content: self.content.clone(),
            version: self.version,
        }
    }
}
