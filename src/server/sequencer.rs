//! The server-side sequencer: one canonical, totally ordered operation log
//! per document.
//!
//! Every inbound operation names the revision it was authored against. The
//! sequencer folds it through the log tail it has not seen, validates the
//! result against the authoritative content, applies it, and assigns the
//! next revision. Locking is per document; documents are independent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use super::DocumentId;
use crate::ot::{DocumentState, Operation, OperationId, OtError};

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("document {0} already exists")]
    DocumentExists(DocumentId),

    #[error("unknown document {0}")]
    DocumentUnknown(DocumentId),

    #[error("base revision {base} is ahead of current revision {current}")]
    RevisionInFuture { base: u64, current: u64 },

    #[error("base revision {base} predates the retained log (oldest {floor})")]
    BaseEvicted { base: u64, floor: u64 },

    #[error("operation {id} rejected: {source}")]
    Rejected {
        id: OperationId,
        #[source]
        source: OtError,
    },
}

/// The server-assigned, post-rebase form of an operation: the only form
/// that is ever broadcast.
#[derive(Debug, Clone)]
pub struct CanonicalOp {
    pub op: Operation,
    pub revision: u64,
}

/// Canonical operations between two revisions, for incremental resync.
#[derive(Debug, Clone)]
pub struct OperationTail {
    pub from: u64,
    pub to: u64,
    pub ops: Vec<Operation>,
}

pub struct OperationManager {
    docs: Mutex<BTreeMap<DocumentId, Arc<DocumentLog>>>,
    max_log: usize,
}

struct DocumentLog {
    state: Mutex<LogState>,
}

struct LogState {
    name: String,
    content: String,
    revision: u64,
    /// Revision preceding `log[0]`; eviction advances it.
    floor: u64,
    log: VecDeque<Operation>,
}

impl OperationManager {
    pub fn new(max_log: usize) -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            max_log,
        }
    }

    pub fn create_document(
        &self,
        id: DocumentId,
        name: impl Into<String>,
        initial: impl Into<String>,
    ) -> Result<(), SequencerError> {
        let mut docs = self.docs();
        if docs.contains_key(&id) {
            return Err(SequencerError::DocumentExists(id));
        }
        docs.insert(
            id,
            Arc::new(DocumentLog {
                state: Mutex::new(LogState {
                    name: name.into(),
                    content: initial.into(),
                    revision: 0,
                    floor: 0,
                    log: VecDeque::new(),
                }),
            }),
        );
        Ok(())
    }

    pub fn delete_document(&self, id: &DocumentId) -> Result<(), SequencerError> {
        self.docs()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SequencerError::DocumentUnknown(id.clone()))
    }

    pub fn rename_document(
        &self,
        id: &DocumentId,
        name: impl Into<String>,
    ) -> Result<(), SequencerError> {
        let doc = self.doc(id)?;
        doc.lock().name = name.into();
        Ok(())
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.docs().contains_key(id)
    }

    /// `(id, name)` for every document, in id order.
    pub fn list_documents(&self) -> Vec<(DocumentId, String)> {
        self.docs()
            .iter()
            .map(|(id, doc)| (id.clone(), doc.lock().name.clone()))
            .collect()
    }

    pub fn document_name(&self, id: &DocumentId) -> Result<String, SequencerError> {
        Ok(self.doc(id)?.lock().name.clone())
    }

    /// Authoritative `(content, revision)` for a document.
    pub fn snapshot(&self, id: &DocumentId) -> Result<DocumentState, SequencerError> {
        let doc = self.doc(id)?;
        let state = doc.lock();
        Ok(DocumentState::new(state.content.clone(), state.revision))
    }

    /// Canonical operations from `from` (exclusive floor) to the head, for
    /// a Sync-Response. `BaseEvicted` means the client is too far behind
    /// and needs a full snapshot instead.
    pub fn operations_since(
        &self,
        id: &DocumentId,
        from: u64,
    ) -> Result<OperationTail, SequencerError> {
        let doc = self.doc(id)?;
        let state = doc.lock();
        if from > state.revision {
            return Err(SequencerError::RevisionInFuture {
                base: from,
                current: state.revision,
            });
        }
        if from < state.floor {
            return Err(SequencerError::BaseEvicted {
                base: from,
                floor: state.floor,
            });
        }
        let start = (from - state.floor) as usize;
        Ok(OperationTail {
            from,
            to: state.revision,
            ops: state.log.iter().skip(start).cloned().collect(),
        })
    }

    /// Sequence one operation: rebase it over the log tail the author has
    /// not seen, validate, apply, and assign the next revision.
    ///
    /// Submitting the same operation id twice returns the recorded
    /// canonical form, so client retries are idempotent.
    pub fn process(
        &self,
        id: &DocumentId,
        op: Operation,
        base_revision: u64,
    ) -> Result<CanonicalOp, SequencerError> {
        let doc = self.doc(id)?;
        let mut state = doc.lock();

        if base_revision > state.revision {
            return Err(SequencerError::RevisionInFuture {
                base: base_revision,
                current: state.revision,
            });
        }
        if base_revision < state.floor {
            return Err(SequencerError::BaseEvicted {
                base: base_revision,
                floor: state.floor,
            });
        }

        let start = (base_revision - state.floor) as usize;
        let mut transformed = op;
        for (offset, entry) in state.log.iter().enumerate().skip(start) {
            if entry.id == transformed.id {
                return Ok(CanonicalOp {
                    op: entry.clone(),
                    revision: state.floor + offset as u64 + 1,
                });
            }
            transformed = transformed.transform(entry);
        }

        if let Err(source) = transformed.validate(&state.content) {
            return Err(SequencerError::Rejected {
                id: transformed.id,
                source,
            });
        }
        transformed
            .apply(&mut state.content)
            .map_err(|source| SequencerError::Rejected {
                id: transformed.id.clone(),
                source,
            })?;

        state.revision += 1;
        state.log.push_back(transformed.clone());
        while state.log.len() > self.max_log {
            state.log.pop_front();
            state.floor += 1;
        }

        tracing::debug!(
            document = %id,
            revision = state.revision,
            op = %transformed.id,
            "operation sequenced"
        );
        Ok(CanonicalOp {
            op: transformed,
            revision: state.revision,
        })
    }

    fn doc(&self, id: &DocumentId) -> Result<Arc<DocumentLog>, SequencerError> {
        self.docs()
            .get(id)
            .cloned()
            .ok_or_else(|| SequencerError::DocumentUnknown(id.clone()))
    }

    fn docs(&self) -> MutexGuard<'_, BTreeMap<DocumentId, Arc<DocumentLog>>> {
        self.docs.lock().expect("document map lock poisoned")
    }
}

impl DocumentLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().expect("document log lock poisoned")
    }
}
