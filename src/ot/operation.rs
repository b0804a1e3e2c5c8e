//! Edit operations and the transformation algebra they satisfy.
//!
//! An [`Operation`] is the unit of history, transform, and transport. Every
//! variant implements `apply`, `transform`, and `inverse`; `transform` is the
//! function that lets two concurrent operations commute, and the author-id
//! tie-break is what makes the outcome identical on every replica.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies an author across the whole system. Ordering on the inner
/// string is the conflict tie-break, so it must be total and stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique operation identifier: monotone sequence within an author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub author: UserId,
    pub seq: u64,
}

impl OperationId {
    pub fn new(author: UserId, seq: u64) -> Self {
        Self { author, seq }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.author, self.seq)
    }
}

impl FromStr for OperationId {
    type Err = OtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (author, seq) = s
            .rsplit_once('#')
            .ok_or_else(|| OtError::Malformed(format!("operation id missing '#': {s:?}")))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|e| OtError::Malformed(format!("operation id sequence: {e}")))?;
        Ok(Self::new(UserId::new(author), seq))
    }
}

/// Where an operation came from, for undo/redo bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
    LocalUndo,
    LocalRedo,
    System,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("operation out of range: position {position} length {length} in {doc_len}-byte document")]
    OutOfRange {
        position: usize,
        length: usize,
        doc_len: usize,
    },

    #[error("cannot invert a delete that has never been applied")]
    MissingDeletedText,

    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// The edit payload, in the self-describing wire shape
/// `{ "type": "insert" | "delete" | "composite", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpKind {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        length: usize,
        /// Captured on first apply so the inverse is total.
        #[serde(rename = "text", default, skip_serializing_if = "Option::is_none")]
        deleted_text: Option<String>,
    },
    Composite {
        children: Vec<OpKind>,
    },
}

impl OpKind {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        OpKind::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        OpKind::Delete {
            position,
            length,
            deleted_text: None,
        }
    }

    pub fn composite(children: Vec<OpKind>) -> Self {
        OpKind::Composite { children }
    }

    /// True if applying the operation can never change any document.
    pub fn is_noop(&self) -> bool {
        match self {
            OpKind::Insert { text, .. } => text.is_empty(),
            OpKind::Delete { length, .. } => *length == 0,
            OpKind::Composite { children } => children.iter().all(OpKind::is_noop),
        }
    }

    /// Apply the operation to `content` in place.
    ///
    /// Deletes capture the removed bytes on their first successful apply.
    /// A composite applies all of its children or none of them.
    pub fn apply(&mut self, content: &mut String) -> Result<(), OtError> {
        match self {
            OpKind::Insert { position, text } => {
                if *position > content.len() || !content.is_char_boundary(*position) {
                    return Err(OtError::OutOfRange {
                        position: *position,
                        length: 0,
                        doc_len: content.len(),
                    });
                }
                content.insert_str(*position, text);
                Ok(())
            }
            OpKind::Delete {
                position,
                length,
                deleted_text,
            } => {
                let end = position.checked_add(*length).filter(|e| *e <= content.len());
                let in_bounds = end.is_some_and(|e| {
                    content.is_char_boundary(*position) && content.is_char_boundary(e)
                });
                if !in_bounds {
                    return Err(OtError::OutOfRange {
                        position: *position,
                        length: *length,
                        doc_len: content.len(),
                    });
                }
                let end = *position + *length;
                if deleted_text.is_none() {
                    *deleted_text = Some(content[*position..end].to_string());
                }
                content.replace_range(*position..end, "");
                Ok(())
            }
            OpKind::Composite { children } => {
                let mut scratch = content.clone();
                let mut staged = children.clone();
                for child in &mut staged {
                    child.apply(&mut scratch)?;
                }
                *children = staged;
                *content = scratch;
                Ok(())
            }
        }
    }

    /// Bounds-check without mutating the target document.
    pub fn validate(&self, content: &str) -> Result<(), OtError> {
        let mut scratch = content.to_string();
        self.clone().apply(&mut scratch)
    }

    /// The operation that exactly undoes this one.
    pub fn inverse(&self) -> Result<OpKind, OtError> {
        match self {
            OpKind::Insert { position, text } => Ok(OpKind::Delete {
                position: *position,
                length: text.len(),
                deleted_text: Some(text.clone()),
            }),
            OpKind::Delete {
                deleted_text: None, ..
            } => Err(OtError::MissingDeletedText),
            OpKind::Delete {
                position,
                deleted_text: Some(text),
                ..
            } => Ok(OpKind::Insert {
                position: *position,
                text: text.clone(),
            }),
            OpKind::Composite { children } => {
                let inverted = children
                    .iter()
                    .rev()
                    .map(OpKind::inverse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(OpKind::Composite { children: inverted })
            }
        }
    }

    /// Transform `self` so it applies after `other`, where both were created
    /// against the same document state. `self_author` and `other_author`
    /// break position ties deterministically.
    pub fn transform_against(
        &self,
        self_author: &UserId,
        other: &OpKind,
        other_author: &UserId,
    ) -> OpKind {
        match (self, other) {
            // A composite transforms child by child; each child's own effect
            // shifts how the concurrent operation meets the next child.
            (OpKind::Composite { children }, _) => {
                let mut concurrent = other.clone();
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    out.push(child.transform_against(self_author, &concurrent, other_author));
                    concurrent = concurrent.transform_against(other_author, child, self_author);
                }
                OpKind::Composite { children: out }
            }
            // Transforming against a composite folds through its children
            // left-to-right, matching their application order.
            (_, OpKind::Composite { children }) => {
                let mut current = self.clone();
                for child in children {
                    current = current.transform_against(self_author, child, other_author);
                }
                current
            }
            (
                OpKind::Insert { position, text },
                OpKind::Insert {
                    position: other_pos,
                    text: other_text,
                },
            ) => {
                let shifted = *other_pos < *position
                    || (*other_pos == *position && other_author < self_author);
                OpKind::Insert {
                    position: if shifted {
                        position + other_text.len()
                    } else {
                        *position
                    },
                    text: text.clone(),
                }
            }
            (
                OpKind::Insert { position, text },
                OpKind::Delete {
                    position: del_pos,
                    length: del_len,
                    ..
                },
            ) => {
                let del_end = del_pos + del_len;
                let position = if del_end <= *position {
                    position - del_len
                } else if *del_pos >= *position {
                    *position
                } else {
                    // The deletion straddles the insert point: relocate the
                    // insert to the start of the deleted span.
                    *del_pos
                };
                OpKind::Insert {
                    position,
                    text: text.clone(),
                }
            }
            (
                OpKind::Delete {
                    position,
                    length,
                    deleted_text,
                },
                OpKind::Insert {
                    position: ins_pos,
                    text: ins_text,
                },
            ) => {
                if *ins_pos <= *position {
                    OpKind::Delete {
                        position: position + ins_text.len(),
                        length: *length,
                        deleted_text: deleted_text.clone(),
                    }
                } else if *ins_pos < position + length {
                    // The insert landed inside the deleted span: split the
                    // delete around it so the concurrently inserted text
                    // survives. A single grown delete would swallow text the
                    // other author just typed and breaks convergence when the
                    // two operations are sequenced the other way around.
                    let head_len = ins_pos - position;
                    let tail_len = position + length - ins_pos;
                    let head = OpKind::Delete {
                        position: *position,
                        length: head_len,
                        deleted_text: slice_text(deleted_text.as_deref(), 0, head_len),
                    };
                    let tail = OpKind::Delete {
                        position: position + ins_text.len(),
                        length: tail_len,
                        deleted_text: slice_text(deleted_text.as_deref(), head_len, *length),
                    };
                    OpKind::Composite {
                        children: vec![head, tail],
                    }
                } else {
                    self.clone()
                }
            }
            (
                OpKind::Delete {
                    position,
                    length,
                    deleted_text,
                },
                OpKind::Delete {
                    position: other_pos,
                    length: other_len,
                    ..
                },
            ) => {
                let (start, end) = (*position, position + length);
                let (other_start, other_end) = (*other_pos, other_pos + other_len);
                if other_end <= start {
                    OpKind::Delete {
                        position: start - other_len,
                        length: *length,
                        deleted_text: deleted_text.clone(),
                    }
                } else if other_start >= end {
                    self.clone()
                } else if other_start <= start && other_end >= end {
                    // Entirely subsumed. Keep a zero-length marker so inverses
                    // in the surrounding history stay aligned.
                    OpKind::Delete {
                        position: other_start,
                        length: 0,
                        deleted_text: Some(String::new()),
                    }
                } else if other_start <= start {
                    // Overlaps our prefix; the suffix survives.
                    let survived = end - other_end;
                    OpKind::Delete {
                        position: other_start,
                        length: survived,
                        deleted_text: slice_text(deleted_text.as_deref(), other_end - start, *length),
                    }
                } else if other_end >= end {
                    // Overlaps our suffix; the prefix survives.
                    let survived = other_start - start;
                    OpKind::Delete {
                        position: start,
                        length: survived,
                        deleted_text: slice_text(deleted_text.as_deref(), 0, survived),
                    }
                } else {
                    // Carved out of our middle.
                    let text = deleted_text.as_deref().and_then(|t| {
                        let head = t.get(..other_start - start)?;
                        let tail = t.get(other_end - start..)?;
                        Some(format!("{head}{tail}"))
                    });
                    OpKind::Delete {
                        position: start,
                        length: length - other_len,
                        deleted_text: text,
                    }
                }
            }
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).expect("operation serialization is infallible")
    }

    pub fn from_wire(raw: &str) -> Result<OpKind, OtError> {
        serde_json::from_str(raw).map_err(|e| OtError::Malformed(e.to_string()))
    }
}

fn slice_text(text: Option<&str>, from: usize, to: usize) -> Option<String> {
    text.and_then(|t| t.get(from..to)).map(str::to_string)
}

/// An edit plus the metadata the engine needs: identity, provenance, and
/// the undo linkage. Immutable after construction except for the
/// deleted-text capture on first apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub id: OperationId,
    pub related: Option<OperationId>,
    pub origin: Origin,
}

impl Operation {
    pub fn new(kind: OpKind, id: OperationId, origin: Origin) -> Self {
        Self {
            kind,
            id,
            related: None,
            origin,
        }
    }

    pub fn with_related(mut self, related: OperationId) -> Self {
        self.related = Some(related);
        self
    }

    pub fn author(&self) -> &UserId {
        &self.id.author
    }

    pub fn apply(&mut self, content: &mut String) -> Result<(), OtError> {
        self.kind.apply(content)
    }

    pub fn validate(&self, content: &str) -> Result<(), OtError> {
        self.kind.validate(content)
    }

    pub fn transform(&self, against: &Operation) -> Operation {
        Operation {
            kind: self
                .kind
                .transform_against(self.author(), &against.kind, against.author()),
            id: self.id.clone(),
            related: self.related.clone(),
            origin: self.origin,
        }
    }

    /// The inverse operation, linked back to this one via `related`.
    pub fn inverse(&self) -> Result<Operation, OtError> {
        Ok(Operation {
            kind: self.kind.inverse()?,
            id: self.id.clone(),
            related: Some(self.id.clone()),
            origin: self.origin,
        })
    }
}
