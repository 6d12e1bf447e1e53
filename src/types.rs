// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::ot::Op;
use derive_more::Display;
use thiserror::Error;

/// Numeric identity of one editing party. `0` is the server itself; clients
/// are assigned ids from `1` upwards during negotiation.
pub type EditorId = usize;

/// The reserved editor id of the authoritative history.
pub const SERVER: EditorId = 0;

/// Identity of a single edit: a sequence number scoped to the editor that
/// authored it. `seq` is monotonic within its editor, so the pair is unique
/// server-wide.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{seq}@{editor}")]
pub struct EditId {
    pub seq: usize,
    pub editor: EditorId,
}

impl EditId {
    #[must_use]
    pub fn new(seq: usize, editor: EditorId) -> Self {
        Self { seq, editor }
    }

    /// An id on the authoritative history.
    #[must_use]
    pub fn server(seq: usize) -> Self {
        Self {
            seq,
            editor: SERVER,
        }
    }
}

/// Envelope around one operation, carrying identity and parentage.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub op: Op,
    pub id: EditId,
    pub parent: EditId,
    /// The client-scoped id of the submission this edit linearizes. For
    /// edits the server authors itself (the sentinel and the initial
    /// content), this is the edit's own id. Shadows use it to recognize
    /// their own acknowledged submissions in the history.
    pub submitted: EditId,
}

impl Edit {
    /// The editor that submitted this edit.
    #[must_use]
    pub fn submitter(&self) -> EditorId {
        self.submitted.editor
    }
}

/// A rebased form of a history edit, as tracked in a shadow's tail. The
/// origin is kept as an id rather than a reference; it is only needed for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditMod {
    pub op: Op,
    pub origin: EditId,
}

/// Violations that close the offending connection. `Rejected` is not among
/// them: a rejected submission is a normal outcome and is answered with an
/// accept line like any other. A closed transport is not one either; it
/// surfaces as end-of-stream in the connection tasks.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed line, bad escape, unknown operation type, wrong field count.
    #[error("malformed message: {0}")]
    BadEncoding(String),
    /// Parent out of range, unrecognized parent editor, or a client-claimed
    /// parent that is not the latest submission.
    #[error("bad parent: {0}")]
    BadParent(String),
}

pub mod factories {
    use super::{Edit, EditId, EditorId};
    use crate::ot::Op;

    pub fn insert(idx: usize, text: &str) -> Op {
        Op::Insert {
            idx,
            text: text.as_bytes().to_vec(),
        }
    }

    pub fn delete(idx: usize, nchars: usize) -> Op {
        Op::Delete {
            idx,
            nchars,
            recovered: None,
        }
    }

    pub fn recovered_delete(idx: usize, text: &str) -> Op {
        Op::Delete {
            idx,
            nchars: text.len(),
            recovered: Some(text.as_bytes().to_vec()),
        }
    }

    pub fn edit(op: Op, seq: usize, editor: EditorId, parent: EditId) -> Edit {
        let id = EditId::new(seq, editor);
        Edit {
            op,
            id,
            parent,
            submitted: id,
        }
    }

    /// A history edit at `seq`, linearizing the client edit `submitted`.
    pub fn server_edit(op: Op, seq: usize, submitted: EditId) -> Edit {
        Edit {
            op,
            id: EditId::server(seq),
            parent: EditId::server(seq - 1),
            submitted,
        }
    }
}
