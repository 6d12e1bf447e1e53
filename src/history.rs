// SPDX-License-Identifier: AGPL-3.0-or-later

//! The authoritative history: an append-only sequence of edits, indexed by
//! their server sequence number. Index 0 is a no-op sentinel that is its own
//! parent; if the server starts with initial content, index 1 inserts it.

use crate::ot::Op;
use crate::types::{Edit, EditId};

#[derive(Debug)]
pub struct History {
    edits: Vec<Edit>,
}

impl History {
    #[must_use]
    pub fn new(initial_text: &[u8]) -> Self {
        let base_id = EditId::server(0);
        let sentinel = Edit {
            op: Op::Insert {
                idx: 0,
                text: vec![],
            },
            id: base_id,
            parent: base_id,
            submitted: base_id,
        };
        let mut history = Self {
            edits: vec![sentinel],
        };
        if !initial_text.is_empty() {
            history.append(
                Op::Insert {
                    idx: 0,
                    text: initial_text.to_vec(),
                },
                EditId::server(1),
            );
        }
        history
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// The id of the newest edit.
    #[must_use]
    pub fn last_id(&self) -> EditId {
        self.edits
            .last()
            .expect("history always contains the sentinel")
            .id
    }

    #[must_use]
    pub fn get(&self, seq: usize) -> Option<&Edit> {
        self.edits.get(seq)
    }

    /// All edits strictly newer than `seq`, oldest first.
    #[must_use]
    pub fn since(&self, seq: usize) -> &[Edit] {
        &self.edits[seq + 1..]
    }

    /// Append a server-space operation, recording the client edit it
    /// linearizes, and return the new edit.
    pub fn append(&mut self, op: Op, submitted: EditId) -> &Edit {
        let id = EditId::server(self.edits.len());
        let edit = Edit {
            op,
            id,
            parent: self.last_id(),
            submitted,
        };
        self.edits.push(edit);
        self.edits.last().expect("edit was just pushed")
    }
}
