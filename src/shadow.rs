// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-connection shadow history. The server keeps one shadow per client so
//! that submissions based on the client's own in-flight edits can be rebased
//! onto the authoritative history, and vice versa.
//!
//! The client's submissions apply *before* any external edit in the shadow's
//! frame, while the real history interleaves them. Both orderings produce
//! the same document:
//!
//! ```text
//!     a - b - x' - c - d - y' - e    real history, client edits applied
//!                                    as they arrived, rebased
//!
//!     a - x - y - b' - c' - d' - e   shadow frame: client edits unmodified,
//!              \                     external edits rebased after them
//!               z
//! ```
//!
//! When submission z (based on y) arrives, z is rebased one-onto-many across
//! the tail `b' - c' - d' - e` to get the form that applies to the real
//! history, and the tail is simultaneously rebased many-onto-one onto z so
//! the invariant holds for the next submission:
//!
//! ```text
//!     a - b - x' - c - d - y' - e - z'       real history
//!
//!     a - x - y - z - b'' - c'' - d'' - e'   shadow frame
//! ```
//!
//! If z conflicts with a tail element, z still lands best-effort (the
//! transform tables resolve the collision), but the shadow turns dirty:
//! every later submission is dropped until the client starts over with a
//! parent on the server history.

use crate::ot::Op;
use crate::types::{Edit, EditId, EditMod};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug)]
pub struct Shadow {
    /// Once set, no further submissions are accepted on this shadow.
    dirty: bool,
    /// The newest server edit this shadow has pulled into its frame.
    last_known_id: EditId,
    /// Client submissions in the form they were received, oldest first.
    submissions: Vec<Edit>,
    submission_ids: HashSet<EditId>,
    /// External edits after the last submission, each rebased to apply
    /// after all of `submissions`.
    tail: Vec<EditMod>,
}

impl Shadow {
    #[must_use]
    pub fn new(base_id: EditId) -> Self {
        Self {
            dirty: false,
            last_known_id: base_id,
            submissions: Vec::new(),
            submission_ids: HashSet::new(),
            tail: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn last_known_seq(&self) -> usize {
        self.last_known_id.seq
    }

    /// The id a chained submission must name as its parent.
    #[must_use]
    pub fn last_submission_id(&self) -> Option<EditId> {
        self.submissions.last().map(|edit| edit.id)
    }

    #[must_use]
    pub fn submissions(&self) -> &[Edit] {
        &self.submissions
    }

    #[must_use]
    pub fn tail(&self) -> &[EditMod] {
        &self.tail
    }

    /// Fold the server edits since `last_known_id` into the shadow, store
    /// the submission, and return the form of its operation that applies to
    /// the tip of the authoritative history.
    ///
    /// `None` means nothing is to be appended: either the shadow was already
    /// dirty (the submission is consumed and dropped), or the operation was
    /// annulled during the rebase.
    pub fn new_submission(&mut self, edit: Edit, new_edits: &[Edit]) -> Option<Op> {
        if let Some(newest) = new_edits.last() {
            self.last_known_id = newest.id;
        }

        if self.dirty {
            debug!("shadow for {} is dirty, dropping submission {}", edit.id.editor, edit.id);
            return None;
        }

        // The rebased form of our own latest acked submission shows up as
        // the first new server edit; it is already accounted for in
        // `submissions` and must not enter the tail.
        let external = match new_edits.first() {
            Some(first) if self.submission_ids.contains(&first.submitted) => &new_edits[1..],
            _ => new_edits,
        };
        self.tail.extend(external.iter().map(|e| EditMod {
            op: e.op.clone(),
            origin: e.id,
        }));

        // Double rebase: commute the submission past each tail element
        // (one-onto-many) while rebasing the tail onto it (many-onto-one).
        // After the first conflict the tail is left alone; the submission
        // keeps transforming so that whatever we commit fits the history.
        let mut x = Some(edit.op.clone());
        for t in &mut self.tail {
            let Some(cur) = x.take() else {
                break;
            };
            if cur.conflicts(&t.op) {
                debug!("submission {} conflicts with server edit {}", edit.id, t.origin);
                self.dirty = true;
            }
            let next = cur.after(&t.op);
            if !self.dirty {
                t.op = t
                    .op
                    .after(&cur)
                    .expect("non-conflicting transform cannot annul");
            }
            x = next;
        }

        if !self.dirty {
            self.submission_ids.insert(edit.id);
            self.submissions.push(edit);
        }
        x
    }
}
