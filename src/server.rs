// SPDX-License-Identifier: AGPL-3.0-or-later

//! The edit server core: owns the authoritative history, the document bytes,
//! and one shadow per connection. Submission handling is synchronous and
//! I/O-free; functions here *calculate* what to send, and the daemon does
//! the sending. That keeps the critical section (validate, pull, rebase,
//! append, apply) trivially atomic and the whole protocol testable without
//! sockets.

use crate::history::History;
use crate::ot::Op;
use crate::shadow::Shadow;
use crate::types::{Edit, EditId, EditorId, ProtocolError, SERVER};
use crate::wire::{ClientMessage, Submission};
use std::collections::HashMap;
use tracing::debug;

/// What a processed submission asks the daemon to do. The accept goes to the
/// author in every case, even when nothing was committed; the author needs
/// it to retire its in-flight record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    /// Client-scoped submission seq to echo back as `a:<seq>`.
    pub accepted: usize,
    /// Server seq and operation to broadcast as `x:<seq>:<op>` to every
    /// other connection; `None` when the submission was dropped (dirty
    /// shadow) or annulled.
    pub committed: Option<(usize, Op)>,
}

pub struct EditServer {
    history: History,
    text: Vec<u8>,
    shadows: HashMap<EditorId, Shadow>,
}

impl EditServer {
    #[must_use]
    pub fn new(initial_text: &[u8]) -> Self {
        Self {
            history: History::new(initial_text),
            text: initial_text.to_vec(),
            shadows: HashMap::new(),
        }
    }

    #[must_use]
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// The seq of the newest history edit.
    #[must_use]
    pub fn latest_seq(&self) -> usize {
        self.history.last_id().seq
    }

    #[must_use]
    pub fn shadow(&self, editor: EditorId) -> Option<&Shadow> {
        self.shadows.get(&editor)
    }

    /// Register a connection and return the negotiation snapshot: the latest
    /// history seq and the current document.
    pub fn connect(&mut self, editor: EditorId) -> (usize, Vec<u8>) {
        self.shadows.insert(editor, Shadow::new(self.history.last_id()));
        (self.latest_seq(), self.text.clone())
    }

    pub fn disconnect(&mut self, editor: EditorId) {
        self.shadows.remove(&editor);
    }

    /// Process one streaming line from a client. `Ok(None)` means the line
    /// needed no response (currently only the reserved `k:` message).
    pub fn handle_line(
        &mut self,
        editor: EditorId,
        line: &[u8],
    ) -> Result<Option<SubmissionOutcome>, ProtocolError> {
        match ClientMessage::parse(line)? {
            ClientMessage::Submit(submission) => self.submit(editor, submission).map(Some),
            ClientMessage::Ack { seq } => {
                debug!("ignoring reserved acknowledgement of {seq} from {editor}");
                Ok(None)
            }
        }
    }

    /// Handle one submission: validate its parent, fold new history into the
    /// shadow, run the double rebase, and commit the result.
    pub fn submit(
        &mut self,
        editor: EditorId,
        submission: Submission,
    ) -> Result<SubmissionOutcome, ProtocolError> {
        let edit_id = EditId::new(submission.seq, editor);
        let edit = Edit {
            op: submission.op,
            id: edit_id,
            parent: submission.parent,
            submitted: edit_id,
        };

        if edit.parent.editor == SERVER {
            if edit.parent.seq >= self.history.len() {
                return Err(ProtocolError::BadParent(format!(
                    "parent {} is not in the history",
                    edit.parent
                )));
            }
            // Basing on the server history starts a new stream; any previous
            // shadow for this connection is superseded.
            self.shadows.insert(editor, Shadow::new(edit.parent));
        } else if edit.parent.editor == editor {
            let shadow = self.shadows.get(&editor).ok_or_else(|| {
                ProtocolError::BadParent(format!("no active stream for editor {editor}"))
            })?;
            // A dirty shadow accepts any claimed parent, since the
            // submission is dropped without side effects anyway.
            if !shadow.is_dirty() && shadow.last_submission_id() != Some(edit.parent) {
                return Err(ProtocolError::BadParent(format!(
                    "parent {} is not the latest submission",
                    edit.parent
                )));
            }
        } else {
            return Err(ProtocolError::BadParent(format!(
                "parent editor {} is neither the server nor editor {editor}",
                edit.parent.editor
            )));
        }

        let shadow = self
            .shadows
            .get_mut(&editor)
            .expect("shadow exists after parent validation");
        let new_edits = self.history.since(shadow.last_known_seq());
        let accepted = edit.id.seq;
        let Some(op) = shadow.new_submission(edit, new_edits) else {
            debug!("submission {accepted} from {editor} dropped");
            return Ok(SubmissionOutcome {
                accepted,
                committed: None,
            });
        };

        // The rebased operation is in history coordinates now; anything that
        // still falls outside the document means the client lied about its
        // parent frame.
        if !op.fits(self.text.len()) {
            return Err(ProtocolError::BadParent(format!(
                "rebased operation {op:?} does not fit a document of {} bytes",
                self.text.len()
            )));
        }

        let appended = self.history.append(op.clone(), edit_id);
        let seq = appended.id.seq;
        self.text = op.apply(&self.text);
        debug!("committed {} as {}", edit_id, appended.id);
        Ok(SubmissionOutcome {
            accepted,
            committed: Some((seq, op)),
        })
    }
}
