// SPDX-License-Identifier: AGPL-3.0-or-later

//! The operation algebra: two operation variants and the pure functions
//! `apply`, `after`, `inverse`, plus the `conflicts` predicate. Everything
//! here is stateless; the shadow and server layers drive it.
//!
//! Two simultaneous edits x and y (both based on a) are non-conflicting if
//! the following sequences produce the same document, i.e. they can be
//! applied in either order:
//!
//! ```text
//!     a - x - y(x)  ==  a - y - x(y)
//! ```
//!
//! where `y(x)` is `y.after(&x)`. The transform tables below resolve the
//! conflicting pairs as best as possible, because one client's edits are
//! routinely replayed after another's simultaneous edits.

use thiserror::Error;

/// Returned by [`Op::inverse`] for a deletion that did not record the bytes
/// it removed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("non-invertible delete")]
pub struct NonInvertible;

/// A single transformation of a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Splice `text` in at `idx`. Requires `idx <= doc.len()` at apply time.
    Insert { idx: usize, text: Vec<u8> },
    /// Remove `nchars` bytes starting at `idx`. Requires
    /// `idx + nchars <= doc.len()` at apply time.
    ///
    /// `recovered` holds the removed bytes when the deletion was produced by
    /// inverting an insert; without them the deletion cannot be inverted.
    /// Deletions that come out of a conflicting transform lose their
    /// recovered text, since the bytes they would restore no longer exist.
    Delete {
        idx: usize,
        nchars: usize,
        recovered: Option<Vec<u8>>,
    },
}

impl Op {
    /// Apply this operation to a document.
    ///
    /// # Panics
    ///
    /// Panics if the operation does not fit the document; callers check
    /// [`Op::fits`] on untrusted input first.
    #[must_use]
    pub fn apply(&self, doc: &[u8]) -> Vec<u8> {
        match self {
            Self::Insert { idx, text } => {
                assert!(
                    *idx <= doc.len(),
                    "insert at {idx} exceeds document length {}",
                    doc.len()
                );
                let mut out = Vec::with_capacity(doc.len() + text.len());
                out.extend_from_slice(&doc[..*idx]);
                out.extend_from_slice(text);
                out.extend_from_slice(&doc[*idx..]);
                out
            }
            Self::Delete { idx, nchars, .. } => {
                assert!(
                    idx + nchars <= doc.len(),
                    "delete of {nchars} at {idx} exceeds document length {}",
                    doc.len()
                );
                let mut out = Vec::with_capacity(doc.len() - nchars);
                out.extend_from_slice(&doc[..*idx]);
                out.extend_from_slice(&doc[idx + nchars..]);
                out
            }
        }
    }

    /// Whether this operation is applicable to a document of length `len`.
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        match self {
            Self::Insert { idx, .. } => *idx <= len,
            Self::Delete { idx, nchars, .. } => idx + nchars <= len,
        }
    }

    /// Return the operation that cancels this one, if applied directly after
    /// it. Inverses are one-sided: `A - x - ~x == A` holds, but applying `x`
    /// after `~x` is undefined.
    pub fn inverse(&self) -> Result<Self, NonInvertible> {
        match self {
            Self::Insert { idx, text } => Ok(Self::Delete {
                idx: *idx,
                nchars: text.len(),
                recovered: Some(text.clone()),
            }),
            Self::Delete {
                idx,
                recovered: Some(text),
                ..
            } => Ok(Self::Insert {
                idx: *idx,
                text: text.clone(),
            }),
            Self::Delete {
                recovered: None, ..
            } => Err(NonInvertible),
        }
    }

    /// Return what this operation looks like when applied after `other`,
    /// with both originally based on the same document. All offsets in
    /// `other` are against the shared pre-`other` coordinate space.
    ///
    /// `None` means the operation is annulled: `other` already deleted
    /// everything this deletion would have removed. Annulment only happens
    /// on conflicting pairs; for a non-conflicting pair the result is always
    /// `Some`.
    #[must_use]
    pub fn after(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Insert { idx, text }, Self::Insert { idx: j, text: u }) => {
                if *j > *idx {
                    // other inserts after us
                    Some(self.clone())
                } else {
                    // A tied position is a conflict; the later insert goes to
                    // the right of the earlier one either way.
                    Some(Self::Insert {
                        idx: idx + u.len(),
                        text: text.clone(),
                    })
                }
            }
            (Self::Insert { idx, text }, Self::Delete { idx: j, nchars: m, .. }) => {
                if *j > *idx {
                    // deletion is after us
                    Some(self.clone())
                } else if j + m < *idx {
                    // deletion is before us, no overlap
                    Some(Self::Insert {
                        idx: idx - m,
                        text: text.clone(),
                    })
                } else {
                    // The deletion covers or touches our position; the insert
                    // survives, collapsed to the deletion site.
                    Some(Self::Insert {
                        idx: *j,
                        text: text.clone(),
                    })
                }
            }
            (
                Self::Delete {
                    idx,
                    nchars,
                    recovered,
                },
                Self::Insert { idx: j, text: u },
            ) => {
                if *j > idx + nchars {
                    // other inserts after us, no overlap
                    Some(self.clone())
                } else if *j <= *idx {
                    // Inserts before our range shift us; an insert exactly at
                    // our left edge is left standing (conflict, but the range
                    // we delete is unchanged).
                    Some(Self::Delete {
                        idx: idx + u.len(),
                        nchars: *nchars,
                        recovered: recovered.clone(),
                    })
                } else if *j == idx + nchars {
                    // insert at our right edge is left standing
                    Some(self.clone())
                } else {
                    // Insert into the middle of the section we hoped to
                    // delete; widen to delete it too.
                    Some(Self::Delete {
                        idx: *idx,
                        nchars: nchars + u.len(),
                        recovered: None,
                    })
                }
            }
            (
                Self::Delete {
                    idx,
                    nchars,
                    recovered,
                },
                Self::Delete {
                    idx: j, nchars: m, ..
                },
            ) => {
                let (i, n) = (*idx, *nchars);
                let (j, m) = (*j, *m);
                if j >= i + n {
                    // disjoint on the right
                    Some(self.clone())
                } else if j + m <= i {
                    // disjoint on the left
                    Some(Self::Delete {
                        idx: i - m,
                        nchars: n,
                        recovered: recovered.clone(),
                    })
                } else if j <= i && j + m >= i + n {
                    // other already deleted everything we would
                    None
                } else if j <= i {
                    // partial overlap from the left
                    let overlap = m - (i - j);
                    Some(Self::Delete {
                        idx: j,
                        nchars: n - overlap,
                        recovered: None,
                    })
                } else if j + m > i + n {
                    // partial overlap from the right
                    Some(Self::Delete {
                        idx: i,
                        nchars: j - i,
                        recovered: None,
                    })
                } else {
                    // other deletion contained within ours
                    Some(Self::Delete {
                        idx: i,
                        nchars: n - m,
                        recovered: None,
                    })
                }
            }
        }
    }

    /// Whether applying `self` then `other` would produce a different
    /// document than the reverse order, or the transform would be lossy.
    ///
    /// Deletions with touching endpoints commute in document outcome, but
    /// their inverses do not; they count as conflicts so that shadows can
    /// protect invertibility.
    #[must_use]
    pub fn conflicts(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Insert { idx: a, .. }, Self::Insert { idx: b, .. }) => a == b,
            (
                Self::Delete {
                    idx: a, nchars: n, ..
                },
                Self::Delete {
                    idx: b, nchars: m, ..
                },
            ) => {
                let (first, first_len, second) = if a <= b { (*a, *n, *b) } else { (*b, *m, *a) };
                first + first_len >= second
            }
            (Self::Insert { idx: i, .. }, Self::Delete { idx: d, nchars: n, .. })
            | (Self::Delete { idx: d, nchars: n, .. }, Self::Insert { idx: i, .. }) => {
                *i >= *d && *i <= d + n
            }
        }
    }
}
