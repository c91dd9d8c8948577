//! Operational transform over the closed edit set.
//!
//! When an operation arrives with a stale base version, every one of its
//! edits is rewritten against every edit of every operation that was
//! committed in between. The table below covers each ordered pair of
//! primitives; anything outside it refuses with `Irreconcilable` instead
//! of guessing author intent.
//!
//! Tie-break policy: the incoming operation always carries a later
//! server sequence than the committed one it transforms against, so
//! scalar `SetField` conflicts resolve last-writer-wins in favor of the
//! incoming edit. Positional edits on the same list are index-shifted;
//! concurrent deletes of the same element collapse to a no-op.

use crate::edit::{CommittedOp, Edit, Operation};

/// Transform failures.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// The pair of edits has no defined rewrite; the author must resend
    /// against the current snapshot.
    Irreconcilable { reason: String },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Irreconcilable { reason } => {
                write!(f, "irreconcilable edits: {reason}")
            }
        }
    }
}

impl std::error::Error for TransformError {}

fn irreconcilable(reason: impl Into<String>) -> TransformError {
    TransformError::Irreconcilable { reason: reason.into() }
}

/// Rewrite `ours` (incoming, later sequence) against `theirs` (already
/// committed). `Ok(None)` means the edit became a no-op.
pub fn transform_edit(ours: &Edit, theirs: &Edit) -> Result<Option<Edit>, TransformError> {
    use Edit::*;

    // Disjoint fields never interact; `Replace` touches every field.
    let same_field = match (ours.field_id(), theirs.field_id()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };

    match (ours, theirs) {
        // Later whole-document replace supersedes anything committed.
        (Replace { .. }, _) => Ok(Some(ours.clone())),

        // A scalar set survives any committed edit: last-writer-wins at
        // field granularity, and a set to a list field overwrites the
        // whole list regardless of committed positional edits.
        (SetField { .. }, _) => Ok(Some(ours.clone())),

        // The document was replaced underneath a positional edit: the
        // index no longer addresses anything the author saw.
        (InsertElement { .. }, Replace { .. }) | (DeleteElement { .. }, Replace { .. }) => {
            Err(irreconcilable("positional edit against replaced document"))
        }

        // The list itself was overwritten by a committed scalar set.
        (InsertElement { field_id, .. }, SetField { .. })
        | (DeleteElement { field_id, .. }, SetField { .. })
            if same_field =>
        {
            Err(irreconcilable(format!(
                "positional edit on field '{field_id}' whose value was replaced"
            )))
        }
        (InsertElement { .. }, SetField { .. }) | (DeleteElement { .. }, SetField { .. }) => {
            Ok(Some(ours.clone()))
        }

        // Insert vs insert: a committed insert at or before our index
        // shifts us right. Ties shift too — committed-first ordering
        // keeps both inserts and is deterministic across replicas.
        (InsertElement { field_id, index, value }, InsertElement { index: their_idx, .. })
            if same_field =>
        {
            let index = if *their_idx <= *index { index + 1 } else { *index };
            Ok(Some(InsertElement {
                field_id: field_id.clone(),
                index,
                value: value.clone(),
            }))
        }

        // Insert vs delete: a committed delete strictly before our index
        // shifts us left.
        (InsertElement { field_id, index, value }, DeleteElement { index: their_idx, .. })
            if same_field =>
        {
            let index = if *their_idx < *index { index - 1 } else { *index };
            Ok(Some(InsertElement {
                field_id: field_id.clone(),
                index,
                value: value.clone(),
            }))
        }

        // Delete vs insert: a committed insert at or before our index
        // shifts us right.
        (DeleteElement { field_id, index }, InsertElement { index: their_idx, .. })
            if same_field =>
        {
            let index = if *their_idx <= *index { index + 1 } else { *index };
            Ok(Some(DeleteElement { field_id: field_id.clone(), index }))
        }

        // Delete vs delete: same element already gone — no-op; an
        // earlier delete shifts us left.
        (DeleteElement { field_id, index }, DeleteElement { index: their_idx, .. })
            if same_field =>
        {
            if *their_idx == *index {
                Ok(None)
            } else if *their_idx < *index {
                Ok(Some(DeleteElement { field_id: field_id.clone(), index: index - 1 }))
            } else {
                Ok(Some(ours.clone()))
            }
        }

        // Positional edits on different fields are independent.
        (InsertElement { .. }, _) | (DeleteElement { .. }, _) => Ok(Some(ours.clone())),
    }
}

/// Rebase an operation over the operations committed since its base
/// version. `missed` must be in ascending version order.
///
/// Returns the operation rewritten to apply at
/// `missed.last().version` (edits that became no-ops are dropped; the
/// operation itself survives even if all of them did, so the author
/// still gets a version acknowledgement).
pub fn transform_operation(
    mut op: Operation,
    missed: &[CommittedOp],
) -> Result<Operation, TransformError> {
    for committed in missed {
        let mut rewritten = Vec::with_capacity(op.edits.len());
        for edit in &op.edits {
            let mut current = Some(edit.clone());
            for their_edit in &committed.op.edits {
                current = match current {
                    Some(e) => transform_edit(&e, their_edit)?,
                    None => None,
                };
            }
            if let Some(e) = current {
                rewritten.push(e);
            }
        }
        op.edits = rewritten;
        op.base_version = committed.version;
    }
    Ok(op)
}
