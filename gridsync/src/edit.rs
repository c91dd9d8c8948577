//! Atomic edit primitives and operation envelopes.
//!
//! An operation carries one or more edits against a single document,
//! authored against a known base version. Edits form a closed set so the
//! transform engine can define a rule for every ordered pair — see
//! [`crate::transform`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{CellValue, Collection, DocData};

/// One atomic change to a document snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Edit {
    /// Set (or create) a scalar field value.
    SetField { field_id: String, value: CellValue },
    /// Insert an element into an ordered list field at `index`.
    InsertElement {
        field_id: String,
        index: usize,
        value: CellValue,
    },
    /// Delete the element at `index` from an ordered list field.
    DeleteElement { field_id: String, index: usize },
    /// Replace the whole document snapshot. Also the creation primitive:
    /// a base-version-0 operation starting with `Replace` creates the doc.
    Replace { data: DocData },
}

impl Edit {
    /// The field this edit touches, if it targets a single field.
    pub fn field_id(&self) -> Option<&str> {
        match self {
            Edit::SetField { field_id, .. }
            | Edit::InsertElement { field_id, .. }
            | Edit::DeleteElement { field_id, .. } => Some(field_id),
            Edit::Replace { .. } => None,
        }
    }

    /// Whether this edit is positional (index-addressed).
    pub fn is_positional(&self) -> bool {
        matches!(
            self,
            Edit::InsertElement { .. } | Edit::DeleteElement { .. }
        )
    }
}

/// Errors raised while applying an edit to a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// Positional edit addressed an index past the end of the list.
    IndexOutOfRange {
        field_id: String,
        index: usize,
        len: usize,
    },
    /// Positional edit targeted a field that holds a scalar.
    NotAList { field_id: String },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::IndexOutOfRange { field_id, index, len } => {
                write!(f, "index {index} out of range for field '{field_id}' (len {len})")
            }
            ApplyError::NotAList { field_id } => {
                write!(f, "field '{field_id}' is not an ordered list")
            }
        }
    }
}

impl std::error::Error for ApplyError {}

/// Apply a single edit to a snapshot in place.
pub fn apply_edit(data: &mut DocData, edit: &Edit) -> Result<(), ApplyError> {
    match edit {
        Edit::SetField { field_id, value } => {
            data.set(field_id.clone(), value.clone());
            Ok(())
        }
        Edit::InsertElement { field_id, index, value } => {
            let list = list_mut(data, field_id, true)?;
            if *index > list.len() {
                return Err(ApplyError::IndexOutOfRange {
                    field_id: field_id.clone(),
                    index: *index,
                    len: list.len(),
                });
            }
            list.insert(*index, value.clone());
            Ok(())
        }
        Edit::DeleteElement { field_id, index } => {
            let list = list_mut(data, field_id, false)?;
            if *index >= list.len() {
                return Err(ApplyError::IndexOutOfRange {
                    field_id: field_id.clone(),
                    index: *index,
                    len: list.len(),
                });
            }
            list.remove(*index);
            Ok(())
        }
        Edit::Replace { data: new_data } => {
            *data = new_data.clone();
            Ok(())
        }
    }
}

/// Get the list behind a field, optionally creating an empty one.
fn list_mut<'a>(
    data: &'a mut DocData,
    field_id: &str,
    create: bool,
) -> Result<&'a mut Vec<CellValue>, ApplyError> {
    if !data.contains(field_id) {
        if create {
            data.set(field_id.to_string(), CellValue::List(Vec::new()));
        } else {
            return Err(ApplyError::IndexOutOfRange {
                field_id: field_id.to_string(),
                index: 0,
                len: 0,
            });
        }
    }
    match data.fields.get_mut(field_id) {
        Some(CellValue::List(list)) => Ok(list),
        _ => Err(ApplyError::NotAList { field_id: field_id.to_string() }),
    }
}

/// A client-submitted operation against one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-assigned id; the store uses it for idempotent replay.
    pub op_id: Uuid,
    pub collection: Collection,
    pub doc_id: String,
    /// Document version this operation was authored against.
    pub base_version: u64,
    /// Authoring session, stamped by the server at receipt.
    pub session_id: Uuid,
    pub edits: Vec<Edit>,
}

impl Operation {
    pub fn new(
        collection: Collection,
        doc_id: impl Into<String>,
        base_version: u64,
        session_id: Uuid,
        edits: Vec<Edit>,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            collection,
            doc_id: doc_id.into(),
            base_version,
            session_id,
            edits,
        }
    }

    /// Whether this operation may create its target document.
    pub fn is_creation(&self) -> bool {
        self.base_version == 0 && matches!(self.edits.first(), Some(Edit::Replace { .. }))
    }
}

/// An operation the store has accepted, with its assigned position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOp {
    pub op: Operation,
    /// The version the document reached by applying this op.
    pub version: u64,
    /// Server-global sequence number; the scalar tie-break authority.
    pub sequence: u64,
}
