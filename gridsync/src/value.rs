//! Cell values and document snapshots.
//!
//! Every document in a table collection — a field definition, a record,
//! a view — is a flat map from attribute id to [`CellValue`]. Record
//! documents key their map by field id; field and view documents use
//! well-known attribute names (`"name"`, `"type"`, ...).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which schema role a collection's documents play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Field definition documents (`fld_<table>`)
    Field,
    /// Record documents (`rec_<table>`)
    Record,
    /// View documents (`viw_<table>`)
    View,
}

impl CollectionKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CollectionKind::Field => "fld",
            CollectionKind::Record => "rec",
            CollectionKind::View => "viw",
        }
    }
}

/// A logical namespace of documents: a role prefix plus the owning table.
///
/// Rendered on the wire and in storage keys as `"<prefix>_<table_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collection {
    pub kind: CollectionKind,
    pub table_id: String,
}

impl Collection {
    pub fn fields(table_id: impl Into<String>) -> Self {
        Self { kind: CollectionKind::Field, table_id: table_id.into() }
    }

    pub fn records(table_id: impl Into<String>) -> Self {
        Self { kind: CollectionKind::Record, table_id: table_id.into() }
    }

    pub fn views(table_id: impl Into<String>) -> Self {
        Self { kind: CollectionKind::View, table_id: table_id.into() }
    }

    /// Parse the `"<prefix>_<table_id>"` form.
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, table_id) = name.split_once('_')?;
        if table_id.is_empty() {
            return None;
        }
        let kind = match prefix {
            "fld" => CollectionKind::Field,
            "rec" => CollectionKind::Record,
            "viw" => CollectionKind::View,
            _ => return None,
        };
        Some(Self { kind, table_id: table_id.to_string() })
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.prefix(), self.table_id)
    }
}

/// A single cell or attribute value.
///
/// Closed set: the transform engine only ever has to reason about
/// scalars and ordered lists, so richer field types are flattened to
/// these variants before they reach the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Ordered structure — multi-selects, link arrays, attachment lists.
    List(Vec<CellValue>),
}

impl CellValue {
    /// Whether this value is an ordered structure.
    pub fn is_list(&self) -> bool {
        matches!(self, CellValue::List(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

/// The snapshot payload of one document: attribute id → value.
///
/// BTreeMap keeps attribute order deterministic so replaying the same
/// op-log always yields byte-identical encoded snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocData {
    pub fields: BTreeMap<String, CellValue>,
}

impl DocData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an iterator of (attribute, value) pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<CellValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, attr: &str) -> Option<&CellValue> {
        self.fields.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: CellValue) {
        self.fields.insert(attr.into(), value);
    }

    pub fn remove(&mut self, attr: &str) -> Option<CellValue> {
        self.fields.remove(attr)
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.fields.contains_key(attr)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}
