//! Row Change Records
//!
//! One `ChangeRecord` describes one row-level change shipped from a peer
//! cluster. Records are built once per row per apply cycle and never mutated.
//!
//! Origin metadata travels with every change in a 32-bit "any value" word
//! plus an optional origin transaction id:
//! - High bit clear: the word is the originating server id
//! - High bit set: the word is one of the reserved operation markers
//!   (reflected, refresh, read)
//!
//! Any other reserved value is a malformed event and stops replication.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{ApplyError, ApplyResult};

/// Reserved bit marking the any-value word as an operation marker.
pub const ANYVALUE_RESERVED: u32 = 0x8000_0000;

/// Operation reflected back by the Primary so the Secondary can detect loss.
pub const ANYVALUE_REFLECT_OP: u32 = 0x8000_0080;

/// Corrective refresh generated by a conflict resolution on the peer.
pub const ANYVALUE_REFRESH_OP: u32 = 0x8000_0100;

/// Row read with an exclusive lock on the peer.
pub const ANYVALUE_READ_OP: u32 = 0x8000_0200;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Signed integer
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Value {
    /// Compare two values of the same type. Mixed types and NULLs are unordered.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Column name to value mapping for one row image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage(BTreeMap<String, Value>);

impl RowImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay every column of `other` onto this image.
    pub fn merge(&mut self, other: &RowImage) {
        for (column, value) in &other.0 {
            self.0.insert(column.clone(), value.clone());
        }
    }
}

/// Primary key image of a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<Value>);

impl RowKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single integer key.
    pub fn int(value: i64) -> Self {
        Self(vec![Value::Int(value)])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// Read-marker: the peer read the row with an exclusive lock.
    Read,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Read => "read",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decoded origin metadata. Every field is optional because older peers
/// ship none of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    /// Originating server id, when the any-value word carried one.
    pub server_id: Option<u32>,
    /// Origin transaction id.
    pub transaction_id: Option<u64>,
    pub is_reflected: Option<bool>,
    pub is_refresh: Option<bool>,
    pub is_read_marker: Option<bool>,
}

impl OriginMetadata {
    /// Decode the any-value word and transaction id carried by a raw event.
    pub fn decode(any_value: Option<u32>, transaction_id: Option<u64>) -> ApplyResult<Self> {
        let mut origin = OriginMetadata {
            transaction_id,
            ..Default::default()
        };

        let Some(word) = any_value else {
            return Ok(origin);
        };

        if word & ANYVALUE_RESERVED == 0 {
            origin.server_id = Some(word);
            return Ok(origin);
        }

        match word {
            ANYVALUE_REFLECT_OP => origin.is_reflected = Some(true),
            ANYVALUE_REFRESH_OP => origin.is_refresh = Some(true),
            ANYVALUE_READ_OP => origin.is_read_marker = Some(true),
            other => {
                return Err(ApplyError::malformed_event(format!(
                    "unknown reserved origin marker {:#010x}",
                    other
                )))
            }
        }

        Ok(origin)
    }

    pub fn reflected(&self) -> bool {
        self.is_reflected.unwrap_or(false)
    }

    pub fn refresh(&self) -> bool {
        self.is_refresh.unwrap_or(false)
    }

    pub fn read_marker(&self) -> bool {
        self.is_read_marker.unwrap_or(false)
    }
}

/// A raw change event as handed over by the replication stream driver,
/// before origin metadata is decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    pub table: String,
    pub kind: OpKind,
    pub key: RowKey,
    #[serde(default)]
    pub before: Option<RowImage>,
    #[serde(default)]
    pub after: Option<RowImage>,
    #[serde(default)]
    pub write_set: Option<Vec<String>>,
    #[serde(default)]
    pub any_value: Option<u32>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
}

/// One row-level change to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    pub kind: OpKind,
    pub key: RowKey,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    /// Columns actually modified.
    pub write_set: Vec<String>,
    pub origin: OriginMetadata,
}

impl ChangeRecord {
    fn new(
        table: impl Into<String>,
        kind: OpKind,
        key: RowKey,
        before: Option<RowImage>,
        after: Option<RowImage>,
    ) -> Self {
        let write_set = after
            .as_ref()
            .or(before.as_ref())
            .map(|image| image.columns().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            table: table.into(),
            kind,
            key,
            before,
            after,
            write_set,
            origin: OriginMetadata::default(),
        }
    }

    pub fn insert(table: impl Into<String>, key: RowKey, after: RowImage) -> Self {
        Self::new(table, OpKind::Insert, key, None, Some(after))
    }

    pub fn update(table: impl Into<String>, key: RowKey, before: RowImage, after: RowImage) -> Self {
        Self::new(table, OpKind::Update, key, Some(before), Some(after))
    }

    pub fn delete(table: impl Into<String>, key: RowKey, before: RowImage) -> Self {
        Self::new(table, OpKind::Delete, key, Some(before), None)
    }

    pub fn read(table: impl Into<String>, key: RowKey, before: RowImage) -> Self {
        Self::new(table, OpKind::Read, key, Some(before), None)
    }

    pub fn with_transaction(mut self, transaction_id: u64) -> Self {
        self.origin.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_write_set(mut self, columns: &[&str]) -> Self {
        self.write_set = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_origin(mut self, origin: OriginMetadata) -> Self {
        self.origin = origin;
        self
    }

    pub fn reflected(mut self) -> Self {
        self.origin.is_reflected = Some(true);
        self
    }

    pub fn refresh(mut self) -> Self {
        self.origin.is_refresh = Some(true);
        self
    }

    pub fn read_marker(mut self) -> Self {
        self.origin.is_read_marker = Some(true);
        self
    }

    /// Decode a raw event. Decode failures are fatal.
    pub fn from_event(event: RawChangeEvent) -> ApplyResult<Self> {
        let origin = OriginMetadata::decode(event.any_value, event.transaction_id)?;
        let mut record = Self::new(event.table, event.kind, event.key, event.before, event.after);
        if let Some(write_set) = event.write_set {
            record.write_set = write_set;
        }
        record.origin = origin;
        record.validate()?;
        Ok(record)
    }

    /// Check image presence against the operation kind.
    pub fn validate(&self) -> ApplyResult<()> {
        match self.kind {
            OpKind::Insert => {
                if self.before.is_some() {
                    return Err(ApplyError::malformed_event(format!(
                        "insert on {}{} carries a before-image",
                        self.table, self.key
                    )));
                }
                if self.after.is_none() {
                    return Err(ApplyError::malformed_event(format!(
                        "insert on {}{} has no after-image",
                        self.table, self.key
                    )));
                }
            }
            OpKind::Update => {
                if self.after.is_none() {
                    return Err(ApplyError::malformed_event(format!(
                        "update on {}{} has no after-image",
                        self.table, self.key
                    )));
                }
            }
            OpKind::Delete | OpKind::Read => {
                if self.after.is_some() {
                    return Err(ApplyError::malformed_event(format!(
                        "{} on {}{} carries an after-image",
                        self.kind, self.table, self.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Operation kind recorded for this change when it conflicts. A change
    /// that originated from an exclusive read is reported as a read.
    pub fn effective_kind(&self) -> OpKind {
        if self.origin.read_marker() {
            OpKind::Read
        } else {
            self.kind
        }
    }
}
