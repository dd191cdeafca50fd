//! Per-Table Conflict Configuration
//!
//! Each replicated table may name a conflict function, the large-object
//! columns that make forced refresh impossible, and an exceptions table that
//! receives one row per resolved conflict.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::errors::{ApplyError, ApplyResult};
use super::function::ConflictFunction;

/// Reserved bookkeeping table carrying `(server_id, epoch)` apply positions.
pub const APPLY_STATUS_TABLE: &str = "apply_status";

/// Suffix of the default exceptions table name.
pub const EXCEPTIONS_SUFFIX: &str = "$EX";

/// Conflict configuration of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,

    /// Known column names; empty disables column validation.
    #[serde(default)]
    pub columns: Vec<String>,

    /// Large-object columns.
    #[serde(default)]
    pub blob_columns: Vec<String>,

    #[serde(default)]
    pub conflict_function: Option<ConflictFunction>,

    /// Exceptions table; `"default"` expands to `<name>$EX`.
    #[serde(default)]
    pub exceptions_table: Option<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            blob_columns: Vec::new(),
            conflict_function: None,
            exceptions_table: None,
        }
    }

    pub fn with_function(mut self, function: ConflictFunction) -> Self {
        self.conflict_function = Some(function);
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_blob_columns(mut self, columns: &[&str]) -> Self {
        self.blob_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Log conflicts to `<name>$EX`.
    pub fn with_default_exceptions(mut self) -> Self {
        self.exceptions_table = Some(format!("{}{}", self.name, EXCEPTIONS_SUFFIX));
        self
    }

    pub fn has_blobs(&self) -> bool {
        !self.blob_columns.is_empty()
    }

    /// Resolved exceptions table name, if one is configured.
    pub fn exceptions_table_name(&self) -> Option<String> {
        self.exceptions_table.as_ref().map(|name| {
            if name == "default" {
                format!("{}{}", self.name, EXCEPTIONS_SUFFIX)
            } else {
                name.clone()
            }
        })
    }

    /// Validate the definition.
    pub fn validate(&self) -> ApplyResult<()> {
        if self.name.is_empty() {
            return Err(ApplyError::configuration("table name must not be empty"));
        }
        if self.name == APPLY_STATUS_TABLE {
            return Err(ApplyError::configuration(format!(
                "'{}' is a reserved bookkeeping table",
                APPLY_STATUS_TABLE
            )));
        }
        if let Some(exceptions) = self.exceptions_table_name() {
            if exceptions == self.name {
                return Err(ApplyError::configuration(format!(
                    "table '{}' cannot be its own exceptions table",
                    self.name
                )));
            }
        }
        if !self.columns.is_empty() {
            if let Some(column) = self.conflict_function.as_ref().and_then(|f| f.column()) {
                if !self.columns.iter().any(|c| c == column) {
                    return Err(ApplyError::configuration(format!(
                        "conflict function on '{}' names unknown column '{}'",
                        self.name, column
                    )));
                }
            }
            for blob in &self.blob_columns {
                if !self.columns.contains(blob) {
                    return Err(ApplyError::configuration(format!(
                        "table '{}' declares unknown blob column '{}'",
                        self.name, blob
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Table definitions looked up once per change.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableDef>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from definitions, rejecting duplicates and invalid tables.
    pub fn from_defs(defs: &[TableDef]) -> ApplyResult<Self> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def.clone())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, def: TableDef) -> ApplyResult<()> {
        def.validate()?;
        if self.tables.contains_key(&def.name) {
            return Err(ApplyError::configuration(format!(
                "table '{}' is defined twice",
                def.name
            )));
        }
        self.tables.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
