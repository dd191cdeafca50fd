//! Applier configuration
//!
//! A single JSON file. Every optional field has a serde default so a minimal
//! config only names the server and its tables:
//!
//! ```json
//! {
//!   "server_id": 1,
//!   "role": "primary",
//!   "tables": [
//!     { "name": "t1", "conflict_function": "NDB$EPOCH_TRANS()", "exceptions_table": "default" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conflict::{ApplyError, ApplyResult, ConflictRole, TableDef, TableRegistry};

/// Configuration of one applier context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Server id of this cluster (required, non-zero)
    pub server_id: u32,

    /// Conflict role (optional, default "none")
    #[serde(default)]
    pub role: ConflictRole,

    /// Operations defined before an automatic flush (optional, default 64)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per epoch on temporary errors, used by drivers (optional, default 10)
    #[serde(default = "default_transaction_retries")]
    pub transaction_retries: u32,

    /// Replicated tables and their conflict handling
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

fn default_batch_size() -> usize {
    64
}
fn default_transaction_retries() -> u32 {
    10
}

impl ApplierConfig {
    /// Config with defaults for everything but the server id.
    pub fn new(server_id: u32) -> Self {
        Self {
            server_id,
            role: ConflictRole::default(),
            batch_size: default_batch_size(),
            transaction_retries: default_transaction_retries(),
            tables: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: ConflictRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> ApplyResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ApplyError::configuration(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(content: &str) -> ApplyResult<Self> {
        let config: ApplierConfig = serde_json::from_str(content)
            .map_err(|e| ApplyError::configuration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ApplyResult<()> {
        if self.server_id == 0 {
            return Err(ApplyError::configuration("server_id must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ApplyError::configuration("batch_size must be > 0"));
        }

        let names: HashSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        for table in &self.tables {
            if let Some(exceptions) = table.exceptions_table_name() {
                if names.contains(exceptions.as_str()) {
                    return Err(ApplyError::configuration(format!(
                        "exceptions table '{}' of '{}' is also a replicated table",
                        exceptions, table.name
                    )));
                }
            }
        }

        // Per-table checks and duplicate names.
        self.registry().map(|_| ())
    }

    /// Build the table registry.
    pub fn registry(&self) -> ApplyResult<TableRegistry> {
        TableRegistry::from_defs(&self.tables)
    }
}
