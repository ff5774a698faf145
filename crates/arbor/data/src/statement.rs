use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row: column name to JSON value
pub type Row = BTreeMap<String, serde_json::Value>;

/// A typed statement against a keyed table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// Create the table if it does not exist
    EnsureTable { table: String },
    /// Insert or replace the row stored under `key`
    Upsert { table: String, key: String, row: Row },
    /// Fetch the row stored under `key`
    Get { table: String, key: String },
    /// Fetch every row, ordered by key
    Scan { table: String },
    /// Remove the row stored under `key`
    Delete { table: String, key: String },
}

impl Statement {
    pub fn ensure_table(table: impl Into<String>) -> Self {
        Statement::EnsureTable {
            table: table.into(),
        }
    }

    pub fn upsert(table: impl Into<String>, key: impl Into<String>, row: Row) -> Self {
        Statement::Upsert {
            table: table.into(),
            key: key.into(),
            row,
        }
    }

    pub fn get(table: impl Into<String>, key: impl Into<String>) -> Self {
        Statement::Get {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn scan(table: impl Into<String>) -> Self {
        Statement::Scan {
            table: table.into(),
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Statement::Delete {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::EnsureTable { table }
            | Statement::Upsert { table, .. }
            | Statement::Get { table, .. }
            | Statement::Scan { table }
            | Statement::Delete { table, .. } => table,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::EnsureTable { .. } | Statement::Upsert { .. } | Statement::Delete { .. }
        )
    }
}

/// Result of a statement
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    pub rows: Vec<Row>,
    pub affected: u64,
}

impl RecordSet {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self { rows, affected: 0 }
    }

    pub fn affected(affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected,
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
