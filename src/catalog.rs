//! Table schema and the sort-key expression boundary.

use std::fmt::Write;

use crate::block::Block;
use crate::error::{StorageResult, TracedStorageError};
use crate::types::DataType;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCatalog {
    pub name: String,
    pub datatype: DataType,
}

impl ColumnCatalog {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            datatype,
        }
    }
}

/// Schema of the single table an engine instance stores.
#[derive(Clone)]
pub struct TableSchema {
    pub columns: Vec<ColumnCatalog>,
    /// The partitioning date column; must be of type `UInt16`.
    pub date_column: String,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnCatalog>, date_column: impl Into<String>) -> StorageResult<Self> {
        let date_column = date_column.into();
        let schema = Self {
            columns,
            date_column,
        };
        match schema.column(&schema.date_column) {
            Some(c) if c.datatype == DataType::UInt16 => Ok(schema),
            Some(c) => Err(TracedStorageError::logical(format!(
                "date column {} must be UInt16, got {:?}",
                c.name, c.datatype
            ))),
            None => Err(TracedStorageError::logical(format!(
                "date column {} not in schema",
                schema.date_column
            ))),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnCatalog> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Validates an incoming block: every schema column present with the
    /// right type, and nothing else.
    pub fn check_block(&self, block: &Block) -> StorageResult<()> {
        for catalog in &self.columns {
            match block.by_name(&catalog.name) {
                Some(array) if array.data_type() == catalog.datatype => {}
                Some(array) => {
                    return Err(TracedStorageError::logical(format!(
                        "column {} has type {:?}, expected {:?}",
                        catalog.name,
                        array.data_type(),
                        catalog.datatype
                    )))
                }
                None => {
                    return Err(TracedStorageError::logical(format!(
                        "column {} missing from block",
                        catalog.name
                    )))
                }
            }
        }
        if block.column_count() != self.columns.len() {
            return Err(TracedStorageError::logical(
                "block has columns not in the table schema",
            ));
        }
        Ok(())
    }
}

/// The pre-built sort-key expression the engine consumes.
///
/// `execute` may add computed columns to a block; `sample_columns` names the
/// key columns (in sort order) and their types, which is what the primary
/// index stores at every mark.
pub trait KeyExpression: Send + Sync {
    fn execute(&self, block: &mut Block) -> StorageResult<()>;
    fn sample_columns(&self) -> &[ColumnCatalog];
}

/// A key expression that sorts by existing columns, computing nothing.
pub struct ColumnKeyExpression {
    columns: Vec<ColumnCatalog>,
}

impl ColumnKeyExpression {
    pub fn new(columns: Vec<ColumnCatalog>) -> Self {
        Self { columns }
    }
}

impl KeyExpression for ColumnKeyExpression {
    fn execute(&self, block: &mut Block) -> StorageResult<()> {
        for catalog in &self.columns {
            if block.by_name(&catalog.name).is_none() {
                return Err(TracedStorageError::logical(format!(
                    "sort key column {} missing from block",
                    catalog.name
                )));
            }
        }
        Ok(())
    }

    fn sample_columns(&self) -> &[ColumnCatalog] {
        &self.columns
    }
}

/// Escapes a column name for use as a file name stem. Alphanumerics and
/// underscores pass through; everything else becomes `%XX`.
pub fn escape_for_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            out.push(byte as char);
        } else {
            write!(out, "%{byte:02X}").unwrap();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_for_file_name() {
        assert_eq!(escape_for_file_name("visits_count"), "visits_count");
        assert_eq!(escape_for_file_name("a.b/c"), "a%2Eb%2Fc");
    }

    #[test]
    fn test_schema_requires_u16_date() {
        assert!(TableSchema::new(
            vec![ColumnCatalog::new("d", DataType::Int32)],
            "d"
        )
        .is_err());
        assert!(TableSchema::new(
            vec![ColumnCatalog::new("d", DataType::UInt16)],
            "d"
        )
        .is_ok());
    }
}
