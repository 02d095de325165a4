// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Blocks of named columns.
//!
//! A [`Block`] is the unit of data exchanged with the engine: an ordered
//! list of equally-sized named columns. Ingest splits and sorts blocks;
//! readers and merge streams emit them.

use crate::array::ArrayImpl;
use crate::error::{StorageResult, TracedStorageError};
use crate::types::{DataValue, Row};

#[derive(Debug, Clone)]
pub struct NamedColumn {
    pub name: String,
    pub array: ArrayImpl,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    columns: Vec<NamedColumn>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: impl IntoIterator<Item = (String, ArrayImpl)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, array)| NamedColumn { name, array })
                .collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(|c| c.array.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[NamedColumn] {
        &self.columns
    }

    pub fn by_name(&self, name: &str) -> Option<&ArrayImpl> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.array)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Appends a column. The column must match the block height.
    pub fn insert(&mut self, name: impl Into<String>, array: ArrayImpl) -> StorageResult<()> {
        let name = name.into();
        if !self.columns.is_empty() && array.len() != self.rows() {
            return Err(TracedStorageError::logical(format!(
                "column {} has {} rows, block has {}",
                name,
                array.len(),
                self.rows()
            )));
        }
        if self.contains(&name) {
            return Err(TracedStorageError::logical(format!(
                "duplicate column {name}"
            )));
        }
        self.columns.push(NamedColumn { name, array });
        Ok(())
    }

    /// The same columns, all empty.
    pub fn clone_empty(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| NamedColumn {
                    name: c.name.clone(),
                    array: ArrayImpl::new(&c.array.data_type()),
                })
                .collect(),
        }
    }

    /// Copies row `idx` of `src` onto the end of this block. Both blocks
    /// must have the same column layout.
    pub fn push_row_from(&mut self, src: &Block, idx: usize) {
        for (dst, src) in self.columns.iter_mut().zip(src.columns.iter()) {
            dst.array.push(src.array.get(idx));
        }
    }

    /// Appends one row given as a value per column, in column order.
    pub fn push_row(&mut self, values: &[DataValue]) {
        for (column, value) in self.columns.iter_mut().zip(values.iter()) {
            column.array.push(value.clone());
        }
    }

    /// The values of the named columns at row `idx`.
    pub fn row_key(&self, key_indices: &[usize], idx: usize) -> Row {
        key_indices
            .iter()
            .map(|&col| self.columns[col].array.get(idx))
            .collect()
    }

    pub fn column_indices(&self, names: &[String]) -> StorageResult<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| {
                        TracedStorageError::logical(format!("column {name} not found in block"))
                    })
            })
            .collect()
    }
}

/// Stable-sorts a block by the given key columns, ascending.
pub fn sort_block(block: &mut Block, sort_columns: &[String]) -> StorageResult<()> {
    let key_indices = block.column_indices(sort_columns)?;
    let mut perm: Vec<usize> = (0..block.rows()).collect();
    perm.sort_by(|&a, &b| {
        key_indices
            .iter()
            .map(|&col| {
                let array = &block.columns()[col].array;
                array.get(a).cmp(&array.get(b))
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for column in &mut block.columns {
        column.array = column.array.take(&perm);
    }
    Ok(())
}
