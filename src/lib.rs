// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! A log-structured, month-partitioned columnar table engine.
//!
//! Rows live in immutable on-disk *parts*, each a directory of per-column
//! compressed data files plus mark files and a primary index, sorted by a
//! user-defined key and confined to one calendar month. Writes append new
//! level-0 parts; a background pool continuously merges adjacent runs of
//! parts into larger ones, optionally collapsing sign-paired rows. Reads
//! prune down to the parts and index granules that can satisfy the
//! predicate, then stream only the requested columns.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mergetree::*;
//! # async fn demo() -> StorageResult<()> {
//! let calendar = Arc::new(Calendar::new());
//! let schema = TableSchema::new(
//!     vec![
//!         ColumnCatalog::new("date", DataType::UInt16),
//!         ColumnCatalog::new("visits", DataType::Int64),
//!     ],
//!     "date",
//! )?;
//! let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
//!     "visits",
//!     DataType::Int64,
//! )]));
//! let storage = MergeTreeStorage::open(
//!     StorageOptions::default_for_test("./visits.db"),
//!     schema,
//!     key,
//!     calendar,
//! )
//! .await?;
//! storage.merge(0, true).await;
//! # Ok(())
//! # }
//! ```

mod array;
mod block;
mod calendar;
mod catalog;
mod compress;
mod error;
mod increment;
mod merge;
mod merged_writer;
mod options;
mod part;
mod part_reader;
mod part_set;
mod part_writer;
mod pruner;
mod storage;
mod types;

#[cfg(test)]
mod tests;

pub use array::{ArrayImpl, ListArray};
pub use block::{sort_block, Block, NamedColumn};
pub use calendar::Calendar;
pub use catalog::{
    escape_for_file_name, ColumnCatalog, ColumnKeyExpression, KeyExpression, TableSchema,
};
pub use error::{StorageError, StorageResult, TracedStorageError};
pub use options::StorageOptions;
pub use part::{Part, PartRef, MARK_SIZE};
pub use part_reader::PartReader;
pub use pruner::{AlwaysTrue, KeyCondition, KeyRange, PartRange};
pub use storage::{BlockSink, MergeTreeStorage, TableStream};
pub use types::{DataType, DataValue, Row, F64};
