// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Reading one part.
//!
//! A [`PartReader`] opens a part at a given mark and streams blocks of up to
//! `block_size` rows for a subset of columns, until a row limit is
//! exhausted. Column streams open lazily on the first read, so a query that
//! creates many readers but drives few of them keeps few files open.
//!
//! The reader holds a strong reference to the part descriptor: as long as
//! any reader exists, reclamation leaves the part's files alone.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::trace;

use crate::array::ArrayImpl;
use crate::block::Block;
use crate::catalog::{escape_for_file_name, ColumnCatalog};
use crate::compress::CompressedReader;
use crate::error::{StorageError, StorageResult, TracedStorageError};
use crate::merged_writer::stream_names;
use crate::part::{PartRef, MARK_SIZE};
use crate::types::{DataType, DataValue};

struct ReadStream {
    compressed: CompressedReader,
    /// Cumulative element count within the current granule; size streams
    /// only. Reset at every granule boundary, mirroring the writer.
    prev_count: u64,
}

enum Streams {
    /// Not opened yet.
    Pending,
    /// Streams keyed like the writer keys them; columns whose files are
    /// missing from the part have no entry.
    Open(BTreeMap<String, ReadStream>),
    Closed,
}

pub struct PartReader {
    part: PartRef,
    path: PathBuf,
    columns: Vec<ColumnCatalog>,
    first_mark: usize,
    rows_limit: usize,
    rows_read: usize,
    block_size: usize,
    granularity: usize,
    streams: Streams,
}

impl PartReader {
    pub fn new(
        part: PartRef,
        root: &std::path::Path,
        columns: Vec<ColumnCatalog>,
        first_mark: usize,
        rows_limit: usize,
        block_size: usize,
        granularity: usize,
    ) -> Self {
        if first_mark == 0 && rows_limit == usize::MAX {
            trace!(part = %part.name, "reading all rows");
        } else {
            trace!(
                part = %part.name,
                rows = rows_limit,
                from_row = first_mark * granularity,
                "reading range"
            );
        }
        let path = part.path(root);
        Self {
            part,
            path,
            columns,
            first_mark,
            rows_limit,
            rows_read: 0,
            block_size,
            granularity,
            streams: Streams::Pending,
        }
    }

    pub fn part(&self) -> &PartRef {
        &self.part
    }

    /// Opens the streams of every requested column whose files exist,
    /// seeking each to `first_mark`. Columns added to the table after this
    /// part was written have no files here; they read as defaults.
    fn open_streams(&mut self) -> StorageResult<()> {
        let mut streams = BTreeMap::new();
        for catalog in &self.columns {
            let escaped = escape_for_file_name(&catalog.name);
            if !self.path.join(format!("{escaped}.bin")).exists() {
                continue;
            }
            for (stream, stem) in stream_names(&catalog.name, &catalog.datatype) {
                let mut compressed = CompressedReader::open(self.path.join(format!("{stem}.bin")))?;
                if self.first_mark > 0 {
                    let mut marks = File::open(self.path.join(format!("{stem}.mrk")))?;
                    marks.seek(SeekFrom::Start(self.first_mark as u64 * MARK_SIZE))?;
                    let mut record = [0u8; MARK_SIZE as usize];
                    marks.read_exact(&mut record)?;
                    let compressed_offset = u64::from_le_bytes(record[..8].try_into().unwrap());
                    let block_offset = u64::from_le_bytes(record[8..].try_into().unwrap());
                    compressed.seek_to(compressed_offset, block_offset)?;
                }
                streams.insert(
                    stream,
                    ReadStream {
                        compressed,
                        prev_count: 0,
                    },
                );
            }
        }
        self.streams = Streams::Open(streams);
        Ok(())
    }

    /// Next block of up to `block_size` rows, or `None` when the range is
    /// exhausted. Missing columns materialize as default values of the
    /// block's height.
    pub fn next_block(&mut self) -> StorageResult<Option<Block>> {
        if self.rows_read == self.rows_limit || matches!(self.streams, Streams::Closed) {
            return Ok(None);
        }
        if matches!(self.streams, Streams::Pending) {
            self.open_streams()?;
        }
        let Streams::Open(streams) = &mut self.streams else {
            unreachable!()
        };

        let max_rows_to_read = self.block_size.min(self.rows_limit - self.rows_read);
        let base_row = self.first_mark * self.granularity + self.rows_read;

        let mut arrays: Vec<Option<ArrayImpl>> = vec![];
        let mut common_height = None;
        let mut any_present = false;

        for catalog in &self.columns {
            if !streams.contains_key(&catalog.name) {
                arrays.push(None);
                continue;
            }
            any_present = true;

            let row_stream = match &catalog.datatype {
                DataType::Array(_) => format!("{}.size0", catalog.name),
                _ => catalog.name.clone(),
            };
            let mut array = ArrayImpl::new(&catalog.datatype);
            for k in 0..max_rows_to_read {
                if (base_row + k) % self.granularity == 0 {
                    reset_granule(streams, &catalog.name, &catalog.datatype);
                }
                if streams.get_mut(&row_stream).unwrap().compressed.is_eof()? {
                    break;
                }
                array.push(read_value(streams, &catalog.name, &catalog.datatype, 0)?);
            }

            match common_height {
                Some(height) if height != array.len() => {
                    return Err(TracedStorageError::logical(format!(
                        "column {} has {} rows where its part neighbours have {}",
                        catalog.name,
                        array.len(),
                        height
                    )));
                }
                _ => common_height = Some(array.len()),
            }
            arrays.push(Some(array));
        }

        if !any_present {
            return Err(StorageError::AllRequestedColumnsAreMissing.into());
        }

        let height = common_height.unwrap_or(0);
        if height == 0 {
            self.streams = Streams::Closed;
            return Ok(None);
        }

        let mut block = Block::new();
        for (catalog, array) in self.columns.iter().zip(arrays) {
            let array = array.unwrap_or_else(|| default_column(&catalog.datatype, height));
            block.insert(catalog.name.clone(), array)?;
        }

        self.rows_read += height;
        if self.rows_read == self.rows_limit {
            // Close files early, before the reader itself is dropped.
            self.streams = Streams::Closed;
        }
        Ok(Some(block))
    }
}

/// A full column of `height` default values.
fn default_column(datatype: &DataType, height: usize) -> ArrayImpl {
    let mut array = ArrayImpl::new(datatype);
    for _ in 0..height {
        array.push(datatype.default_value());
    }
    array
}

fn reset_granule(streams: &mut BTreeMap<String, ReadStream>, name: &str, datatype: &DataType) {
    let mut level = 0;
    let mut ty = datatype;
    while let Some(nested) = ty.nested_type() {
        if let Some(stream) = streams.get_mut(&format!("{name}.size{level}")) {
            stream.prev_count = 0;
        }
        ty = nested;
        level += 1;
    }
}

fn read_value(
    streams: &mut BTreeMap<String, ReadStream>,
    name: &str,
    datatype: &DataType,
    level: usize,
) -> StorageResult<DataValue> {
    match datatype {
        DataType::Array(nested) => {
            let count = {
                let sizes = streams.get_mut(&format!("{name}.size{level}")).unwrap();
                let mut record = [0u8; 8];
                sizes.compressed.read_exact(&mut record)?;
                let cumulative = u64::from_le_bytes(record);
                let count = cumulative.checked_sub(sizes.prev_count).ok_or_else(|| {
                    TracedStorageError::decode("array size stream went backwards")
                })?;
                sizes.prev_count = cumulative;
                count
            };
            let mut elems = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elems.push(read_value(streams, name, nested, level + 1)?);
            }
            Ok(DataValue::Array(elems))
        }
        scalar => {
            let stream = streams.get_mut(name).unwrap();
            scalar.read_value(&mut stream.compressed)
        }
    }
}
