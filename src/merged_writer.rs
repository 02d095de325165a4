// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Streaming part writer.
//!
//! Writes one new part from a sequence of blocks that are already sorted by
//! the primary key and confined to one month. Column streams stay open for
//! the life of the writer; `finish` closes them, checks the part is not
//! empty and atomically publishes the directory by renaming `tmp_<name>` to
//! `<name>`.
//!
//! Marks are aligned globally: one mark every `index_granularity` rows
//! counted across all blocks, so `index_offset` tracks how far into the next
//! block the next mark lands. Ingest writes a single pre-sorted block, which
//! makes it the `index_offset == 0` special case of the same writer.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::block::Block;
use crate::catalog::{escape_for_file_name, ColumnCatalog};
use crate::compress::CompressedWriter;
use crate::error::{StorageResult, TracedStorageError};
use crate::types::{DataType, DataValue};

struct ColumnStream {
    compressed: CompressedWriter,
    marks: BufWriter<File>,
    /// Cumulative element count within the current granule; size streams
    /// only. Reset at every mark so a mark is a self-contained seek point.
    granule_count: u64,
}

impl ColumnStream {
    fn create(dir: &Path, stem: &str, compress_block_size: usize) -> StorageResult<Self> {
        let compressed =
            CompressedWriter::create(dir.join(format!("{stem}.bin")), compress_block_size)?;
        let marks = BufWriter::new(
            File::options()
                .write(true)
                .create_new(true)
                .open(dir.join(format!("{stem}.mrk")))?,
        );
        Ok(Self {
            compressed,
            marks,
            granule_count: 0,
        })
    }

    fn write_mark(&mut self) -> StorageResult<()> {
        self.marks
            .write_all(&self.compressed.count().to_le_bytes())?;
        self.marks
            .write_all(&self.compressed.offset().to_le_bytes())?;
        self.granule_count = 0;
        Ok(())
    }
}

/// Names the streams one column decomposes into: one size stream per array
/// nesting level, then the value stream. Yields `(stream_key, file_stem)`.
pub(crate) fn stream_names(name: &str, datatype: &DataType) -> Vec<(String, String)> {
    let escaped = escape_for_file_name(name);
    let mut names = vec![];
    let mut level = 0;
    let mut ty = datatype;
    while let Some(nested) = ty.nested_type() {
        names.push((
            format!("{name}.size{level}"),
            format!("{escaped}.size{level}"),
        ));
        ty = nested;
        level += 1;
    }
    names.push((name.to_string(), escaped));
    names
}

pub struct MergedPartWriter {
    part_name: String,
    tmp_path: PathBuf,
    res_path: PathBuf,
    columns: Vec<ColumnCatalog>,
    sample_columns: Vec<ColumnCatalog>,
    granularity: usize,
    index: BufWriter<File>,
    streams: BTreeMap<String, ColumnStream>,
    marks_count: usize,
    rows_written: usize,
    scratch: Vec<u8>,
}

impl MergedPartWriter {
    pub fn create(
        root: &Path,
        part_name: &str,
        columns: &[ColumnCatalog],
        sample_columns: &[ColumnCatalog],
        granularity: usize,
        compress_block_size: usize,
    ) -> StorageResult<Self> {
        let tmp_path = root.join(format!("tmp_{part_name}"));
        let res_path = root.join(part_name);
        // A leftover of an earlier failed attempt at the same part.
        if tmp_path.exists() {
            std::fs::remove_dir_all(&tmp_path)?;
        }
        std::fs::create_dir_all(&tmp_path)?;

        let index = BufWriter::new(
            File::options()
                .write(true)
                .create_new(true)
                .open(tmp_path.join("primary.idx"))?,
        );

        let mut streams = BTreeMap::new();
        for catalog in columns {
            for (stream, stem) in stream_names(&catalog.name, &catalog.datatype) {
                streams.insert(
                    stream,
                    ColumnStream::create(&tmp_path, &stem, compress_block_size)?,
                );
            }
        }

        Ok(Self {
            part_name: part_name.to_string(),
            tmp_path,
            res_path,
            columns: columns.to_vec(),
            sample_columns: sample_columns.to_vec(),
            granularity,
            index,
            streams,
            marks_count: 0,
            rows_written: 0,
            scratch: vec![],
        })
    }

    /// Rows into the next block at which the next mark lands.
    fn index_offset(&self) -> usize {
        match self.rows_written % self.granularity {
            0 => 0,
            rem => self.granularity - rem,
        }
    }

    pub fn marks_count(&self) -> usize {
        self.marks_count
    }

    pub fn write_block(&mut self, block: &Block) -> StorageResult<()> {
        let rows = block.rows();
        let first_mark_row = self.index_offset();

        // The index holds the key-column values at every mark row.
        let sample_columns = self.sample_columns.clone();
        let mut row = first_mark_row;
        while row < rows {
            for catalog in &sample_columns {
                let array = block.by_name(&catalog.name).ok_or_else(|| {
                    TracedStorageError::logical(format!(
                        "sort key column {} missing from block",
                        catalog.name
                    ))
                })?;
                self.scratch.clear();
                catalog
                    .datatype
                    .serialize_value(&array.get(row), &mut self.scratch);
                self.index.write_all(&self.scratch)?;
            }
            self.marks_count += 1;
            row += self.granularity;
        }

        let columns = self.columns.clone();
        for catalog in &columns {
            let array = block.by_name(&catalog.name).ok_or_else(|| {
                TracedStorageError::logical(format!("column {} missing from block", catalog.name))
            })?;
            for i in 0..rows {
                if i >= first_mark_row && (i - first_mark_row) % self.granularity == 0 {
                    for (stream, _) in stream_names(&catalog.name, &catalog.datatype) {
                        self.streams.get_mut(&stream).unwrap().write_mark()?;
                    }
                }
                self.write_value(&catalog.name, &catalog.datatype, array.get(i), 0)?;
            }
        }

        self.rows_written += rows;
        Ok(())
    }

    fn write_value(
        &mut self,
        name: &str,
        datatype: &DataType,
        value: DataValue,
        level: usize,
    ) -> StorageResult<()> {
        match (datatype, value) {
            (DataType::Array(nested), DataValue::Array(elems)) => {
                {
                    let sizes = self
                        .streams
                        .get_mut(&format!("{name}.size{level}"))
                        .unwrap();
                    sizes.granule_count += elems.len() as u64;
                    let count = sizes.granule_count;
                    sizes.compressed.write_all(&count.to_le_bytes())?;
                }
                for elem in elems {
                    self.write_value(name, nested, elem, level + 1)?;
                }
            }
            (datatype, value) => {
                self.scratch.clear();
                datatype.serialize_value(&value, &mut self.scratch);
                let stream = self.streams.get_mut(name).unwrap();
                stream.compressed.write_all(&self.scratch)?;
            }
        }
        Ok(())
    }

    /// Closes every stream and atomically publishes the part directory.
    /// Returns the number of marks written.
    pub fn finish(mut self) -> StorageResult<usize> {
        if self.marks_count == 0 {
            return Err(TracedStorageError::logical("empty part"));
        }

        self.index.flush()?;
        self.index.get_ref().sync_data()?;
        for (_, stream) in std::mem::take(&mut self.streams) {
            let ColumnStream {
                compressed,
                mut marks,
                ..
            } = stream;
            compressed.finish()?;
            marks.flush()?;
            marks.get_ref().sync_data()?;
        }

        std::fs::rename(&self.tmp_path, &self.res_path)?;
        File::open(self.res_path.parent().unwrap())?.sync_data()?;
        trace!(part = %self.part_name, marks = self.marks_count, "wrote part");
        Ok(self.marks_count)
    }
}
