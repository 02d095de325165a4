// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Merge planning and execution.
//!
//! The planner picks a contiguous run of active parts whose sizes satisfy
//! the ratio rule `max / (sum - max) < max_size_ratio_to_merge_parts`,
//! which bounds total merge work to `O(n log n)` regardless of scheduling.
//! Among candidate windows it keeps the maximal-by-inclusion ones and picks
//! the lexicographic minimum of `(max_size, min_size, -length)`: smallest
//! parts first, longest run among equals.
//!
//! Execution streams the sources through a k-way merge (collapsing paired
//! rows when a sign column is configured) into one new part, then swaps the
//! part sets atomically. A failing merge is logged and forgotten; the
//! sources stay active with their merging flag cleared, and a later planner
//! run retries them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use crate::block::Block;
use crate::error::{StorageResult, TracedStorageError};
use crate::merged_writer::MergedPartWriter;
use crate::part::{Part, PartRef};
use crate::part_reader::PartReader;
use crate::storage::StorageInner;
use crate::types::{DataValue, Row};

/// Selects the next window of parts to merge and flips their
/// `currently_merging` flags, all under the active-set lock. Returns `None`
/// when nothing qualifies.
pub(crate) fn select_parts_to_merge(inner: &StorageInner) -> Option<Vec<PartRef>> {
    debug!("selecting parts to merge");
    let options = &inner.options;
    let granularity = options.index_granularity;

    let selected = inner.parts.with_active(|active| {
        let parts: Vec<&PartRef> = active.values().collect();

        let mut min_max = usize::MAX;
        let mut min_min = usize::MAX;
        let mut max_len = 0usize;
        let mut best_begin = 0usize;
        let mut found = false;

        // How many parts, starting at the current one, already fit into a
        // valid window beginning further left. Tracks maximality by
        // inclusion.
        let mut max_count_from_left = 0i64;

        for (i, first_part) in parts.iter().enumerate() {
            max_count_from_left = (max_count_from_left - 1).max(0);

            // The window start must be free and small enough.
            if first_part.is_merging()
                || first_part.size * granularity > options.max_rows_to_merge_parts
            {
                continue;
            }
            if first_part.left_month != first_part.right_month {
                warn!(part = %first_part.name, "part spans more than one month");
                continue;
            }

            // The longest valid window starting here.
            let mut cur_longest_max = usize::MAX;
            let mut cur_longest_min = usize::MAX;
            let mut cur_longest_len = 0usize;

            // The running window, not necessarily valid.
            let mut cur_max = first_part.size;
            let mut cur_min = first_part.size;
            let mut cur_sum = first_part.size;
            let mut cur_len = 1usize;

            let month = first_part.left_month;
            let mut cur_id = first_part.right;

            for last_part in parts.iter().skip(i + 1) {
                if cur_len >= options.max_parts_to_merge_at_once {
                    break;
                }
                if last_part.is_merging()
                    || last_part.size * granularity > options.max_rows_to_merge_parts
                    || last_part.left_month != last_part.right_month
                    || last_part.left_month != month
                {
                    break;
                }
                if last_part.left < cur_id {
                    warn!(part = %last_part.name, "part intersects previous part");
                    break;
                }

                cur_max = cur_max.max(last_part.size);
                cur_min = cur_min.min(last_part.size);
                cur_sum += last_part.size;
                cur_len += 1;
                cur_id = last_part.right;

                if cur_len >= 2
                    && ((cur_max as f64) / (cur_sum - cur_max) as f64)
                        < options.max_size_ratio_to_merge_parts
                {
                    cur_longest_max = cur_max;
                    cur_longest_min = cur_min;
                    cur_longest_len = cur_len;
                }
            }

            // A window shorter than this is covered by one starting earlier.
            if cur_longest_len as i64 > max_count_from_left {
                max_count_from_left = cur_longest_len as i64;

                if !found
                    || (cur_longest_max, cur_longest_min, Reverse(cur_longest_len))
                        < (min_max, min_min, Reverse(max_len))
                {
                    found = true;
                    min_max = cur_longest_max;
                    min_min = cur_longest_min;
                    max_len = cur_longest_len;
                    best_begin = i;
                }
            }
        }

        if !found {
            return None;
        }
        let selected: Vec<PartRef> = parts[best_begin..best_begin + max_len]
            .iter()
            .map(|part| (*part).clone())
            .collect();
        for part in &selected {
            part.set_merging(true);
        }
        Some(selected)
    });

    match &selected {
        Some(parts) => debug!(
            from = %parts.first().unwrap().name,
            to = %parts.last().unwrap().name,
            count = parts.len(),
            "selected parts to merge"
        ),
        None => debug!("no parts to merge"),
    }
    selected
}

/// One merge source: a part reader with the sort-key expression applied to
/// every block it yields.
struct MergeSource {
    reader: PartReader,
    block: Option<Block>,
    row: usize,
    key_indices: Vec<usize>,
}

impl MergeSource {
    fn new(inner: &StorageInner, part: PartRef) -> Self {
        Self {
            reader: PartReader::new(
                part,
                &inner.options.path,
                inner.schema.columns.clone(),
                0,
                usize::MAX,
                inner.options.write_block_size,
                inner.options.index_granularity,
            ),
            block: None,
            row: 0,
            key_indices: vec![],
        }
    }

    /// Makes sure a block with unread rows is buffered. Returns false when
    /// the source is exhausted.
    fn ensure_block(&mut self, inner: &StorageInner) -> StorageResult<bool> {
        loop {
            if let Some(block) = &self.block {
                if self.row < block.rows() {
                    return Ok(true);
                }
            }
            match self.reader.next_block()? {
                Some(mut block) => {
                    inner.key_expr.execute(&mut block)?;
                    let key_names: Vec<String> = inner
                        .key_expr
                        .sample_columns()
                        .iter()
                        .map(|c| c.name.clone())
                        .collect();
                    self.key_indices = block.column_indices(&key_names)?;
                    self.block = Some(block);
                    self.row = 0;
                }
                None => return Ok(false),
            }
        }
    }

    fn key(&self) -> Row {
        self.block
            .as_ref()
            .unwrap()
            .row_key(&self.key_indices, self.row)
    }
}

/// The k-way merge over pre-sorted sources, emitting rows in key order.
struct MergingSortedStream {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<Reverse<(Row, usize)>>,
    primed: bool,
    template: Option<Block>,
}

impl MergingSortedStream {
    fn new(sources: Vec<MergeSource>) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            primed: false,
            template: None,
        }
    }

    fn prime(&mut self, inner: &StorageInner) -> StorageResult<()> {
        for idx in 0..self.sources.len() {
            if self.sources[idx].ensure_block(inner)? {
                if self.template.is_none() {
                    self.template = Some(self.sources[idx].block.as_ref().unwrap().clone_empty());
                }
                self.heap.push(Reverse((self.sources[idx].key(), idx)));
            }
        }
        self.primed = true;
        Ok(())
    }

    /// The source holding the smallest key, or `None` when all sources are
    /// exhausted. The caller consumes the row and calls `advance`.
    fn peek_min(&mut self, inner: &StorageInner) -> StorageResult<Option<usize>> {
        if !self.primed {
            self.prime(inner)?;
        }
        Ok(self.heap.peek().map(|Reverse((_, idx))| *idx))
    }

    fn advance(&mut self, inner: &StorageInner, idx: usize) -> StorageResult<()> {
        self.heap.pop();
        self.sources[idx].row += 1;
        if self.sources[idx].ensure_block(inner)? {
            self.heap.push(Reverse((self.sources[idx].key(), idx)));
        }
        Ok(())
    }

    fn next_block(&mut self, inner: &StorageInner, block_size: usize) -> StorageResult<Option<Block>> {
        let Some(first) = self.peek_min(inner)? else {
            return Ok(None);
        };
        let mut out = self.template.as_ref().unwrap().clone_empty();
        let mut idx = Some(first);
        while out.rows() < block_size {
            let Some(i) = idx else { break };
            let source = &self.sources[i];
            out.push_row_from(source.block.as_ref().unwrap(), source.row);
            self.advance(inner, i)?;
            idx = self.peek_min(inner)?;
        }
        Ok(Some(out))
    }
}

/// Wraps the k-way merge, cancelling adjacent rows that share a primary key
/// and carry opposite signs; equal keys with equal signs keep the first row.
struct CollapsingSortedStream {
    merge: MergingSortedStream,
    sign_column: String,
    sign_index: Option<usize>,
    pending: Option<(Row, Vec<DataValue>, i8)>,
}

impl CollapsingSortedStream {
    fn new(merge: MergingSortedStream, sign_column: String) -> Self {
        Self {
            merge,
            sign_column,
            sign_index: None,
            pending: None,
        }
    }

    fn next_block(
        &mut self,
        inner: &StorageInner,
        block_size: usize,
    ) -> StorageResult<Option<Block>> {
        // Priming peek; also leaves the output template behind.
        if self.merge.peek_min(inner)?.is_none() && self.pending.is_none() {
            return Ok(None);
        }
        let template = self.merge.template.as_ref().unwrap();
        if self.sign_index.is_none() {
            self.sign_index =
                Some(template.column_indices(std::slice::from_ref(&self.sign_column))?[0]);
        }
        let sign_index = self.sign_index.unwrap();

        let mut out = template.clone_empty();
        while out.rows() < block_size {
            let Some(idx) = self.merge.peek_min(inner)? else {
                // Input exhausted; the held-back row survives.
                if let Some((_, values, _)) = self.pending.take() {
                    out.push_row(&values);
                }
                break;
            };

            let source = &self.merge.sources[idx];
            let block = source.block.as_ref().unwrap();
            let key = source.key();
            let sign = match block.columns()[sign_index].array.get(source.row) {
                DataValue::Int8(sign) => sign,
                value => {
                    return Err(TracedStorageError::logical(format!(
                        "sign column {} holds {value:?}, expected Int8",
                        self.sign_column
                    )))
                }
            };
            let values: Vec<DataValue> = block
                .columns()
                .iter()
                .map(|c| c.array.get(source.row))
                .collect();
            self.merge.advance(inner, idx)?;

            match self.pending.take() {
                None => self.pending = Some((key, values, sign)),
                Some((pending_key, pending_values, pending_sign)) => {
                    if pending_key == key {
                        if pending_sign == sign {
                            // Equal keys with equal signs keep the first.
                            self.pending = Some((pending_key, pending_values, pending_sign));
                        }
                        // Opposite signs annihilate: pending stays empty.
                    } else {
                        out.push_row(&pending_values);
                        self.pending = Some((key, values, sign));
                    }
                }
            }
        }

        if out.rows() == 0 {
            return Ok(None);
        }
        Ok(Some(out))
    }
}

/// Merges the selected parts into one new part of level `max + 1` and swaps
/// it into the active set.
pub(crate) fn merge_parts(inner: &StorageInner, parts: &[PartRef]) -> StorageResult<()> {
    debug!(
        count = parts.len(),
        from = %parts.first().unwrap().name,
        to = %parts.last().unwrap().name,
        "merging parts"
    );

    let left_date = parts.iter().map(|p| p.left_date).min().unwrap();
    let right_date = parts.iter().map(|p| p.right_date).max().unwrap();
    let left = parts.first().unwrap().left;
    let right = parts.last().unwrap().right;
    let level = parts.iter().map(|p| p.level).max().unwrap() + 1;
    let name = Part::format_name(&inner.calendar, left_date, right_date, left, right, level);

    let sources = parts
        .iter()
        .map(|part| MergeSource::new(inner, part.clone()))
        .collect_vec();

    let mut writer = MergedPartWriter::create(
        &inner.options.path,
        &name,
        &inner.schema.columns,
        inner.key_expr.sample_columns(),
        inner.options.index_granularity,
        inner.options.compress_block_size,
    )?;

    let block_size = inner.options.write_block_size;
    let merge = MergingSortedStream::new(sources);
    match inner.options.sign_column.clone() {
        Some(sign_column) => {
            let mut stream = CollapsingSortedStream::new(merge, sign_column);
            while let Some(block) = stream.next_block(inner, block_size)? {
                writer.write_block(&block)?;
            }
        }
        None => {
            let mut merge = merge;
            while let Some(block) = merge.next_block(inner, block_size)? {
                writer.write_block(&block)?;
            }
        }
    }

    let marks = writer.finish()?;
    let merged = Arc::new(Part {
        left_date,
        right_date,
        left_month: inner.calendar.first_day_num_of_month(left_date),
        right_month: inner.calendar.first_day_num_of_month(right_date),
        left,
        right,
        level,
        name: name.clone(),
        size: marks,
        modification_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        currently_merging: Default::default(),
    });

    inner.parts.swap(merged, parts)?;

    info!(
        sources = %parts.iter().map(|p| p.name.as_str()).join(","),
        merged = %name,
        "merge complete"
    );
    Ok(())
}

/// One background merge worker. Every failure is caught and logged: a
/// broken merge must not poison the pool, and the sources stay retryable.
pub(crate) fn merge_worker(inner: &StorageInner, while_can: bool) {
    while let Some(parts) = select_parts_to_merge(inner) {
        if let Err(e) = merge_parts(inner, &parts) {
            error!(error = %e, "merge failed");
            for part in &parts {
                part.set_merging(false);
            }
        }
        if let Err(e) = inner.parts.reclaim(&inner.options.path) {
            error!(error = %e, "reclaiming old parts failed");
        }
        if !while_can {
            break;
        }
    }
}
