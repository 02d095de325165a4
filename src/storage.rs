// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! The engine façade.
//!
//! [`MergeTreeStorage`] stores one table as an append-only set of immutable
//! month-partitioned parts, merged in the background by a worker pool and
//! pruned at read time down to `(part, mark range)` slices.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use itertools::Itertools;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::block::Block;
use crate::calendar::Calendar;
use crate::catalog::{escape_for_file_name, ColumnCatalog, KeyExpression, TableSchema};
use crate::error::{StorageResult, TracedStorageError};
use crate::merge::merge_worker;
use crate::options::StorageOptions;
use crate::part::{parse_part_name, Part, PartRef, MARK_SIZE};
use crate::part_reader::PartReader;
use crate::part_set::PartSet;
use crate::part_writer::{split_by_month, write_ingest_part};
use crate::pruner::{mark_range_from_key_condition, spread_mark_ranges, KeyCondition, PartRange};
use crate::increment::Increment;
use crate::types::DataValue;

pub(crate) struct StorageInner {
    pub options: Arc<StorageOptions>,
    pub schema: TableSchema,
    pub key_expr: Arc<dyn KeyExpression>,
    pub calendar: Arc<Calendar>,
    pub parts: PartSet,
    pub increment: Increment,
    /// Outstanding background merge tasks, drained on shutdown.
    merge_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Bounds concurrent merge work to `merging_threads`.
    merge_permits: Arc<Semaphore>,
}

/// A month-partitioned columnar table engine.
pub struct MergeTreeStorage {
    inner: Arc<StorageInner>,
}

impl MergeTreeStorage {
    /// Opens (or creates) the engine directory, loads existing parts and
    /// resolves leftover containment between them.
    pub async fn open(
        options: StorageOptions,
        schema: TableSchema,
        key_expr: Arc<dyn KeyExpression>,
        calendar: Arc<Calendar>,
    ) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&options.path).await?;
        let increment = Increment::open(options.path.join("increment.txt"))?;
        let merging_threads = options.merging_threads.max(1);
        let inner = Arc::new(StorageInner {
            options: Arc::new(options),
            schema,
            key_expr,
            calendar,
            parts: PartSet::new(),
            increment,
            merge_tasks: Mutex::new(vec![]),
            merge_permits: Arc::new(Semaphore::new(merging_threads)),
        });

        let loader = inner.clone();
        tokio::task::spawn_blocking(move || load_parts(&loader))
            .await
            .map_err(|e| TracedStorageError::logical(format!("load task panicked: {e}")))??;

        Ok(Self { inner })
    }

    /// An ingest sink bound to this engine.
    pub fn write(&self) -> BlockSink {
        BlockSink {
            inner: self.inner.clone(),
        }
    }

    /// Plans and opens a pruned read: one pull-based stream per worker,
    /// each covering a contiguous run of surviving marks. A stream sees the
    /// parts that were active when `read` was called, even if merges retire
    /// them afterwards.
    pub async fn read(
        &self,
        column_names: &[&str],
        date_condition: &dyn KeyCondition,
        key_condition: &dyn KeyCondition,
        block_size: usize,
        threads: usize,
    ) -> StorageResult<Vec<TableStream>> {
        let inner = &self.inner;
        let columns: Vec<ColumnCatalog> = column_names
            .iter()
            .map(|name| {
                inner.schema.column(name).cloned().ok_or_else(|| {
                    TracedStorageError::logical(format!("no column {name} in table"))
                })
            })
            .try_collect()?;

        let parts: Vec<PartRef> = inner
            .parts
            .snapshot_active()
            .into_iter()
            .filter(|part| {
                date_condition.may_be_true_in_range(
                    &[DataValue::UInt16(part.left_date)],
                    &[DataValue::UInt16(part.right_date)],
                )
            })
            .collect();

        let mut ranges = vec![];
        for part in parts {
            let index_path = part.path(&inner.options.path).join("primary.idx");
            let index_data = tokio::fs::read(index_path).await?;
            if let Some((first_mark, last_mark)) = mark_range_from_key_condition(
                &index_data,
                part.size,
                inner.key_expr.sample_columns(),
                key_condition,
            )? {
                ranges.push(PartRange {
                    part,
                    first_mark,
                    last_mark,
                });
            }
        }

        let sum_marks: usize = ranges.iter().map(|r| r.marks()).sum();
        debug!(
            parts = ranges.len(),
            marks = sum_marks,
            "selected parts and marks to read"
        );
        if sum_marks == 0 {
            return Ok(vec![]);
        }

        // Spread the marks evenly over the workers, in random part order so
        // hot parts do not all land on one worker.
        ranges.shuffle(&mut rand::thread_rng());
        let granularity = inner.options.index_granularity;
        let workers = spread_mark_ranges(
            ranges,
            threads,
            granularity,
            inner.options.min_rows_for_concurrent_read,
        )?;

        Ok(workers
            .into_iter()
            .map(|slices| TableStream {
                readers: slices
                    .into_iter()
                    .map(|slice| {
                        PartReader::new(
                            slice.part,
                            &inner.options.path,
                            columns.clone(),
                            slice.first_mark,
                            slice.marks * granularity,
                            block_size,
                            granularity,
                        )
                    })
                    .collect(),
                current: 0,
            })
            .collect())
    }

    /// Schedules background merge work. `iterations == 0` means every
    /// worker in the pool loops while the planner finds work; otherwise
    /// exactly `iterations` one-shot attempts run. With `wait`, returns
    /// only after the scheduled work finishes.
    pub async fn merge(&self, iterations: usize, wait: bool) {
        schedule_merge(&self.inner, iterations, wait).await;
    }

    /// Deletes parts that were merged away and have no remaining readers.
    /// Returns immediately if another caller is already reclaiming.
    pub fn reclaim(&self) -> StorageResult<usize> {
        self.inner.parts.reclaim(&self.inner.options.path)
    }

    /// Waits for all scheduled merge work to finish.
    pub async fn shutdown(&self) {
        debug!("waiting for merge tasks to finish");
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.inner.merge_tasks.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Joins merge workers, clears both part sets and removes the engine
    /// directory.
    pub async fn drop_storage(self) -> StorageResult<()> {
        self.shutdown().await;
        self.inner.parts.clear();
        tokio::fs::remove_dir_all(&self.inner.options.path).await?;
        Ok(())
    }

    pub fn active_parts(&self) -> Vec<PartRef> {
        self.inner.parts.snapshot_active()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<StorageInner> {
        &self.inner
    }

    pub fn all_parts(&self) -> Vec<PartRef> {
        self.inner.parts.snapshot_all()
    }
}

async fn schedule_merge(inner: &Arc<StorageInner>, iterations: usize, wait: bool) {
    let (count, while_can) = if iterations == 0 {
        (inner.options.merging_threads, true)
    } else {
        (iterations, false)
    };

    let mut handles = vec![];
    for _ in 0..count {
        let inner = inner.clone();
        handles.push(tokio::spawn(async move {
            let _permit = inner
                .merge_permits
                .clone()
                .acquire_owned()
                .await
                .expect("merge semaphore closed");
            let worker = inner.clone();
            let _ = tokio::task::spawn_blocking(move || merge_worker(&worker, while_can)).await;
        }));
    }

    if wait {
        for handle in handles {
            let _ = handle.await;
        }
    } else {
        let mut tasks = inner.merge_tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.extend(handles);
    }
}

/// The ingest sink. Each written block becomes one level-0 part per month
/// it touches, then two asynchronous merge attempts keep the tree compact.
pub struct BlockSink {
    inner: Arc<StorageInner>,
}

impl BlockSink {
    pub async fn write_block(&self, block: Block) -> StorageResult<()> {
        self.inner.schema.check_block(&block)?;
        let buckets = split_by_month(block, &self.inner.schema.date_column, &self.inner.calendar)?;

        for bucket in buckets {
            let part_id = self.inner.increment.next()?;
            let inner = self.inner.clone();
            let part = tokio::task::spawn_blocking(move || {
                write_ingest_part(
                    &inner.options,
                    &inner.calendar,
                    &inner.schema.columns,
                    &inner.key_expr,
                    part_id,
                    bucket,
                )
            })
            .await
            .map_err(|e| TracedStorageError::logical(format!("ingest task panicked: {e}")))??;
            self.inner.parts.publish(part);
        }

        // Two merge attempts per write keep the tree close to compact.
        schedule_merge(&self.inner, 2, false).await;
        Ok(())
    }
}

/// One read worker's stream: its part slices, concatenated.
pub struct TableStream {
    readers: Vec<PartReader>,
    current: usize,
}

impl TableStream {
    pub fn next_block(&mut self) -> StorageResult<Option<Block>> {
        loop {
            if self.current >= self.readers.len() {
                return Ok(None);
            }
            if let Some(block) = self.readers[self.current].next_block()? {
                return Ok(Some(block));
            }
            self.current += 1;
        }
    }
}

/// Startup load: adopt every directory matching the canonical part name,
/// sizing each from its first column's mark file, then drop active parts
/// that a neighbour fully contains (leftovers of merges that finished
/// without completing their swap).
fn load_parts(inner: &StorageInner) -> StorageResult<()> {
    debug!("loading data parts");
    let first_column = escape_for_file_name(&inner.schema.columns[0].name);

    let mut count = 0usize;
    for entry in std::fs::read_dir(&inner.options.path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((left_date, right_date, left, right, level)) =
            parse_part_name(&inner.calendar, &name)
        else {
            continue;
        };

        let marks_file = entry.path().join(format!("{first_column}.mrk"));
        let size = std::fs::metadata(&marks_file)?.len() / MARK_SIZE;
        let modification_time = entry
            .metadata()?
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        inner.parts.publish(Arc::new(Part {
            left_date,
            right_date,
            left_month: inner.calendar.first_day_num_of_month(left_date),
            right_month: inner.calendar.first_day_num_of_month(right_date),
            left,
            right,
            level,
            name,
            size: size as usize,
            modification_time,
            currently_merging: Default::default(),
        }));
        count += 1;
    }

    inner.parts.retire_contained();
    info!(count, "loaded data parts");
    Ok(())
}
