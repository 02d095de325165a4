// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Ingest path: one incoming block becomes one level-0 part per month.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::array::ArrayImpl;
use crate::block::{sort_block, Block};
use crate::calendar::Calendar;
use crate::catalog::{ColumnCatalog, KeyExpression};
use crate::error::{StorageResult, TracedStorageError};
use crate::merged_writer::MergedPartWriter;
use crate::options::StorageOptions;
use crate::part::{Part, PartRef};

pub(crate) struct BlockWithDateInterval {
    pub block: Block,
    pub min_date: u16,
    pub max_date: u16,
}

/// Splits an incoming block into per-month buckets, computing the date
/// interval of each. The common case of a single month passes the block
/// through without copying rows.
pub(crate) fn split_by_month(
    block: Block,
    date_column: &str,
    calendar: &Calendar,
) -> StorageResult<Vec<BlockWithDateInterval>> {
    let dates = match block.by_name(date_column) {
        Some(ArrayImpl::UInt16(dates)) => dates.clone(),
        Some(_) => {
            return Err(TracedStorageError::logical(format!(
                "date column {date_column} is not UInt16"
            )))
        }
        None => {
            return Err(TracedStorageError::logical(format!(
                "date column {date_column} missing from block"
            )))
        }
    };
    if dates.is_empty() {
        return Ok(vec![]);
    }

    let min_date = *dates.iter().min().unwrap();
    let max_date = *dates.iter().max().unwrap();

    if calendar.first_day_num_of_month(min_date) == calendar.first_day_num_of_month(max_date) {
        return Ok(vec![BlockWithDateInterval {
            block,
            min_date,
            max_date,
        }]);
    }

    let mut buckets: BTreeMap<u16, BlockWithDateInterval> = BTreeMap::new();
    for (row, date) in dates.iter().enumerate() {
        let month = calendar.first_day_num_of_month(*date);
        let bucket = buckets
            .entry(month)
            .or_insert_with(|| BlockWithDateInterval {
                block: block.clone_empty(),
                min_date: u16::MAX,
                max_date: 0,
            });
        bucket.min_date = bucket.min_date.min(*date);
        bucket.max_date = bucket.max_date.max(*date);
        bucket.block.push_row_from(&block, row);
    }
    Ok(buckets.into_values().collect())
}

/// Writes one month bucket as a new level-0 part: evaluates the sort-key
/// expression, sorts by the key, writes the part files and publishes the
/// directory. Returns the descriptor; the caller inserts it into the sets.
pub(crate) fn write_ingest_part(
    options: &StorageOptions,
    calendar: &Calendar,
    columns: &[ColumnCatalog],
    key_expr: &Arc<dyn KeyExpression>,
    part_id: u64,
    bucket: BlockWithDateInterval,
) -> StorageResult<PartRef> {
    let BlockWithDateInterval {
        mut block,
        min_date,
        max_date,
    } = bucket;

    let name = Part::format_name(calendar, min_date, max_date, part_id, part_id, 0);

    trace!(part = %name, "calculating primary expression");
    key_expr.execute(&mut block)?;

    trace!(part = %name, "sorting by primary key");
    let sort_columns: Vec<String> = key_expr
        .sample_columns()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    sort_block(&mut block, &sort_columns)?;

    trace!(part = %name, "writing data");
    let mut writer = MergedPartWriter::create(
        &options.path,
        &name,
        columns,
        key_expr.sample_columns(),
        options.index_granularity,
        options.compress_block_size,
    )?;
    writer.write_block(&block)?;
    let marks = writer.finish()?;

    let month = calendar.first_day_num_of_month(min_date);
    Ok(Arc::new(Part {
        left_date: min_date,
        right_date: max_date,
        left_month: month,
        right_month: calendar.first_day_num_of_month(max_date),
        left: part_id,
        right: part_id,
        level: 0,
        name,
        size: marks,
        modification_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        currently_merging: Default::default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataValue;

    fn test_block(rows: &[(u16, i32)]) -> Block {
        Block::from_columns([
            (
                "date".to_string(),
                ArrayImpl::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            ),
            (
                "v".to_string(),
                ArrayImpl::from(rows.iter().map(|r| r.1).collect::<Vec<_>>()),
            ),
        ])
    }

    #[test]
    fn test_single_month_passthrough() {
        let cal = Calendar::new();
        let jan1 = cal.from_ymd(2024, 1, 1);
        let jan3 = cal.from_ymd(2024, 1, 3);
        let buckets =
            split_by_month(test_block(&[(jan3, 10), (jan1, 30)]), "date", &cal).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].min_date, jan1);
        assert_eq!(buckets[0].max_date, jan3);
        assert_eq!(buckets[0].block.rows(), 2);
    }

    #[test]
    fn test_cross_month_split() {
        let cal = Calendar::new();
        let jan31 = cal.from_ymd(2024, 1, 31);
        let feb1 = cal.from_ymd(2024, 2, 1);
        let buckets =
            split_by_month(test_block(&[(feb1, 2), (jan31, 1)]), "date", &cal).unwrap();
        assert_eq!(buckets.len(), 2);
        // Buckets come out in month order.
        assert_eq!(buckets[0].min_date, jan31);
        assert_eq!(buckets[0].max_date, jan31);
        assert_eq!(buckets[1].min_date, feb1);
        assert_eq!(
            buckets[0].block.by_name("v").unwrap().get(0),
            DataValue::Int32(1)
        );
        assert_eq!(
            buckets[1].block.by_name("v").unwrap().get(0),
            DataValue::Int32(2)
        );
    }

    #[test]
    fn test_empty_block_makes_no_parts() {
        let cal = Calendar::new();
        let buckets = split_by_month(test_block(&[]), "date", &cal).unwrap();
        assert!(buckets.is_empty());
    }
}
