// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! Index-range pruning.
//!
//! Narrows a read plan from "all parts, all marks" to a set of
//! `(part, mark range)` pairs that is guaranteed to contain every matching
//! row, then deals the surviving marks out to read workers.

use itertools::Itertools;

use crate::catalog::ColumnCatalog;
use crate::error::{StorageResult, TracedStorageError};
use crate::part::PartRef;
use crate::types::{DataValue, Row};

/// The predicate abstraction the engine consumes. Conditions are built by
/// the query layer; the engine only ever asks range questions.
///
/// `may_be_true_after` bounds the final index granule, whose keys have no
/// recorded upper neighbour; the default is conservatively true.
pub trait KeyCondition: Send + Sync {
    fn always_true(&self) -> bool;

    /// May the condition hold for some key tuple in `[lo, hi]`?
    fn may_be_true_in_range(&self, lo: &[DataValue], hi: &[DataValue]) -> bool;

    /// May the condition hold for some key tuple `>= lo`?
    fn may_be_true_after(&self, _lo: &[DataValue]) -> bool {
        true
    }
}

pub struct AlwaysTrue;

impl KeyCondition for AlwaysTrue {
    fn always_true(&self) -> bool {
        true
    }

    fn may_be_true_in_range(&self, _lo: &[DataValue], _hi: &[DataValue]) -> bool {
        true
    }
}

/// Inclusive lexicographic tuple range `[min, max]`.
pub struct KeyRange {
    pub min: Row,
    pub max: Row,
}

impl KeyCondition for KeyRange {
    fn always_true(&self) -> bool {
        false
    }

    fn may_be_true_in_range(&self, lo: &[DataValue], hi: &[DataValue]) -> bool {
        !(hi < &self.min[..] || lo > &self.max[..])
    }

    fn may_be_true_after(&self, lo: &[DataValue]) -> bool {
        !(lo > &self.max[..])
    }
}

/// A part together with the inclusive mark interval to read from it.
pub struct PartRange {
    pub part: PartRef,
    pub first_mark: usize,
    pub last_mark: usize,
}

impl PartRange {
    pub fn marks(&self) -> usize {
        self.last_mark - self.first_mark + 1
    }
}

/// Computes the mark interval of one part outside which no key matching the
/// condition can lie. `index_data` is the raw `primary.idx` contents.
/// Returns `None` when the whole part is excluded. The interval may
/// over-approximate, never under-approximate.
pub fn mark_range_from_key_condition(
    index_data: &[u8],
    marks_count: usize,
    sample_columns: &[ColumnCatalog],
    condition: &dyn KeyCondition,
) -> StorageResult<Option<(usize, usize)>> {
    let last_mark_in_file = marks_count.saturating_sub(1);

    if condition.always_true() {
        return Ok(Some((0, last_mark_in_file)));
    }

    let mut min_mark = None;
    let mut max_mark = None;

    let mut buf = index_data;
    let mut prev_key: Option<Row> = None;
    let mut current_mark = 0usize;
    while !buf.is_empty() {
        let key: Row = sample_columns
            .iter()
            .map(|c| c.datatype.deserialize_value(&mut buf))
            .try_collect()?;

        if let Some(prev) = &prev_key {
            if condition.may_be_true_in_range(prev, &key) {
                min_mark.get_or_insert(current_mark - 1);
                max_mark = Some(current_mark - 1);
            }
        }
        prev_key = Some(key);
        current_mark += 1;
    }

    if current_mark != marks_count {
        return Err(TracedStorageError::decode(format!(
            "primary index has {current_mark} entries, expected {marks_count}"
        )));
    }

    // Keys in the final granule have no upper neighbour in the index; it is
    // covered whenever the condition may hold at or above the last key.
    if let Some(last_key) = &prev_key {
        if condition.may_be_true_after(last_key) {
            min_mark.get_or_insert(last_mark_in_file);
            max_mark = Some(last_mark_in_file);
        }
    }

    Ok(min_mark.map(|min| (min, max_mark.unwrap())))
}

/// One contiguous slice of marks a worker reads from one part.
pub struct ReadSlice {
    pub part: PartRef,
    pub first_mark: usize,
    pub marks: usize,
}

/// Deals the surviving marks out to at most `threads` workers, each getting
/// a contiguous run of roughly `sum_marks / threads` marks drawn from the
/// parts in order. A part is split across workers when needed, but never in
/// a way that leaves a residue smaller than `min_rows_for_concurrent_read`.
///
/// The caller shuffles `parts` beforehand so that hot parts spread across
/// workers.
pub fn spread_mark_ranges(
    parts: Vec<PartRange>,
    threads: usize,
    granularity: usize,
    min_rows_for_concurrent_read: usize,
) -> StorageResult<Vec<Vec<ReadSlice>>> {
    let sum_marks: usize = parts.iter().map(|p| p.marks()).sum();
    let mut result = vec![];
    if sum_marks == 0 {
        return Ok(result);
    }

    let effective_threads = threads.min(sum_marks);
    let mut cur_part = 0;
    // Marks already taken from parts[cur_part].
    let mut cur_pos = 0;
    let mut marks_spread = 0;

    for _ in 0..effective_threads {
        if marks_spread >= sum_marks {
            break;
        }
        let mut need_marks =
            ((sum_marks - 1) / effective_threads + 1).min(sum_marks - marks_spread);
        let mut slices = vec![];

        while need_marks > 0 {
            if cur_part >= parts.len() {
                return Err(TracedStorageError::logical(
                    "cannot spread marks among threads",
                ));
            }
            let part = &parts[cur_part];
            let marks_left_in_part = part.marks() - cur_pos;
            if marks_left_in_part == 0 {
                cur_part += 1;
                cur_pos = 0;
                continue;
            }

            let mut marks_to_get = marks_left_in_part.min(need_marks);
            // Do not leave too few rows behind in the part.
            if (marks_left_in_part - marks_to_get) * granularity < min_rows_for_concurrent_read {
                marks_to_get = marks_left_in_part;
            }

            slices.push(ReadSlice {
                part: part.part.clone(),
                first_mark: part.first_mark + cur_pos,
                marks: marks_to_get,
            });

            marks_spread += marks_to_get;
            need_marks = need_marks.saturating_sub(marks_to_get);
            cur_pos += marks_to_get;
        }

        result.push(slices);
    }

    let spread_ok = marks_spread == sum_marks
        && cur_part + 1 == parts.len()
        && cur_pos == parts.last().unwrap().marks();
    if !spread_ok {
        return Err(TracedStorageError::logical(
            "could not spread marks among threads",
        ));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::part::Part;
    use crate::types::DataType;

    fn key_range(min: i32, max: i32) -> KeyRange {
        KeyRange {
            min: vec![DataValue::Int32(min)],
            max: vec![DataValue::Int32(max)],
        }
    }

    fn index_of(keys: &[i32]) -> Vec<u8> {
        let mut data = vec![];
        for key in keys {
            DataType::Int32.serialize_value(&DataValue::Int32(*key), &mut data);
        }
        data
    }

    fn sample() -> Vec<ColumnCatalog> {
        vec![ColumnCatalog::new("v", DataType::Int32)]
    }

    #[test]
    fn test_mark_range_inner() {
        let index = index_of(&[10, 30, 50]);
        let range =
            mark_range_from_key_condition(&index, 3, &sample(), &key_range(25, 45)).unwrap();
        // Both adjacent pairs may hold, and the trailing granule is cut off
        // by the upper bound.
        assert_eq!(range, Some((0, 1)));
    }

    #[test]
    fn test_mark_range_covers_trailing_granule() {
        let index = index_of(&[10, 30, 50]);
        let range =
            mark_range_from_key_condition(&index, 3, &sample(), &key_range(55, 70)).unwrap();
        assert_eq!(range, Some((2, 2)));
    }

    #[test]
    fn test_mark_range_excludes_part() {
        let index = index_of(&[10, 30, 50]);
        let range =
            mark_range_from_key_condition(&index, 3, &sample(), &key_range(-10, 5)).unwrap();
        assert_eq!(range, None);
    }

    #[test]
    fn test_mark_range_always_true() {
        let index = index_of(&[10, 30, 50]);
        let range = mark_range_from_key_condition(&index, 3, &sample(), &AlwaysTrue).unwrap();
        assert_eq!(range, Some((0, 2)));
    }

    #[test]
    fn test_mark_range_size_mismatch() {
        let index = index_of(&[10, 30, 50]);
        assert!(mark_range_from_key_condition(&index, 2, &sample(), &AlwaysTrue).is_ok());
        assert!(
            mark_range_from_key_condition(&index, 2, &sample(), &key_range(0, 1)).is_err()
        );
    }

    fn fake_part(size: usize) -> PartRef {
        Arc::new(Part {
            left_date: 0,
            right_date: 0,
            left_month: 0,
            right_month: 0,
            left: 1,
            right: 1,
            level: 0,
            name: "19700101_19700101_1_1_0".into(),
            size,
            modification_time: 0,
            currently_merging: Default::default(),
        })
    }

    #[test]
    fn test_spread_splits_parts() {
        let parts = vec![
            PartRange {
                part: fake_part(6),
                first_mark: 0,
                last_mark: 5,
            },
            PartRange {
                part: fake_part(2),
                first_mark: 0,
                last_mark: 1,
            },
        ];
        let spread = spread_mark_ranges(parts, 2, 2, 1).unwrap();
        assert_eq!(spread.len(), 2);
        let marks_per_worker: Vec<usize> = spread
            .iter()
            .map(|slices| slices.iter().map(|s| s.marks).sum())
            .collect();
        assert_eq!(marks_per_worker.iter().sum::<usize>(), 8);
        assert_eq!(marks_per_worker[0], 4);
    }

    #[test]
    fn test_spread_respects_min_residual_rows() {
        let parts = vec![PartRange {
            part: fake_part(5),
            first_mark: 0,
            last_mark: 4,
        }];
        // Splitting 5 marks at granularity 2 would leave a 2-mark residue of
        // 4 rows, below the threshold; the whole part goes to one worker.
        let spread = spread_mark_ranges(parts, 2, 2, 5).unwrap();
        assert_eq!(spread.len(), 1);
        assert_eq!(spread[0].len(), 1);
        assert_eq!(spread[0][0].marks, 5);
    }
}
