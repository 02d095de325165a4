// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! In-memory part descriptors.
//!
//! A part is an immutable directory of column files covering one month of
//! rows. Descriptors are shared through `Arc`: the part sets hold one
//! reference each, every open reader holds another, and the reference count
//! is what keeps a retired part's files alive until the last reader drops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::calendar::Calendar;

/// One mark record: two little-endian `u64`s.
pub const MARK_SIZE: u64 = 16;

pub struct Part {
    pub left_date: u16,
    pub right_date: u16,
    pub left_month: u16,
    pub right_month: u16,
    /// Inclusive interval of part ids absorbed into this part.
    pub left: u64,
    pub right: u64,
    pub level: u32,
    pub name: String,
    /// Number of marks (granules of `index_granularity` rows).
    pub size: usize,
    pub modification_time: u64,
    /// Set by the merge planner while this part is a merge source.
    pub currently_merging: AtomicBool,
}

pub type PartRef = Arc<Part>;

/// Sort key of the part sets: id order within each month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartKey {
    pub left_month: u16,
    pub left: u64,
    pub right: u64,
    pub level: u32,
}

impl Part {
    pub fn key(&self) -> PartKey {
        PartKey {
            left_month: self.left_month,
            left: self.left,
            right: self.right,
            level: self.level,
        }
    }

    /// Whether this part's id interval covers `other`'s.
    pub fn contains(&self, other: &Part) -> bool {
        self.left_month == other.left_month
            && self.left <= other.left
            && self.right >= other.right
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.name)
    }

    pub fn is_merging(&self) -> bool {
        self.currently_merging.load(Ordering::SeqCst)
    }

    pub fn set_merging(&self, merging: bool) {
        self.currently_merging.store(merging, Ordering::SeqCst);
    }

    /// Canonical part name: `YYYYMMDD_YYYYMMDD_minId_maxId_level`.
    pub fn format_name(
        calendar: &Calendar,
        left_date: u16,
        right_date: u16,
        left: u64,
        right: u64,
        level: u32,
    ) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            calendar.format_day_num(left_date),
            calendar.format_day_num(right_date),
            left,
            right,
            level
        )
    }
}

pub fn part_name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d{8})_(\d{8})_(\d+)_(\d+)_(\d+)$").unwrap())
}

/// Parses a directory name into the descriptor fields it encodes. Returns
/// `None` for names outside the canonical grammar (`tmp_*` leftovers in
/// particular).
pub fn parse_part_name(calendar: &Calendar, name: &str) -> Option<(u16, u16, u64, u64, u32)> {
    let captures = part_name_regex().captures(name)?;
    let left_date = calendar.parse_day_num(&captures[1]).ok()?;
    let right_date = calendar.parse_day_num(&captures[2]).ok()?;
    let left: u64 = captures[3].parse().ok()?;
    let right: u64 = captures[4].parse().ok()?;
    let level: u32 = captures[5].parse().ok()?;
    Some((left_date, right_date, left, right, level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let cal = Calendar::new();
        let left = cal.from_ymd(2024, 1, 1);
        let right = cal.from_ymd(2024, 1, 5);
        let name = Part::format_name(&cal, left, right, 1, 2, 1);
        assert_eq!(name, "20240101_20240105_1_2_1");
        assert_eq!(
            parse_part_name(&cal, &name),
            Some((left, right, 1, 2, 1))
        );
    }

    #[test]
    fn test_non_canonical_names_rejected() {
        let cal = Calendar::new();
        assert!(parse_part_name(&cal, "tmp_20240101_20240105_1_2_1").is_none());
        assert!(parse_part_name(&cal, "20240101_20240105_1_2").is_none());
        assert!(parse_part_name(&cal, "increment.txt").is_none());
    }

    #[test]
    fn test_key_order() {
        let feb = PartKey {
            left_month: 31,
            left: 1,
            right: 1,
            level: 0,
        };
        let jan_a = PartKey {
            left_month: 0,
            left: 2,
            right: 2,
            level: 0,
        };
        let jan_b = PartKey {
            left_month: 0,
            left: 3,
            right: 5,
            level: 1,
        };
        let mut keys = [feb, jan_b, jan_a];
        keys.sort();
        assert_eq!(keys, [jan_a, jan_b, feb]);
    }
}
