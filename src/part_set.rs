// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

//! The two ordered part collections.
//!
//! `active` holds the parts visible to readers and eligible for merging;
//! `all` additionally holds parts that were merged away but may still have
//! readers. Lock order is always `active` before `all`. Reclamation takes
//! only the `all` lock, and only by try-lock, so concurrent callers return
//! immediately instead of queueing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{StorageResult, TracedStorageError};
use crate::part::{PartKey, PartRef};

#[derive(Default)]
pub struct PartSet {
    active: Mutex<BTreeMap<PartKey, PartRef>>,
    all: Mutex<BTreeMap<PartKey, PartRef>>,
}

impl PartSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a freshly written part visible: inserts it into both
    /// collections atomically.
    pub fn publish(&self, part: PartRef) {
        let mut active = self.active.lock();
        let mut all = self.all.lock();
        active.insert(part.key(), part.clone());
        all.insert(part.key(), part);
    }

    /// Atomically replaces `retired` with `merged` in the active set. The
    /// retired parts stay in `all` until reclaimed. Every retired part must
    /// still be active; anything else is an invariant violation.
    pub fn swap(&self, merged: PartRef, retired: &[PartRef]) -> StorageResult<()> {
        let mut active = self.active.lock();
        let mut all = self.all.lock();

        for part in retired {
            if !active.contains_key(&part.key()) {
                return Err(TracedStorageError::logical(format!(
                    "cannot find part {} in the active set",
                    part.name
                )));
            }
        }

        active.insert(merged.key(), merged.clone());
        all.insert(merged.key(), merged);
        for part in retired {
            active.remove(&part.key());
        }
        Ok(())
    }

    /// The active parts, in `(month, id)` order.
    pub fn snapshot_active(&self) -> Vec<PartRef> {
        self.active.lock().values().cloned().collect()
    }

    /// Every part not yet reclaimed, in `(month, id)` order.
    pub fn snapshot_all(&self) -> Vec<PartRef> {
        self.all.lock().values().cloned().collect()
    }

    /// Runs `f` on the active collection under its lock. Used by the merge
    /// planner, which must flip `currently_merging` flags while no one else
    /// can change the set.
    pub fn with_active<R>(&self, f: impl FnOnce(&BTreeMap<PartKey, PartRef>) -> R) -> R {
        f(&self.active.lock())
    }

    /// Drops active parts whose id interval is covered by a neighbouring
    /// part in the same month. Called once after startup load; the dropped
    /// parts stay in `all` for reclamation. Returns the dropped names.
    pub fn retire_contained(&self) -> Vec<String> {
        let mut active = self.active.lock();
        let _all = self.all.lock();

        let mut retired = vec![];
        let parts: Vec<PartRef> = active.values().cloned().collect();
        let mut prev: Option<&PartRef> = None;
        for curr in &parts {
            if curr.left_month != curr.right_month {
                prev = Some(curr);
                continue;
            }
            let Some(p) = prev else {
                prev = Some(curr);
                continue;
            };
            if p.left_month != p.right_month || p.left_month != curr.left_month {
                prev = Some(curr);
                continue;
            }
            if curr.contains(p) {
                warn!("part {} contains {}", curr.name, p.name);
                active.remove(&p.key());
                retired.push(p.name.clone());
                prev = Some(curr);
            } else if p.contains(curr) {
                warn!("part {} contains {}", p.name, curr.name);
                active.remove(&curr.key());
                retired.push(curr.name.clone());
            } else {
                prev = Some(curr);
            }
        }
        retired
    }

    /// Deletes parts that have left the active set and have no remaining
    /// readers: their only reference is the `all` collection itself. If
    /// another thread is already reclaiming, returns without waiting.
    pub fn reclaim(&self, root: &Path) -> StorageResult<usize> {
        let Some(mut all) = self.all.try_lock() else {
            trace!("already clearing or modifying old parts");
            return Ok(0);
        };

        let unused: Vec<PartKey> = all
            .iter()
            .filter(|(_, part)| Arc::strong_count(part) == 1)
            .map(|(key, _)| *key)
            .collect();

        let mut removed = 0;
        for key in unused {
            let part = all.remove(&key).unwrap();
            debug!(part = %part.name, "removing old part");
            std::fs::remove_dir_all(part.path(root))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn clear(&self) {
        let mut active = self.active.lock();
        let mut all = self.all.lock();
        active.clear();
        all.clear();
    }
}
