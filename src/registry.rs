//! Per-tier file registry.
//!
//! A sorted set of file items keyed by `(end_step asc, start_step
//! desc)`: for equal end steps the larger file sorts first. Mutations
//! take a short exclusive critical section; readers grab the read-only
//! snapshot pointer once per operation and hold the `Arc`s for its
//! duration. Items superseded by a merged superset are marked
//! deletable and die with their last snapshot.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::files::{FileItem, StepRange};

type RegistryKey = (u64, Reverse<u64>);

fn key_of(range: &StepRange) -> RegistryKey {
    (range.to_step, Reverse(range.from_step))
}

/// A consistent view of the registry: items ascending by end step,
/// garbage and subsumed ranges already filtered out.
pub type FilesSnapshot = Arc<Vec<Arc<FileItem>>>;

#[derive(Debug, Default)]
pub struct FileRegistry {
    files: Mutex<BTreeMap<RegistryKey, Arc<FileItem>>>,
    snapshot: ArcSwap<Vec<Arc<FileItem>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current read-only view. Cheap: one atomic pointer load.
    pub fn snapshot(&self) -> FilesSnapshot {
        self.snapshot.load_full()
    }

    /// Inserts a published item, applying the dedup rules:
    /// an equal range is a noop; a subset of a frozen item is garbage
    /// (removed from disk); a superset retires the existing subsets.
    /// Returns the item now representing the range.
    pub fn insert(&self, item: FileItem) -> Arc<FileItem> {
        let item = Arc::new(item);
        {
            let mut files = self.files.lock();

            if let Some(existing) = files.get(&key_of(&item.range)) {
                debug!(range = ?item.range, "registry insert: range already present");
                return existing.clone();
            }

            let frozen_superset = files
                .values()
                .any(|f| f.frozen && item.range.is_subset_of(&f.range));
            if frozen_superset {
                debug!(range = ?item.range, "registry insert: subset of frozen file, discarding");
                item.mark_deletable();
                return item;
            }

            let subsumed: Vec<RegistryKey> = files
                .iter()
                .filter(|(_, f)| f.range.is_subset_of(&item.range))
                .map(|(k, _)| *k)
                .collect();
            for k in subsumed {
                if let Some(old) = files.remove(&k) {
                    debug!(retired = ?old.range, by = ?item.range, "registry insert: retiring subset");
                    old.mark_deletable();
                }
            }

            files.insert(key_of(&item.range), item.clone());
            self.recalc_locked(&files);
        }
        item
    }

    /// Swaps in a reopened item for the same range, e.g. after its
    /// accessors were rebuilt. The displaced item is not deletable, so
    /// its files stay on disk.
    pub fn replace(&self, item: FileItem) -> Arc<FileItem> {
        let item = Arc::new(item);
        let mut files = self.files.lock();
        files.insert(key_of(&item.range), item.clone());
        self.recalc_locked(&files);
        item
    }

    /// Drops every item whose `start_step >= lower_step`. Used on open
    /// to discard history/index files that ran ahead of the values
    /// tier. Returns the number of items dropped.
    pub fn scan_after(&self, lower_step: u64) -> usize {
        let mut files = self.files.lock();
        let doomed: Vec<RegistryKey> = files
            .iter()
            .filter(|(_, f)| f.range.from_step >= lower_step)
            .map(|(k, _)| *k)
            .collect();
        let n = doomed.len();
        for k in doomed {
            if let Some(item) = files.remove(&k) {
                debug!(range = ?item.range, lower_step, "dropping file ahead of values tier");
                item.mark_deletable();
            }
        }
        if n > 0 {
            self.recalc_locked(&files);
        }
        n
    }

    /// Largest covered end step, 0 when empty.
    pub fn end_step_max(&self) -> u64 {
        self.snapshot().last().map(|f| f.range.to_step).unwrap_or(0)
    }

    pub fn all(&self) -> Vec<Arc<FileItem>> {
        self.files.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    fn recalc_locked(&self, files: &BTreeMap<RegistryKey, Arc<FileItem>>) {
        let mut out: Vec<Arc<FileItem>> = Vec::with_capacity(files.len());
        for item in files.values() {
            if item.is_deletable() {
                continue;
            }
            while let Some(last) = out.last() {
                if last.range.is_subset_of(&item.range) {
                    out.pop();
                } else {
                    break;
                }
            }
            out.push(item.clone());
        }
        self.snapshot.store(Arc::new(out));
    }
}
