//! Immutable file items and their on-disk naming.
//!
//! A file item is one published step-range artifact set: the data
//! segment plus its access index, and for value files an existence
//! filter. Items spanning exactly 64 steps are frozen and immortal.
//! Non-frozen items are shared through `Arc`; when an item has been
//! marked deletable and the last handle drops, the artifacts are
//! removed from disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing::{debug, warn};

use crate::index::{BtIndex, ExistenceFilter, HashedIndex};
use crate::options::IndexFlavor;
use crate::segment::SegmentReader;
use crate::step::STEPS_IN_FROZEN_FILE;

pub const FILE_VERSION_PREFIX: &str = "v1";

/// Half-open step range `[from_step, to_step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepRange {
    pub from_step: u64,
    pub to_step: u64,
}

impl StepRange {
    pub fn new(from_step: u64, to_step: u64) -> Self {
        debug_assert!(from_step < to_step);
        Self { from_step, to_step }
    }

    pub fn span(&self) -> u64 {
        self.to_step - self.from_step
    }

    pub fn is_frozen(&self) -> bool {
        self.span() == STEPS_IN_FROZEN_FILE
    }

    pub fn tx_from(&self, step_size: u64) -> u64 {
        self.from_step * step_size
    }

    pub fn tx_to(&self, step_size: u64) -> u64 {
        self.to_step * step_size
    }

    /// Strict subset: contained in `other` and not equal to it.
    pub fn is_subset_of(&self, other: &StepRange) -> bool {
        other.from_step <= self.from_step
            && self.to_step <= other.to_step
            && (other.from_step != self.from_step || self.to_step != other.to_step)
    }
}

pub fn file_name(base: &str, range: StepRange, ext: &str) -> String {
    format!(
        "{FILE_VERSION_PREFIX}-{base}.{}-{}.{ext}",
        range.from_step, range.to_step
    )
}

/// Parses `v1-<base>.<from>-<to>.<ext>`. Returns `None` for anything
/// that does not match exactly.
pub fn parse_file_name(name: &str) -> Option<(String, StepRange, String)> {
    let rest = name
        .strip_prefix(FILE_VERSION_PREFIX)?
        .strip_prefix('-')?;
    let (stem, ext) = rest.rsplit_once('.')?;
    let (base, range_str) = stem.rsplit_once('.')?;
    let (from_str, to_str) = range_str.split_once('-')?;
    let from_step: u64 = from_str.parse().ok()?;
    let to_step: u64 = to_str.parse().ok()?;
    if base.is_empty() || ext.is_empty() || from_step >= to_step {
        return None;
    }
    Some((
        base.to_string(),
        StepRange::new(from_step, to_step),
        ext.to_string(),
    ))
}

/// One published file set. Field presence depends on the tier:
/// value files carry `existence`, history/index files do not.
pub struct FileItem {
    pub range: StepRange,
    pub frozen: bool,
    pub data: SegmentReader,
    pub bt: Option<BtIndex>,
    pub hashed: Option<HashedIndex>,
    pub existence: Option<ExistenceFilter>,
    can_delete: AtomicBool,
    paths: Vec<PathBuf>,
}

impl FileItem {
    pub fn new(
        range: StepRange,
        data: SegmentReader,
        bt: Option<BtIndex>,
        hashed: Option<HashedIndex>,
        existence: Option<ExistenceFilter>,
        paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            range,
            frozen: range.is_frozen(),
            data,
            bt,
            hashed,
            existence,
            can_delete: AtomicBool::new(false),
            paths,
        }
    }

    pub fn mark_deletable(&self) {
        if !self.frozen {
            self.can_delete.store(true, Ordering::Release);
        }
    }

    pub fn is_deletable(&self) -> bool {
        self.can_delete.load(Ordering::Acquire)
    }

    /// End of the covered tx range, exclusive.
    pub fn end_tx(&self, step_size: u64) -> u64 {
        self.range.tx_to(step_size)
    }
}

impl Drop for FileItem {
    fn drop(&mut self) {
        if self.frozen || !self.is_deletable() {
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(file = %path.display(), "removed retired file"),
                Err(err) => debug!(file = %path.display(), %err, "remove after close"),
            }
        }
    }
}

impl std::fmt::Debug for FileItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileItem")
            .field("range", &self.range)
            .field("frozen", &self.frozen)
            .field("deletable", &self.is_deletable())
            .finish()
    }
}

/// Opens a value-tier file set (`.kv` + index + `.kvei`). The data
/// segment is required; a corrupt or missing accessor is tolerated:
/// it is warned about and rebuilt later, the segment's own index block
/// keeps lookups correct meanwhile.
pub fn open_values_file(
    dir: &Path,
    base: &str,
    range: StepRange,
    flavor: IndexFlavor,
) -> anyhow::Result<FileItem> {
    let kv_path = dir.join(file_name(base, range, "kv"));
    let data = SegmentReader::open(&kv_path)
        .with_context(|| format!("open {}", kv_path.display()))?;
    let mut paths = vec![kv_path];

    let bt_path = dir.join(file_name(base, range, "bt"));
    let kvi_path = dir.join(file_name(base, range, "kvi"));
    let (bt, hashed) = match flavor {
        IndexFlavor::BTree => (open_optional(&bt_path, BtIndex::open, &mut paths), None),
        IndexFlavor::Hashed => (None, open_optional(&kvi_path, HashedIndex::open, &mut paths)),
    };

    let kvei_path = dir.join(file_name(base, range, "kvei"));
    let existence = open_optional(&kvei_path, ExistenceFilter::open, &mut paths);

    Ok(FileItem::new(range, data, bt, hashed, existence, paths))
}

/// Opens a history (`.v` + `.vi`) or inverted-index (`.ef` + `.efi`)
/// file set.
pub fn open_indexed_file(
    dir: &Path,
    base: &str,
    range: StepRange,
    data_ext: &str,
    idx_ext: &str,
) -> anyhow::Result<FileItem> {
    let data_path = dir.join(file_name(base, range, data_ext));
    let data = SegmentReader::open(&data_path)
        .with_context(|| format!("open {}", data_path.display()))?;
    let mut paths = vec![data_path];

    let idx_path = dir.join(file_name(base, range, idx_ext));
    let hashed = open_optional(&idx_path, HashedIndex::open, &mut paths);

    Ok(FileItem::new(range, data, None, hashed, None, paths))
}

fn open_optional<T>(
    path: &Path,
    open: impl FnOnce(&Path) -> anyhow::Result<T>,
    paths: &mut Vec<PathBuf>,
) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match open(path) {
        Ok(v) => {
            paths.push(path.to_path_buf());
            Some(v)
        }
        Err(err) => {
            warn!(file = %path.display(), err = %format!("{err:#}"), "corrupt accessor skipped; will rebuild");
            None
        }
    }
}

/// Step ranges of every `v1-<base>.*.<ext>` file in `dir`, unsorted.
pub fn scan_ranges(dir: &Path, base: &str, ext: &str) -> anyhow::Result<Vec<StepRange>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((b, range, e)) = parse_file_name(name) else {
            continue;
        };
        if b == base && e == ext {
            out.push(range);
        }
    }
    Ok(out)
}

/// Removes stray `.tmp` outputs left by a crash mid-build.
pub fn remove_tmp_files(dir: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove {}", path.display()))?;
            debug!(file = %path.display(), "removed stale tmp output");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        let range = StepRange::new(3, 5);
        let name = file_name("accounts", range, "kv");
        assert_eq!(name, "v1-accounts.3-5.kv");
        assert_eq!(
            parse_file_name(&name),
            Some(("accounts".to_string(), range, "kv".to_string()))
        );
        assert_eq!(parse_file_name("v1-accounts.5-3.kv"), None);
        assert_eq!(parse_file_name("junk"), None);
        assert_eq!(parse_file_name("v2-accounts.3-5.kv"), None);
    }

    #[test]
    fn subset_and_frozen() {
        let small = StepRange::new(1, 2);
        let big = StepRange::new(0, 4);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(!big.is_subset_of(&big));
        assert!(StepRange::new(0, 64).is_frozen());
        assert!(!StepRange::new(0, 32).is_frozen());
    }
}
