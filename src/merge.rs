//! K-way merge across the engine's three cursor kinds, and cross-file
//! merging of adjacent step files.
//!
//! The heap orders entries by `(key asc, end_tx desc)`: for a key
//! present in several tiers the source covering the most recent
//! transactions wins. The same protocol serves prefix iteration
//! (ram + hot tier + files) and background file merging (files only).

use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::cancel::Cancel;
use crate::files::{self, FileItem, StepRange};
use crate::index::{BtIndex, EliasFano, ExistenceFilterBuilder, HashedIndex, DEFAULT_BTREE_M};
use crate::kv::KvRead;
use crate::options::{EngineOptions, IndexFlavor};
use crate::registry::FilesSnapshot;
use crate::segment::{SegmentCursor, SegmentReader, SegmentWriter};
use crate::step::{composite, step_from_inverted, MERGE_SPANS};

pub(crate) trait MergeSource {
    /// Next `(key, value, end_tx)` in ascending key order.
    fn advance(&mut self) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>, u64)>>;
}

struct HeapEntry {
    key: Vec<u8>,
    val: Vec<u8>,
    end_tx: u64,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx == other.end_tx && self.src == other.src
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the maximum; make the maximum the smallest
        // key, breaking ties toward the most recent source.
        self.key
            .cmp(&other.key)
            .reverse()
            .then(self.end_tx.cmp(&other.end_tx))
            .then(self.src.cmp(&other.src))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct MergeHeap<'a> {
    sources: Vec<Box<dyn MergeSource + 'a>>,
    heap: BinaryHeap<HeapEntry>,
}

impl<'a> MergeHeap<'a> {
    pub fn new(sources: Vec<Box<dyn MergeSource + 'a>>) -> anyhow::Result<Self> {
        let mut this = Self {
            sources,
            heap: BinaryHeap::new(),
        };
        for src in 0..this.sources.len() {
            this.push_from(src)?;
        }
        Ok(this)
    }

    fn push_from(&mut self, src: usize) -> anyhow::Result<()> {
        if let Some((key, val, end_tx)) = self.sources[src].advance()? {
            self.heap.push(HeapEntry {
                key,
                val,
                end_tx,
                src,
            });
        }
        Ok(())
    }

    /// Pops the next distinct key with the value from the source of
    /// greatest `end_tx`, advancing every source that held the key.
    pub fn next_key(&mut self) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        let key = top.key;
        let val = top.val;
        self.push_from(top.src)?;
        while let Some(peek) = self.heap.peek() {
            if peek.key != key {
                break;
            }
            let stale = self.heap.pop().expect("peeked");
            self.push_from(stale.src)?;
        }
        Ok(Some((key, val)))
    }
}

/// File cursor bounded to keys starting with `prefix` (empty = all).
pub(crate) struct FileSource<'a> {
    cursor: SegmentCursor<'a>,
    prefix: Vec<u8>,
    end_tx: u64,
    done: bool,
}

impl<'a> FileSource<'a> {
    pub fn new(
        reader: &'a SegmentReader,
        prefix: &[u8],
        end_tx: u64,
    ) -> anyhow::Result<Self> {
        let mut cursor = reader.cursor();
        cursor.seek(prefix)?;
        Ok(Self {
            cursor,
            prefix: prefix.to_vec(),
            end_tx,
            done: false,
        })
    }
}

impl MergeSource for FileSource<'_> {
    fn advance(&mut self) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        if self.done {
            return Ok(None);
        }
        match self.cursor.next()? {
            Some((key, val)) if key.starts_with(&self.prefix) => {
                Ok(Some((key, val, self.end_tx)))
            }
            _ => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Hot-tier cursor over a domain's keys table: for each key the first
/// duplicate is the most recent inverted step, which locates the
/// current value row. The step also yields the source's `end_tx`: the
/// first txNum of the step, which is ahead of any file covering it.
pub(crate) struct DbSource<'tx, T: KvRead> {
    tx: &'tx T,
    keys_table: String,
    vals_table: String,
    prefix: Vec<u8>,
    step_size: u64,
    /// When the in-memory tier has updates at this txNum, every hot row
    /// must be strictly behind it; a violation means the caller wrote
    /// without setting the transaction number first.
    ram_tx_guard: Option<u64>,
    pending: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'tx, T: KvRead> DbSource<'tx, T> {
    pub fn new(
        tx: &'tx T,
        keys_table: &str,
        vals_table: &str,
        prefix: &[u8],
        step_size: u64,
        ram_tx_guard: Option<u64>,
    ) -> Self {
        let pending = tx.dup_seek(keys_table, prefix);
        Self {
            tx,
            keys_table: keys_table.to_string(),
            vals_table: vals_table.to_string(),
            prefix: prefix.to_vec(),
            step_size,
            ram_tx_guard,
            pending,
        }
    }
}

impl<T: KvRead> MergeSource for DbSource<'_, T> {
    fn advance(&mut self) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        let Some((key, inv_step)) = self.pending.take() else {
            return Ok(None);
        };
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        if inv_step.len() != 8 {
            anyhow::bail!("malformed inverted step for key {key:x?}");
        }
        let step = step_from_inverted(&inv_step);
        let end_tx = step * self.step_size;
        if let Some(ram_tx) = self.ram_tx_guard {
            anyhow::ensure!(
                end_tx < ram_tx,
                "ram updates must be ahead of the hot tier ({ram_tx} <= {end_tx}); \
                 was the transaction number set before writing?"
            );
        }

        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&inv_step);
        let val = self
            .tx
            .get(&self.vals_table, &composite(&key, &suffix))
            .with_context(|| format!("keys row without values row, step {step}"))?;

        self.pending = self.tx.dup_next_no_dup(&self.keys_table, &key);
        Ok(Some((key, val, end_tx)))
    }
}

/// In-memory ordered updates, already filtered to the prefix.
pub(crate) struct RamSource {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    end_tx: u64,
}

impl RamSource {
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>, end_tx: u64) -> Self {
        Self {
            entries: entries.into(),
            end_tx,
        }
    }
}

impl MergeSource for RamSource {
    fn advance(&mut self) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        Ok(self
            .entries
            .pop_front()
            .map(|(k, v)| (k, v, self.end_tx)))
    }
}

/// Picks the widest mergeable range: the largest allowed span whose
/// aligned window is exactly tiled by two or more existing files.
pub(crate) fn find_merge_range(snapshot: &FilesSnapshot) -> Option<StepRange> {
    let max_end = snapshot.iter().map(|f| f.range.to_step).max()?;
    let ranges: Vec<StepRange> = snapshot.iter().map(|f| f.range).collect();

    for span in MERGE_SPANS {
        let mut boundary = 0;
        while boundary + span <= max_end {
            let window = StepRange::new(boundary, boundary + span);
            if let Some(parts) = tile(&ranges, window) {
                if parts >= 2 {
                    return Some(window);
                }
            }
            boundary += span;
        }
    }
    None
}

/// Number of files exactly tiling `window`, if they do.
fn tile(ranges: &[StepRange], window: StepRange) -> Option<usize> {
    let mut cur = window.from_step;
    let mut parts = 0;
    while cur < window.to_step {
        // Widest piece starting exactly at `cur` that stays inside.
        let next = ranges
            .iter()
            .filter(|r| r.from_step == cur && r.to_step <= window.to_step)
            .map(|r| r.to_step)
            .max()?;
        cur = next;
        parts += 1;
    }
    (cur == window.to_step).then_some(parts)
}

/// Files from `snapshot` exactly tiling `window`, ascending.
pub(crate) fn files_for_window(
    snapshot: &FilesSnapshot,
    window: StepRange,
) -> Vec<Arc<FileItem>> {
    let mut out = Vec::new();
    let mut cur = window.from_step;
    while cur < window.to_step {
        let Some(item) = snapshot
            .iter()
            .filter(|f| f.range.from_step == cur && f.range.to_step <= window.to_step)
            .max_by_key(|f| f.range.to_step)
        else {
            break;
        };
        cur = item.range.to_step;
        out.push(item.clone());
    }
    out
}

/// Merges adjacent value files into one covering `window`, newest value
/// per key. Returns the opened, published file item.
pub(crate) fn merge_value_files(
    cancel: &Cancel,
    opts: &EngineOptions,
    dir: &Path,
    base: &str,
    inputs: &[Arc<FileItem>],
    window: StepRange,
) -> anyhow::Result<FileItem> {
    let step_size = opts.step_size;
    let mut sources: Vec<Box<dyn MergeSource + '_>> = Vec::with_capacity(inputs.len());
    for item in inputs {
        sources.push(Box::new(FileSource::new(
            &item.data,
            b"",
            item.end_tx(step_size),
        )?));
    }
    let mut heap = MergeHeap::new(sources)?;

    let out_path = dir.join(files::file_name(base, window, "kv"));
    let mut writer = SegmentWriter::create(
        &out_path,
        opts.segment_block_size,
        opts.compression_level,
        opts.fsync,
    )?;
    while let Some((key, val)) = heap.next_key()? {
        if let Err(err) = cancel.check() {
            writer.abort();
            return Err(err);
        }
        writer.add(&key, &val)?;
    }
    let entries = writer.entries();
    writer.finish()?;
    let data = SegmentReader::open(&out_path)?;

    build_value_accessors(opts, dir, base, window, &data, entries)?;
    files::open_values_file(dir, base, window, opts.index_flavor)
}

/// Builds the flavor index and existence filter for a published value
/// segment. Shared by step builds and merges.
pub(crate) fn build_value_accessors(
    opts: &EngineOptions,
    dir: &Path,
    base: &str,
    range: StepRange,
    data: &SegmentReader,
    entries: u64,
) -> anyhow::Result<()> {
    match opts.index_flavor {
        IndexFlavor::BTree => {
            let path = dir.join(files::file_name(base, range, "bt"));
            BtIndex::build(data, &path, DEFAULT_BTREE_M, opts.fsync)
                .with_context(|| format!("build {base} bt"))?;
        }
        IndexFlavor::Hashed => {
            let path = dir.join(files::file_name(base, range, "kvi"));
            HashedIndex::build(data, &path, opts.fsync)
                .with_context(|| format!("build {base} kvi"))?;
        }
    }

    let mut filter = ExistenceFilterBuilder::new(entries, opts.existence_fp_rate);
    data.for_each_entry(|key, _| {
        filter.add(key);
        Ok(())
    })?;
    let kvei = dir.join(files::file_name(base, range, "kvei"));
    filter
        .finish(&kvei, opts.fsync)
        .with_context(|| format!("build {base} kvei"))?;
    Ok(())
}

/// Merges adjacent history value files; rows are disjoint across
/// inputs, so this is a plain sorted concatenation.
pub(crate) fn merge_history_files(
    cancel: &Cancel,
    opts: &EngineOptions,
    dir: &Path,
    base: &str,
    inputs: &[Arc<FileItem>],
    window: StepRange,
) -> anyhow::Result<FileItem> {
    let step_size = opts.step_size;
    let mut sources: Vec<Box<dyn MergeSource + '_>> = Vec::with_capacity(inputs.len());
    for item in inputs {
        sources.push(Box::new(FileSource::new(
            &item.data,
            b"",
            item.end_tx(step_size),
        )?));
    }
    let mut heap = MergeHeap::new(sources)?;

    let out_path = dir.join(files::file_name(base, window, "v"));
    let mut writer = SegmentWriter::create(
        &out_path,
        opts.segment_block_size,
        opts.compression_level,
        opts.fsync,
    )?;
    while let Some((key, val)) = heap.next_key()? {
        if let Err(err) = cancel.check() {
            writer.abort();
            return Err(err);
        }
        writer.add(&key, &val)?;
    }
    writer.finish()?;
    let data = SegmentReader::open(&out_path)?;
    let idx_path = dir.join(files::file_name(base, window, "vi"));
    HashedIndex::build(&data, &idx_path, opts.fsync)?;
    files::open_indexed_file(dir, base, window, "v", "vi")
}

/// Merges adjacent inverted-index files, unioning each key's posting
/// list.
pub(crate) fn merge_ef_files(
    cancel: &Cancel,
    opts: &EngineOptions,
    dir: &Path,
    base: &str,
    inputs: &[Arc<FileItem>],
    window: StepRange,
) -> anyhow::Result<FileItem> {
    let mut union: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    for item in inputs {
        cancel.check()?;
        let mut cursor = item.data.cursor();
        while let Some((key, raw)) = cursor.next()? {
            let ef = EliasFano::decode(&raw).map_err(anyhow::Error::msg)?;
            union.entry(key).or_default().extend(ef.iter());
        }
    }

    let out_path = dir.join(files::file_name(base, window, "ef"));
    let mut writer = SegmentWriter::create(
        &out_path,
        opts.segment_block_size,
        opts.compression_level,
        opts.fsync,
    )?;
    for (key, mut txs) in union {
        if let Err(err) = cancel.check() {
            writer.abort();
            return Err(err);
        }
        txs.sort_unstable();
        txs.dedup();
        let ef = EliasFano::new(&txs).map_err(anyhow::Error::msg)?;
        writer.add(&key, &ef.encode())?;
    }
    writer.finish()?;
    let data = SegmentReader::open(&out_path)?;
    let idx_path = dir.join(files::file_name(base, window, "efi"));
    HashedIndex::build(&data, &idx_path, opts.fsync)?;
    files::open_indexed_file(dir, base, window, "ef", "efi")
}
