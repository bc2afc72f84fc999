//! History and inverted index: per-key mutation txNums plus pre-images.
//!
//! For every write `(key, txNum, new, old)` the engine records the
//! pre-image `old` under `key ‖ u64_be(txNum)` and the member `txNum`
//! in the key's inverted index. The hot tier keeps both orientations,
//! `key → txNum` for point queries and `txNum → key` for range scans
//! and unwind. Promoted steps live in `.ef` files (Elias–Fano posting
//! lists per key) and `.v` files (pre-image values), each with a hashed
//! accessor.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::cancel::Cancel;
use crate::files::{self, FileItem, StepRange};
use crate::index::{EliasFano, HashedIndex};
use crate::kv::{KvRead, RwTx};
use crate::options::EngineOptions;
use crate::registry::{FileRegistry, FilesSnapshot};
use crate::segment::{SegmentReader, SegmentWriter};
use crate::step::{composite, tx_num_bytes, tx_num_from_bytes};

/// Inverted index: which txNums mutated each key.
#[derive(Debug)]
pub struct InvertedIndex {
    pub base: String,
    table_idx: String,
    table_idx_keys: String,
    dir: PathBuf,
    pub files: FileRegistry,
    opts: Arc<EngineOptions>,
}

impl InvertedIndex {
    pub fn new(base: &str, idx_dir: PathBuf, opts: Arc<EngineOptions>) -> Self {
        Self {
            base: base.to_string(),
            table_idx: format!("{base}.idx"),
            table_idx_keys: format!("{base}.idx.keys"),
            dir: idx_dir,
            files: FileRegistry::new(),
            opts,
        }
    }

    pub fn open_folder(&self) -> anyhow::Result<()> {
        files::remove_tmp_files(&self.dir)?;
        let mut ranges = files::scan_ranges(&self.dir, &self.base, "ef")?;
        ranges.sort();
        for range in ranges {
            match files::open_indexed_file(&self.dir, &self.base, range, "ef", "efi") {
                Ok(item) => {
                    self.files.insert(item);
                }
                Err(err) => {
                    tracing::warn!(
                        base = %self.base, ?range, err = %format!("{err:#}"),
                        "skipping corrupt inverted-index file"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> FilesSnapshot {
        self.files.snapshot()
    }

    /// Records a mutation of `key` at `tx_num` in the hot tier.
    pub fn add(&self, rw: &mut RwTx<'_>, key: &[u8], tx_num: u64) {
        let txb = tx_num_bytes(tx_num).to_vec();
        rw.dup_put(&self.table_idx, key.to_vec(), txb.clone());
        rw.dup_put(&self.table_idx_keys, txb, key.to_vec());
    }

    /// txNums of `key` in `[from, to)` merged across the hot tier and
    /// files, in the requested order, at most `limit` entries.
    pub fn idx_range(
        &self,
        snap: &FilesSnapshot,
        tx: &impl KvRead,
        key: &[u8],
        from: u64,
        to: Option<u64>,
        asc: bool,
        limit: usize,
    ) -> anyhow::Result<Vec<u64>> {
        let mut members = BTreeSet::new();
        for dup in tx.dups(&self.table_idx, key) {
            if dup.len() != 8 {
                continue;
            }
            let t = tx_num_from_bytes(&dup);
            if t >= from && to.map_or(true, |to| t < to) {
                members.insert(t);
            }
        }

        let step_size = self.opts.step_size;
        for item in snap.iter() {
            let file_from = item.range.tx_from(step_size);
            let file_to = item.range.tx_to(step_size);
            if to.map_or(false, |to| file_from >= to) || file_to <= from {
                continue;
            }
            if let Some(ef) = lookup_ef(item, key)? {
                for t in ef.iter() {
                    if t < from {
                        continue;
                    }
                    if to.map_or(false, |to| t >= to) {
                        break;
                    }
                    members.insert(t);
                }
            }
        }

        let mut out: Vec<u64> = if asc {
            members.into_iter().collect()
        } else {
            members.into_iter().rev().collect()
        };
        out.truncate(limit);
        Ok(out)
    }

    /// Deletes hot rows for txNums in `[tx_from, tx_to)`. Returns the
    /// number of `(key, txNum)` pairs removed.
    pub fn prune(
        &self,
        cancel: &Cancel,
        rw: &mut RwTx<'_>,
        tx_from: u64,
        tx_to: Option<u64>,
        limit: u64,
    ) -> anyhow::Result<u64> {
        let from = tx_num_bytes(tx_from).to_vec();
        let to = tx_to.map(|t| tx_num_bytes(t).to_vec());
        let mut removed = 0u64;
        while removed < limit {
            cancel.check()?;
            let batch = rw.dup_range(
                &self.table_idx_keys,
                &from,
                to.as_deref(),
                self.opts.prune_batch.min(limit - removed) as usize,
            );
            if batch.is_empty() {
                break;
            }
            for (txb, key) in batch {
                rw.dup_del(&self.table_idx, &key, &txb);
                rw.dup_del(&self.table_idx_keys, &txb, &key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Gathers the step's mutations into an `.ef` segment writer.
    pub fn collate(
        &self,
        cancel: &Cancel,
        range: StepRange,
        ro: &impl KvRead,
    ) -> anyhow::Result<IiCollation> {
        let step_size = self.opts.step_size;
        let from = tx_num_bytes(range.tx_from(step_size)).to_vec();
        let to = tx_num_bytes(range.tx_to(step_size)).to_vec();

        let mut per_key: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
        for (txb, key) in ro.dup_range(&self.table_idx_keys, &from, Some(&to), usize::MAX) {
            cancel.check()?;
            per_key.entry(key).or_default().push(tx_num_from_bytes(&txb));
        }

        let path = self.dir.join(files::file_name(&self.base, range, "ef"));
        let mut writer = SegmentWriter::create(
            &path,
            self.opts.segment_block_size,
            self.opts.compression_level,
            self.opts.fsync,
        )?;
        for (key, mut txs) in per_key {
            if let Err(err) = cancel.check() {
                writer.abort();
                return Err(err);
            }
            txs.sort_unstable();
            txs.dedup();
            let ef = match EliasFano::new(&txs) {
                Ok(ef) => ef,
                Err(msg) => {
                    writer.abort();
                    anyhow::bail!("{}: {msg}", self.base);
                }
            };
            if let Err(err) = writer.add(&key, &ef.encode()) {
                writer.abort();
                return Err(err.into());
            }
        }
        Ok(IiCollation { range, writer })
    }

    pub fn build_files(&self, cancel: &Cancel, coll: IiCollation) -> anyhow::Result<FileItem> {
        if cancel.is_cancelled() {
            coll.writer.abort();
            anyhow::bail!("operation cancelled");
        }
        let range = coll.range;
        let data_path = coll.writer.final_path().to_path_buf();
        coll.writer
            .finish()
            .with_context(|| format!("finish {} ef segment", self.base))?;
        let data = SegmentReader::open(&data_path)?;

        let idx_path = self.dir.join(files::file_name(&self.base, range, "efi"));
        HashedIndex::build(&data, &idx_path, self.opts.fsync)
            .with_context(|| format!("build {} efi", self.base))?;

        files::open_indexed_file(&self.dir, &self.base, range, "ef", "efi")
    }

    pub fn integrate(&self, item: FileItem) -> Arc<FileItem> {
        self.files.insert(item)
    }

    /// Rebuilds `.efi` accessors lost to corruption or a crash.
    pub fn build_missed_indexes(&self) -> anyhow::Result<()> {
        for item in self.files.all() {
            if item.hashed.is_some() {
                continue;
            }
            let idx_path = self
                .dir
                .join(files::file_name(&self.base, item.range, "efi"));
            HashedIndex::build(&item.data, &idx_path, self.opts.fsync)
                .with_context(|| format!("rebuild {} efi", self.base))?;
            let reopened =
                files::open_indexed_file(&self.dir, &self.base, item.range, "ef", "efi")?;
            self.files.replace(reopened);
        }
        Ok(())
    }

    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

pub struct IiCollation {
    pub range: StepRange,
    writer: SegmentWriter,
}

impl IiCollation {
    pub fn discard(self) {
        self.writer.abort();
    }
}

/// Point lookup of a key's posting list inside one `.ef` file.
fn lookup_ef(item: &FileItem, key: &[u8]) -> anyhow::Result<Option<EliasFano>> {
    let raw = match &item.hashed {
        Some(idx) => {
            let mut found = None;
            for pos in idx.lookup(key) {
                if let Some((k, v)) = item.data.get_at(pos)? {
                    if k == key {
                        found = Some(v);
                        break;
                    }
                }
            }
            found
        }
        None => item.data.get(key)?,
    };
    match raw {
        None => Ok(None),
        Some(raw) => Ok(Some(EliasFano::decode(&raw).map_err(anyhow::Error::msg)?)),
    }
}

/// Read view over the history tiers, captured once per operation.
#[derive(Debug, Clone)]
pub struct HistoryView {
    pub v_files: FilesSnapshot,
    pub ef_files: FilesSnapshot,
}

/// History: pre-image values keyed by `(key ‖ txNum)` over the
/// inverted index.
#[derive(Debug)]
pub struct History {
    pub base: String,
    table_hist: String,
    pub ii: InvertedIndex,
    dir: PathBuf,
    pub files: FileRegistry,
    opts: Arc<EngineOptions>,
}

impl History {
    pub fn new(
        base: &str,
        history_dir: PathBuf,
        idx_dir: PathBuf,
        opts: Arc<EngineOptions>,
    ) -> Self {
        Self {
            base: base.to_string(),
            table_hist: format!("{base}.history"),
            ii: InvertedIndex::new(base, idx_dir, opts.clone()),
            dir: history_dir,
            files: FileRegistry::new(),
            opts,
        }
    }

    pub fn open_folder(&self) -> anyhow::Result<()> {
        files::remove_tmp_files(&self.dir)?;
        self.ii.open_folder()?;
        let mut ranges = files::scan_ranges(&self.dir, &self.base, "v")?;
        ranges.sort();
        for range in ranges {
            match files::open_indexed_file(&self.dir, &self.base, range, "v", "vi") {
                Ok(item) => {
                    self.files.insert(item);
                }
                Err(err) => {
                    tracing::warn!(
                        base = %self.base, ?range, err = %format!("{err:#}"),
                        "skipping corrupt history file"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn view(&self) -> HistoryView {
        HistoryView {
            v_files: self.files.snapshot(),
            ef_files: self.ii.snapshot(),
        }
    }

    /// Records the pre-image of a mutation. If a pre-image for
    /// `(key, txNum)` was already recorded, the first write wins:
    /// later writes within the same txNum observed the in-memory value.
    pub fn put_prev_value(&self, rw: &mut RwTx<'_>, key: &[u8], tx_num: u64, pre: &[u8]) {
        let comp = composite(key, &tx_num_bytes(tx_num));
        if rw.get(&self.table_hist, &comp).is_none() {
            rw.put(&self.table_hist, comp, pre.to_vec());
        }
        self.ii.add(rw, key, tx_num);
    }

    /// Pre-image stored at exactly `(key, t)`, from the hot tier or a
    /// `.v` file covering `t`.
    pub fn hist_value(
        &self,
        view: &HistoryView,
        tx: &impl KvRead,
        key: &[u8],
        t: u64,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let comp = composite(key, &tx_num_bytes(t));
        if let Some(v) = tx.get(&self.table_hist, &comp) {
            return Ok(Some(v));
        }
        let step_size = self.opts.step_size;
        for item in view.v_files.iter() {
            if t < item.range.tx_from(step_size) || t >= item.range.tx_to(step_size) {
                continue;
            }
            let hit = match &item.hashed {
                Some(idx) => {
                    let mut found = None;
                    for pos in idx.lookup(&comp) {
                        if let Some((k, v)) = item.data.get_at(pos)? {
                            if k == comp {
                                found = Some(v);
                                break;
                            }
                        }
                    }
                    found
                }
                None => item.data.get(&comp)?,
            };
            if let Some(v) = hit {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// The value of `key` as of `tx_num`, using only history: the
    /// pre-image of the smallest mutation `t >= tx_num`. `None` means
    /// the key has no recorded mutation at or after `tx_num`.
    pub fn get_no_state_with_recent(
        &self,
        view: &HistoryView,
        tx: &impl KvRead,
        key: &[u8],
        tx_num: u64,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let ts = self
            .ii
            .idx_range(&view.ef_files, tx, key, tx_num, None, true, 1)?;
        let Some(t) = ts.first().copied() else {
            return Ok(None);
        };
        let pre = self
            .hist_value(view, tx, key, t)?
            .with_context(|| format!("{}: inverted index has tx {t} but no pre-image", self.base))?;
        Ok(Some(pre))
    }

    /// For every key mutated at or after `from_tx`: `(key, t, pre)`
    /// where `t` is the key's smallest mutation `>= from_tx`, so `pre`
    /// is the key's value as of `from_tx`. Ascending by key.
    pub fn history_range(
        &self,
        view: &HistoryView,
        tx: &impl KvRead,
        from_tx: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, u64, Vec<u8>)>> {
        let mut firsts: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        let from = tx_num_bytes(from_tx).to_vec();
        for (txb, key) in tx.dup_range(&self.ii.table_idx_keys, &from, None, usize::MAX) {
            let t = tx_num_from_bytes(&txb);
            firsts
                .entry(key)
                .and_modify(|cur| *cur = (*cur).min(t))
                .or_insert(t);
        }

        let step_size = self.opts.step_size;
        for item in view.ef_files.iter() {
            if item.range.tx_to(step_size) <= from_tx {
                continue;
            }
            let mut cursor = item.data.cursor();
            while let Some((key, raw)) = cursor.next()? {
                let ef = EliasFano::decode(&raw).map_err(anyhow::Error::msg)?;
                if let Some(t) = ef.seek(from_tx) {
                    firsts
                        .entry(key)
                        .and_modify(|cur| *cur = (*cur).min(t))
                        .or_insert(t);
                }
            }
        }

        let mut out = Vec::with_capacity(firsts.len().min(limit));
        for (key, t) in firsts {
            if out.len() >= limit {
                break;
            }
            let pre = self
                .hist_value(view, tx, &key, t)?
                .with_context(|| format!("{}: missing pre-image for tx {t}", self.base))?;
            out.push((key, t, pre));
        }
        Ok(out)
    }

    /// Collates the step's pre-images and posting lists.
    pub fn collate(
        &self,
        cancel: &Cancel,
        range: StepRange,
        ro: &impl KvRead,
    ) -> anyhow::Result<HistoryCollation> {
        let index = self.ii.collate(cancel, range, ro)?;

        let step_size = self.opts.step_size;
        let from = tx_num_bytes(range.tx_from(step_size)).to_vec();
        let to = tx_num_bytes(range.tx_to(step_size)).to_vec();

        // (key ‖ txNum) composites sort the same way the .v segment is
        // keyed, so collect then emit in order.
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (txb, key) in ro.dup_range(&self.ii.table_idx_keys, &from, Some(&to), usize::MAX) {
            if let Err(err) = cancel.check() {
                index.discard();
                return Err(err);
            }
            let mut suffix = [0u8; 8];
            suffix.copy_from_slice(&txb);
            let comp = composite(&key, &suffix);
            let pre = ro.get(&self.table_hist, &comp).unwrap_or_default();
            rows.insert(comp, pre);
        }

        let path = self.dir.join(files::file_name(&self.base, range, "v"));
        let mut writer = match SegmentWriter::create(
            &path,
            self.opts.segment_block_size,
            self.opts.compression_level,
            self.opts.fsync,
        ) {
            Ok(w) => w,
            Err(err) => {
                index.discard();
                return Err(err.into());
            }
        };
        for (comp, pre) in rows {
            if let Err(err) = writer.add(&comp, &pre) {
                writer.abort();
                index.discard();
                return Err(err.into());
            }
        }
        Ok(HistoryCollation {
            range,
            values: writer,
            index,
        })
    }

    pub fn build_files(
        &self,
        cancel: &Cancel,
        coll: HistoryCollation,
    ) -> anyhow::Result<HistoryFiles> {
        let HistoryCollation {
            range,
            values,
            index,
        } = coll;
        let ef_item = match self.ii.build_files(cancel, index) {
            Ok(item) => item,
            Err(err) => {
                values.abort();
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            values.abort();
            anyhow::bail!("operation cancelled");
        }
        let data_path = values.final_path().to_path_buf();
        values
            .finish()
            .with_context(|| format!("finish {} history segment", self.base))?;
        let data = SegmentReader::open(&data_path)?;
        let idx_path = self.dir.join(files::file_name(&self.base, range, "vi"));
        HashedIndex::build(&data, &idx_path, self.opts.fsync)
            .with_context(|| format!("build {} vi", self.base))?;
        let v_item = files::open_indexed_file(&self.dir, &self.base, range, "v", "vi")?;

        Ok(HistoryFiles { v_item, ef_item })
    }

    pub fn integrate(&self, built: HistoryFiles) {
        self.ii.integrate(built.ef_item);
        self.files.insert(built.v_item);
    }

    /// Rebuilds `.vi` accessors, then the inverted index's `.efi`.
    pub fn build_missed_indexes(&self) -> anyhow::Result<()> {
        self.ii.build_missed_indexes()?;
        for item in self.files.all() {
            if item.hashed.is_some() {
                continue;
            }
            let idx_path = self
                .dir
                .join(files::file_name(&self.base, item.range, "vi"));
            HashedIndex::build(&item.data, &idx_path, self.opts.fsync)
                .with_context(|| format!("rebuild {} vi", self.base))?;
            let reopened =
                files::open_indexed_file(&self.dir, &self.base, item.range, "v", "vi")?;
            self.files.replace(reopened);
        }
        Ok(())
    }

    /// Deletes hot history + inverted-index rows in `[tx_from, tx_to)`.
    pub fn prune(
        &self,
        cancel: &Cancel,
        rw: &mut RwTx<'_>,
        tx_from: u64,
        tx_to: Option<u64>,
        limit: u64,
    ) -> anyhow::Result<u64> {
        let from = tx_num_bytes(tx_from).to_vec();
        let to = tx_to.map(|t| tx_num_bytes(t).to_vec());
        let mut removed = 0u64;
        while removed < limit {
            cancel.check()?;
            let batch = rw.dup_range(
                &self.ii.table_idx_keys,
                &from,
                to.as_deref(),
                self.opts.prune_batch.min(limit - removed) as usize,
            );
            if batch.is_empty() {
                break;
            }
            for (txb, key) in batch {
                let mut suffix = [0u8; 8];
                suffix.copy_from_slice(&txb);
                rw.del(&self.table_hist, &composite(&key, &suffix));
                rw.dup_del(&self.ii.table_idx, &key, &txb);
                rw.dup_del(&self.ii.table_idx_keys, &txb, &key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(base = %self.base, removed, tx_from, "pruned history rows");
        }
        Ok(removed)
    }

    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// First txNum with hot rows, if any.
    pub fn first_tx_in_db(&self, tx: &impl KvRead) -> Option<u64> {
        tx.first_dup_key(&self.ii.table_idx_keys)
            .map(|k| tx_num_from_bytes(&k))
    }

    /// Last txNum with hot rows, if any.
    pub fn last_tx_in_db(&self, tx: &impl KvRead) -> Option<u64> {
        tx.last_dup_key(&self.ii.table_idx_keys)
            .map(|k| tx_num_from_bytes(&k))
    }
}

pub struct HistoryCollation {
    pub range: StepRange,
    values: SegmentWriter,
    index: IiCollation,
}

impl HistoryCollation {
    pub fn discard(self) {
        self.values.abort();
        self.index.discard();
    }
}

pub struct HistoryFiles {
    pub v_item: FileItem,
    pub ef_item: FileItem,
}
