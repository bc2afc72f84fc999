//! Domain: one semantic column family with latest-value and history
//! storage.
//!
//! The hot tier keeps, per key, the set of steps in which the key was
//! modified (keys table, inverted-step encoded, recent first) and the
//! latest value written during each of those steps (values table).
//! Collation promotes one finished step into an immutable value
//! segment with accessors; pruning then deletes the promoted rows.
//! Reads unify hot tier and files, newest version first.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::files::{self, FileItem, StepRange};
use crate::history::{History, HistoryCollation, HistoryFiles, HistoryView};
use crate::kv::{KvRead, RwTx};
use crate::merge;
use crate::options::{EngineOptions, IndexFlavor};
use crate::registry::{FileRegistry, FilesSnapshot};
use crate::segment::{SegmentReader, SegmentWriter};
use crate::step::{composite, inverted_step_bytes, step_from_inverted};

/// Hot-store table holding resumable prune cursors, keyed by the
/// pruned table's name.
pub const PRUNE_PROGRESS_TABLE: &str = "prune.progress";

#[derive(Debug)]
pub struct Domain {
    pub base: String,
    table_keys: String,
    table_vals: String,
    dir: PathBuf,
    pub files: FileRegistry,
    pub history: History,
    opts: Arc<EngineOptions>,
}

/// Consistent read view over one domain: file snapshot plus history
/// view, captured once per operation.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub files: FilesSnapshot,
    pub history: HistoryView,
}

/// In-progress collation of one step; discard on error or cancel.
pub struct Collation {
    pub range: StepRange,
    values: SegmentWriter,
    history: HistoryCollation,
}

impl Collation {
    pub fn discard(self) {
        self.values.abort();
        self.history.discard();
    }
}

/// Built-but-unpublished outputs of one step.
pub struct StaticFiles {
    pub values: FileItem,
    pub history: HistoryFiles,
}

impl Domain {
    pub fn new(
        base: &str,
        domain_dir: PathBuf,
        history_dir: PathBuf,
        idx_dir: PathBuf,
        opts: Arc<EngineOptions>,
    ) -> Self {
        Self {
            base: base.to_string(),
            table_keys: format!("{base}.keys"),
            table_vals: format!("{base}.vals"),
            dir: domain_dir,
            files: FileRegistry::new(),
            history: History::new(base, history_dir, idx_dir, opts.clone()),
            opts,
        }
    }

    /// Scans the snapshot directories and opens every published file.
    /// Stale `.tmp` outputs are removed; history or index files running
    /// ahead of the newest values file are dropped.
    pub fn open_folder(&self) -> anyhow::Result<()> {
        files::remove_tmp_files(&self.dir)?;
        self.history.open_folder()?;

        let mut ranges = files::scan_ranges(&self.dir, &self.base, "kv")?;
        ranges.sort();
        for range in ranges {
            match files::open_values_file(&self.dir, &self.base, range, self.opts.index_flavor) {
                Ok(item) => {
                    self.files.insert(item);
                }
                Err(err) => {
                    tracing::warn!(
                        base = %self.base, ?range, err = %format!("{err:#}"),
                        "skipping corrupt domain file"
                    );
                }
            }
        }

        // A power cut between a values build and a history build can
        // leave .v/.ef files beyond the newest .kv. Those are garbage.
        let lower = self.files.end_step_max();
        let dropped =
            self.history.files.scan_after(lower) + self.history.ii.files.scan_after(lower);
        if dropped > 0 {
            info!(base = %self.base, lower, dropped, "dropped history files ahead of values tier");
        }

        self.build_missed_indexes()?;
        Ok(())
    }

    /// Regenerates missing or corrupt accessors from the data segments.
    pub fn build_missed_indexes(&self) -> anyhow::Result<()> {
        self.history.build_missed_indexes()?;
        for item in self.files.all() {
            let missing_primary = match self.opts.index_flavor {
                IndexFlavor::BTree => item.bt.is_none(),
                IndexFlavor::Hashed => item.hashed.is_none(),
            };
            if !missing_primary && item.existence.is_some() {
                continue;
            }
            debug!(base = %self.base, range = ?item.range, "rebuilding domain accessors");
            merge::build_value_accessors(
                &self.opts,
                &self.dir,
                &self.base,
                item.range,
                &item.data,
                item.data.entries(),
            )?;
            let reopened = files::open_values_file(
                &self.dir,
                &self.base,
                item.range,
                self.opts.index_flavor,
            )?;
            self.files.replace(reopened);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        DomainSnapshot {
            files: self.files.snapshot(),
            history: self.history.view(),
        }
    }

    /// Latest value of `key`, hot tier first, then files newest to
    /// oldest. An empty stored value is a tombstone and reads as
    /// absent.
    pub fn get_latest(
        &self,
        snap: &DomainSnapshot,
        tx: &impl KvRead,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .get_latest_raw(snap, tx, key)?
            .filter(|v| !v.is_empty()))
    }

    /// Like [`Self::get_latest`] but preserves tombstones: a deleted
    /// key reads as `Some(empty)`.
    pub fn get_latest_raw(
        &self,
        snap: &DomainSnapshot,
        tx: &impl KvRead,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(inv_step) = tx.first_dup(&self.table_keys, key) {
            let mut suffix = [0u8; 8];
            suffix.copy_from_slice(&inv_step);
            let val = tx
                .get(&self.table_vals, &composite(key, &suffix))
                .with_context(|| {
                    format!(
                        "{}: keys row without values row at step {}",
                        self.base,
                        step_from_inverted(&inv_step)
                    )
                })?;
            return Ok(Some(val));
        }
        self.get_latest_from_files(snap, key)
    }

    fn get_latest_from_files(
        &self,
        snap: &DomainSnapshot,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        for item in snap.files.iter().rev() {
            if let Some(existence) = &item.existence {
                if !existence.contains(key) {
                    continue;
                }
            }
            if let Some(v) = probe_file(item, key)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Point-in-time read: the value of `key` as of `tx_num`. A key
    /// whose first recorded mutation is at or after `tx_num` with an
    /// empty pre-image did not exist then.
    pub fn get_as_of(
        &self,
        snap: &DomainSnapshot,
        tx: &impl KvRead,
        key: &[u8],
        tx_num: u64,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(pre) =
            self.history
                .get_no_state_with_recent(&snap.history, tx, key, tx_num)?
        {
            if pre.is_empty() {
                return Ok(None);
            }
            return Ok(Some(pre));
        }
        self.get_latest(snap, tx, key)
    }

    /// Merges hot tier and files over a min-heap and visits each
    /// distinct key under `prefix` once, in ascending key order, with
    /// its newest value. Tombstones are skipped.
    pub fn iterate_prefix(
        &self,
        snap: &DomainSnapshot,
        tx: &impl KvRead,
        prefix: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let step_size = self.opts.step_size;
        let mut sources: Vec<Box<dyn merge::MergeSource + '_>> = Vec::new();
        sources.push(Box::new(merge::DbSource::new(
            tx,
            &self.table_keys,
            &self.table_vals,
            prefix,
            step_size,
            None,
        )));
        for item in snap.files.iter() {
            // Files cover [from, to): their newest tx is end - 1, always
            // behind a hot row of the same step (whose end is step*S).
            sources.push(Box::new(merge::FileSource::new(
                &item.data,
                prefix,
                item.end_tx(step_size) - 1,
            )?));
        }
        let mut heap = merge::MergeHeap::new(sources)?;
        while let Some((key, val)) = heap.next_key()? {
            if val.is_empty() {
                continue;
            }
            visit(&key, &val)?;
        }
        Ok(())
    }

    /// Gathers the step's latest values into a new compressed segment
    /// and drives history collation for the same range.
    ///
    /// Preconditions: the step boundaries are step-aligned.
    pub fn collate(
        &self,
        cancel: &Cancel,
        step: u64,
        ro: &impl KvRead,
    ) -> anyhow::Result<Collation> {
        let range = StepRange::new(step, step + 1);
        let history = self.history.collate(cancel, range, ro)?;

        let path = self.dir.join(files::file_name(&self.base, range, "kv"));
        let mut values = match SegmentWriter::create(
            &path,
            self.opts.segment_block_size,
            self.opts.compression_level,
            self.opts.fsync,
        ) {
            Ok(w) => w,
            Err(err) => {
                history.discard();
                return Err(err.into());
            }
        };

        let step_bytes = inverted_step_bytes(step);
        for (key, dup) in ro.dup_range(&self.table_keys, b"", None, usize::MAX) {
            if let Err(err) = cancel.check() {
                values.abort();
                history.discard();
                return Err(err);
            }
            if dup.as_slice() != step_bytes {
                continue;
            }
            let Some(val) = ro.get(&self.table_vals, &composite(&key, &step_bytes)) else {
                values.abort();
                history.discard();
                anyhow::bail!(
                    "{}: keys row without values row during collate, key {key:x?}",
                    self.base
                );
            };
            if let Err(err) = values.add(&key, &val) {
                values.abort();
                history.discard();
                return Err(err.into());
            }
        }

        debug!(base = %self.base, step, entries = values.entries(), "collated step");
        Ok(Collation {
            range,
            values,
            history,
        })
    }

    /// Finishes compression, builds the accessor indexes and the
    /// existence filter, and opens the published files. Outputs are
    /// written as `.tmp`, fsynced, then renamed.
    pub fn build_files(&self, cancel: &Cancel, coll: Collation) -> anyhow::Result<StaticFiles> {
        let Collation {
            range,
            values,
            history,
        } = coll;

        let history_files = match self.history.build_files(cancel, history) {
            Ok(built) => built,
            Err(err) => {
                values.abort();
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            values.abort();
            anyhow::bail!("operation cancelled");
        }

        let entries = values.entries();
        let data_path = values.final_path().to_path_buf();
        values
            .finish()
            .with_context(|| format!("finish {} values segment", self.base))?;
        let data = SegmentReader::open(&data_path)?;
        merge::build_value_accessors(&self.opts, &self.dir, &self.base, range, &data, entries)?;
        let values_item =
            files::open_values_file(&self.dir, &self.base, range, self.opts.index_flavor)?;

        Ok(StaticFiles {
            values: values_item,
            history: history_files,
        })
    }

    /// Publishes built files into the registries and recomputes the
    /// read-only snapshots.
    pub fn integrate(&self, built: StaticFiles) {
        self.history.integrate(built.history);
        let item = self.files.insert(built.values);
        info!(base = %self.base, range = ?item.range, "integrated step files");
    }

    /// True when hot history rows exist behind the newest values file.
    pub fn can_prune(&self, tx: &impl KvRead) -> bool {
        match self.history.first_tx_in_db(tx) {
            None => false,
            Some(first) => first < self.files.end_step_max() * self.opts.step_size,
        }
    }

    /// Deletes hot rows whose step is at or before `step`, in bounded
    /// batches. Progress is persisted under [`PRUNE_PROGRESS_TABLE`]
    /// before each batch and on cancellation; a later call resumes from
    /// the saved step. History rows in `[tx_from, tx_to)` are pruned
    /// afterwards.
    pub fn prune(
        &self,
        cancel: &Cancel,
        rw: &mut RwTx<'_>,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
    ) -> anyhow::Result<u64> {
        let step = match rw.get(PRUNE_PROGRESS_TABLE, self.table_keys.as_bytes()) {
            Some(saved) if saved.len() == 8 => step_from_inverted(&saved),
            _ => step,
        };
        let threshold = inverted_step_bytes(step);

        let mut pruned = 0u64;
        let mut completed = false;
        loop {
            cancel.check().map_err(|err| {
                rw.put(
                    PRUNE_PROGRESS_TABLE,
                    self.table_keys.as_bytes().to_vec(),
                    threshold.to_vec(),
                );
                err
            })?;

            // Stored inverted step >= threshold means numeric step <= step.
            let batch: Vec<(Vec<u8>, Vec<u8>)> = rw
                .dup_range(&self.table_keys, b"", None, usize::MAX)
                .into_iter()
                .filter(|(_, dup)| dup.as_slice() >= threshold.as_slice())
                .take(self.opts.prune_batch.min(limit - pruned) as usize)
                .collect();
            if batch.is_empty() {
                completed = true;
                break;
            }
            for (key, dup) in batch {
                let mut suffix = [0u8; 8];
                suffix.copy_from_slice(&dup);
                rw.del(&self.table_vals, &composite(&key, &suffix));
                rw.dup_del(&self.table_keys, &key, &dup);
                pruned += 1;
            }
            rw.put(
                PRUNE_PROGRESS_TABLE,
                self.table_keys.as_bytes().to_vec(),
                threshold.to_vec(),
            );
            if pruned >= limit {
                break;
            }
        }
        if completed {
            rw.del(PRUNE_PROGRESS_TABLE, self.table_keys.as_bytes());
        }

        if pruned > 0 {
            info!(base = %self.base, step, pruned, "pruned domain rows");
        }
        self.history
            .prune(cancel, rw, tx_from, Some(tx_to), u64::MAX)?;
        Ok(pruned)
    }

    /// Rolls the domain back to `tx_unwind_to`: every key mutated at or
    /// after the unwind point gets its pre-image written back as a
    /// fresh latest value, newer hot rows are deleted, and history at
    /// and after the unwind point is pruned.
    pub fn unwind(
        &self,
        cancel: &Cancel,
        rw: &mut RwTx<'_>,
        snap: &DomainSnapshot,
        step: u64,
        tx_unwind_to: u64,
    ) -> anyhow::Result<()> {
        let step_size = self.opts.step_size;
        let mut seen: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut restores: Vec<(Vec<u8>, [u8; 8], Vec<u8>)> = Vec::new();

        if tx_unwind_to > 0 {
            for (key, _t, pre) in
                self.history
                    .history_range(&snap.history, rw, tx_unwind_to, usize::MAX)?
            {
                cancel.check()?;
                // Restore at the last mutation before the unwind point
                // when there is one, else just before the unwind point.
                let prior = self
                    .history
                    .ii
                    .idx_range(&snap.history.ef_files, rw, &key, 0, Some(tx_unwind_to), false, 1)?;
                let restore_tx = prior.first().copied().unwrap_or(tx_unwind_to - 1);
                let restore_step = restore_tx / step_size;
                restores.push((key.clone(), inverted_step_bytes(restore_step), pre));
                seen.insert(key);
            }
        }

        // Delete hot rows newer than the unwind point. Keys untouched
        // after the unwind point cannot have rows in later steps.
        let threshold = inverted_step_bytes(step);
        let doomed: Vec<(Vec<u8>, Vec<u8>)> = rw
            .dup_range(&self.table_keys, b"", None, usize::MAX)
            .into_iter()
            .filter(|(key, dup)| {
                dup.as_slice() <= threshold.as_slice()
                    && (tx_unwind_to == 0 || seen.contains(key))
            })
            .collect();
        for (key, dup) in doomed {
            cancel.check()?;
            let mut suffix = [0u8; 8];
            suffix.copy_from_slice(&dup);
            rw.del(&self.table_vals, &composite(&key, &suffix));
            rw.dup_del(&self.table_keys, &key, &dup);
        }

        for (key, step_bytes, val) in restores {
            rw.dup_put(&self.table_keys, key.clone(), step_bytes.to_vec());
            rw.put(&self.table_vals, composite(&key, &step_bytes), val);
        }

        self.history
            .prune(cancel, rw, tx_unwind_to, None, u64::MAX)?;
        info!(base = %self.base, tx_unwind_to, "unwound domain");
        Ok(())
    }

    /// Merges adjacent small files into a larger one when an aligned
    /// window is fully tiled. Returns true if a merge was published.
    pub fn merge_if_needed(&self, cancel: &Cancel) -> anyhow::Result<bool> {
        let snap = self.files.snapshot();
        let Some(window) = merge::find_merge_range(&snap) else {
            return Ok(false);
        };
        let inputs = merge::files_for_window(&snap, window);
        let merged = merge::merge_value_files(
            cancel,
            &self.opts,
            &self.dir,
            &self.base,
            &inputs,
            window,
        )?;
        self.files.insert(merged);
        info!(base = %self.base, ?window, inputs = inputs.len(), "merged domain files");

        // Merge the matching history windows when they tile too.
        let hist_snap = self.history.files.snapshot();
        let hist_inputs = merge::files_for_window(&hist_snap, window);
        if hist_inputs
            .iter()
            .map(|f| f.range.span())
            .sum::<u64>()
            == window.span()
        {
            let merged = merge::merge_history_files(
                cancel,
                &self.opts,
                self.history_dir(),
                &self.base,
                &hist_inputs,
                window,
            )?;
            self.history.files.insert(merged);
        }
        let ef_snap = self.history.ii.files.snapshot();
        let ef_inputs = merge::files_for_window(&ef_snap, window);
        if ef_inputs.iter().map(|f| f.range.span()).sum::<u64>() == window.span() {
            let merged = merge::merge_ef_files(
                cancel,
                &self.opts,
                self.idx_dir(),
                &self.base,
                &ef_inputs,
                window,
            )?;
            self.history.ii.files.insert(merged);
        }
        Ok(true)
    }

    /// Most recent step with hot rows, if any.
    pub fn last_step_in_db(&self, tx: &impl KvRead) -> Option<u64> {
        self.history
            .last_tx_in_db(tx)
            .map(|t| t / self.opts.step_size)
    }

    /// Oldest step with hot rows, if any.
    pub fn first_step_in_db(&self, tx: &impl KvRead) -> Option<u64> {
        self.history
            .first_tx_in_db(tx)
            .map(|t| t / self.opts.step_size)
    }

    pub(crate) fn keys_table(&self) -> &str {
        &self.table_keys
    }

    pub(crate) fn vals_table(&self) -> &str {
        &self.table_vals
    }

    fn history_dir(&self) -> &std::path::Path {
        self.history.dir()
    }

    fn idx_dir(&self) -> &std::path::Path {
        self.history.ii.dir()
    }
}

/// Exact-match probe of one value file: existence filter already
/// consulted by the caller; the primary index (or the segment's own
/// index block) resolves the position, and the stored key is verified.
fn probe_file(item: &FileItem, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
    if let Some(bt) = &item.bt {
        if let Some(pos) = bt.get(key) {
            if let Some((k, v)) = item.data.get_at(pos)? {
                if k == key {
                    return Ok(Some(v));
                }
            }
        }
        return Ok(None);
    }
    if let Some(hashed) = &item.hashed {
        for pos in hashed.lookup(key) {
            if let Some((k, v)) = item.data.get_at(pos)? {
                if k == key {
                    return Ok(Some(v));
                }
            }
        }
        return Ok(None);
    }
    Ok(item.data.get(key)?)
}
