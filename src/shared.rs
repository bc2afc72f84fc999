//! Shared domains: a transient, per-executor view over all four
//! domains and the standalone inverted indexes.
//!
//! Writes land in sorted in-memory maps and per-domain buffered
//! writers; `flush` materializes them into the hot store in one write
//! transaction, after recomputing and storing the commitment root.
//! Reads consult the in-memory view first and fall back to the
//! domain's latest state. The view is bound to one file snapshot taken
//! at construction; `refresh_snapshot` re-captures it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::commitment::{
    CommitmentContext, CommitmentState, CommitmentTrie, FoldedMerkle, TouchKind,
    COMMITMENT_STATE_KEY,
};
use crate::engine::{DomainKind, Engine, EngineSnapshot, IndexKind};
use crate::merge::{DbSource, FileSource, MergeHeap, MergeSource, RamSource};
use crate::step::inverted_step_bytes;

#[derive(Default)]
struct DomainBufferedWriter {
    /// `(key, inverted step, value)`; an empty value is a tombstone.
    values: Vec<(Vec<u8>, [u8; 8], Vec<u8>)>,
    /// `(key, txNum, pre-image)`.
    history: Vec<(Vec<u8>, u64, Vec<u8>)>,
}

impl DomainBufferedWriter {
    fn put_with_prev(&mut self, key: &[u8], val: &[u8], prev: &[u8], tx_num: u64, step_size: u64) {
        self.history.push((key.to_vec(), tx_num, prev.to_vec()));
        self.values.push((
            key.to_vec(),
            inverted_step_bytes(tx_num / step_size),
            val.to_vec(),
        ));
    }

    fn clear(&mut self) {
        self.values.clear();
        self.history.clear();
    }
}

pub struct SharedDomains {
    engine: Arc<Engine>,
    snap: EngineSnapshot,
    tx_num: u64,
    tx_num_set: bool,
    block_num: u64,

    account: FxHashMap<Vec<u8>, Vec<u8>>,
    code: FxHashMap<Vec<u8>, Vec<u8>>,
    commitment: FxHashMap<Vec<u8>, Vec<u8>>,
    /// Ordered, so prefix iteration can merge in-memory writes.
    storage: BTreeMap<Vec<u8>, Vec<u8>>,

    accounts_w: DomainBufferedWriter,
    storage_w: DomainBufferedWriter,
    code_w: DomainBufferedWriter,
    commitment_w: DomainBufferedWriter,
    index_w: FxHashMap<IndexKind, Vec<(Vec<u8>, u64)>>,

    touched: BTreeSet<(TouchKind, Vec<u8>)>,
    trie: Box<dyn CommitmentTrie>,
}

impl SharedDomains {
    /// Binds a new view to the engine's current file snapshot and
    /// restores the latest committed state.
    pub fn new(engine: Arc<Engine>) -> anyhow::Result<Self> {
        let snap = engine.snapshot();
        let mut sd = Self {
            snap,
            engine,
            tx_num: 0,
            tx_num_set: false,
            block_num: 0,
            account: FxHashMap::default(),
            code: FxHashMap::default(),
            commitment: FxHashMap::default(),
            storage: BTreeMap::new(),
            accounts_w: DomainBufferedWriter::default(),
            storage_w: DomainBufferedWriter::default(),
            code_w: DomainBufferedWriter::default(),
            commitment_w: DomainBufferedWriter::default(),
            index_w: FxHashMap::default(),
            touched: BTreeSet::new(),
            trie: Box::new(FoldedMerkle::new()),
        };
        sd.seek_commitment()?;
        Ok(sd)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn refresh_snapshot(&mut self) {
        self.snap = self.engine.snapshot();
    }

    /// Must be called before any write at a new transaction number.
    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.tx_num_set = true;
    }

    pub fn tx_num(&self) -> u64 {
        self.tx_num
    }

    pub fn set_block_num(&mut self, block_num: u64) {
        self.block_num = block_num;
    }

    pub fn block_num(&self) -> u64 {
        self.block_num
    }

    pub fn root_hash(&self) -> [u8; 32] {
        self.trie.root_hash()
    }

    fn writer(&mut self, kind: DomainKind) -> &mut DomainBufferedWriter {
        match kind {
            DomainKind::Accounts => &mut self.accounts_w,
            DomainKind::Storage => &mut self.storage_w,
            DomainKind::Code => &mut self.code_w,
            DomainKind::Commitment => &mut self.commitment_w,
        }
    }

    fn map_get(&self, kind: DomainKind, key: &[u8]) -> Option<&Vec<u8>> {
        match kind {
            DomainKind::Accounts => self.account.get(key),
            DomainKind::Code => self.code.get(key),
            DomainKind::Commitment => self.commitment.get(key),
            DomainKind::Storage => self.storage.get(key),
        }
    }

    fn map_put(&mut self, kind: DomainKind, key: Vec<u8>, val: Vec<u8>) {
        match kind {
            DomainKind::Accounts => {
                self.account.insert(key, val);
            }
            DomainKind::Code => {
                self.code.insert(key, val);
            }
            DomainKind::Commitment => {
                self.commitment.insert(key, val);
            }
            DomainKind::Storage => {
                self.storage.insert(key, val);
            }
        }
    }

    /// Cached-view read: in-memory first, then the domain's latest
    /// state. An in-memory tombstone reads as absent.
    pub fn domain_get(
        &self,
        kind: DomainKind,
        k1: &[u8],
        k2: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let key = join_key(k1, k2);
        if let Some(v) = self.map_get(kind, &key) {
            return Ok((!v.is_empty()).then(|| v.clone()));
        }
        let ro = self.engine.kv().ro();
        self.engine
            .domain(kind)
            .get_latest(self.snap.domain(kind), &ro, &key)
    }

    /// Point-in-time read through the bound snapshot.
    pub fn domain_get_as_of(
        &self,
        kind: DomainKind,
        k1: &[u8],
        k2: &[u8],
        tx_num: u64,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let key = join_key(k1, k2);
        let ro = self.engine.kv().ro();
        self.engine
            .domain(kind)
            .get_as_of(self.snap.domain(kind), &ro, &key, tx_num)
    }

    /// Writes `val` under `(k1 ‖ k2)`. `val` must be non-empty; use
    /// [`Self::domain_del`] for deletion. When `prev` is not supplied
    /// it is read through [`Self::domain_get`].
    pub fn domain_put(
        &mut self,
        kind: DomainKind,
        k1: &[u8],
        k2: &[u8],
        val: &[u8],
        prev: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !val.is_empty(),
            "domain_put: empty value for {kind:?}; use domain_del"
        );
        let key = join_key(k1, k2);
        self.check_reserved(kind, &key)?;
        assert!(
            self.tx_num_set,
            "transaction number must be set before writing"
        );
        let prev = match prev {
            Some(p) => p,
            None => self.domain_get(kind, k1, k2)?.unwrap_or_default(),
        };

        if kind == DomainKind::Code && prev == val {
            return Ok(());
        }
        self.touch(kind, &key);
        self.map_put(kind, key.clone(), val.to_vec());
        let (tx_num, step_size) = (self.tx_num, self.engine.opts.step_size);
        self.writer(kind)
            .put_with_prev(&key, val, &prev, tx_num, step_size);
        Ok(())
    }

    /// Deletes `(k1 ‖ k2)`. Deleting an account cascades: its code is
    /// cleared and every storage slot under the address is deleted.
    pub fn domain_del(
        &mut self,
        kind: DomainKind,
        k1: &[u8],
        k2: &[u8],
        prev: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let key = join_key(k1, k2);
        self.check_reserved(kind, &key)?;
        assert!(
            self.tx_num_set,
            "transaction number must be set before writing"
        );
        let prev = match prev {
            Some(p) => p,
            None => self.domain_get(kind, k1, k2)?.unwrap_or_default(),
        };

        match kind {
            DomainKind::Accounts => {
                self.domain_del(DomainKind::Code, k1, b"", None)?;
                self.domain_del_prefix(DomainKind::Storage, k1)?;
            }
            DomainKind::Code if prev.is_empty() => return Ok(()),
            _ => {}
        }

        self.touch(kind, &key);
        self.map_put(kind, key.clone(), Vec::new());
        let (tx_num, step_size) = (self.tx_num, self.engine.opts.step_size);
        self.writer(kind)
            .put_with_prev(&key, &[], &prev, tx_num, step_size);
        Ok(())
    }

    /// Deletes every storage key under `prefix`. Only the storage
    /// domain supports prefix deletion.
    pub fn domain_del_prefix(&mut self, kind: DomainKind, prefix: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            kind == DomainKind::Storage,
            "domain_del_prefix: not supported for {kind:?}"
        );
        let mut doomed: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.iterate_storage_prefix(prefix, |k, v| {
            doomed.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        for (key, prev) in doomed {
            self.domain_del(DomainKind::Storage, &key, b"", Some(prev))?;
        }
        Ok(())
    }

    /// Appends `key` to the named inverted index at the current txNum.
    pub fn index_add(&mut self, kind: IndexKind, key: &[u8]) {
        assert!(
            self.tx_num_set,
            "transaction number must be set before writing"
        );
        self.index_w
            .entry(kind)
            .or_default()
            .push((key.to_vec(), self.tx_num));
    }

    fn touch(&mut self, kind: DomainKind, key: &[u8]) {
        let touch_kind = match kind {
            DomainKind::Accounts => TouchKind::Account,
            DomainKind::Storage => TouchKind::Storage,
            DomainKind::Code => TouchKind::Code,
            // Branch data is the trie's own output, not an input.
            DomainKind::Commitment => return,
        };
        self.touched.insert((touch_kind, key.to_vec()));
    }

    fn check_reserved(&self, kind: DomainKind, key: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            !(kind == DomainKind::Commitment && key == COMMITMENT_STATE_KEY),
            "key {:?} is reserved for the commitment state record",
            String::from_utf8_lossy(COMMITMENT_STATE_KEY)
        );
        Ok(())
    }

    /// Merges in-memory writes, the hot tier, and storage files over a
    /// min-heap and visits each live storage key under `prefix` once,
    /// newest version first, in ascending key order.
    pub fn iterate_storage_prefix(
        &self,
        prefix: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let step_size = self.engine.opts.step_size;
        let storage_domain = self.engine.domain(DomainKind::Storage);
        let snap = &self.snap.storage;

        let ram_entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .storage
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let have_ram = !ram_entries.is_empty();

        let ro = self.engine.kv().ro();
        let mut sources: Vec<Box<dyn MergeSource + '_>> = Vec::new();
        sources.push(Box::new(RamSource::new(ram_entries, self.tx_num)));
        sources.push(Box::new(DbSource::new(
            &ro,
            storage_domain.keys_table(),
            storage_domain.vals_table(),
            prefix,
            step_size,
            have_ram.then_some(self.tx_num),
        )));
        for item in snap.files.iter() {
            sources.push(Box::new(FileSource::new(
                &item.data,
                prefix,
                item.end_tx(step_size) - 1,
            )?));
        }

        let mut heap = MergeHeap::new(sources)?;
        while let Some((key, val)) = heap.next_key()? {
            if val.is_empty() {
                continue;
            }
            visit(&key, &val)?;
        }
        Ok(())
    }

    /// Recomputes the commitment over the touched keys, optionally
    /// persisting the state record under the reserved key.
    pub fn compute_commitment(&mut self, save_state: bool) -> anyhow::Result<[u8; 32]> {
        if self.touched.is_empty() {
            return Ok(self.trie.root_hash());
        }
        let touched: Vec<(TouchKind, Vec<u8>)> = self.touched.iter().cloned().collect();

        // The trie reads back through this view; hand it out as a
        // callback while the trie is temporarily detached.
        let mut trie = std::mem::replace(&mut self.trie, Box::new(FoldedMerkle::new()));
        let result = trie.process_keys(&mut SdCommitmentCtx { sd: self }, &touched);
        self.trie = trie;
        let root = result?;
        self.touched.clear();

        if save_state {
            self.store_commitment_state(root)?;
        }
        Ok(root)
    }

    fn store_commitment_state(&mut self, root: [u8; 32]) -> anyhow::Result<()> {
        let state = CommitmentState {
            tx_num: self.tx_num,
            block_num: self.block_num,
            trie_state: self.trie.encode_state()?,
        };
        let encoded = state.encode();
        let prev = self
            .latest_commitment(COMMITMENT_STATE_KEY)?
            .unwrap_or_default();
        // Identical records are skipped; the txNum alone does not
        // justify a new row.
        if prev == encoded {
            return Ok(());
        }
        debug!(tx_num = self.tx_num, block_num = self.block_num, root = %hex32(&root), "storing commitment state");
        self.update_commitment_data(COMMITMENT_STATE_KEY, &encoded, Some(prev))
    }

    fn latest_commitment(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(v) = self.commitment.get(key) {
            return Ok((!v.is_empty()).then(|| v.clone()));
        }
        let ro = self.engine.kv().ro();
        self.engine.domain(DomainKind::Commitment).get_latest(
            &self.snap.commitment,
            &ro,
            key,
        )
    }

    /// Branch/state writes from the commitment driver itself; not
    /// subject to the reserved-key check.
    fn update_commitment_data(
        &mut self,
        key: &[u8],
        data: &[u8],
        prev: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        assert!(
            self.tx_num_set,
            "transaction number must be set before writing"
        );
        let prev = match prev {
            Some(p) => p,
            None => self.latest_commitment(key)?.unwrap_or_default(),
        };
        self.map_put(DomainKind::Commitment, key.to_vec(), data.to_vec());
        let (tx_num, step_size) = (self.tx_num, self.engine.opts.step_size);
        self.commitment_w
            .put_with_prev(key, data, &prev, tx_num, step_size);
        Ok(())
    }

    /// Materializes all buffered writes into the hot store in one
    /// write transaction: the commitment root and state record first,
    /// then per-domain pre-images, values, and the standalone inverted
    /// indexes. Buffered writers reset afterwards.
    pub fn flush(&mut self, cancel: &Cancel) -> anyhow::Result<[u8; 32]> {
        let root = self
            .compute_commitment(true)
            .context("flush commitment")?;

        let engine = self.engine.clone();
        let mut rw = engine.kv().rw();

        for kind in DomainKind::ALL {
            cancel.check()?;
            let domain = engine.domain(kind);
            for (key, tx_num, pre) in &self.writer_ref(kind).history {
                domain.history.put_prev_value(&mut rw, key, *tx_num, pre);
            }
        }
        for kind in DomainKind::ALL {
            cancel.check()?;
            let domain = engine.domain(kind);
            let keys_table = domain.keys_table().to_string();
            let vals_table = domain.vals_table().to_string();
            for (key, step_bytes, val) in &self.writer_ref(kind).values {
                rw.dup_put(&keys_table, key.clone(), step_bytes.to_vec());
                rw.put(
                    &vals_table,
                    crate::step::composite(key, step_bytes),
                    val.clone(),
                );
            }
        }
        for kind in IndexKind::ALL {
            cancel.check()?;
            if let Some(pending) = self.index_w.get(&kind) {
                let index = engine.index(kind);
                for (key, tx_num) in pending {
                    index.add(&mut rw, key, *tx_num);
                }
            }
        }
        drop(rw);

        for kind in DomainKind::ALL {
            self.writer(kind).clear();
        }
        self.index_w.clear();
        info!(tx_num = self.tx_num, root = %hex32(&root), "flushed shared domains");
        Ok(root)
    }

    fn writer_ref(&self, kind: DomainKind) -> &DomainBufferedWriter {
        match kind {
            DomainKind::Accounts => &self.accounts_w,
            DomainKind::Storage => &self.storage_w,
            DomainKind::Code => &self.code_w,
            DomainKind::Commitment => &self.commitment_w,
        }
    }

    /// Rolls all four domains back to `tx_unwind_to`, prunes the
    /// standalone inverted indexes at and after it, clears the
    /// in-memory view, and restores the commitment state recorded at
    /// the unwind point.
    pub fn unwind(&mut self, cancel: &Cancel, tx_unwind_to: u64) -> anyhow::Result<()> {
        self.flush(cancel)?;

        let engine = self.engine.clone();
        let step = tx_unwind_to / engine.opts.step_size;
        info!(tx_unwind_to, step, "unwinding shared domains");
        {
            let mut rw = engine.kv().rw();
            for kind in DomainKind::ALL {
                engine.domain(kind).unwind(
                    cancel,
                    &mut rw,
                    self.snap.domain(kind),
                    step,
                    tx_unwind_to,
                )?;
            }
            for kind in IndexKind::ALL {
                engine
                    .index(kind)
                    .prune(cancel, &mut rw, tx_unwind_to, None, u64::MAX)?;
            }
        }

        self.clear_ram(true);
        self.refresh_snapshot();
        self.seek_commitment()?;
        Ok(())
    }

    pub fn clear_ram(&mut self, reset_commitment: bool) {
        self.account.clear();
        self.code.clear();
        self.commitment.clear();
        self.storage.clear();
        for kind in DomainKind::ALL {
            self.writer(kind).clear();
        }
        self.index_w.clear();
        if reset_commitment {
            self.touched.clear();
            self.trie.reset();
        }
        self.tx_num = 0;
        self.tx_num_set = false;
        self.block_num = 0;
    }

    /// Restores the most recent committed state: the commitment
    /// history is searched newest-first for the reserved key and the
    /// record is read back as of `txn + 1` (the record stored *at*
    /// `txn` must itself be visible). When the commitment domain has
    /// no history files at all (they are not required to exist), the
    /// latest-value tier serves as fallback.
    pub fn seek_commitment(&mut self) -> anyhow::Result<Option<(u64, u64)>> {
        let engine = self.engine.clone();
        let cdom = engine.domain(DomainKind::Commitment);
        let snap = self.snap.commitment.clone();

        let raw = {
            let ro = engine.kv().ro();
            let newest = cdom.history.ii.idx_range(
                &snap.history.ef_files,
                &ro,
                COMMITMENT_STATE_KEY,
                0,
                None,
                false,
                1,
            )?;
            match newest.first() {
                Some(&txn) => {
                    cdom.get_as_of(&snap, &ro, COMMITMENT_STATE_KEY, txn + 1)?
                }
                None => cdom.get_latest(&snap, &ro, COMMITMENT_STATE_KEY)?,
            }
        };

        let Some(raw) = raw else {
            self.trie.reset();
            self.tx_num = 0;
            self.tx_num_set = false;
            self.block_num = 0;
            return Ok(None);
        };
        let state = CommitmentState::decode(&raw).context("decode commitment state")?;
        self.trie.set_state(&state.trie_state)?;
        self.tx_num = state.tx_num;
        self.tx_num_set = true;
        self.block_num = state.block_num;
        info!(
            tx_num = state.tx_num,
            block_num = state.block_num,
            "restored commitment state"
        );
        Ok(Some((state.block_num, state.tx_num)))
    }
}

/// The trie's view back into the shared domains.
struct SdCommitmentCtx<'a> {
    sd: &'a mut SharedDomains,
}

impl CommitmentContext for SdCommitmentCtx<'_> {
    fn account(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.sd.domain_get(DomainKind::Accounts, key, b"")
    }

    fn storage(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.sd.domain_get(DomainKind::Storage, key, b"")
    }

    fn code(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.sd.domain_get(DomainKind::Code, key, b"")
    }

    fn branch(&mut self, prefix: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.sd.latest_commitment(prefix)
    }

    fn put_branch(&mut self, prefix: &[u8], data: &[u8]) -> anyhow::Result<()> {
        self.sd.update_commitment_data(prefix, data, None)
    }
}

fn join_key(k1: &[u8], k2: &[u8]) -> Vec<u8> {
    if k2.is_empty() {
        return k1.to_vec();
    }
    let mut out = Vec::with_capacity(k1.len() + k2.len());
    out.extend_from_slice(k1);
    out.extend_from_slice(k2);
    out
}

fn hex32(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
