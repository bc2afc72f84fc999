//! Hot-tier key-value store.
//!
//! The engine treats the transactional store as an external
//! collaborator; this module pins down the contract the engine needs
//! (ordered plain tables, duplicate-sorted tables, shared read
//! snapshots, an exclusive write transaction) and ships an in-process
//! reference implementation backed by ordered maps. Hot-tier mutation
//! is single-writer: [`RwTx`] holds the store's write lock for its
//! lifetime, so readers observe pre- or post-commit state atomically.
//!
//! Table encodings used by the engine (per domain `base`):
//! - `{base}.keys` (dup): `key → u64_be(^step)`, recent step first.
//! - `{base}.vals` (plain): `key ‖ u64_be(^step) → value`.
//! - `{base}.history` (plain): `key ‖ u64_be(txNum) → pre-image`.
//! - `{base}.idx` (dup): `key → u64_be(txNum)`.
//! - `{base}.idx.keys` (dup): `u64_be(txNum) → key`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

#[doc(hidden)]
#[derive(Debug, Default)]
pub struct Tables {
    plain: FxHashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    dup: FxHashMap<String, BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>>,
}

impl Tables {
    fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.plain.get(table)?.get(key).cloned()
    }

    fn seek(&self, table: &str, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.plain
            .get(table)?
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn next_after(&self, table: &str, after: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.plain
            .get(table)?
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn first_key(&self, table: &str) -> Option<Vec<u8>> {
        self.plain.get(table)?.keys().next().cloned()
    }

    fn last_key(&self, table: &str) -> Option<Vec<u8>> {
        self.plain.get(table)?.keys().next_back().cloned()
    }

    fn first_dup(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.dup.get(table)?.get(key)?.iter().next().cloned()
    }

    fn dups(&self, table: &str, key: &[u8]) -> Vec<Vec<u8>> {
        self.dup
            .get(table)
            .and_then(|t| t.get(key))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn dup_seek(&self, table: &str, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let t = self.dup.get(table)?;
        let (k, set) = t
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .next()?;
        Some((k.clone(), set.iter().next()?.clone()))
    }

    fn dup_next_no_dup(&self, table: &str, after: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let t = self.dup.get(table)?;
        let (k, set) = t
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
            .next()?;
        Some((k.clone(), set.iter().next()?.clone()))
    }

    fn first_dup_key(&self, table: &str) -> Option<Vec<u8>> {
        self.dup.get(table)?.keys().next().cloned()
    }

    fn last_dup_key(&self, table: &str) -> Option<Vec<u8>> {
        self.dup.get(table)?.keys().next_back().cloned()
    }

    /// All `(key, dup)` pairs with `from <= key < to`, key order then
    /// dup order, at most `limit` pairs.
    fn dup_range(
        &self,
        table: &str,
        from: &[u8],
        to: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(t) = self.dup.get(table) else {
            return Vec::new();
        };
        let upper = match to {
            Some(to) => Bound::Excluded(to),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for (k, set) in t.range::<[u8], _>((Bound::Included(from), upper)) {
            for d in set {
                if out.len() >= limit {
                    return out;
                }
                out.push((k.clone(), d.clone()));
            }
        }
        out
    }
}

/// In-process reference store. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct HotKv {
    inner: Arc<RwLock<Tables>>,
}

impl HotKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared read snapshot.
    pub fn ro(&self) -> RoTx<'_> {
        RoTx {
            guard: self.inner.read(),
        }
    }

    /// Exclusive write transaction.
    pub fn rw(&self) -> RwTx<'_> {
        RwTx {
            guard: self.inner.write(),
        }
    }
}

pub struct RoTx<'a> {
    guard: RwLockReadGuard<'a, Tables>,
}

pub struct RwTx<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
}

/// Read surface shared by [`RoTx`] and [`RwTx`].
pub trait KvRead {
    #[doc(hidden)]
    fn tables(&self) -> &Tables;

    fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.tables().get(table, key)
    }

    fn seek(&self, table: &str, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.tables().seek(table, from)
    }

    fn next_after(&self, table: &str, after: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.tables().next_after(table, after)
    }

    fn first_key(&self, table: &str) -> Option<Vec<u8>> {
        self.tables().first_key(table)
    }

    fn last_key(&self, table: &str) -> Option<Vec<u8>> {
        self.tables().last_key(table)
    }

    fn first_dup(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.tables().first_dup(table, key)
    }

    fn dups(&self, table: &str, key: &[u8]) -> Vec<Vec<u8>> {
        self.tables().dups(table, key)
    }

    fn dup_seek(&self, table: &str, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.tables().dup_seek(table, from)
    }

    fn dup_next_no_dup(&self, table: &str, after: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.tables().dup_next_no_dup(table, after)
    }

    fn first_dup_key(&self, table: &str) -> Option<Vec<u8>> {
        self.tables().first_dup_key(table)
    }

    fn last_dup_key(&self, table: &str) -> Option<Vec<u8>> {
        self.tables().last_dup_key(table)
    }

    fn dup_range(
        &self,
        table: &str,
        from: &[u8],
        to: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.tables().dup_range(table, from, to, limit)
    }
}

impl KvRead for RoTx<'_> {
    fn tables(&self) -> &Tables {
        &self.guard
    }
}

impl KvRead for RwTx<'_> {
    fn tables(&self) -> &Tables {
        &self.guard
    }
}

impl RwTx<'_> {
    pub fn put(&mut self, table: &str, key: Vec<u8>, val: Vec<u8>) {
        self.guard
            .plain
            .entry(table.to_string())
            .or_default()
            .insert(key, val);
    }

    pub fn del(&mut self, table: &str, key: &[u8]) -> bool {
        self.guard
            .plain
            .get_mut(table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn dup_put(&mut self, table: &str, key: Vec<u8>, dup: Vec<u8>) {
        self.guard
            .dup
            .entry(table.to_string())
            .or_default()
            .entry(key)
            .or_default()
            .insert(dup);
    }

    pub fn dup_del(&mut self, table: &str, key: &[u8], dup: &[u8]) -> bool {
        let Some(t) = self.guard.dup.get_mut(table) else {
            return false;
        };
        let Some(set) = t.get_mut(key) else {
            return false;
        };
        let removed = set.remove(dup);
        if set.is_empty() {
            t.remove(key);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_table_orders_and_drops_empty_keys() {
        let kv = HotKv::new();
        {
            let mut rw = kv.rw();
            rw.dup_put("t", b"k".to_vec(), vec![2]);
            rw.dup_put("t", b"k".to_vec(), vec![1]);
            rw.dup_put("t", b"k".to_vec(), vec![3]);
        }
        let ro = kv.ro();
        assert_eq!(ro.first_dup("t", b"k"), Some(vec![1]));
        assert_eq!(ro.dups("t", b"k"), vec![vec![1], vec![2], vec![3]]);
        drop(ro);

        let mut rw = kv.rw();
        assert!(rw.dup_del("t", b"k", &[1]));
        assert!(rw.dup_del("t", b"k", &[2]));
        assert!(rw.dup_del("t", b"k", &[3]));
        assert_eq!(rw.first_dup("t", b"k"), None);
        assert_eq!(rw.first_dup_key("t"), None);
    }

    #[test]
    fn dup_range_respects_bounds_and_limit() {
        let kv = HotKv::new();
        {
            let mut rw = kv.rw();
            for k in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
                rw.dup_put("t", k.to_vec(), vec![0]);
                rw.dup_put("t", k.to_vec(), vec![1]);
            }
        }
        let ro = kv.ro();
        let all = ro.dup_range("t", b"a", Some(b"c"), usize::MAX);
        assert_eq!(all.len(), 4);
        let capped = ro.dup_range("t", b"a", None, 3);
        assert_eq!(capped.len(), 3);
    }
}
