//! Ordered access index (`.bt`) over a compressed segment.
//!
//! A paged sorted array of `(key, position)` pairs: page heads are held
//! for a first binary search, then the page itself is searched. Keys
//! are duplicated from the segment, which keeps the index
//! self-contained and rebuildable.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::segment::{fsync_parent_dir, tmp_path, Pos, SegmentReader};

pub const DEFAULT_BTREE_M: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct BtData {
    m: u32,
    /// First key of each page.
    heads: Vec<Vec<u8>>,
    pages: Vec<Vec<(Vec<u8>, Pos)>>,
}

#[derive(Debug)]
pub struct BtIndex {
    data: BtData,
}

impl BtIndex {
    /// Builds the index from a finished segment and publishes it via
    /// `.tmp` + rename.
    pub fn build(
        segment: &SegmentReader,
        path: &Path,
        m: usize,
        fsync: bool,
    ) -> anyhow::Result<()> {
        let m = m.max(2);
        let mut data = BtData {
            m: m as u32,
            heads: Vec::new(),
            pages: Vec::new(),
        };
        segment.for_each_entry(|key, pos| {
            match data.pages.last_mut() {
                Some(page) if page.len() < m => page.push((key.to_vec(), pos)),
                _ => {
                    data.heads.push(key.to_vec());
                    data.pages.push(vec![(key.to_vec(), pos)]);
                }
            }
            Ok(())
        })?;

        let tmp = tmp_path(path);
        let bytes = bincode::serialize(&data).context("serialize bt index")?;
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&bytes)?;
        if fsync {
            f.sync_data()?;
        }
        drop(f);
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        if fsync {
            fsync_parent_dir(path)?;
        }
        Ok(())
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let data: BtData = bincode::deserialize(&bytes)
            .with_context(|| format!("decode bt index {}", path.display()))?;
        Ok(Self { data })
    }

    pub fn is_empty(&self) -> bool {
        self.data.pages.is_empty()
    }

    /// Exact-match lookup; returns the entry's segment position.
    pub fn get(&self, key: &[u8]) -> Option<Pos> {
        let page_idx = self.page_for(key)?;
        let page = &self.data.pages[page_idx];
        page.binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| page[i].1)
    }

    /// Cursor positioned at the first entry with key `>= from`.
    pub fn seek(&self, from: &[u8]) -> BtCursor<'_> {
        if self.data.pages.is_empty() {
            return BtCursor {
                index: self,
                page: 0,
                entry: 0,
            };
        }
        // Last page whose head is <= from; entries before it are all smaller.
        let page = self
            .data
            .heads
            .partition_point(|h| h.as_slice() <= from)
            .saturating_sub(1);
        let entry = self.data.pages[page].partition_point(|(k, _)| k.as_slice() < from);
        let mut cursor = BtCursor {
            index: self,
            page,
            entry,
        };
        cursor.normalize();
        cursor
    }

    fn page_for(&self, key: &[u8]) -> Option<usize> {
        if self.data.heads.is_empty() {
            return None;
        }
        let idx = self.data.heads.partition_point(|h| h.as_slice() <= key);
        idx.checked_sub(1)
    }
}

pub struct BtCursor<'a> {
    index: &'a BtIndex,
    page: usize,
    entry: usize,
}

impl BtCursor<'_> {
    fn normalize(&mut self) {
        while self.page < self.index.data.pages.len()
            && self.entry >= self.index.data.pages[self.page].len()
        {
            self.page += 1;
            self.entry = 0;
        }
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, Pos)> {
        self.normalize();
        let page = self.index.data.pages.get(self.page)?;
        let (k, p) = page.get(self.entry)?.clone();
        self.entry += 1;
        Some((k, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;

    fn fixture(dir: &Path, n: u32) -> (SegmentReader, std::path::PathBuf) {
        let kv = dir.join("f.kv");
        let bt = dir.join("f.bt");
        let mut w = SegmentWriter::create(&kv, 256, 1, false).expect("create");
        for i in 0..n {
            w.add(format!("k{i:04}").as_bytes(), &i.to_le_bytes())
                .expect("add");
        }
        w.finish().expect("finish");
        let seg = SegmentReader::open(&kv).expect("open");
        BtIndex::build(&seg, &bt, 16, false).expect("build");
        (seg, bt)
    }

    #[test]
    fn get_and_seek() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let (seg, bt_path) = fixture(dir.path(), 100);
        let bt = BtIndex::open(&bt_path).expect("open bt");

        let pos = bt.get(b"k0042").expect("present");
        let (k, v) = seg.get_at(pos).expect("get_at").expect("entry");
        assert_eq!(k, b"k0042".to_vec());
        assert_eq!(v, 42u32.to_le_bytes().to_vec());
        assert!(bt.get(b"k9999").is_none());
        assert!(bt.get(b"a").is_none());

        let mut c = bt.seek(b"k0097");
        let keys: Vec<Vec<u8>> = std::iter::from_fn(|| c.next().map(|(k, _)| k)).collect();
        assert_eq!(
            keys,
            vec![b"k0097".to_vec(), b"k0098".to_vec(), b"k0099".to_vec()]
        );
    }
}
