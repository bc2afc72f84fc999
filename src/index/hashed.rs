//! Salted hashed access index (`.kvi`, `.vi`, `.efi`).
//!
//! Open-addressed table of `(hash64, position)` slots. The salt is
//! chosen at build time and persisted, so two builds of the same
//! segment may disagree byte-for-byte but always agree on lookups.
//! A lookup yields candidate positions; the caller must verify the key
//! against the segment, a hash hit is not an exact match.

use std::hash::BuildHasher;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::segment::{fsync_parent_dir, tmp_path, Pos, SegmentReader};

#[derive(Debug, Serialize, Deserialize)]
struct HashedData {
    salt: u64,
    /// `(hash, pos + 1)`; an unoccupied slot stores 0 in the second field.
    slots: Vec<(u64, u64)>,
}

#[derive(Debug)]
pub struct HashedIndex {
    data: HashedData,
    hasher: ahash::RandomState,
}

fn hasher_for(salt: u64) -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        salt,
        salt.rotate_left(17),
        0x9e37_79b9_7f4a_7c15,
        0xd6e8_feb8_6659_fd93,
    )
}

impl HashedIndex {
    pub fn build(segment: &SegmentReader, path: &Path, fsync: bool) -> anyhow::Result<()> {
        let n = segment.entries() as usize;
        let capacity = (n.saturating_mul(10) / 7).next_power_of_two().max(8);
        let salt: u64 = rand::random();
        let hasher = hasher_for(salt);

        let mut slots = vec![(0u64, 0u64); capacity];
        let mask = capacity as u64 - 1;
        segment.for_each_entry(|key, pos| {
            let h = hasher.hash_one(key);
            let mut i = (h & mask) as usize;
            while slots[i].1 != 0 {
                i = (i + 1) & mask as usize;
            }
            slots[i] = (h, pos + 1);
            Ok(())
        })?;

        let data = HashedData { salt, slots };
        let tmp = tmp_path(path);
        let bytes = bincode::serialize(&data).context("serialize hashed index")?;
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
        let data: HashedData = bincode::deserialize(&bytes)
            .with_context(|| format!("decode hashed index {}", path.display()))?;
        let hasher = hasher_for(data.salt);
        Ok(Self { data, hasher })
    }

    pub fn is_empty(&self) -> bool {
        self.data.slots.iter().all(|(_, p)| *p == 0)
    }

    /// Candidate positions for `key`, usually zero or one.
    pub fn lookup(&self, key: &[u8]) -> Vec<Pos> {
        let mask = self.data.slots.len() as u64 - 1;
        let h = self.hasher.hash_one(key);
        let mut i = (h & mask) as usize;
        let mut out = Vec::new();
        while self.data.slots[i].1 != 0 {
            if self.data.slots[i].0 == h {
                out.push(self.data.slots[i].1 - 1);
            }
            i = (i + 1) & mask as usize;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;

    #[test]
    fn lookup_then_verify() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let kv = dir.path().join("f.kv");
        let idx = dir.path().join("f.kvi");
        let mut w = SegmentWriter::create(&kv, 256, 1, false).expect("create");
        for i in 0u32..200 {
            w.add(format!("k{i:04}").as_bytes(), &i.to_le_bytes())
                .expect("add");
        }
        w.finish().expect("finish");
        let seg = SegmentReader::open(&kv).expect("open");
        HashedIndex::build(&seg, &idx, false).expect("build");
        let hi = HashedIndex::open(&idx).expect("open idx");

        let mut found = false;
        for pos in hi.lookup(b"k0123") {
            let (k, v) = seg.get_at(pos).expect("get_at").expect("entry");
            if k == b"k0123" {
                assert_eq!(v, 123u32.to_le_bytes().to_vec());
                found = true;
            }
        }
        assert!(found);

        for pos in hi.lookup(b"absent") {
            let (k, _) = seg.get_at(pos).expect("get_at").expect("entry");
            assert_ne!(k, b"absent".to_vec());
        }
    }
}
