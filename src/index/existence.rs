//! Existence filter (`.kvei`): approximate membership over the keys of
//! one segment.
//!
//! Bloom filter with a build-time random seed, sized for the configured
//! false-positive rate. May yield false positives, never false
//! negatives. Segments with fewer than two keys are marked empty and
//! the filter answers "contains" unconditionally.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

use crate::segment::{fsync_parent_dir, tmp_path};

#[derive(Serialize, Deserialize)]
struct ExistenceData {
    empty: bool,
    seed: [u8; 32],
    bloom: Option<Bloom<[u8]>>,
}

pub struct ExistenceFilter {
    data: ExistenceData,
}

pub struct ExistenceFilterBuilder {
    data: ExistenceData,
}

impl ExistenceFilterBuilder {
    /// `keys_count` must be the exact number of keys that will be added.
    pub fn new(keys_count: u64, fp_rate: f64) -> Self {
        use rand::Rng;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed[..]);
        let bloom = (keys_count >= 2)
            .then(|| Bloom::new_for_fp_rate_with_seed(keys_count as usize, fp_rate, &seed));
        Self {
            data: ExistenceData {
                empty: bloom.is_none(),
                seed,
                bloom,
            },
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        if let Some(bloom) = self.data.bloom.as_mut() {
            bloom.set(key);
        }
    }

    /// Publishes the filter via `.tmp` + fsync + rename and returns the
    /// in-memory handle.
    pub fn finish(self, path: &Path, fsync: bool) -> anyhow::Result<ExistenceFilter> {
        let tmp = tmp_path(path);
        let bytes = bincode::serialize(&self.data).context("serialize existence filter")?;
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
        Ok(ExistenceFilter { data: self.data })
    }
}

impl ExistenceFilter {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let data: ExistenceData = bincode::deserialize(&bytes)
            .with_context(|| format!("decode existence filter {}", path.display()))?;
        Ok(Self { data })
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match &self.data.bloom {
            None => true,
            Some(bloom) => bloom.check(key),
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.data.empty
    }
}

impl std::fmt::Debug for ExistenceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceFilter")
            .field("empty", &self.data.empty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives_and_bounded_false_positives() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("f.kvei");
        let keys: Vec<Vec<u8>> = (0u32..2000).map(|i| format!("m{i}").into_bytes()).collect();

        let mut b = ExistenceFilterBuilder::new(keys.len() as u64, 0.01);
        for k in &keys {
            b.add(k);
        }
        let filter = b.finish(&path, false).expect("finish");

        for k in &keys {
            assert!(filter.contains(k));
        }
        let false_positives = (0u32..2000)
            .map(|i| format!("absent{i}").into_bytes())
            .filter(|k| filter.contains(k))
            .count();
        // 1% target; tolerate up to 2% over this sample.
        assert!(false_positives <= 40, "fp count {false_positives}");

        let reopened = ExistenceFilter::open(&path).expect("open");
        for k in &keys {
            assert!(reopened.contains(k));
        }
    }

    #[test]
    fn tiny_sets_always_answer_contains() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("one.kvei");
        let mut b = ExistenceFilterBuilder::new(1, 0.01);
        b.add(b"only");
        let filter = b.finish(&path, false).expect("finish");
        assert!(filter.is_empty_marker());
        assert!(filter.contains(b"only"));
        assert!(filter.contains(b"anything"));
    }
}
