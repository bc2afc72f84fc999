//! Engine: the four state domains plus the standalone inverted
//! indexes, wired to one hot store and one snapshot directory tree.
//!
//! Directory layout under `<datadir>/snapshots/`:
//! `domain/` value segments and their accessors, `history/` pre-image
//! segments, `idx/` posting lists, `accessors/` rebuilt indexes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::cancel::Cancel;
use crate::domain::{Domain, DomainSnapshot, StaticFiles};
use crate::history::InvertedIndex;
use crate::kv::{HotKv, KvRead};
use crate::options::EngineOptions;
use crate::step::inverted_step_bytes;

pub const DOMAIN_BASES: [&str; 4] = ["accounts", "storage", "code", "commitment"];
pub const INDEX_BASES: [&str; 4] = ["logaddrs", "logtopics", "tracesfrom", "tracesto"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    Accounts,
    Storage,
    Code,
    Commitment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    LogAddrs,
    LogTopics,
    TracesFrom,
    TracesTo,
}

impl DomainKind {
    pub const ALL: [DomainKind; 4] = [
        DomainKind::Accounts,
        DomainKind::Storage,
        DomainKind::Code,
        DomainKind::Commitment,
    ];
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::LogAddrs,
        IndexKind::LogTopics,
        IndexKind::TracesFrom,
        IndexKind::TracesTo,
    ];
}

#[derive(Debug, Clone)]
pub struct SnapshotDirs {
    pub root: PathBuf,
    pub domain: PathBuf,
    pub history: PathBuf,
    pub idx: PathBuf,
    pub accessors: PathBuf,
}

impl SnapshotDirs {
    pub fn new(datadir: &Path) -> Self {
        let root = datadir.join("snapshots");
        Self {
            domain: root.join("domain"),
            history: root.join("history"),
            idx: root.join("idx"),
            accessors: root.join("accessors"),
            root,
        }
    }

    pub fn create(&self) -> anyhow::Result<()> {
        for dir in [&self.root, &self.domain, &self.history, &self.idx, &self.accessors] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create dir {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Consistent per-domain read views, captured together.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub accounts: DomainSnapshot,
    pub storage: DomainSnapshot,
    pub code: DomainSnapshot,
    pub commitment: DomainSnapshot,
}

impl EngineSnapshot {
    pub fn domain(&self, kind: DomainKind) -> &DomainSnapshot {
        match kind {
            DomainKind::Accounts => &self.accounts,
            DomainKind::Storage => &self.storage,
            DomainKind::Code => &self.code,
            DomainKind::Commitment => &self.commitment,
        }
    }
}

pub struct Engine {
    pub opts: Arc<EngineOptions>,
    pub dirs: SnapshotDirs,
    kv: HotKv,
    accounts: Domain,
    storage: Domain,
    code: Domain,
    commitment: Domain,
    log_addrs: InvertedIndex,
    log_topics: InvertedIndex,
    traces_from: InvertedIndex,
    traces_to: InvertedIndex,
    build_pool: rayon::ThreadPool,
}

impl Engine {
    /// Opens the engine over `datadir`, scanning published files and
    /// removing stale `.tmp` outputs.
    pub fn open(datadir: &Path, opts: EngineOptions) -> anyhow::Result<Arc<Self>> {
        let opts = Arc::new(opts);
        let dirs = SnapshotDirs::new(datadir);
        dirs.create()?;

        let new_domain = |base: &str| {
            Domain::new(
                base,
                dirs.domain.clone(),
                dirs.history.clone(),
                dirs.idx.clone(),
                opts.clone(),
            )
        };
        let new_index = |base: &str| InvertedIndex::new(base, dirs.idx.clone(), opts.clone());

        let accounts = new_domain("accounts");
        let storage = new_domain("storage");
        let code = new_domain("code");
        let commitment = new_domain("commitment");
        let log_addrs = new_index("logaddrs");
        let log_topics = new_index("logtopics");
        let traces_from = new_index("tracesfrom");
        let traces_to = new_index("tracesto");

        let build_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.build_workers.max(1))
            .thread_name(|i| format!("stratadb-build-{i}"))
            .build()
            .context("build worker pool")?;

        let engine = Self {
            accounts,
            storage,
            code,
            commitment,
            log_addrs,
            log_topics,
            traces_from,
            traces_to,
            kv: HotKv::new(),
            opts,
            dirs,
            build_pool,
        };

        for kind in DomainKind::ALL {
            engine
                .domain(kind)
                .open_folder()
                .with_context(|| format!("open {} folder", engine.domain(kind).base))?;
        }
        for kind in IndexKind::ALL {
            engine.index(kind).open_folder()?;
        }
        Ok(Arc::new(engine))
    }

    pub fn kv(&self) -> &HotKv {
        &self.kv
    }

    pub fn domain(&self, kind: DomainKind) -> &Domain {
        match kind {
            DomainKind::Accounts => &self.accounts,
            DomainKind::Storage => &self.storage,
            DomainKind::Code => &self.code,
            DomainKind::Commitment => &self.commitment,
        }
    }

    pub fn index(&self, kind: IndexKind) -> &InvertedIndex {
        match kind {
            IndexKind::LogAddrs => &self.log_addrs,
            IndexKind::LogTopics => &self.log_topics,
            IndexKind::TracesFrom => &self.traces_from,
            IndexKind::TracesTo => &self.traces_to,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            accounts: self.accounts.snapshot(),
            storage: self.storage.snapshot(),
            code: self.code.snapshot(),
            commitment: self.commitment.snapshot(),
        }
    }

    /// Promotes one finished step across every domain and standalone
    /// index: collate → build files (in parallel on the worker pool) →
    /// integrate → prune the promoted hot rows.
    pub fn promote_step(&self, cancel: &Cancel, step: u64) -> anyhow::Result<()> {
        let tx_from = step * self.opts.step_size;
        let tx_to = (step + 1) * self.opts.step_size;
        let range = crate::files::StepRange::new(step, step + 1);

        // Collate everything under one read snapshot; discard all
        // in-progress writers if any collation fails.
        let mut collations = Vec::with_capacity(4);
        let mut ii_collations = Vec::with_capacity(4);
        {
            let ro = self.kv.ro();
            for kind in DomainKind::ALL {
                match self.domain(kind).collate(cancel, step, &ro) {
                    Ok(coll) => collations.push((kind, coll)),
                    Err(err) => {
                        discard_all(collations, ii_collations);
                        return Err(err);
                    }
                }
            }
            for kind in IndexKind::ALL {
                match self.index(kind).collate(cancel, range, &ro) {
                    Ok(coll) => ii_collations.push((kind, coll)),
                    Err(err) => {
                        discard_all(collations, ii_collations);
                        return Err(err);
                    }
                }
            }
        }

        // Build in parallel; each task owns its collation.
        let built: Vec<anyhow::Result<(DomainKind, StaticFiles)>> =
            self.build_pool.install(|| {
                use rayon::prelude::*;
                collations
                    .into_par_iter()
                    .map(|(kind, coll)| {
                        let files = self.domain(kind).build_files(cancel, coll)?;
                        Ok((kind, files))
                    })
                    .collect()
            });
        let ii_built: Vec<anyhow::Result<(IndexKind, crate::files::FileItem)>> =
            self.build_pool.install(|| {
                use rayon::prelude::*;
                ii_collations
                    .into_par_iter()
                    .map(|(kind, coll)| {
                        let item = self.index(kind).build_files(cancel, coll)?;
                        Ok((kind, item))
                    })
                    .collect()
            });

        for result in built {
            let (kind, files) = result?;
            self.domain(kind).integrate(files);
        }
        for result in ii_built {
            let (kind, item) = result?;
            self.index(kind).integrate(item);
        }

        // Delete the promoted hot rows.
        let mut rw = self.kv.rw();
        for kind in DomainKind::ALL {
            self.domain(kind)
                .prune(cancel, &mut rw, step, tx_from, tx_to, u64::MAX)?;
        }
        for kind in IndexKind::ALL {
            self.index(kind)
                .prune(cancel, &mut rw, tx_from, Some(tx_to), u64::MAX)?;
        }

        info!(step, "promoted step");
        Ok(())
    }

    /// Prunes hot rows already covered by published files. Used on
    /// startup when a crash landed between integrate and prune.
    pub fn prune_matured(&self, cancel: &Cancel) -> anyhow::Result<()> {
        let mut rw = self.kv.rw();
        for kind in DomainKind::ALL {
            let domain = self.domain(kind);
            let end_step = domain.files.end_step_max();
            if end_step == 0 || !domain.can_prune(&rw) {
                continue;
            }
            let tx_to = end_step * self.opts.step_size;
            domain.prune(cancel, &mut rw, end_step - 1, 0, tx_to, u64::MAX)?;
        }
        Ok(())
    }

    /// One merge round across all domains. Returns true if anything
    /// was merged.
    pub fn merge_if_needed(&self, cancel: &Cancel) -> anyhow::Result<bool> {
        let mut merged = false;
        for kind in DomainKind::ALL {
            merged |= self.domain(kind).merge_if_needed(cancel)?;
        }
        Ok(merged)
    }

    /// First tx of the step currently accepting writes: everything
    /// below the newest values file is already promoted.
    pub fn min_unpromoted_tx(&self, kind: DomainKind) -> u64 {
        self.domain(kind).files.end_step_max() * self.opts.step_size
    }

    /// Raw hot-row lookup used by integrity checks in tests.
    pub fn hot_row(&self, kind: DomainKind, key: &[u8], step: u64) -> Option<Vec<u8>> {
        let ro = self.kv.ro();
        let domain = self.domain(kind);
        let comp = crate::step::composite(key, &inverted_step_bytes(step));
        ro.get(domain.vals_table(), &comp)
    }

    /// Steps present in the hot keys table for `key`, newest first.
    pub fn hot_steps(&self, kind: DomainKind, key: &[u8]) -> Vec<u64> {
        let ro = self.kv.ro();
        ro.dups(self.domain(kind).keys_table(), key)
            .iter()
            .filter(|d| d.len() == 8)
            .map(|d| crate::step::step_from_inverted(d))
            .collect()
    }
}

fn discard_all(
    collations: Vec<(DomainKind, crate::domain::Collation)>,
    ii_collations: Vec<(IndexKind, crate::history::IiCollation)>,
) {
    for (_, c) in collations {
        c.discard();
    }
    for (_, c) in ii_collations {
        c.discard();
    }
}
