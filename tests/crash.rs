use std::sync::Arc;

use stratadb::{Cancel, DomainKind, Engine, EngineOptions, SharedDomains};
use tempfile::TempDir;

fn small_options() -> EngineOptions {
    EngineOptions {
        step_size: 4,
        segment_block_size: 256,
        fsync: false,
        build_workers: 2,
        ..Default::default()
    }
}

fn open(dir: &TempDir) -> anyhow::Result<Arc<Engine>> {
    Engine::open(dir.path(), small_options())
}

#[test]
fn startup_removes_stale_tmp_outputs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let _engine = open(&dir)?;
    }
    // Simulate a crash mid-build: a half-written segment.
    let domain_dir = dir.path().join("snapshots/domain");
    let stray = domain_dir.join("v1-accounts.0-1.kv.tmp");
    std::fs::write(&stray, b"partial")?;

    let _engine = open(&dir)?;
    assert!(!stray.exists());
    Ok(())
}

#[test]
fn published_but_unintegrated_files_are_adopted_on_open() -> anyhow::Result<()> {
    // Crash window: after the build renamed its outputs but before the
    // registry insert. The files are complete on disk; a rescan must
    // expose them, and the first prune must clean the now-redundant
    // hot rows without disturbing any read.
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"1", None)?;
    sd.set_tx_num(2);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"2", None)?;
    sd.set_tx_num(5);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"3", None)?;
    sd.flush(&cancel)?;

    // Build and publish step 0 of the accounts domain, then "crash"
    // before integration: the built items are dropped unpublished.
    let accounts = engine.domain(DomainKind::Accounts);
    {
        let ro_coll = {
            let ro = engine.kv().ro();
            accounts.collate(&cancel, 0, &ro)?
        };
        let built = accounts.build_files(&cancel, ro_coll)?;
        drop(built);
    }
    assert!(dir
        .path()
        .join("snapshots/domain/v1-accounts.0-1.kv")
        .exists());
    assert_eq!(accounts.files.snapshot().len(), 0);

    // "Restart": rescan the folders; the published file appears.
    accounts.open_folder()?;
    assert_eq!(accounts.files.snapshot().len(), 1);

    // Hot rows for step 0 are still present (prune never ran) and
    // reads are correct either way.
    assert_eq!(engine.hot_steps(DomainKind::Accounts, b"A"), vec![1, 0]);
    sd.refresh_snapshot();
    assert_eq!(
        sd.domain_get(DomainKind::Accounts, b"A", b"")?,
        Some(b"3".to_vec())
    );
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Accounts, b"A", b"", 4)?,
        Some(b"2".to_vec())
    );

    // First prune after the restart removes the redundant rows.
    engine.prune_matured(&cancel)?;
    assert_eq!(engine.hot_steps(DomainKind::Accounts, b"A"), vec![1]);
    assert_eq!(
        sd.domain_get(DomainKind::Accounts, b"A", b"")?,
        Some(b"3".to_vec())
    );
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Accounts, b"A", b"", 4)?,
        Some(b"2".to_vec())
    );
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Accounts, b"A", b"", 1)?,
        Some(b"1".to_vec())
    );
    Ok(())
}

#[test]
fn cancelled_collation_leaves_no_tmp_outputs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"1", None)?;
    sd.flush(&cancel)?;

    let accounts = engine.domain(DomainKind::Accounts);
    let coll = {
        let ro = engine.kv().ro();
        accounts.collate(&cancel, 0, &ro)?
    };
    // Cancellation between collate and build discards the writers.
    coll.discard();

    let domain_dir = dir.path().join("snapshots/domain");
    for entry in std::fs::read_dir(&domain_dir)? {
        let path = entry?.path();
        assert!(
            path.extension().and_then(|e| e.to_str()) != Some("tmp"),
            "stray tmp output {}",
            path.display()
        );
    }
    assert!(!domain_dir.join("v1-accounts.0-1.kv").exists());
    Ok(())
}

#[test]
fn cancelled_build_surfaces_cancellation() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"1", None)?;
    sd.flush(&cancel)?;

    let accounts = engine.domain(DomainKind::Accounts);
    let coll = {
        let ro = engine.kv().ro();
        accounts.collate(&cancel, 0, &ro)?
    };
    cancel.cancel();
    assert!(accounts.build_files(&cancel, coll).is_err());
    Ok(())
}

#[test]
fn cancelled_prune_saves_a_resume_cursor() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    for i in 0u64..4 {
        sd.set_tx_num(i);
        let key = format!("k{i}").into_bytes();
        sd.domain_put(DomainKind::Accounts, &key, b"", b"v", None)?;
    }
    sd.flush(&cancel)?;

    let accounts = engine.domain(DomainKind::Accounts);
    let built = {
        let ro = engine.kv().ro();
        let coll = accounts.collate(&cancel, 0, &ro)?;
        accounts.build_files(&cancel, coll)?
    };
    accounts.integrate(built);

    // Cancel immediately: the prune must persist its cursor and fail.
    let cancelled = Cancel::new();
    cancelled.cancel();
    {
        let mut rw = engine.kv().rw();
        assert!(accounts
            .prune(&cancelled, &mut rw, 0, 0, 4, u64::MAX)
            .is_err());
    }

    // A later prune resumes and completes.
    {
        let mut rw = engine.kv().rw();
        accounts.prune(&cancel, &mut rw, 0, 0, 4, u64::MAX)?;
    }
    for i in 0u64..4 {
        let key = format!("k{i}").into_bytes();
        assert!(engine.hot_steps(DomainKind::Accounts, &key).is_empty());
    }
    sd.refresh_snapshot();
    for i in 0u64..4 {
        let key = format!("k{i}").into_bytes();
        assert_eq!(
            sd.domain_get(DomainKind::Accounts, &key, b"")?,
            Some(b"v".to_vec())
        );
    }
    Ok(())
}
