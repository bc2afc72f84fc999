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
fn put_put_flush_roundtrip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"k", b"", b"v1", None)?;
    sd.set_tx_num(1);
    sd.domain_put(DomainKind::Accounts, b"k", b"", b"v2", None)?;
    sd.flush(&cancel)?;

    assert_eq!(
        sd.domain_get(DomainKind::Accounts, b"k", b"")?,
        Some(b"v2".to_vec())
    );
    // As of tx 1 the pending mutation at tx 1 had not applied yet.
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Accounts, b"k", b"", 1)?,
        Some(b"v1".to_vec())
    );
    assert_eq!(sd.domain_get_as_of(DomainKind::Accounts, b"k", b"", 0)?, None);
    Ok(())
}

#[test]
fn as_of_returns_pre_images_at_every_point() -> anyhow::Result<()> {
    // Literal scenario, step size 4: A=1@t0, A=2@t2, A=3@t5.
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"1", None)?;
    sd.set_tx_num(2);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"2", None)?;
    sd.set_tx_num(5);
    sd.domain_put(DomainKind::Accounts, b"A", b"", b"3", None)?;
    sd.flush(&cancel)?;

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
    assert_eq!(sd.domain_get_as_of(DomainKind::Accounts, b"A", b"", 0)?, None);
    Ok(())
}

#[test]
fn delete_keeps_history_and_inverted_index() -> anyhow::Result<()> {
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
    sd.set_tx_num(6);
    sd.domain_del(DomainKind::Accounts, b"A", b"", None)?;
    sd.flush(&cancel)?;

    assert_eq!(sd.domain_get(DomainKind::Accounts, b"A", b"")?, None);
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Accounts, b"A", b"", 6)?,
        Some(b"3".to_vec())
    );

    // Inverted index for A over [0, 7) holds every mutation point.
    let accounts = engine.domain(DomainKind::Accounts);
    let snap = accounts.snapshot();
    let ro = engine.kv().ro();
    let txs = accounts.history.ii.idx_range(
        &snap.history.ef_files,
        &ro,
        b"A",
        0,
        Some(7),
        true,
        usize::MAX,
    )?;
    assert_eq!(txs, vec![0, 2, 5, 6]);
    Ok(())
}

#[test]
fn empty_put_is_rejected_and_delete_is_used_instead() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;

    sd.set_tx_num(0);
    assert!(sd
        .domain_put(DomainKind::Accounts, b"A", b"", b"", None)
        .is_err());
    Ok(())
}

#[test]
fn reserved_commitment_key_rejects_user_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;

    sd.set_tx_num(0);
    assert!(sd
        .domain_put(DomainKind::Commitment, b"state", b"", b"x", None)
        .is_err());
    assert!(sd
        .domain_del(DomainKind::Commitment, b"state", b"", None)
        .is_err());
    // Other commitment keys are writable (branch data).
    sd.domain_put(DomainKind::Commitment, b"branch0", b"", b"x", None)?;
    Ok(())
}

#[test]
fn account_delete_cascades_to_storage_and_code() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Accounts, b"addr1", b"", b"acct", None)?;
    sd.domain_put(DomainKind::Code, b"addr1", b"", b"code", None)?;
    sd.domain_put(DomainKind::Storage, b"addr1", b"s1", b"1", None)?;
    sd.domain_put(DomainKind::Storage, b"addr1", b"s2", b"2", None)?;
    sd.flush(&cancel)?;

    sd.set_tx_num(1);
    sd.domain_del(DomainKind::Accounts, b"addr1", b"", None)?;
    sd.flush(&cancel)?;

    assert_eq!(sd.domain_get(DomainKind::Accounts, b"addr1", b"")?, None);
    assert_eq!(sd.domain_get(DomainKind::Code, b"addr1", b"")?, None);
    assert_eq!(sd.domain_get(DomainKind::Storage, b"addr1", b"s1")?, None);
    assert_eq!(sd.domain_get(DomainKind::Storage, b"addr1", b"s2")?, None);
    Ok(())
}
