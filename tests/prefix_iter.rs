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
fn prefix_scan_is_ordered_and_newest_version_wins() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    let addr = [0x12u8, 0x34];
    let mut expected = Vec::new();
    for i in 0u32..1000 {
        sd.set_tx_num(i as u64);
        let slot = format!("slot{i:04}").into_bytes();
        let val = format!("v{i}").into_bytes();
        sd.domain_put(DomainKind::Storage, &addr, &slot, &val, None)?;
        let mut key = addr.to_vec();
        key.extend_from_slice(&slot);
        expected.push((key, val));
    }
    // Unrelated prefix that must not appear.
    sd.set_tx_num(1000);
    sd.domain_put(DomainKind::Storage, &[0x12, 0x35], b"slot", b"other", None)?;
    sd.flush(&cancel)?;
    // The in-memory view still mirrors the flushed rows; move past the
    // flushed txNum so it stays ahead of the hot tier.
    sd.set_tx_num(1001);

    expected.sort();
    let mut seen = Vec::new();
    sd.iterate_storage_prefix(&addr, |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        Ok(())
    })?;
    assert_eq!(seen.len(), 1000);
    assert_eq!(seen, expected);

    // Strictly ascending keys.
    for pair in seen.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
    Ok(())
}

#[test]
fn prefix_scan_merges_ram_hot_and_files() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    let addr = b"aa";
    // Step 0: three slots, then promote them to a file.
    for (i, slot) in [b"s1", b"s2", b"s3"].iter().enumerate() {
        sd.set_tx_num(i as u64);
        sd.domain_put(DomainKind::Storage, addr, *slot, b"old", None)?;
    }
    sd.flush(&cancel)?;
    engine.promote_step(&cancel, 0)?;
    sd.refresh_snapshot();

    // Step 1: overwrite one slot in the hot tier.
    sd.set_tx_num(4);
    sd.domain_put(DomainKind::Storage, addr, b"s2", b"hot", None)?;
    sd.flush(&cancel)?;

    // Pending in-memory write, newest of all.
    sd.set_tx_num(6);
    sd.domain_put(DomainKind::Storage, addr, b"s3", b"ram", None)?;

    let mut seen = Vec::new();
    sd.iterate_storage_prefix(addr, |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        Ok(())
    })?;
    assert_eq!(
        seen,
        vec![
            (b"aas1".to_vec(), b"old".to_vec()),
            (b"aas2".to_vec(), b"hot".to_vec()),
            (b"aas3".to_vec(), b"ram".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn del_prefix_removes_everything_and_is_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine)?;
    let cancel = Cancel::new();

    sd.set_tx_num(0);
    sd.domain_put(DomainKind::Storage, b"addr", b"s1", b"1", None)?;
    sd.domain_put(DomainKind::Storage, b"addr", b"s2", b"2", None)?;
    sd.domain_put(DomainKind::Storage, b"bddr", b"s1", b"3", None)?;
    sd.flush(&cancel)?;

    sd.set_tx_num(1);
    sd.domain_del_prefix(DomainKind::Storage, b"addr")?;

    let mut count = 0;
    sd.iterate_storage_prefix(b"addr", |_, _| {
        count += 1;
        Ok(())
    })?;
    assert_eq!(count, 0);

    // The sibling prefix is untouched.
    assert_eq!(
        sd.domain_get(DomainKind::Storage, b"bddr", b"s1")?,
        Some(b"3".to_vec())
    );

    // Second deletion is a noop.
    sd.domain_del_prefix(DomainKind::Storage, b"addr")?;
    sd.flush(&cancel)?;
    let mut count = 0;
    sd.iterate_storage_prefix(b"addr", |_, _| {
        count += 1;
        Ok(())
    })?;
    assert_eq!(count, 0);

    // Deleted slots are still visible as of the earlier transaction.
    assert_eq!(
        sd.domain_get_as_of(DomainKind::Storage, b"addr", b"s1", 1)?,
        Some(b"1".to_vec())
    );

    // Prefix deletion is storage-only.
    assert!(sd
        .domain_del_prefix(DomainKind::Accounts, b"addr")
        .is_err());
    Ok(())
}

#[test]
fn tombstones_shadow_older_file_versions_in_scans() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    for (i, slot) in [b"s1", b"s2"].iter().enumerate() {
        sd.set_tx_num(i as u64);
        sd.domain_put(DomainKind::Storage, b"aa", *slot, b"v", None)?;
    }
    sd.flush(&cancel)?;
    engine.promote_step(&cancel, 0)?;
    sd.refresh_snapshot();

    sd.set_tx_num(4);
    sd.domain_del(DomainKind::Storage, b"aa", b"s1", None)?;
    sd.flush(&cancel)?;
    sd.set_tx_num(5);

    let mut seen = Vec::new();
    sd.iterate_storage_prefix(b"aa", |k, _| {
        seen.push(k.to_vec());
        Ok(())
    })?;
    assert_eq!(seen, vec![b"aas2".to_vec()]);
    Ok(())
}
