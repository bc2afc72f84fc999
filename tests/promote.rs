use std::collections::BTreeMap;
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
fn promoted_step_moves_rows_into_files() -> anyhow::Result<()> {
    // Scenario: A=1@t0, A=2@t2, A=3@t5. Promote step 0 ([t0, t4)).
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

    engine.promote_step(&cancel, 0)?;

    // The step-0 file holds the latest value written during step 0.
    let kv_file = dir
        .path()
        .join("snapshots/domain/v1-accounts.0-1.kv");
    assert!(kv_file.exists());
    let seg = stratadb::segment::SegmentReader::open(&kv_file)?;
    assert_eq!(seg.get(b"A")?, Some(b"2".to_vec()));

    // The hot tier keeps only the step-1 row.
    assert_eq!(engine.hot_steps(DomainKind::Accounts, b"A"), vec![1]);
    assert_eq!(engine.hot_row(DomainKind::Accounts, b"A", 0), None);
    assert_eq!(
        engine.hot_row(DomainKind::Accounts, b"A", 1),
        Some(b"3".to_vec())
    );

    // Reads are unchanged across the promotion.
    sd.refresh_snapshot();
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
fn promotion_preserves_every_read() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    let keys: Vec<Vec<u8>> = (0u32..40).map(|i| format!("key{i:03}").into_bytes()).collect();
    let mut tx = 0u64;
    for round in 0u32..3 {
        for (i, key) in keys.iter().enumerate() {
            if (i as u32 + round) % 3 == 0 {
                continue;
            }
            sd.set_tx_num(tx);
            let val = format!("v{round}-{i}").into_bytes();
            sd.domain_put(DomainKind::Accounts, key, b"", &val, None)?;
            tx += 1;
        }
    }
    sd.flush(&cancel)?;

    let mut latest: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
    let mut as_of: BTreeMap<(Vec<u8>, u64), Option<Vec<u8>>> = BTreeMap::new();
    for key in &keys {
        latest.insert(key.clone(), sd.domain_get(DomainKind::Accounts, key, b"")?);
        for t in [0u64, 5, 17, 40, 77] {
            as_of.insert(
                (key.clone(), t),
                sd.domain_get_as_of(DomainKind::Accounts, key, b"", t)?,
            );
        }
    }

    // Promote every finished step.
    let last_step = tx / 4;
    for step in 0..last_step {
        engine.promote_step(&cancel, step)?;
    }
    sd.refresh_snapshot();

    for key in &keys {
        assert_eq!(
            sd.domain_get(DomainKind::Accounts, key, b"")?,
            latest[key],
            "latest mismatch for {}",
            String::from_utf8_lossy(key)
        );
        for t in [0u64, 5, 17, 40, 77] {
            assert_eq!(
                sd.domain_get_as_of(DomainKind::Accounts, key, b"", t)?,
                as_of[&(key.clone(), t)],
                "as-of {t} mismatch for {}",
                String::from_utf8_lossy(key)
            );
        }
    }
    Ok(())
}

#[test]
fn merging_adjacent_files_preserves_reads_and_shrinks_the_set() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    for tx in 0u64..8 {
        sd.set_tx_num(tx);
        let key = format!("k{}", tx % 3).into_bytes();
        let val = format!("val{tx}").into_bytes();
        sd.domain_put(DomainKind::Accounts, &key, b"", &val, None)?;
    }
    sd.flush(&cancel)?;
    engine.promote_step(&cancel, 0)?;
    engine.promote_step(&cancel, 1)?;

    sd.refresh_snapshot();
    let mut before = BTreeMap::new();
    for i in 0..3 {
        let key = format!("k{i}").into_bytes();
        before.insert(key.clone(), sd.domain_get(DomainKind::Accounts, &key, b"")?);
    }

    let accounts = engine.domain(DomainKind::Accounts);
    let files_before = accounts.files.snapshot().len();
    assert!(engine.merge_if_needed(&cancel)?);
    let files_after = accounts.files.snapshot().len();
    assert!(files_after < files_before, "{files_after} < {files_before}");

    sd.refresh_snapshot();
    for (key, expected) in before {
        assert_eq!(
            sd.domain_get(DomainKind::Accounts, &key, b"")?,
            expected,
            "merge changed latest for {}",
            String::from_utf8_lossy(&key)
        );
    }
    Ok(())
}

#[test]
fn existence_filter_has_no_false_negatives_after_promotion() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = open(&dir)?;
    let mut sd = SharedDomains::new(engine.clone())?;
    let cancel = Cancel::new();

    for i in 0u64..4 {
        sd.set_tx_num(i);
        let key = format!("member{i}").into_bytes();
        sd.domain_put(DomainKind::Accounts, &key, b"", b"x", None)?;
    }
    sd.flush(&cancel)?;
    engine.promote_step(&cancel, 0)?;

    let accounts = engine.domain(DomainKind::Accounts);
    let snap = accounts.files.snapshot();
    assert_eq!(snap.len(), 1);
    let existence = snap[0].existence.as_ref().expect("existence filter built");
    for i in 0u64..4 {
        assert!(existence.contains(format!("member{i}").as_bytes()));
    }
    Ok(())
}
