use stratadb::{Db, Error};

fn open_db(path: &std::path::Path) -> Db {
    Db::options().page_size(4096).open(path).unwrap()
}

#[test]
fn compaction_shrinks_a_churned_file_and_keeps_all_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("churn.db");

    let mut db = open_db(&path);
    // Many small commits maximize copy-on-write garbage.
    for round in 0..20u32 {
        db.update(|txn| {
            for i in 0..200u32 {
                let key = format!("key{:06}", i);
                txn.put(key.as_bytes(), format!("r{round}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
    }
    let before = std::fs::metadata(&path).unwrap().len();
    let entries = db.stat().entries;

    let mut db = db.compact().unwrap();

    let after = std::fs::metadata(&path).unwrap().len();
    assert!(
        after < before,
        "compaction did not shrink the file: {after} >= {before}"
    );
    assert_eq!(db.stat().entries, entries);

    db.view(|txn| {
        for i in 0..200u32 {
            let key = format!("key{:06}", i);
            assert_eq!(txn.get(key.as_bytes())?.unwrap(), b"r19");
        }
        Ok(())
    })
    .unwrap();

    // The compacted file keeps working as a normal database.
    db.update(|txn| txn.put(b"post", b"compact")).unwrap();
    assert_eq!(db.view(|txn| txn.get(b"post")).unwrap().unwrap(), b"compact");
}

#[test]
fn compaction_preserves_overflow_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bigcompact.db");

    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    let mut db = open_db(&path);
    db.update(|txn| {
        txn.put(b"blob", &big)?;
        txn.put(b"tiny", b"t")
    })
    .unwrap();
    // Churn so the blob's chain is preceded by garbage.
    for i in 0..10u32 {
        db.update(|txn| txn.put(b"churn", &i.to_le_bytes())).unwrap();
    }

    let mut db = db.compact().unwrap();
    db.view(|txn| {
        assert_eq!(txn.get(b"blob")?.unwrap(), big);
        assert_eq!(txn.get(b"tiny")?.unwrap(), b"t");
        Ok(())
    })
    .unwrap();
    assert!(db.stat().overflow_pages >= 2);
}

#[test]
fn other_handles_observe_stale_after_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.db");

    let mut a = open_db(&path);
    a.update(|txn| txn.put(b"k", b"v")).unwrap();

    let mut b = Db::open(&path).unwrap();
    assert_eq!(b.view(|txn| txn.get(b"k")).unwrap().unwrap(), b"v");

    let _a = a.compact().unwrap();

    // The old inode b still holds is tombstoned now.
    assert!(matches!(b.begin(true), Err(Error::Stale)));

    // Reopening by path sees the compacted file.
    let mut b = Db::open(&path).unwrap();
    assert_eq!(b.view(|txn| txn.get(b"k")).unwrap().unwrap(), b"v");
}

#[test]
fn compacting_an_empty_database_yields_an_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.db");

    let db = open_db(&path);
    let mut db = db.compact().unwrap();

    assert_eq!(db.stat().entries, 0);
    assert!(db.view(|txn| txn.get(b"k")).unwrap().is_none());
    db.update(|txn| txn.put(b"k", b"v")).unwrap();
    assert_eq!(db.view(|txn| txn.get(b"k")).unwrap().unwrap(), b"v");
}

#[test]
fn compaction_resets_the_revision_counter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("revreset.db");

    let mut db = open_db(&path);
    for i in 0..5u32 {
        db.update(|txn| txn.put(format!("k{i}").as_bytes(), b"v")).unwrap();
    }
    assert_eq!(db.stat().revisions, 5);

    let db = db.compact().unwrap();
    assert_eq!(db.stat().revisions, 1);
    assert_eq!(db.stat().entries, 5);
}
