use stratadb::Db;

fn open_db(path: &std::path::Path) -> Db {
    Db::options().page_size(4096).open(path).unwrap()
}

#[test]
fn ten_thousand_keys_split_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stress.db");

    {
        let mut db = open_db(&path);
        db.update(|txn| {
            for i in 0..10_000u64 {
                let key = format!("key{:013}", i);
                let value = [b'v'; 64];
                txn.put(key.as_bytes(), &value)?;
            }
            Ok(())
        })
        .unwrap();

        let stat = db.stat();
        assert_eq!(stat.entries, 10_000);
        assert!(stat.depth >= 2, "tree depth {} after 10k inserts", stat.depth);
        assert!(stat.branch_pages >= 1);
    }

    let mut db = Db::open(&path).unwrap();
    assert_eq!(db.stat().entries, 10_000);

    db.view(|txn| {
        let mut cur = txn.cursor();
        let mut count = 0u64;
        let mut prev: Option<Vec<u8>> = None;
        while let Some((key, value)) = cur.next()? {
            assert_eq!(key, format!("key{:013}", count).into_bytes());
            assert_eq!(value.len(), 64);
            if let Some(p) = &prev {
                assert!(p < &key, "cursor went backwards");
            }
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 10_000);
        Ok(())
    })
    .unwrap();
}

#[test]
fn reverse_insertion_keeps_sorted_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir.path().join("reverse.db"));

    db.update(|txn| {
        for i in (0..2_000u32).rev() {
            let key = format!("k{:08}", i);
            txn.put(key.as_bytes(), format!("val{i}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|txn| {
        for i in 0..2_000u32 {
            let key = format!("k{:08}", i);
            assert_eq!(txn.get(key.as_bytes())?.unwrap(), format!("val{i}").into_bytes());
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn random_point_lookups_after_splits() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir.path().join("lookup.db"));

    // Interleave two key families so inserts land all over the tree.
    db.update(|txn| {
        for i in 0..3_000u32 {
            txn.put(format!("user:{:06}", i).as_bytes(), &i.to_le_bytes())?;
            txn.put(format!("item:{:06}", i * 7).as_bytes(), &i.to_be_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|txn| {
        assert_eq!(
            txn.get(b"user:000042")?.unwrap(),
            42u32.to_le_bytes().to_vec()
        );
        assert_eq!(
            txn.get(b"item:000049")?.unwrap(),
            7u32.to_be_bytes().to_vec()
        );
        assert!(txn.get(b"user:9")?.is_none());
        assert!(txn.get(b"a")?.is_none());
        assert!(txn.get(b"zzzz")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_every_other_key_merges_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir.path().join("merge.db"));

    db.update(|txn| {
        for i in 0..1_000u32 {
            let key = format!("seq{:06}", i);
            txn.put(key.as_bytes(), &[b'x'; 32])?;
        }
        Ok(())
    })
    .unwrap();
    let leaves_full = db.stat().leaf_pages;
    assert!(leaves_full > 1);

    // Drop two of every three keys so every page falls well below the
    // rebalance threshold.
    db.update(|txn| {
        for i in 0..1_000u32 {
            if i % 3 != 0 {
                txn.del(format!("seq{:06}", i).as_bytes())?;
            }
        }
        Ok(())
    })
    .unwrap();

    let stat = db.stat();
    assert_eq!(stat.entries, 334);
    assert!(
        stat.leaf_pages < leaves_full,
        "leaf pages {} did not shrink from {}",
        stat.leaf_pages,
        leaves_full
    );

    db.view(|txn| {
        let mut cur = txn.cursor();
        let mut expected = (0..1_000u32).step_by(3);
        while let Some((key, _)) = cur.next()? {
            let want = expected.next().expect("cursor returned extra keys");
            assert_eq!(key, format!("seq{:06}", want).into_bytes());
        }
        assert!(expected.next().is_none(), "cursor missed keys");
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_everything_empties_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.db");
    let mut db = open_db(&path);

    db.update(|txn| {
        for i in 0..500u32 {
            txn.put(format!("d{:05}", i).as_bytes(), b"payload")?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|txn| {
        for i in 0..500u32 {
            txn.del(format!("d{:05}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let stat = db.stat();
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    db.view(|txn| {
        assert!(txn.get(b"d00000")?.is_none());
        let mut cur = txn.cursor();
        assert!(cur.first()?.is_none());
        Ok(())
    })
    .unwrap();

    // An emptied tree accepts new keys.
    db.update(|txn| txn.put(b"reborn", b"yes")).unwrap();
    assert_eq!(db.view(|txn| txn.get(b"reborn")).unwrap().unwrap(), b"yes");
}

#[test]
fn many_commits_accumulate_revisions() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(&dir.path().join("revs.db"));

    for i in 0..50u32 {
        db.update(|txn| txn.put(format!("r{i}").as_bytes(), &i.to_le_bytes()))
            .unwrap();
    }

    let stat = db.stat();
    assert_eq!(stat.entries, 50);
    assert_eq!(stat.revisions, 50);
}
