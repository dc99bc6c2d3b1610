//! Freelist behavior across commits, reopens, and live readers

use rivetdb::{Db, Options};
use tempfile::TempDir;

#[test]
fn test_freed_pages_are_reused() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path().join("test.rdb")).unwrap();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"b")?;
        for i in 0..2_000u32 {
            bucket.put(format!("{:06}", i).as_bytes(), &[7u8; 64])?;
        }
        Ok(())
    })
    .unwrap();
    let grown = db.stats();

    db.update(|tx| {
        let bucket = tx.bucket(b"b")?;
        for i in 0..2_000u32 {
            bucket.delete(format!("{:06}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    let freed = db.stats();
    assert!(
        freed.free_page_n + freed.pending_page_n
            > grown.free_page_n + grown.pending_page_n,
        "mass delete must release pages"
    );

    // Rewriting similar data should recycle instead of growing much.
    let len_before = std::fs::metadata(dir.path().join("test.rdb")).unwrap().len();
    db.update(|tx| {
        let bucket = tx.bucket(b"b")?;
        for i in 0..2_000u32 {
            bucket.put(format!("{:06}", i).as_bytes(), &[8u8; 64])?;
        }
        Ok(())
    })
    .unwrap();
    let len_after = std::fs::metadata(dir.path().join("test.rdb")).unwrap().len();
    assert!(
        len_after <= len_before * 2,
        "file doubled unexpectedly: {} -> {}",
        len_before,
        len_after
    );
}

#[test]
fn test_free_count_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    let observed = {
        // A small page size keeps the byte volume down while the page
        // inventory still outgrows a u16 element count, forcing the
        // spilled-count convention through a real commit.
        let db = Options::new().page_size(512).open(&path).unwrap();
        let entries = 1000 * (2 * db.page_size());

        let mut next = 0usize;
        while next < entries {
            let batch_end = (next + 10_000).min(entries);
            db.update(|tx| {
                let bucket = tx.create_bucket_if_not_exists(b"bulk")?;
                for i in next..batch_end {
                    bucket.put(format!("{:08}", i).as_bytes(), b"00000000")?;
                }
                Ok(())
            })
            .unwrap();
            next = batch_end;
        }

        // Delete every entry in a single transaction.
        db.update(|tx| {
            let bucket = tx.bucket(b"bulk")?;
            for i in 0..entries {
                bucket.delete(format!("{:08}", i).as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        let stats = db.stats();
        let inventory = stats.free_page_n + stats.pending_page_n;
        assert!(inventory > 65_535, "inventory must exceed a u16 count, got {}", inventory);
        inventory
    };

    // Pending state merges into the free set across a reopen, with the
    // count intact.
    let db = Options::new().page_size(512).open(&path).unwrap();
    let stats = db.stats();
    assert_eq!(stats.free_page_n, observed);
    assert_eq!(stats.pending_page_n, 0);

    db.view(|tx| {
        assert_eq!(tx.check(), Vec::<String>::new());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_live_reader_blocks_release() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path().join("test.rdb")).unwrap();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"b")?;
        for i in 0..500u32 {
            bucket.put(format!("{:04}", i).as_bytes(), &[1u8; 128])?;
        }
        Ok(())
    })
    .unwrap();

    // The reader pins the pre-delete snapshot.
    let reader = db.begin().unwrap();

    db.update(|tx| {
        let bucket = tx.bucket(b"b")?;
        for i in 0..500u32 {
            bucket.delete(format!("{:04}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    // Another write begins while the reader is live: the pages freed
    // by the delete stay pending.
    db.update(|tx| tx.bucket(b"b")?.put(b"probe", b"1")).unwrap();
    let held = db.stats();
    assert!(held.pending_page_n > 0, "freed pages must wait for the reader");

    // The reader can still walk its snapshot completely.
    let bucket = reader.bucket(b"b").unwrap();
    assert_eq!(bucket.get(b"0123").unwrap().as_deref(), Some(&[1u8; 128][..]));
    drop(bucket);
    reader.rollback().unwrap();

    // With the reader gone the next writer releases them.
    db.update(|tx| tx.bucket(b"b")?.put(b"probe", b"2")).unwrap();
    let released = db.stats();
    assert!(released.free_page_n > held.free_page_n);
}
