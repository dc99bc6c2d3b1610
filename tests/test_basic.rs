//! Basic open, put/get/delete, and reopen behavior

use rivetdb::{Db, Error, Options};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Db {
    Db::open(dir.path().join("test.rdb")).unwrap()
}

#[test]
fn test_create_and_reopen_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    {
        let db = Db::open(&path).unwrap();
        assert_eq!(db.page_size(), 4096);
        assert!(!db.is_read_only());
    }
    // Reopen reads the page size from the meta.
    let db = Db::open(&path).unwrap();
    assert_eq!(db.page_size(), 4096);
}

#[test]
fn test_custom_page_size_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    {
        let db = Options::new().page_size(8192).open(&path).unwrap();
        assert_eq!(db.page_size(), 8192);
        db.update(|tx| {
            tx.create_bucket(b"widgets")?.put(b"foo", b"bar")
        })
        .unwrap();
    }
    let db = Options::new().page_size(4096).open(&path).unwrap();
    assert_eq!(db.page_size(), 8192);
    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_invalid_page_size_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(Options::new().page_size(1000).open(dir.path().join("x.rdb")).is_err());
    assert!(Options::new().page_size(256).open(dir.path().join("y.rdb")).is_err());
}

#[test]
fn test_basic_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        // Uncommitted writes are visible within the same transaction.
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        assert_eq!(bucket.get(b"missing")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_overwrite_and_delete_in_one_tx() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        bucket.put(b"foo", b"baz")?;
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"baz"[..]));
        bucket.delete(b"foo")?;
        assert_eq!(bucket.get(b"foo")?, None);
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"foo")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_absent_key_is_noop() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.delete(b"never-existed")
    })
    .unwrap();
}

#[test]
fn test_zero_length_value_allowed() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| tx.create_bucket(b"b")?.put(b"empty", b"")).unwrap();
    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        let got = b.get(b"empty")?;
        assert_eq!(got.as_deref(), Some(&b""[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_key_size_limits() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let bucket = tx.create_bucket(b"b")?;
        assert!(matches!(bucket.put(b"", b"v"), Err(Error::KeyRequired)));

        let max_key = vec![7u8; 32767];
        bucket.put(&max_key, b"fits")?;

        let too_big = vec![7u8; 32768];
        assert!(matches!(bucket.put(&too_big, b"v"), Err(Error::KeyTooLarge)));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let max_key = vec![7u8; 32767];
        assert_eq!(tx.bucket(b"b")?.get(&max_key)?.as_deref(), Some(&b"fits"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    {
        let db = Db::open(&path).unwrap();
        db.update(|tx| {
            let bucket = tx.create_bucket(b"widgets")?;
            for i in 0..100u32 {
                let key = format!("key{:03}", i);
                let value = format!("value{}", i);
                bucket.put(key.as_bytes(), value.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
    }
    let db = Db::open(&path).unwrap();
    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 0..100u32 {
            let key = format!("key{:03}", i);
            let want = format!("value{}", i);
            assert_eq!(bucket.get(key.as_bytes())?.as_deref(), Some(want.as_bytes()));
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_read_only_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    {
        let db = Db::open(&path).unwrap();
        db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"v")).unwrap();
    }
    let db = Options::new().read_only(true).open(&path).unwrap();
    assert!(db.is_read_only());
    db.view(|tx| {
        assert_eq!(tx.bucket(b"b")?.get(b"k")?.as_deref(), Some(&b"v"[..]));
        Ok(())
    })
    .unwrap();
    assert!(matches!(db.begin_rw(), Err(Error::DatabaseReadOnly)));
    assert!(db.update(|_| Ok(())).is_err());
}

#[test]
fn test_second_writable_open_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.rdb");
    let _db = Db::open(&path).unwrap();
    assert!(matches!(Db::open(&path), Err(Error::DatabaseAlreadyOpen)));
}

#[test]
fn test_open_garbage_file_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("junk.rdb");
    std::fs::write(&path, vec![0xABu8; 8192]).unwrap();
    assert!(Db::open(&path).is_err());
}
