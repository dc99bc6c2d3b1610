//! Embedded single-file key/value store
//!
//! rivetdb persists an ordered mapping from byte-string keys to
//! byte-string values, grouped into nested buckets, inside one file
//! organized as a copy-on-write B+tree. Transactions are fully
//! serializable: at most one writer runs at a time while any number of
//! readers iterate their own immutable snapshot, and a double-buffered
//! meta page plus strict fsync ordering make every commit crash
//! consistent without a write-ahead log.
//!
//! ```no_run
//! use rivetdb::Db;
//!
//! # fn main() -> rivetdb::Result<()> {
//! let db = Db::open("app.rdb")?;
//! db.update(|tx| {
//!     let bucket = tx.create_bucket_if_not_exists(b"widgets")?;
//!     bucket.put(b"foo", b"bar")
//! })?;
//! db.view(|tx| {
//!     let bucket = tx.bucket(b"widgets")?;
//!     assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod bucket;
mod cursor;
mod db;
mod error;
mod freelist;
mod meta;
mod node;
mod page;
mod readers;
mod tx;

pub use bucket::{Bucket, BucketStats};
pub use cursor::Cursor;
pub use db::{Db, DbStats, Options};
pub use error::{Error, PageId, Result, TxId};
pub use tx::Tx;

/// Page size used when creating a database without an override
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Largest accepted key, in bytes
pub const MAX_KEY_SIZE: usize = 32767;

/// Largest accepted value, in bytes
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Default leaf fill percentage before a page splits
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;
