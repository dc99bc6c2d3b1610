//! Error types for rivetdb

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for rivetdb operations
#[derive(Error, Debug)]
pub enum Error {
    /// The database handle has been closed
    #[error("database not open")]
    DatabaseNotOpen,

    /// Another process (or handle) holds the file lock
    #[error("database already open")]
    DatabaseAlreadyOpen,

    /// The file is not a rivetdb database
    #[error("invalid database")]
    Invalid,

    /// The file was written by an incompatible format version
    #[error("version mismatch")]
    VersionMismatch,

    /// A meta page failed checksum validation
    #[error("checksum error")]
    Checksum,

    /// The transaction has already been committed or rolled back
    #[error("tx closed")]
    TxClosed,

    /// The database was opened in read-only mode
    #[error("database read-only")]
    DatabaseReadOnly,

    /// A mutation was attempted on a read-only transaction
    #[error("tx not writable")]
    TxNotWritable,

    /// An empty key was passed to a mutating call
    #[error("key required")]
    KeyRequired,

    /// The key exceeds the maximum key size
    #[error("key too large")]
    KeyTooLarge,

    /// The value exceeds the maximum value size
    #[error("value too large")]
    ValueTooLarge,

    /// No bucket exists under the given name
    #[error("bucket not found")]
    BucketNotFound,

    /// A bucket already exists under the given name
    #[error("bucket exists")]
    BucketExists,

    /// An empty name was passed to a bucket operation
    #[error("bucket name required")]
    BucketNameRequired,

    /// The element is a bucket where a value was expected, or vice versa
    #[error("incompatible value")]
    IncompatibleValue,

    /// On-disk or in-memory state violated an engine invariant.
    ///
    /// Fatal to the current transaction; the transaction must be rolled
    /// back and the condition reported upstream.
    #[error("corruption detected: {details}")]
    Corruption {
        /// Description of the violated invariant
        details: String,
        /// Page where the violation was detected
        page_id: Option<PageId>,
    },

    /// I/O error from the underlying file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Custom error, also usable as a callback sentinel in iteration
    #[error("{0}")]
    Custom(Cow<'static, str>),
}

impl Error {
    pub(crate) fn corruption(details: impl Into<String>, page_id: Option<PageId>) -> Self {
        Error::Corruption { details: details.into(), page_id }
    }
}

/// Page identifier: 64-bit index of a page within the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to a byte offset in the file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, strictly increasing across commits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for rivetdb operations
pub type Result<T> = std::result::Result<T, Error>;
