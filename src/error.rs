//! Error taxonomy for paildb.
//!
//! Every fallible public operation returns [`Result`]. The variants fall
//! into four groups: meta validation (`Invalid`, `VersionMismatch`),
//! lifecycle misuse (`DatabaseNotOpen`, `DatabaseOpen`), catalog and input
//! validation errors, and `Io` for anything surfaced verbatim from the OS.
//!
//! Invariant violations — freeing a meta page, descending into a leaf,
//! a cursor stack that disagrees with the node cache — are not errors.
//! They indicate corruption or a logic bug and abort the process via
//! `panic!`/`assert!`.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on a database.
#[derive(Debug, Error)]
pub enum Error {
    /// The meta page magic did not match; the file is not a paildb file
    /// (or the catalog on disk is unreadable).
    #[error("invalid database")]
    Invalid,

    /// The meta page was written by an incompatible format version.
    #[error("version mismatch")]
    VersionMismatch,

    /// The database handle has been closed; no new transactions can
    /// begin on it.
    #[error("database not open")]
    DatabaseNotOpen,

    /// The data file is already held open, by this process or another;
    /// it stays exclusively locked until the holder closes.
    #[error("database already open")]
    DatabaseOpen,

    /// The named bucket does not exist.
    #[error("bucket not found")]
    BucketNotFound,

    /// A bucket with that name already exists.
    #[error("bucket already exists")]
    BucketExists,

    /// Bucket names must be non-empty.
    #[error("bucket name required")]
    BucketNameRequired,

    /// Bucket names are limited to 255 bytes.
    #[error("bucket name too large")]
    BucketNameTooLarge,

    /// Keys must be non-empty.
    #[error("key required")]
    KeyRequired,

    /// Keys are limited to 32768 bytes.
    #[error("key too large")]
    KeyTooLarge,

    /// Values are limited to u32::MAX bytes.
    #[error("value too large")]
    ValueTooLarge,

    /// An underlying file, mmap, or stat operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        assert_eq!(Error::Invalid.to_string(), "invalid database");
        assert_eq!(Error::BucketExists.to_string(), "bucket already exists");
        assert_eq!(Error::KeyTooLarge.to_string(), "key too large");
    }

    #[test]
    fn error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
