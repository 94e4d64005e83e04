//! # paildb — embedded, single-file, ordered key/value storage
//!
//! paildb persists any number of named buckets (independent, ordered
//! key/value namespaces) to one file, each bucket backed by its own
//! copy-on-write B+tree. Reads are zero-copy out of a memory map; writes
//! go through buffered I/O and become visible atomically when a commit
//! flips the meta page through an `O_SYNC` handle.
//!
//! ## Quick start
//!
//! ```ignore
//! use paildb::Database;
//!
//! let db = Database::open("app.db", 0o600)?;
//!
//! let mut txn = db.begin_write()?;
//! txn.create_bucket("widgets")?;
//! txn.put("widgets", b"foo", b"bar")?;
//! txn.commit()?;
//!
//! let txn = db.begin_read()?;
//! assert_eq!(txn.get("widgets", b"foo")?, Some(&b"bar"[..]));
//! ```
//!
//! ## Concurrency model
//!
//! Single writer, many readers. A read transaction pins the meta version
//! that was active when it began and holds a shared lock on the mapping
//! for its lifetime; it never blocks on the writer and never observes a
//! partial commit. The one writer mutates heap copies of pages and only
//! publishes them at commit. Close read transactions promptly: an open
//! reader pins the pages freed after its snapshot and the file grows.
//!
//! ## File layout
//!
//! ```text
//! | meta 0 | meta 1 | freelist | buckets | data ... |
//! ```
//!
//! Pages 0 and 1 alternate as the commit target (`txid % 2`); the one
//! with the higher transaction id is authoritative. Everything else is
//! reached from it: the bucket catalog, and from the catalog each
//! bucket's tree.
//!
//! ## Module overview
//!
//! - `storage`: page formats, meta pages, freelist
//! - `tree`: cursors over pages, mutable nodes, split/rebalance
//! - `txn`: read and read-write transactions, the commit pipeline
//! - `db`: file lifecycle, mmap growth, transaction admission

mod catalog;
mod db;
mod error;
mod storage;
mod tree;
mod txn;

pub use db::{Database, Options};
pub use error::{Error, Result};
pub use storage::{MAX_BUCKET_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use txn::{Bucket, RwTx, Tx};
