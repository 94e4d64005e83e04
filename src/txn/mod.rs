//! Transactions.
//!
//! All data access goes through a transaction: read-only ([`Tx`]) or
//! read-write ([`RwTx`]). Any number of readers may run concurrently,
//! each pinned to the meta version that was active when it began; at most
//! one writer exists at a time, and its work becomes visible atomically
//! when the commit's meta write lands.

mod read;
mod write;

pub use read::{Bucket, Tx};
pub use write::RwTx;
