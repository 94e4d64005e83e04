//! B+tree navigation and mutation.
//!
//! Reads walk pages directly ([`cursor`]); writes materialize pages into
//! mutable nodes ([`node`]) that are rebalanced, split, and rewritten at
//! commit.

pub(crate) mod cursor;
pub(crate) mod node;

pub(crate) use cursor::{Cursor, ElemRef};
pub(crate) use node::{Bytes, Node, NodeArena, NodeId};
