//! Embedded, disk-backed ordered key-value store.
//!
//! A B-tree whose nodes are serialized into fixed-size blocks of a
//! block-addressed backing store. Variable-length keys and values are packed
//! into each page by a small free-space allocator with an in-memory overflow
//! side table and lazy defragmentation; the tree stays balanced through
//! split, merge, rotate and promote operations expressed purely in terms of
//! page accessors.
//!
//! The crate is a single-process, single-writer engine: no transactions, no
//! internal locking. Callers needing shared access must serialize operations
//! on a [`BTree`] externally.

#![warn(missing_docs)]

pub mod btree;
pub mod codec;
pub mod error;
pub mod storage;

pub use btree::{BTree, Node, Range};
pub use codec::Codec;
pub use error::{BaobabError, Result};
pub use storage::{BlockStorage, FileStorage, MemStorage, Page, Pager, DEFAULT_BLOCK_SIZE};
