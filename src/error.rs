//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, BaobabError>;

/// Failure modes of the storage engine.
///
/// Structural and bounds violations (`InvalidIndex`, `Unsupported`,
/// `InvalidDataSize`, `DeletedPage`) are programmer errors and are reported
/// immediately; they leave the page untouched. `PageOverflow` is raised only
/// after a defragmentation pass failed to make the page contents fit.
/// `Io` propagates unchanged from the block storage layer.
#[derive(Debug, Error)]
pub enum BaobabError {
    /// Underlying block storage failure, propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key, value or child access outside `0..size` (resp. `0..=size`).
    #[error("invalid index {index}, page size {size}")]
    InvalidIndex {
        /// Index that was requested.
        index: usize,
        /// Entry count of the page at the time of the access.
        size: usize,
    },

    /// Child operations invoked on a leaf page.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A single record larger than a quarter of the block size.
    #[error("invalid data size: {len} bytes exceeds limit of {max}")]
    InvalidDataSize {
        /// Encoded length of the rejected record.
        len: usize,
        /// Maximum record length for this block size.
        max: usize,
    },

    /// Page contents do not fit in one block even after defragmentation.
    #[error("page {id} overflow: {used} bytes used, {body} bytes available")]
    PageOverflow {
        /// Identifier of the overflowing page.
        id: u32,
        /// Bytes consumed by record payloads.
        used: usize,
        /// Body capacity of the page (block size minus header).
        body: usize,
    },

    /// Accessor called on a tombstoned page.
    #[error("page {0} is deleted")]
    DeletedPage(u32),

    /// Missing page id or other absent resource.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// On-disk state that violates the page format invariants.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
}
