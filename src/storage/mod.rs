//! Block storage backends, the on-disk page format, and the pager.

mod block;
mod page;
mod pager;

pub use block::{
    BlockStorage, FileStorage, MemStorage, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use page::Page;
pub use pager::{PageRef, Pager};
