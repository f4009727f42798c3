//! Block-addressed backing stores.
//!
//! A [`BlockStorage`] exposes fixed-size blocks addressed by a zero-based
//! index, plus a counter to grow the store one block at a time. Pages map
//! 1:1 onto blocks; everything above this layer is expressed in block
//! indices and never touches file offsets.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{BaobabError, Result};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Largest supported block size. Record offsets are signed 16-bit on disk,
/// so a block may not exceed `i16::MAX + 1` bytes.
pub const MAX_BLOCK_SIZE: usize = 32768;

/// Smallest supported block size; anything below this cannot hold a page
/// header plus a useful number of records.
pub const MIN_BLOCK_SIZE: usize = 128;

const FILE_MAGIC: [u8; 4] = *b"BAOB";
const FILE_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 16;

/// Fixed-size block read/write/allocate contract consumed by the pager.
pub trait BlockStorage {
    /// Block size in bytes; constant for the lifetime of the store.
    fn block_size(&self) -> usize;

    /// Number of allocated blocks.
    fn block_count(&self) -> u32;

    /// Fills `buf` (exactly one block) from the block at `index`.
    fn read(&mut self, index: u32, buf: &mut [u8]) -> Result<()>;

    /// Persists `buf` (exactly one block) to the block at `index`.
    fn write(&mut self, index: u32, buf: &[u8]) -> Result<()>;

    /// Allocates a new zeroed block, growing the store, and returns its
    /// index.
    fn increase(&mut self) -> Result<u32>;

    /// Durability barrier; a no-op where the medium has none.
    fn sync(&mut self) -> Result<()>;
}

fn check_block_size(block_size: usize) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(BaobabError::Corruption("unsupported block size"));
    }
    Ok(())
}

fn check_buffer(buf_len: usize, block_size: usize) -> Result<()> {
    if buf_len != block_size {
        return Err(BaobabError::Corruption("buffer length is not one block"));
    }
    Ok(())
}

/// File-backed block storage: a 16-byte header followed by the blocks.
pub struct FileStorage {
    file: File,
    block_size: usize,
    block_count: u32,
}

impl FileStorage {
    /// Creates (or truncates) the file at `path` with the given block size.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut storage = Self {
            file,
            block_size,
            block_count: 0,
        };
        storage.write_header()?;
        Ok(storage)
    }

    /// Opens an existing file, validating its header and deriving the block
    /// size and count from it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; FILE_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if header[0..4] != FILE_MAGIC {
            return Err(BaobabError::Corruption("bad storage file magic"));
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != FILE_VERSION {
            return Err(BaobabError::Corruption("unknown storage file version"));
        }
        let block_size = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        check_block_size(block_size)?;
        let block_count = u32::from_be_bytes([header[10], header[11], header[12], header[13]]);
        let expected = FILE_HEADER_LEN as u64 + block_count as u64 * block_size as u64;
        if file.metadata()?.len() < expected {
            return Err(BaobabError::Corruption("storage file shorter than header claims"));
        }
        Ok(Self {
            file,
            block_size,
            block_count,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; FILE_HEADER_LEN];
        header[0..4].copy_from_slice(&FILE_MAGIC);
        header[4..6].copy_from_slice(&FILE_VERSION.to_be_bytes());
        header[6..10].copy_from_slice(&(self.block_size as u32).to_be_bytes());
        header[10..14].copy_from_slice(&self.block_count.to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn block_offset(&self, index: u32) -> u64 {
        FILE_HEADER_LEN as u64 + index as u64 * self.block_size as u64
    }
}

impl BlockStorage for FileStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(buf.len(), self.block_size)?;
        if index >= self.block_count {
            return Err(BaobabError::NotFound("block"));
        }
        self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, index: u32, buf: &[u8]) -> Result<()> {
        check_buffer(buf.len(), self.block_size)?;
        if index >= self.block_count {
            return Err(BaobabError::NotFound("block"));
        }
        self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn increase(&mut self) -> Result<u32> {
        let index = self.block_count;
        let zeroes = vec![0u8; self.block_size];
        self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.write_all(&zeroes)?;
        self.block_count += 1;
        self.write_header()?;
        Ok(index)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory block storage for tests and ephemeral trees.
pub struct MemStorage {
    blocks: Vec<Vec<u8>>,
    block_size: usize,
}

impl MemStorage {
    /// Creates an empty store with the given block size.
    pub fn new(block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        Ok(Self {
            blocks: Vec::new(),
            block_size,
        })
    }
}

impl BlockStorage for MemStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn read(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(buf.len(), self.block_size)?;
        let block = self
            .blocks
            .get(index as usize)
            .ok_or(BaobabError::NotFound("block"))?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write(&mut self, index: u32, buf: &[u8]) -> Result<()> {
        check_buffer(buf.len(), self.block_size)?;
        let block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(BaobabError::NotFound("block"))?;
        block.copy_from_slice(buf);
        Ok(())
    }

    fn increase(&mut self) -> Result<u32> {
        let index = self.blocks.len() as u32;
        self.blocks.push(vec![0u8; self.block_size]);
        Ok(index)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
