//! The on-disk B-tree node format.
//!
//! One [`Page`] maps 1:1 onto one storage block:
//!
//! | offset | field                                          | width |
//! |--------|------------------------------------------------|-------|
//! | 0      | flags (bit0 leaf, bit1 fragmented, bit2 deleted) | 2   |
//! | 2      | size (entry count)                             | 2     |
//! | 4      | free boundary offset                           | 2     |
//! | 6      | used bytes count                               | 2     |
//! | 8      | element table                                  | 4 or 8 per entry |
//!
//! Leaf entries are two 2-byte record offsets (key, value); internal entries
//! prepend a 4-byte child id, and one extra trailing child id follows the
//! last entry. Record payloads grow downward from the block end toward the
//! element table; the free boundary is the lowest offset at which data may
//! still be appended. All multi-byte fields are big-endian.
//!
//! A stored record offset of `0` marks an empty slot, a positive offset
//! points into the block's data region, and a negative offset indexes the
//! in-memory overflow side table. Overflow entries are never persisted: a
//! page is defragmented before save, and if its records still do not fit the
//! save fails with a page-overflow error.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use tracing::trace;

use crate::codec::Codec;
use crate::error::{BaobabError, Result};
use crate::storage::block::BlockStorage;

const FLAG_LEAF: u16 = 1;
const FLAG_FRAGMENTED: u16 = 2;
const FLAG_DELETED: u16 = 4;

const FLAGS_POS: usize = 0;
const SIZE_POS: usize = 2;
const FREE_BOUNDARY_POS: usize = 4;
const USED_BYTES_POS: usize = 6;
const ELEMENTS_POS: usize = 8;

/// Which record of an entry an allocator operation refers to. The key and
/// value codecs differ, so freed records are measured with the right one.
#[derive(Clone, Copy)]
enum Slot {
    Key,
    Value,
}

/// One B-tree node, serialized into a single fixed-size block.
pub struct Page<K, V> {
    id: u32,
    buf: Vec<u8>,
    leaf: bool,
    modified: bool,
    overflow: BTreeMap<i16, Vec<u8>>,
    _marker: PhantomData<(K, V)>,
}

impl<K: Codec, V: Codec> Page<K, V> {
    /// Allocates a fresh block and initializes an empty page over it.
    pub fn create<S: BlockStorage>(storage: &mut S, is_leaf: bool) -> Result<Self> {
        let id = storage.increase()? + 1;
        let mut page = Self {
            id,
            buf: vec![0u8; storage.block_size()],
            leaf: is_leaf,
            modified: true,
            overflow: BTreeMap::new(),
            _marker: PhantomData,
        };
        if is_leaf {
            page.set_flags(FLAG_LEAF);
        }
        page.set_free_boundary(page.block_size() as u16);
        Ok(page)
    }

    /// Reads the page with the given id back from its block (`id - 1`).
    pub fn load<S: BlockStorage>(storage: &mut S, id: u32) -> Result<Self> {
        if id == 0 {
            return Err(BaobabError::NotFound("page"));
        }
        let mut buf = vec![0u8; storage.block_size()];
        storage.read(id - 1, &mut buf)?;
        let flags = u16::from_be_bytes([buf[FLAGS_POS], buf[FLAGS_POS + 1]]);
        let page = Self {
            id,
            buf,
            leaf: flags & FLAG_LEAF != 0,
            modified: false,
            overflow: BTreeMap::new(),
            _marker: PhantomData,
        };
        let size = page.size_raw();
        let boundary = page.free_boundary() as usize;
        if boundary > page.block_size() {
            return Err(BaobabError::Corruption("free boundary beyond block end"));
        }
        if page.header_size_for(size) > page.block_size() {
            return Err(BaobabError::Corruption("element table beyond block end"));
        }
        if !page.is_deleted() && page.header_size_for(size) > boundary {
            return Err(BaobabError::Corruption("element table overlaps data region"));
        }
        Ok(page)
    }

    /// Re-initializes a tombstoned page in place for a new lifetime under a
    /// recycled id.
    pub(crate) fn reinit(&mut self, is_leaf: bool) {
        self.buf.fill(0);
        self.leaf = is_leaf;
        if is_leaf {
            self.set_flags(FLAG_LEAF);
        }
        self.set_free_boundary(self.block_size() as u16);
        self.overflow.clear();
        self.modified = true;
    }

    /// Stable identity of this page, used as the cross-page reference.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this page stores leaf entries; fixed at creation.
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Whether the page has unsaved modifications.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Whether the page has been tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    /// Block size of the backing storage, which is also the serialized size
    /// of this page.
    pub fn block_size(&self) -> usize {
        self.buf.len()
    }

    /// Number of entries currently stored.
    pub fn size(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.size_raw())
    }

    /// Grows or shrinks the entry count.
    ///
    /// Growing re-initializes the new slots to empty and defragments first if
    /// the element table would overlap the data region; shrinking releases
    /// the removed slots' records before truncating.
    pub fn set_size(&mut self, value: usize) -> Result<()> {
        self.check_deleted()?;
        let prev = self.size_raw();
        if prev == value {
            return Ok(());
        }
        if value > u16::MAX as usize || self.header_size_for(value) > self.block_size() {
            return Err(BaobabError::Corruption("element table beyond block end"));
        }
        self.modified = true;
        if prev < value {
            self.write_u16(SIZE_POS, value as u16);
            if self.header_size() > self.free_boundary() as usize {
                self.defragment(prev)?;
            }
            for i in prev..value {
                self.reset_element(i);
            }
        } else {
            for i in value..prev {
                self.remove_element(i)?;
                self.reset_element(i);
            }
            self.write_u16(SIZE_POS, value as u16);
        }
        Ok(())
    }

    /// Decodes the key at `index`.
    pub fn key(&self, index: usize) -> Result<K> {
        self.check_deleted()?;
        self.check_index(index)?;
        K::decode(self.record_bytes(self.key_pos(index))?)
    }

    /// Replaces the key at `index`, freeing the old record first.
    pub fn set_key(&mut self, index: usize, key: &K) -> Result<()> {
        self.check_deleted()?;
        self.check_index(index)?;
        let bytes = Self::encode_record(key.encoded_len(), |buf| key.encode(buf))?;
        self.check_record_len(bytes.len())?;
        self.remove_data(self.key_pos(index), Slot::Key)?;
        let pos = self.append_record(&bytes)?;
        self.set_key_pos(index, pos);
        self.modified = true;
        Ok(())
    }

    /// Decodes the value at `index`.
    pub fn value(&self, index: usize) -> Result<V> {
        self.check_deleted()?;
        self.check_index(index)?;
        V::decode(self.record_bytes(self.value_pos(index))?)
    }

    /// Replaces the value at `index`, freeing the old record first.
    pub fn set_value(&mut self, index: usize, value: &V) -> Result<()> {
        self.check_deleted()?;
        self.check_index(index)?;
        let bytes = Self::encode_record(value.encoded_len(), |buf| value.encode(buf))?;
        self.check_record_len(bytes.len())?;
        self.remove_data(self.value_pos(index), Slot::Value)?;
        let pos = self.append_record(&bytes)?;
        self.set_value_pos(index, pos);
        self.modified = true;
        Ok(())
    }

    /// Reads the child page id at `index` (valid for `0..=size`).
    pub fn child(&self, index: usize) -> Result<u32> {
        self.check_deleted()?;
        self.check_child_access(index)?;
        let pos = self.element_pos(index);
        Ok(u32::from_be_bytes([
            self.buf[pos],
            self.buf[pos + 1],
            self.buf[pos + 2],
            self.buf[pos + 3],
        ]))
    }

    /// Writes the child page id at `index` (valid for `0..=size`).
    pub fn set_child(&mut self, index: usize, id: u32) -> Result<()> {
        self.check_deleted()?;
        self.check_child_access(index)?;
        self.write_child_raw(index, id);
        self.modified = true;
        Ok(())
    }

    /// Exchanges the key and value record pointers of two slots without
    /// copying payload bytes.
    pub fn swap(&mut self, i: usize, j: usize) -> Result<()> {
        self.check_deleted()?;
        self.check_index(i)?;
        self.check_index(j)?;
        let (ik, iv) = (self.key_pos(i), self.value_pos(i));
        let (jk, jv) = (self.key_pos(j), self.value_pos(j));
        self.set_key_pos(i, jk);
        self.set_value_pos(i, jv);
        self.set_key_pos(j, ik);
        self.set_value_pos(j, iv);
        self.modified = true;
        Ok(())
    }

    /// Largest encoded record this page accepts, a quarter of the block.
    pub fn max_record_size(&self) -> usize {
        self.block_size() / 4
    }

    /// Bytes consumed by record payloads, the basis for capacity decisions.
    pub fn used_bytes(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.used_raw())
    }

    /// Whether the page should be split before further inserts.
    pub fn is_full(&self) -> Result<bool> {
        self.check_deleted()?;
        Ok(self.used_raw() >= self.body_size())
    }

    /// Whether the page is under-full and should be rebalanced.
    pub fn is_half(&self) -> Result<bool> {
        self.check_deleted()?;
        Ok(self.used_raw() < self.body_size() / 4)
    }

    /// Whether the page can spare an entry to an under-full sibling.
    pub fn can_borrow(&self) -> Result<bool> {
        self.check_deleted()?;
        Ok(self.size_raw() > 2 && self.used_raw() > self.body_size() / 2)
    }

    /// Raises or clears the tombstone.
    ///
    /// Tombstoning resets the page to empty before setting the flag;
    /// clearing it also drops the fragmentation flag, as the page is about
    /// to be recycled for a new lifetime.
    pub fn set_deleted(&mut self, deleted: bool) -> Result<()> {
        if deleted {
            self.set_size(0)?;
            self.set_free_boundary(self.block_size() as u16);
            self.write_u16(USED_BYTES_POS, 0);
            self.overflow.clear();
            self.set_flags(self.flags() | FLAG_DELETED);
        } else {
            self.set_flags(self.flags() & !(FLAG_FRAGMENTED | FLAG_DELETED));
        }
        self.modified = true;
        Ok(())
    }

    /// Persists the page to its block.
    ///
    /// A page that still holds overflow records is defragmented first; if
    /// its contents do not fit even then, the save fails with a
    /// page-overflow error instead of truncating.
    pub fn save<S: BlockStorage>(&mut self, storage: &mut S) -> Result<()> {
        if !self.is_deleted() {
            if !self.overflow.is_empty() {
                self.defragment(self.size_raw())?;
            }
            if !self.overflow.is_empty() {
                return Err(BaobabError::PageOverflow {
                    id: self.id,
                    used: self.used_raw(),
                    body: self.body_size(),
                });
            }
        }
        storage.write(self.id - 1, &self.buf)?;
        self.modified = false;
        Ok(())
    }

    // ---- header bookkeeping ----

    fn flags(&self) -> u16 {
        self.read_u16(FLAGS_POS)
    }

    fn set_flags(&mut self, value: u16) {
        self.write_u16(FLAGS_POS, value);
    }

    fn set_fragmented(&mut self, fragmented: bool) {
        if fragmented {
            self.set_flags(self.flags() | FLAG_FRAGMENTED);
        } else {
            self.set_flags(self.flags() & !FLAG_FRAGMENTED);
        }
    }

    /// Whether a freed in-place record has left an unreclaimed hole.
    pub fn is_fragmented(&self) -> bool {
        self.flags() & FLAG_FRAGMENTED != 0
    }

    fn size_raw(&self) -> usize {
        self.read_u16(SIZE_POS) as usize
    }

    fn used_raw(&self) -> usize {
        self.read_u16(USED_BYTES_POS) as usize
    }

    fn free_boundary(&self) -> u16 {
        self.read_u16(FREE_BOUNDARY_POS)
    }

    fn set_free_boundary(&mut self, value: u16) {
        self.write_u16(FREE_BOUNDARY_POS, value);
    }

    fn element_len(&self) -> usize {
        if self.leaf {
            4
        } else {
            8
        }
    }

    fn element_pos(&self, index: usize) -> usize {
        ELEMENTS_POS + index * self.element_len()
    }

    fn header_size_for(&self, size: usize) -> usize {
        let trailing = if self.leaf { 0 } else { 4 };
        ELEMENTS_POS + size * self.element_len() + trailing
    }

    fn header_size(&self) -> usize {
        self.header_size_for(self.size_raw())
    }

    fn body_size(&self) -> usize {
        self.block_size() - self.header_size()
    }

    fn key_pos(&self, index: usize) -> i16 {
        let rel = if self.leaf { 0 } else { 4 };
        self.read_i16(self.element_pos(index) + rel)
    }

    fn set_key_pos(&mut self, index: usize, value: i16) {
        let rel = if self.leaf { 0 } else { 4 };
        self.write_i16(self.element_pos(index) + rel, value);
    }

    fn value_pos(&self, index: usize) -> i16 {
        let rel = if self.leaf { 2 } else { 6 };
        self.read_i16(self.element_pos(index) + rel)
    }

    fn set_value_pos(&mut self, index: usize, value: i16) {
        let rel = if self.leaf { 2 } else { 6 };
        self.write_i16(self.element_pos(index) + rel, value);
    }

    fn write_child_raw(&mut self, index: usize, id: u32) {
        let pos = self.element_pos(index);
        self.buf[pos..pos + 4].copy_from_slice(&id.to_be_bytes());
    }

    fn reset_element(&mut self, index: usize) {
        self.set_key_pos(index, 0);
        self.set_value_pos(index, 0);
        if !self.leaf {
            self.write_child_raw(index + 1, 0);
        }
    }

    fn remove_element(&mut self, index: usize) -> Result<()> {
        self.remove_data(self.key_pos(index), Slot::Key)?;
        self.remove_data(self.value_pos(index), Slot::Value)?;
        Ok(())
    }

    // ---- free-space allocator ----

    fn check_record_len(&self, len: usize) -> Result<()> {
        let max = self.max_record_size();
        if len == 0 || len > max {
            return Err(BaobabError::InvalidDataSize { len, max });
        }
        Ok(())
    }

    fn encode_record(len: usize, encode: impl FnOnce(&mut [u8]) -> Result<()>) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Reserves space below the free boundary and writes `bytes` there; if
    /// the reservation would intrude into the element table, the record is
    /// spilled to the overflow side table instead.
    fn append_record(&mut self, bytes: &[u8]) -> Result<i16> {
        self.check_record_len(bytes.len())?;
        let target = self.free_boundary() as isize - bytes.len() as isize;
        let position = if target <= self.header_size() as isize {
            self.overflow_record(bytes)?
        } else {
            let start = target as usize;
            self.buf[start..start + bytes.len()].copy_from_slice(bytes);
            self.set_free_boundary(start as u16);
            start as i16
        };
        let used = self
            .used_raw()
            .checked_add(bytes.len())
            .filter(|total| *total <= u16::MAX as usize)
            .ok_or(BaobabError::Corruption("used bytes counter overflow"))?;
        self.write_u16(USED_BYTES_POS, used as u16);
        Ok(position)
    }

    /// Stores a record out of band, keyed by the next negative offset
    /// counting down from -1. Slots freed in the meantime are only reclaimed
    /// by defragmentation; the table errors out at `i16::MAX` entries.
    fn overflow_record(&mut self, bytes: &[u8]) -> Result<i16> {
        if self.overflow.len() >= i16::MAX as usize {
            return Err(BaobabError::PageOverflow {
                id: self.id,
                used: self.used_raw(),
                body: self.body_size(),
            });
        }
        let key = self
            .overflow
            .first_key_value()
            .map(|(key, _)| *key)
            .unwrap_or(0)
            - 1;
        trace!(page = self.id, offset = key, len = bytes.len(), "record spilled to overflow");
        self.overflow.insert(key, bytes.to_vec());
        Ok(key)
    }

    fn record_bytes(&self, position: i16) -> Result<&[u8]> {
        if position == 0 {
            return Err(BaobabError::Corruption("empty record slot"));
        }
        if position < 0 {
            return self
                .overflow
                .get(&position)
                .map(Vec::as_slice)
                .ok_or(BaobabError::Corruption("missing overflow record"));
        }
        let start = position as usize;
        if start >= self.block_size() {
            return Err(BaobabError::Corruption("record position beyond block end"));
        }
        Ok(&self.buf[start..])
    }

    /// Releases the record at `position`: an in-block record leaves a hole
    /// and marks the page fragmented, an overflow record is dropped from the
    /// side table. An empty slot is a no-op.
    fn remove_data(&mut self, position: i16, slot: Slot) -> Result<()> {
        if position == 0 {
            return Ok(());
        }
        let bytes = if position < 0 {
            let record = self
                .overflow
                .remove(&position)
                .ok_or(BaobabError::Corruption("missing overflow record"))?;
            record.len()
        } else {
            let start = position as usize;
            if start < self.free_boundary() as usize || start >= self.block_size() {
                return Err(BaobabError::Corruption("record position outside data region"));
            }
            let len = match slot {
                Slot::Key => K::stored_len(&self.buf[start..])?,
                Slot::Value => V::stored_len(&self.buf[start..])?,
            };
            self.set_fragmented(true);
            len
        };
        let used = self
            .used_raw()
            .checked_sub(bytes)
            .ok_or(BaobabError::Corruption("used bytes counter underflow"))?;
        self.write_u16(USED_BYTES_POS, used as u16);
        Ok(())
    }

    /// Re-appends the first `count` entries' records contiguously from the
    /// block end downward, reclaiming fragmentation holes and folding
    /// overflow records back into the block where they fit.
    fn defragment(&mut self, count: usize) -> Result<()> {
        trace!(page = self.id, entries = count, overflow = self.overflow.len(), "defragmenting");
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let key = self.record_copy(self.key_pos(i), Slot::Key)?;
            let value = self.record_copy(self.value_pos(i), Slot::Value)?;
            records.push((key, value));
        }
        self.write_u16(USED_BYTES_POS, 0);
        self.set_free_boundary(self.block_size() as u16);
        self.overflow.clear();
        for (i, (key, value)) in records.iter().enumerate() {
            let pos = self.append_record(key)?;
            self.set_key_pos(i, pos);
            let pos = self.append_record(value)?;
            self.set_value_pos(i, pos);
        }
        self.set_fragmented(false);
        self.modified = true;
        Ok(())
    }

    fn record_copy(&self, position: i16, slot: Slot) -> Result<Vec<u8>> {
        let bytes = self.record_bytes(position)?;
        let len = if position < 0 {
            bytes.len()
        } else {
            match slot {
                Slot::Key => K::stored_len(bytes)?,
                Slot::Value => V::stored_len(bytes)?,
            }
        };
        Ok(bytes[..len].to_vec())
    }

    // ---- checks and raw buffer access ----

    fn check_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(BaobabError::DeletedPage(self.id));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.size_raw() {
            return Err(BaobabError::InvalidIndex {
                index,
                size: self.size_raw(),
            });
        }
        Ok(())
    }

    fn check_child_access(&self, index: usize) -> Result<()> {
        if self.leaf {
            return Err(BaobabError::Unsupported(
                "child operations are not allowed on leaf pages",
            ));
        }
        if index > self.size_raw() {
            return Err(BaobabError::InvalidIndex {
                index,
                size: self.size_raw(),
            });
        }
        Ok(())
    }

    fn read_u16(&self, pos: usize) -> u16 {
        u16::from_be_bytes([self.buf[pos], self.buf[pos + 1]])
    }

    fn write_u16(&mut self, pos: usize, value: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_i16(&self, pos: usize) -> i16 {
        i16::from_be_bytes([self.buf[pos], self.buf[pos + 1]])
    }

    fn write_i16(&mut self, pos: usize, value: i16) {
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }
}
