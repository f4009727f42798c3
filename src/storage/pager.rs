//! Page lifecycle management.
//!
//! The pager is the sole owner of in-memory pages and of their binding to
//! on-disk blocks: all cross-page references are integer ids resolved here.
//! Block 0 is the pager's metadata block, holding the root page id and the
//! list of freed ids awaiting reuse; page id `n` lives in block `n - 1`, id
//! 0 is the null child sentinel, and id 1 (the metadata block itself) is
//! never a page.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::codec::Codec;
use crate::error::{BaobabError, Result};
use crate::storage::block::BlockStorage;
use crate::storage::page::Page;

/// Shared handle to a resident page. Single-threaded by design; callers
/// serialize access externally.
pub type PageRef<K, V> = Rc<RefCell<Page<K, V>>>;

const META_ROOT_POS: usize = 0;
const META_FREE_COUNT_POS: usize = 4;
const META_FREE_IDS_POS: usize = 6;

/// Creates, loads, caches and persists pages by id.
pub struct Pager<K, V, S> {
    storage: S,
    pages: HashMap<u32, PageRef<K, V>>,
    root: u32,
    free_ids: Vec<u32>,
}

impl<K: Codec, V: Codec, S: BlockStorage> Pager<K, V, S> {
    /// Initializes a pager over empty storage: writes the metadata block and
    /// a fresh root leaf page.
    pub fn create(mut storage: S) -> Result<Self> {
        if storage.block_count() != 0 {
            return Err(BaobabError::Corruption("storage is not empty"));
        }
        storage.increase()?;
        let mut pager = Self {
            storage,
            pages: HashMap::new(),
            root: 0,
            free_ids: Vec::new(),
        };
        let root = pager.create_page(true)?;
        pager.root = root.borrow().id();
        pager.fsync()?;
        Ok(pager)
    }

    /// Opens a pager over previously-initialized storage, reading the root
    /// id and freed-id list back from the metadata block.
    pub fn open(mut storage: S) -> Result<Self> {
        if storage.block_count() == 0 {
            return Err(BaobabError::NotFound("pager metadata block"));
        }
        let mut meta = vec![0u8; storage.block_size()];
        storage.read(0, &mut meta)?;
        let root = u32::from_be_bytes([
            meta[META_ROOT_POS],
            meta[META_ROOT_POS + 1],
            meta[META_ROOT_POS + 2],
            meta[META_ROOT_POS + 3],
        ]);
        if root < 2 || root - 1 >= storage.block_count() {
            return Err(BaobabError::Corruption("metadata root id out of range"));
        }
        let free_count =
            u16::from_be_bytes([meta[META_FREE_COUNT_POS], meta[META_FREE_COUNT_POS + 1]]) as usize;
        if META_FREE_IDS_POS + free_count * 4 > meta.len() {
            return Err(BaobabError::Corruption("metadata freed-id list truncated"));
        }
        let mut free_ids = Vec::with_capacity(free_count);
        for i in 0..free_count {
            let pos = META_FREE_IDS_POS + i * 4;
            let id = u32::from_be_bytes([meta[pos], meta[pos + 1], meta[pos + 2], meta[pos + 3]]);
            if id < 2 || id - 1 >= storage.block_count() {
                return Err(BaobabError::Corruption("metadata freed id out of range"));
            }
            free_ids.push(id);
        }
        Ok(Self {
            storage,
            pages: HashMap::new(),
            root,
            free_ids,
        })
    }

    /// Block size of the underlying storage.
    pub fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    /// Number of blocks allocated in the underlying storage.
    pub fn block_count(&self) -> u32 {
        self.storage.block_count()
    }

    /// Current root page id.
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Records a new root page id; persisted on the next [`Pager::fsync`].
    pub fn set_root(&mut self, id: u32) {
        self.root = id;
    }

    /// Allocates a page, recycling a freed id when one is available.
    pub fn create_page(&mut self, is_leaf: bool) -> Result<PageRef<K, V>> {
        if let Some(id) = self.free_ids.pop() {
            let page = self.load_any(id)?;
            page.borrow_mut().reinit(is_leaf);
            debug!(page = id, is_leaf, "page id recycled");
            return Ok(page);
        }
        let page = Page::create(&mut self.storage, is_leaf)?;
        let id = page.id();
        debug!(page = id, is_leaf, "page created");
        let handle = Rc::new(RefCell::new(page));
        self.pages.insert(id, Rc::clone(&handle));
        Ok(handle)
    }

    /// Returns the page for `id`, reading it from storage if not resident.
    /// Reserved and unallocated ids are a not-found error.
    pub fn load(&mut self, id: u32) -> Result<PageRef<K, V>> {
        if id < 2 {
            return Err(BaobabError::NotFound("page"));
        }
        self.load_any(id)
    }

    fn load_any(&mut self, id: u32) -> Result<PageRef<K, V>> {
        if let Some(page) = self.pages.get(&id) {
            return Ok(Rc::clone(page));
        }
        let page = Page::load(&mut self.storage, id)?;
        let handle = Rc::new(RefCell::new(page));
        self.pages.insert(id, Rc::clone(&handle));
        Ok(handle)
    }

    /// Tombstones a page and queues its id for reuse by a future
    /// [`Pager::create_page`].
    pub fn remove(&mut self, page: &PageRef<K, V>) -> Result<()> {
        let id = {
            let mut page = page.borrow_mut();
            page.set_deleted(true)?;
            page.id()
        };
        self.free_ids.push(id);
        debug!(page = id, "page removed");
        Ok(())
    }

    /// Persists every modified resident page plus the metadata block, then
    /// syncs the storage. Clean pages no longer referenced elsewhere are
    /// dropped from the resident set afterward.
    pub fn fsync(&mut self) -> Result<()> {
        let mut saved = 0usize;
        for page in self.pages.values() {
            let mut page = page.borrow_mut();
            if page.is_modified() {
                page.save(&mut self.storage)?;
                saved += 1;
            }
        }
        self.write_meta()?;
        self.storage.sync()?;
        self.pages.retain(|_, page| Rc::strong_count(page) > 1);
        debug!(saved, resident = self.pages.len(), "pager fsync");
        Ok(())
    }

    /// Freed ids are persisted up to the metadata block's capacity; any
    /// beyond that survive only for this session and their blocks leak.
    fn write_meta(&mut self) -> Result<()> {
        let mut meta = vec![0u8; self.storage.block_size()];
        meta[META_ROOT_POS..META_ROOT_POS + 4].copy_from_slice(&self.root.to_be_bytes());
        let capacity = (meta.len() - META_FREE_IDS_POS) / 4;
        let persisted = self.free_ids.len().min(capacity);
        meta[META_FREE_COUNT_POS..META_FREE_COUNT_POS + 2]
            .copy_from_slice(&(persisted as u16).to_be_bytes());
        for (i, id) in self.free_ids[..persisted].iter().enumerate() {
            let pos = META_FREE_IDS_POS + i * 4;
            meta[pos..pos + 4].copy_from_slice(&id.to_be_bytes());
        }
        self.storage.write(0, &meta)?;
        Ok(())
    }
}
