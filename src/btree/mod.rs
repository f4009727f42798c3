//! Logical tree operations over pages.
//!
//! The tree never touches page bytes directly: search, insert and delete are
//! expressed purely through [`Page`](crate::storage::Page) accessors and the
//! [`Pager`]. Inserts
//! split full pages and promote the middle entry upward; deletes refill
//! internal vacancies from the in-order predecessor and rebalance under-full
//! pages by rotating an entry through the parent separator when a sibling
//! can spare one, or by merging with a sibling otherwise. Every operation
//! completes before returning, so no partially-rebalanced shape is ever
//! observable.
//!
//! This is a B-tree, not a B+ tree: internal entries carry real key/value
//! pairs, and separators move down into merged pages rather than being
//! discarded.

use std::rc::Rc;

use smallvec::SmallVec;
use tracing::debug;

use crate::codec::Codec;
use crate::error::{BaobabError, Result};
use crate::storage::{BlockStorage, PageRef, Pager};

/// A (page, index-within-parent) pair tracked during a single tree
/// operation; never persisted.
pub struct Node<K, V> {
    page: PageRef<K, V>,
    index: usize,
}

impl<K, V> Node<K, V> {
    /// Pairs a page handle with the entry (or child) index it was reached
    /// through.
    pub fn new(page: PageRef<K, V>, index: usize) -> Self {
        Self { page, index }
    }

    /// The page this node refers to.
    pub fn page(&self) -> &PageRef<K, V> {
        &self.page
    }

    /// The index within the page.
    pub fn index(&self) -> usize {
        self.index
    }
}

type Path<K, V> = SmallVec<[Node<K, V>; 8]>;

/// An ordered key-value map backed by pages of a block storage.
pub struct BTree<K, V, S> {
    pager: Pager<K, V, S>,
}

impl<K: Codec + Ord, V: Codec, S: BlockStorage> BTree<K, V, S> {
    /// Wraps an already-initialized pager.
    pub fn new(pager: Pager<K, V, S>) -> Self {
        Self { pager }
    }

    /// Initializes a brand-new tree over empty storage.
    pub fn create(storage: S) -> Result<Self> {
        Ok(Self::new(Pager::create(storage)?))
    }

    /// Opens an existing tree.
    pub fn open(storage: S) -> Result<Self> {
        Ok(Self::new(Pager::open(storage)?))
    }

    /// The pager owning this tree's pages.
    pub fn pager(&self) -> &Pager<K, V, S> {
        &self.pager
    }

    /// Mutable access to the pager.
    pub fn pager_mut(&mut self) -> &mut Pager<K, V, S> {
        &mut self.pager
    }

    /// Flushes every dirty page and the pager metadata to storage.
    pub fn flush(&mut self) -> Result<()> {
        self.pager.fsync()
    }

    /// Looks up the value stored under `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let mut path = Path::new();
        let (node, found) = self.lookup(key, &mut path)?;
        if !found {
            return Ok(None);
        }
        let value = node.page.borrow().value(node.index)?;
        Ok(Some(value))
    }

    /// Inserts or overwrites the entry for `key`, splitting pages upward as
    /// long as they stay full.
    pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
        let mut path = Path::new();
        let (node, found) = self.lookup(key, &mut path)?;
        // reject oversized records before any slot is opened, so a failed
        // put cannot leave a half-filled entry behind
        let max = node.page.borrow().max_record_size();
        for len in [key.encoded_len(), value.encoded_len()] {
            if len > max {
                return Err(BaobabError::InvalidDataSize { len, max });
            }
        }
        if found {
            node.page.borrow_mut().set_value(node.index, value)?;
        } else {
            self.insert_place(&node.page, node.index)?;
            let mut page = node.page.borrow_mut();
            page.set_key(node.index, key)?;
            page.set_value(node.index, value)?;
        }
        let mut current = node.page;
        while current.borrow().is_full()? {
            let parent = match path.pop() {
                Some(parent) => parent,
                None => self.grow_root(&current)?,
            };
            self.split(&current, &parent)?;
            current = parent.page;
        }
        Ok(())
    }

    /// Removes the entry for `key`, returning its value. Under-full pages
    /// are refilled from a sibling or merged away, propagating upward; a
    /// root left with a single child is replaced by it.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let mut path = Path::new();
        let (node, found) = self.lookup(key, &mut path)?;
        if !found {
            return Ok(None);
        }
        let old = node.page.borrow().value(node.index)?;
        let mut current = if node.page.borrow().is_leaf() {
            self.delete_place(&node.page, node.index)?;
            Rc::clone(&node.page)
        } else {
            // fill the vacancy with the in-order predecessor, pulled from the
            // rightmost leaf below the removed key
            path.push(Node::new(Rc::clone(&node.page), node.index));
            let mut leaf = {
                let child = node.page.borrow().child(node.index)?;
                self.pager.load(child)?
            };
            while !leaf.borrow().is_leaf() {
                let size = leaf.borrow().size()?;
                let child = leaf.borrow().child(size)?;
                path.push(Node::new(Rc::clone(&leaf), size));
                leaf = self.pager.load(child)?;
            }
            self.promote_last(&leaf, &node)?;
            self.delete_place(&node.page, node.index + 1)?;
            leaf
        };
        loop {
            let Some(parent) = path.pop() else {
                self.shrink_root(&current)?;
                break;
            };
            if !current.borrow().is_half()? {
                break;
            }
            if !self.rebalance(&parent, &current)? {
                break;
            }
            current = parent.page;
        }
        Ok(Some(old))
    }

    /// Iterates the entries in the inclusive key interval `[from, to]` in
    /// order; either bound may be absent.
    pub fn range(&mut self, from: Option<K>, to: Option<K>) -> Result<Range<'_, K, V, S>> {
        let mut stack = Vec::new();
        let ascended;
        let mut page = self.root_page()?;
        loop {
            let (index, found) = match &from {
                Some(key) => Self::search(&page, key)?,
                None => (0, false),
            };
            let is_leaf = page.borrow().is_leaf();
            if is_leaf || found {
                ascended = found && !is_leaf;
                stack.push(Node::new(page, index));
                break;
            }
            let child = page.borrow().child(index)?;
            stack.push(Node::new(page, index));
            page = self.pager.load(child)?;
        }
        Ok(Range {
            tree: self,
            stack,
            ascended,
            to,
            done: false,
        })
    }

    /// Loads the child page at `index`. A child id whose page no longer
    /// exists yields `None` — that slot is legitimately absent — while leaf
    /// pages and out-of-range indices are reported as errors.
    pub fn get_child_page(
        &mut self,
        page: &PageRef<K, V>,
        index: usize,
    ) -> Result<Option<PageRef<K, V>>> {
        let id = page.borrow().child(index)?;
        match self.pager.load(id) {
            Ok(child) => {
                if child.borrow().is_deleted() {
                    Ok(None)
                } else {
                    Ok(Some(child))
                }
            }
            Err(BaobabError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // ---- structural primitives ----

    /// Opens a slot at `index`: every entry at or after it shifts one place
    /// right (for internal pages including the trailing child pointer),
    /// leaving an empty slot for the caller to fill.
    pub fn insert_place(&self, page: &PageRef<K, V>, index: usize) -> Result<()> {
        let mut page = page.borrow_mut();
        let size = page.size()?;
        if index > size {
            return Err(BaobabError::InvalidIndex { index, size });
        }
        page.set_size(size + 1)?;
        if !page.is_leaf() {
            let trailing = page.child(size)?;
            page.set_child(size + 1, trailing)?;
        }
        let mut i = size;
        while i > index {
            page.swap(i, i - 1)?;
            if !page.is_leaf() {
                let child = page.child(i - 1)?;
                page.set_child(i, child)?;
            }
            i -= 1;
        }
        Ok(())
    }

    /// Exact inverse of [`BTree::insert_place`]: removes the entry (and, for
    /// internal pages, the child pointer) at `index`, shifting the rest
    /// left.
    pub fn delete_place(&self, page: &PageRef<K, V>, index: usize) -> Result<()> {
        let mut page = page.borrow_mut();
        let size = page.size()?;
        if index >= size {
            return Err(BaobabError::InvalidIndex { index, size });
        }
        for i in index..size - 1 {
            page.swap(i, i + 1)?;
        }
        if !page.is_leaf() {
            for i in index..size {
                let child = page.child(i + 1)?;
                page.set_child(i, child)?;
            }
        }
        page.set_size(size - 1)?;
        Ok(())
    }

    /// Pulls the last entry of `source` up into `target`, opening a slot
    /// there first. Used to refill the vacancy left by removing an internal
    /// key.
    pub fn promote_last(&self, source: &PageRef<K, V>, target: &Node<K, V>) -> Result<()> {
        let (last_key, last_value, remaining) = {
            let source = source.borrow();
            let size = source.size()?;
            if size == 0 {
                return Err(BaobabError::InvalidIndex { index: 0, size: 0 });
            }
            (source.key(size - 1)?, source.value(size - 1)?, size - 1)
        };
        self.insert_place(&target.page, target.index)?;
        {
            let mut target_page = target.page.borrow_mut();
            target_page.set_key(target.index, &last_key)?;
            target_page.set_value(target.index, &last_value)?;
        }
        source.borrow_mut().set_size(remaining)?;
        Ok(())
    }

    /// Moves one entry from `source` (the left sibling) through the parent
    /// separator into the front of `target` (the right sibling).
    pub fn rotate_right(
        &self,
        parent: &Node<K, V>,
        source: &PageRef<K, V>,
        target: &PageRef<K, V>,
    ) -> Result<()> {
        let (sep_key, sep_value) = {
            let page = parent.page.borrow();
            (page.key(parent.index)?, page.value(parent.index)?)
        };
        let source_size = source.borrow().size()?;
        if source_size == 0 {
            return Err(BaobabError::InvalidIndex { index: 0, size: 0 });
        }
        self.insert_place(target, 0)?;
        {
            let mut target_page = target.borrow_mut();
            target_page.set_key(0, &sep_key)?;
            target_page.set_value(0, &sep_value)?;
        }
        if !target.borrow().is_leaf() {
            let trailing = source.borrow().child(source_size)?;
            target.borrow_mut().set_child(0, trailing)?;
        }
        let (last_key, last_value) = {
            let page = source.borrow();
            (page.key(source_size - 1)?, page.value(source_size - 1)?)
        };
        {
            let mut parent_page = parent.page.borrow_mut();
            parent_page.set_key(parent.index, &last_key)?;
            parent_page.set_value(parent.index, &last_value)?;
        }
        source.borrow_mut().set_size(source_size - 1)?;
        debug!(
            source = source.borrow().id(),
            target = target.borrow().id(),
            "rotated right"
        );
        Ok(())
    }

    /// Moves one entry from `source` (the right sibling) through the parent
    /// separator onto the end of `target` (the left sibling).
    pub fn rotate_left(
        &self,
        parent: &Node<K, V>,
        source: &PageRef<K, V>,
        target: &PageRef<K, V>,
    ) -> Result<()> {
        let (sep_key, sep_value) = {
            let page = parent.page.borrow();
            (page.key(parent.index)?, page.value(parent.index)?)
        };
        let target_size = target.borrow().size()?;
        target.borrow_mut().set_size(target_size + 1)?;
        {
            let mut target_page = target.borrow_mut();
            target_page.set_key(target_size, &sep_key)?;
            target_page.set_value(target_size, &sep_value)?;
        }
        if !target.borrow().is_leaf() {
            let first = source.borrow().child(0)?;
            target.borrow_mut().set_child(target_size + 1, first)?;
        }
        let (first_key, first_value) = {
            let page = source.borrow();
            (page.key(0)?, page.value(0)?)
        };
        {
            let mut parent_page = parent.page.borrow_mut();
            parent_page.set_key(parent.index, &first_key)?;
            parent_page.set_value(parent.index, &first_value)?;
        }
        self.delete_place(source, 0)?;
        debug!(
            source = source.borrow().id(),
            target = target.borrow().id(),
            "rotated left"
        );
        Ok(())
    }

    // ---- descent ----

    fn root_page(&mut self) -> Result<PageRef<K, V>> {
        let root = self.pager.root();
        self.pager.load(root)
    }

    /// Binary search over the page's ordered keys: on a hit returns the
    /// matching index, otherwise the insertion point (which is also the
    /// child to descend into).
    fn search(page: &PageRef<K, V>, key: &K) -> Result<(usize, bool)> {
        let page = page.borrow();
        let mut lo = 0usize;
        let mut hi = page.size()?;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match page.key(mid)?.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Descends from the root to the page holding `key` (or the leaf where
    /// it belongs), recording the traversed (page, child-index) pairs.
    fn lookup(&mut self, key: &K, path: &mut Path<K, V>) -> Result<(Node<K, V>, bool)> {
        let mut page = self.root_page()?;
        loop {
            let (index, found) = Self::search(&page, key)?;
            if found {
                return Ok((Node::new(page, index), true));
            }
            if page.borrow().is_leaf() {
                return Ok((Node::new(page, index), false));
            }
            let child = page.borrow().child(index)?;
            path.push(Node::new(page, index));
            page = self.pager.load(child)?;
        }
    }

    // ---- rebalancing ----

    fn grow_root(&mut self, current: &PageRef<K, V>) -> Result<Node<K, V>> {
        let current_id = current.borrow().id();
        let root = self.pager.create_page(false)?;
        root.borrow_mut().set_child(0, current_id)?;
        let root_id = root.borrow().id();
        self.pager.set_root(root_id);
        debug!(root = root_id, child = current_id, "tree height grown");
        Ok(Node::new(root, 0))
    }

    fn shrink_root(&mut self, root: &PageRef<K, V>) -> Result<()> {
        let collapse = {
            let root = root.borrow();
            !root.is_leaf() && root.size()? == 0
        };
        if !collapse {
            return Ok(());
        }
        let child = root.borrow().child(0)?;
        if child == 0 {
            return Err(BaobabError::Corruption("empty root without a child"));
        }
        self.pager.set_root(child);
        self.pager.remove(root)?;
        debug!(root = child, "tree height shrunk");
        Ok(())
    }

    /// Creates a sibling of the same leaf-ness, moves the upper half of the
    /// entries (and children) into it, and promotes the middle entry into
    /// the parent as the separator, with the sibling as its right child.
    fn split(&mut self, page: &PageRef<K, V>, parent: &Node<K, V>) -> Result<()> {
        let (is_leaf, size, page_id) = {
            let page = page.borrow();
            (page.is_leaf(), page.size()?, page.id())
        };
        let mid = size / 2;
        let count = size - mid - 1;
        let sibling = self.pager.create_page(is_leaf)?;
        sibling.borrow_mut().set_size(count)?;
        for j in 0..count {
            let key = page.borrow().key(mid + 1 + j)?;
            let value = page.borrow().value(mid + 1 + j)?;
            let mut sibling_page = sibling.borrow_mut();
            sibling_page.set_key(j, &key)?;
            sibling_page.set_value(j, &value)?;
        }
        if !is_leaf {
            for j in 0..=count {
                let child = page.borrow().child(mid + 1 + j)?;
                sibling.borrow_mut().set_child(j, child)?;
            }
        }
        let mid_key = page.borrow().key(mid)?;
        let mid_value = page.borrow().value(mid)?;
        self.insert_place(&parent.page, parent.index)?;
        let sibling_id = sibling.borrow().id();
        {
            let mut parent_page = parent.page.borrow_mut();
            parent_page.set_key(parent.index, &mid_key)?;
            parent_page.set_value(parent.index, &mid_value)?;
            parent_page.set_child(parent.index + 1, sibling_id)?;
        }
        page.borrow_mut().set_size(mid)?;
        debug!(page = page_id, sibling = sibling_id, "page split");
        Ok(())
    }

    /// Refills `current` from a sibling that can spare an entry, or merges
    /// it with one. Returns whether a merge happened, in which case the
    /// parent may now be under-full itself.
    fn rebalance(&mut self, parent: &Node<K, V>, current: &PageRef<K, V>) -> Result<bool> {
        let index = parent.index;
        let parent_size = parent.page.borrow().size()?;
        let current_id = current.borrow().id();
        let left = if index > 0 {
            Some(self.sibling(&parent.page, index - 1, current_id)?)
        } else {
            None
        };
        if let Some(left) = &left {
            if left.borrow().can_borrow()? {
                self.rotate_right(&Node::new(Rc::clone(&parent.page), index - 1), left, current)?;
                return Ok(false);
            }
        }
        let right = if index < parent_size {
            Some(self.sibling(&parent.page, index + 1, current_id)?)
        } else {
            None
        };
        if let Some(right) = &right {
            if right.borrow().can_borrow()? {
                self.rotate_left(&Node::new(Rc::clone(&parent.page), index), right, current)?;
                return Ok(false);
            }
        }
        if let Some(left) = left {
            self.merge(&parent.page, index - 1, &left, current)?;
            return Ok(true);
        }
        if let Some(right) = right {
            self.merge(&parent.page, index, current, &right)?;
            return Ok(true);
        }
        // parent holds a single child and offers no sibling; the underflow
        // propagates and resolves at the parent's own level
        Ok(true)
    }

    fn sibling(
        &mut self,
        parent: &PageRef<K, V>,
        index: usize,
        current_id: u32,
    ) -> Result<PageRef<K, V>> {
        let id = parent.borrow().child(index)?;
        if id == current_id {
            return Err(BaobabError::Corruption("parent references child twice"));
        }
        self.pager.load(id)
    }

    /// Concatenates the separator and `right`'s entries onto `left`, drops
    /// the separator and `right`'s child pointer from the parent, and
    /// deletes `right`.
    fn merge(
        &mut self,
        parent: &PageRef<K, V>,
        sep_index: usize,
        left: &PageRef<K, V>,
        right: &PageRef<K, V>,
    ) -> Result<()> {
        let (sep_key, sep_value) = {
            let parent = parent.borrow();
            (parent.key(sep_index)?, parent.value(sep_index)?)
        };
        let left_size = left.borrow().size()?;
        let right_size = right.borrow().size()?;
        let is_leaf = left.borrow().is_leaf();
        {
            let mut dst = left.borrow_mut();
            dst.set_size(left_size + 1 + right_size)?;
            dst.set_key(left_size, &sep_key)?;
            dst.set_value(left_size, &sep_value)?;
        }
        for j in 0..right_size {
            let key = right.borrow().key(j)?;
            let value = right.borrow().value(j)?;
            let mut dst = left.borrow_mut();
            dst.set_key(left_size + 1 + j, &key)?;
            dst.set_value(left_size + 1 + j, &value)?;
        }
        if !is_leaf {
            for j in 0..=right_size {
                let child = right.borrow().child(j)?;
                left.borrow_mut().set_child(left_size + 1 + j, child)?;
            }
        }
        let left_id = left.borrow().id();
        let right_id = right.borrow().id();
        parent.borrow_mut().set_child(sep_index + 1, left_id)?;
        self.delete_place(parent, sep_index)?;
        self.pager.remove(right)?;
        debug!(left = left_id, right = right_id, "pages merged");
        Ok(())
    }
}

/// In-order iterator over an inclusive key interval.
///
/// Yields `Err` once and fuses if a page turns out to be unreadable
/// mid-traversal.
pub struct Range<'a, K, V, S> {
    tree: &'a mut BTree<K, V, S>,
    stack: Vec<Node<K, V>>,
    ascended: bool,
    to: Option<K>,
    done: bool,
}

impl<K: Codec + Ord, V: Codec, S: BlockStorage> Range<'_, K, V, S> {
    fn emit(&mut self, page: &PageRef<K, V>, index: usize) -> Option<Result<(K, V)>> {
        let key = match page.borrow().key(index) {
            Ok(key) => key,
            Err(err) => return self.fail(err),
        };
        if let Some(to) = &self.to {
            if &key > to {
                self.done = true;
                return None;
            }
        }
        let value = match page.borrow().value(index) {
            Ok(value) => value,
            Err(err) => return self.fail(err),
        };
        Some(Ok((key, value)))
    }

    fn fail(&mut self, err: BaobabError) -> Option<Result<(K, V)>> {
        self.done = true;
        Some(Err(err))
    }

    /// Pushes the leftmost descent of the subtree rooted at `id`.
    fn descend(&mut self, mut id: u32) -> Result<()> {
        loop {
            let page = self.tree.pager.load(id)?;
            let is_leaf = page.borrow().is_leaf();
            if is_leaf {
                self.stack.push(Node::new(page, 0));
                return Ok(());
            }
            let child = page.borrow().child(0)?;
            self.stack.push(Node::new(page, 0));
            id = child;
        }
    }
}

impl<K: Codec + Ord, V: Codec, S: BlockStorage> Iterator for Range<'_, K, V, S> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (page, index) = match self.stack.last() {
                Some(top) => (Rc::clone(&top.page), top.index),
                None => {
                    self.done = true;
                    return None;
                }
            };
            let size = match page.borrow().size() {
                Ok(size) => size,
                Err(err) => return self.fail(err),
            };
            if !self.ascended {
                // deepest frame: a leaf, scanned entry by entry
                if index < size {
                    if let Some(top) = self.stack.last_mut() {
                        top.index += 1;
                    }
                    return self.emit(&page, index);
                }
                self.stack.pop();
                self.ascended = true;
            } else {
                // back on an internal frame: its entry at `index` follows the
                // child subtree just finished
                if index < size {
                    if let Some(top) = self.stack.last_mut() {
                        top.index += 1;
                    }
                    let item = self.emit(&page, index);
                    if let Some(Ok(_)) = &item {
                        let child = match page.borrow().child(index + 1) {
                            Ok(child) => child,
                            Err(err) => return self.fail(err),
                        };
                        if let Err(err) = self.descend(child) {
                            return self.fail(err);
                        }
                        self.ascended = false;
                    }
                    return item;
                }
                self.stack.pop();
            }
        }
    }
}
