//! Array-backed segment tree tracking page runs.
//!
//! The tree is complete and binary, stored implicitly: node 1 is the root,
//! node `n` has children `2n` and `2n + 1`, and the leaves occupy
//! `[capacity, 2 * capacity)` for a power-of-two capacity. Each node packs
//! `(value, allocated_flag)` into a `u32`: a leaf's value is the run length
//! if the page starts an allocation (pages inside a run hold 0 with the
//! flag set) or the free-run length if it starts a free run; an internal
//! node's value is the longest free run in its subtree.

use alloc::vec;
use alloc::vec::Vec;

const ALLOC_FLAG: u32 = 1 << 31;
const VAL_MASK: u32 = ALLOC_FLAG - 1;

/// Outcome of releasing a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The run was released; `pages` is its length before merging.
    Freed { pages: usize },
    /// The leaf was already free. Tolerated at this layer.
    AlreadyFree,
}

/// The page is not the first of an allocated run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotRunStart;

/// Segment tree over `page_count` pages, initially one free run.
#[derive(Debug)]
pub struct RunTree {
    nodes: Vec<u32>,
    /// Power-of-two leaf capacity; leaves past `page_count` stay at value 0
    /// so they are never chosen as a run start.
    capacity: usize,
    page_count: usize,
}

impl RunTree {
    pub fn new(page_count: usize) -> Self {
        assert!(page_count >= 2, "run tree needs at least two pages");
        // +2 guarantees a phantom leaf to the right of the last page, so the
        // merge probe at `node + count` always lands on a real node
        let capacity = (page_count + 2).next_power_of_two();
        let mut tree = RunTree {
            nodes: vec![0; 2 * capacity],
            capacity,
            page_count,
        };
        tree.update_node(tree.node_of(0), page_count as u32, false);
        tree
    }

    /// Longest free run currently available.
    pub fn max_free_run(&self) -> usize {
        self.value(1) as usize
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Claims the leftmost free run of at least `count` pages and returns
    /// its first page index.
    pub fn allocate_first_fit(&mut self, count: usize) -> Option<usize> {
        if count == 0 || self.max_free_run() < count {
            return None;
        }

        let (node, page_idx) = self.first_fit(count as u32);
        let free_pages = self.free_value(node) as usize;
        debug_assert!(free_pages >= count);

        self.update_node(node, count as u32, true);
        for i in 1..count {
            self.set_info(node + i, 0, true);
        }
        if free_pages > count {
            self.update_node(node + count, (free_pages - count) as u32, false);
        }

        Some(page_idx)
    }

    /// Releases the run starting at `page_idx`, merging with the following
    /// free run unconditionally and with a preceding free run when the
    /// immediately preceding leaf is free.
    ///
    /// `on_page` is invoked once per page of the run (in order) before the
    /// bookkeeping is rewritten, so the caller can unmap and release frames.
    pub fn free(
        &mut self,
        page_idx: usize,
        mut on_page: impl FnMut(usize),
    ) -> Result<FreeOutcome, NotRunStart> {
        let node = self.node_of(page_idx);

        if !self.is_allocated(node) {
            return Ok(FreeOutcome::AlreadyFree);
        }
        let mut count = self.value(node) as usize;
        if count == 0 {
            return Err(NotRunStart);
        }
        let released = count;

        for i in 0..count {
            on_page(page_idx + i);
            self.set_info(node + i, 0, false);
        }

        // the run to the right merges unconditionally
        if !self.is_allocated(node + count) {
            let after = self.free_value(node + count) as usize;
            self.update_node(node + count, 0, false);
            count += after;
        }

        if page_idx == 0 || self.is_allocated(node - 1) {
            self.update_node(node, count as u32, false);
        } else {
            // the left neighbor is free but mid-run; walk up until a node
            // with a value appears, then descend preferring the right
            // subtree to land on that run's start
            let mut levels = 0;
            let mut cur = node;
            while self.value(cur) == 0 {
                cur >>= 1;
                levels += 1;
            }
            while levels > 0 {
                if self.value(cur << 1 | 1) > 0 {
                    cur = cur << 1 | 1;
                } else {
                    cur <<= 1;
                }
                levels -= 1;
            }
            let merged = count as u32 + self.free_value(cur);
            self.update_node(cur, merged, false);
        }

        Ok(FreeOutcome::Freed { pages: released })
    }

    /// Length of the allocated run starting at `page_idx`, if any.
    pub fn run_len(&self, page_idx: usize) -> Option<usize> {
        let node = self.node_of(page_idx);
        (self.is_allocated(node) && self.value(node) > 0).then(|| self.value(node) as usize)
    }

    /// Resizes the run starting at `page_idx` in place.
    ///
    /// Shrinking releases the tail leaves (`on_release` per released page);
    /// growing claims pages from the following free run (`Err` when it is
    /// too short, leaving the tree unchanged). Returns the old run length.
    pub fn resize(
        &mut self,
        page_idx: usize,
        new_count: usize,
        mut on_release: impl FnMut(usize),
    ) -> Result<usize, ResizeError> {
        debug_assert!(new_count > 0);
        let node = self.node_of(page_idx);
        if !self.is_allocated(node) || self.value(node) == 0 {
            return Err(ResizeError::NotRunStart);
        }
        let old_count = self.value(node) as usize;
        if new_count == old_count {
            return Ok(old_count);
        }

        let next = node + old_count;
        let next_free = if self.is_allocated(next) {
            0
        } else {
            self.free_value(next) as usize
        };
        if old_count + next_free < new_count {
            return Err(ResizeError::NoRoom);
        }

        if next_free > 0 {
            self.update_node(next, 0, false);
        }

        if new_count < old_count {
            for i in new_count..old_count {
                on_release(page_idx + i);
                self.set_info(node + i, 0, false);
            }
        } else {
            for i in old_count..new_count {
                self.set_info(node + i, 0, true);
            }
        }

        self.set_info(node, new_count as u32, true);
        let leftover = old_count + next_free - new_count;
        if leftover > 0 {
            self.update_node(node + new_count, leftover as u32, false);
        }

        Ok(old_count)
    }

    //===========================
    // node accessors
    //===========================

    fn set_info(&mut self, node: usize, value: u32, allocated: bool) {
        debug_assert!(node >= 1 && node < 2 * self.capacity);
        debug_assert!(value <= VAL_MASK);
        self.nodes[node] = value | if allocated { ALLOC_FLAG } else { 0 };
    }

    fn is_allocated(&self, node: usize) -> bool {
        debug_assert!(node >= 1 && node < 2 * self.capacity);
        self.nodes[node] & ALLOC_FLAG != 0
    }

    /// Value usable as free-run length: 0 for allocated nodes.
    fn free_value(&self, node: usize) -> u32 {
        if self.is_allocated(node) {
            0
        } else {
            self.nodes[node]
        }
    }

    fn value(&self, node: usize) -> u32 {
        debug_assert!(node >= 1 && node < 2 * self.capacity);
        self.nodes[node] & VAL_MASK
    }

    /// Rewrites `node` and refreshes max free-run values up to the root.
    fn update_node(&mut self, node: usize, value: u32, allocated: bool) {
        self.set_info(node, value, allocated);
        let mut cur = node >> 1;
        while cur >= 1 {
            let best = self.free_value(cur << 1).max(self.free_value(cur << 1 | 1));
            self.set_info(cur, best, false);
            cur >>= 1;
        }
    }

    /// Leaf node index for `page_idx`.
    fn node_of(&self, page_idx: usize) -> usize {
        debug_assert!(page_idx < self.capacity);
        let mut cur = 1;
        let (mut l, mut r) = (0, self.capacity - 1);
        while l < r {
            let mid = (l + r) >> 1;
            if page_idx <= mid {
                r = mid;
                cur <<= 1;
            } else {
                l = mid + 1;
                cur = cur << 1 | 1;
            }
        }
        cur
    }

    /// Descends to the leftmost run of at least `count` free pages,
    /// returning `(leaf_node, page_idx)`. Callers must check the root first.
    fn first_fit(&self, count: u32) -> (usize, usize) {
        let mut cur = 1;
        let (mut l, mut r) = (0, self.capacity - 1);
        while l < r {
            let mid = (l + r) >> 1;
            if self.free_value(cur << 1) >= count {
                r = mid;
                cur <<= 1;
            } else {
                l = mid + 1;
                cur = cur << 1 | 1;
            }
        }
        (cur, l)
    }
}

/// Why an in-place resize failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeError {
    NotRunStart,
    /// The following free run is too short; caller should relocate.
    NoRoom,
}
