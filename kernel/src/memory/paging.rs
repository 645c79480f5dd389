//! Page-granular allocation: collaborator contracts and the page allocator.
//!
//! The allocator owns a [`RunTree`] over a virtual range and drives the
//! frame-provider / address-space collaborators when runs are claimed or
//! released. It never leaves a partially mapped run behind: a mapping
//! failure mid-run unwinds every frame mapped for that call and restores
//! the tree before reporting failure.

use x86_64::{
    VirtAddr,
    structures::paging::{PageTableFlags, PhysFrame},
};

use crate::{
    memory::{
        layout::PAGE_SIZE,
        tree::{FreeOutcome, NotRunStart, RunTree},
    },
    trace,
};

/// Software page-table bit marking a user-heap page as belonging to an
/// active allocation, independent of presence.
pub const MARKED: PageTableFlags = PageTableFlags::BIT_9;

/// Supplies and reclaims physical frames.
pub trait FrameProvider {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
    fn free_frame(&mut self, frame: PhysFrame);
}

/// One context's page-table view, including the translation cache.
///
/// `unmap` clears presence and the frame but must preserve software bits
/// (the [`MARKED`] bit survives eviction). `flags_of` returns `None` only
/// when no second-level table covers `va`.
pub trait AddressSpace {
    /// Whether a second-level table covers `va`.
    fn has_table(&self, va: VirtAddr) -> bool;
    /// Installs a second-level table covering `va`.
    fn create_table(&mut self, va: VirtAddr, frames: &mut dyn FrameProvider)
        -> Result<(), MapError>;
    fn map(&mut self, va: VirtAddr, frame: PhysFrame, flags: PageTableFlags)
        -> Result<(), MapError>;
    fn unmap(&mut self, va: VirtAddr) -> Option<PhysFrame>;
    fn frame_of(&self, va: VirtAddr) -> Option<PhysFrame>;
    fn flags_of(&self, va: VirtAddr) -> Option<PageTableFlags>;
    /// Sets then clears the given bits on the entry for `va`.
    fn set_flags(&mut self, va: VirtAddr, set: PageTableFlags, clear: PageTableFlags);
    /// Invalidates stale translation-cache entries.
    fn flush_tlb(&mut self);
}

/// Why a mapping could not be installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    TableAllocationFailed,
}

/// Why a run could not be allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageAllocError {
    /// No free run is long enough.
    Unavailable,
    /// Frame allocation or mapping failed mid-run; everything was rolled
    /// back.
    MappingFailed,
}

/// First-fit page-run allocator over `[start, start + pages * PAGE_SIZE)`.
#[derive(Debug)]
pub struct PageAllocator {
    start: VirtAddr,
    tree: RunTree,
}

impl PageAllocator {
    pub fn new(start: VirtAddr, page_count: usize) -> Self {
        debug_assert!(start.is_aligned(PAGE_SIZE as u64));
        PageAllocator {
            start,
            tree: RunTree::new(page_count),
        }
    }

    /// Whether `va` is a page-aligned address inside the managed range.
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start
            && va < self.start + (self.tree.page_count() * PAGE_SIZE) as u64
            && va.is_aligned(PAGE_SIZE as u64)
    }

    /// Longest free run currently available, in pages.
    pub fn max_free_run(&self) -> usize {
        self.tree.max_free_run()
    }

    /// Length in pages of the allocated run starting at `va`, if any.
    pub fn run_len(&self, va: VirtAddr) -> Option<usize> {
        self.tree.run_len(self.page_index(va))
    }

    /// Claims the leftmost free run of `count` pages and maps a fresh frame
    /// for each, writable and present.
    pub fn allocate_pages(
        &mut self,
        count: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Result<VirtAddr, PageAllocError> {
        let page_idx = self
            .tree
            .allocate_first_fit(count)
            .ok_or(PageAllocError::Unavailable)?;
        let va = self.page_address(page_idx);

        for i in 0..count {
            let page_va = va + (i * PAGE_SIZE) as u64;
            let mapped = frames
                .allocate_frame()
                .and_then(|frame| match space.map(page_va, frame, run_flags()) {
                    Ok(()) => Some(()),
                    Err(_) => {
                        frames.free_frame(frame);
                        None
                    }
                });
            if mapped.is_none() {
                self.unwind(va, i, frames, space);
                let _ = self.tree.free(page_idx, |_| ());
                space.flush_tlb();
                return Err(PageAllocError::MappingFailed);
            }
        }

        trace!("page allocator: mapped {} pages at {:p}", count, va);
        Ok(va)
    }

    /// Releases the run starting at `va`, unmapping and freeing the frame
    /// of every page. Releasing an already-free page is tolerated here;
    /// callers above may still treat it as fatal.
    pub fn free_pages(
        &mut self,
        va: VirtAddr,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Result<FreeOutcome, NotRunStart> {
        let start = self.start;
        let outcome = self
            .tree
            .free(self.page_index(va), |page_idx| {
                let page_va = start + (page_idx * PAGE_SIZE) as u64;
                if let Some(frame) = space.unmap(page_va) {
                    frames.free_frame(frame);
                }
            })
            .map_err(|_| NotRunStart)?;
        space.flush_tlb();
        Ok(outcome)
    }

    /// Resizes the run starting at `va` in place: a shorter run unmaps and
    /// frees the tail, a longer one claims the following free run and maps
    /// frames for the new tail (rolled back entirely on mapping failure).
    ///
    /// `Err(NoRoom)` means the caller should relocate instead.
    pub fn resize_pages(
        &mut self,
        va: VirtAddr,
        new_count: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Result<(), ResizePagesError> {
        use crate::memory::tree::ResizeError;

        let start = self.start;
        let old_count = self
            .tree
            .resize(self.page_index(va), new_count, |page_idx| {
                let page_va = start + (page_idx * PAGE_SIZE) as u64;
                if let Some(frame) = space.unmap(page_va) {
                    frames.free_frame(frame);
                }
            })
            .map_err(|err| match err {
                ResizeError::NotRunStart => ResizePagesError::NotRunStart,
                ResizeError::NoRoom => ResizePagesError::NoRoom,
            })?;

        for i in old_count..new_count {
            let page_va = va + (i * PAGE_SIZE) as u64;
            let mapped = frames
                .allocate_frame()
                .and_then(|frame| match space.map(page_va, frame, run_flags()) {
                    Ok(()) => Some(()),
                    Err(_) => {
                        frames.free_frame(frame);
                        None
                    }
                });
            if mapped.is_none() {
                // unwind the new tail and give the claimed pages back
                self.unwind(va + (old_count * PAGE_SIZE) as u64, i - old_count, frames, space);
                let _ = self.tree.resize(self.page_index(va), old_count, |_| ());
                space.flush_tlb();
                return Err(ResizePagesError::MappingFailed);
            }
        }

        space.flush_tlb();
        Ok(())
    }

    fn unwind(
        &mut self,
        va: VirtAddr,
        mapped: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) {
        for i in 0..mapped {
            let page_va = va + (i * PAGE_SIZE) as u64;
            if let Some(frame) = space.unmap(page_va) {
                frames.free_frame(frame);
            }
        }
    }

    fn page_index(&self, va: VirtAddr) -> usize {
        debug_assert!(self.contains(va), "address {va:p} outside page allocator");
        ((va - self.start) / PAGE_SIZE as u64) as usize
    }

    fn page_address(&self, page_idx: usize) -> VirtAddr {
        self.start + (page_idx * PAGE_SIZE) as u64
    }
}

/// Why an in-place run resize failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizePagesError {
    NotRunStart,
    NoRoom,
    MappingFailed,
}

fn run_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}
