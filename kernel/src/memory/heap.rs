//! Kernel heap facade.
//!
//! One [`KernelHeap`] owns a block allocator for sub-page requests and a
//! page-run allocator for everything larger, split at
//! [`MAX_BLOCK_SIZE`]. Requests route by size on the way in and by address
//! against the hard limit on the way out. The block region grows in whole
//! pages by moving the segment break; the page region starts one guard page
//! past the hard limit and runs to the heap ceiling.

use spin::Mutex;
use x86_64::{VirtAddr, structures::paging::PageTableFlags};

use crate::{
    memory::{
        block::{BlockAllocator, PlacementPolicy, Sbrk, SbrkError, block_size, BLOCK_METADATA},
        layout::{HeapLayout, MAX_BLOCK_SIZE, PAGE_SIZE, round_up_pages},
        paging::{AddressSpace, FrameProvider, PageAllocator, ResizePagesError},
        raw,
    },
    trace,
};

/// Why the heap could not be brought up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapInitError {
    /// The initial block region does not fit under the hard limit.
    InitialExceedsLimit,
    /// Mapping the initial region failed; any partial mapping was undone.
    MappingFailed,
}

/// The kernel heap. Interior locking; all operations take `&self`.
pub struct KernelHeap {
    inner: Mutex<HeapInner>,
}

struct HeapInner {
    layout: HeapLayout,
    brk: VirtAddr,
    blocks: BlockAllocator,
    pages: PageAllocator,
}

impl KernelHeap {
    /// Maps the initial block region and seeds backs both allocators.
    pub fn init(
        layout: HeapLayout,
        initial_size: usize,
        policy: PlacementPolicy,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Result<Self, HeapInitError> {
        let brk = layout.start + initial_size as u64;
        if brk > layout.hard_limit {
            return Err(HeapInitError::InitialExceedsLimit);
        }
        map_range(layout.start, brk, frames, space)?;

        let blocks = unsafe { BlockAllocator::init(layout.start, initial_size, policy) };
        let pages = PageAllocator::new(layout.page_allocator_start(), layout.page_allocator_pages());
        trace!(
            "heap: {} bytes of block region at {:p}, {} pages at {:p}",
            initial_size,
            layout.start,
            layout.page_allocator_pages(),
            layout.page_allocator_start()
        );
        Ok(KernelHeap {
            inner: Mutex::new(HeapInner {
                layout,
                brk,
                blocks,
                pages,
            }),
        })
    }

    /// Allocates `size` bytes: small requests from the block allocator
    /// (growing the break on demand), larger ones as a mapped page run.
    /// Returns `None` when the request cannot be satisfied.
    pub fn allocate(
        &self,
        size: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Option<VirtAddr> {
        self.inner.lock().allocate(size, frames, space)
    }

    /// Releases the allocation at `va`.
    ///
    /// # Panics
    ///
    /// When `va` is not an allocation this heap handed out: a bad free is
    /// heap corruption, not a recoverable condition.
    pub fn free(
        &self,
        va: VirtAddr,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) {
        self.inner.lock().free(va, frames, space)
    }

    /// Resizes the allocation at `va` to `new_size` bytes, in place when
    /// possible, otherwise by relocating (the old address is then invalid).
    /// `None` address allocates; zero size frees. On failure returns `None`
    /// and the old allocation stays valid.
    pub fn reallocate(
        &self,
        va: Option<VirtAddr>,
        new_size: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Option<VirtAddr> {
        self.inner.lock().reallocate(va, new_size, frames, space)
    }

    /// Moves the segment break by `delta_pages` whole pages, mapping or
    /// unmapping frames; `0` reports the current break. The break never
    /// crosses the hard limit upward or the region start downward.
    pub fn sbrk(
        &self,
        delta_pages: isize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Result<VirtAddr, SbrkError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        BreakGrowth {
            brk: &mut inner.brk,
            floor: inner.layout.start,
            limit: inner.layout.hard_limit,
            frames,
            space,
        }
        .sbrk(delta_pages)
    }

    /// Free-list snapshot of the block region, for diagnostics.
    pub fn free_blocks(&self) -> alloc::vec::Vec<(VirtAddr, usize)> {
        self.inner.lock().blocks.free_blocks()
    }
}

impl HeapInner {
    fn allocate(
        &mut self,
        size: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        if size <= MAX_BLOCK_SIZE {
            let mut growth = BreakGrowth {
                brk: &mut self.brk,
                floor: self.layout.start,
                limit: self.layout.hard_limit,
                frames,
                space,
            };
            return self.blocks.allocate(size, &mut growth);
        }
        self.pages
            .allocate_pages(round_up_pages(size), frames, space)
            .ok()
    }

    fn free(
        &mut self,
        va: VirtAddr,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) {
        if va <= self.layout.hard_limit {
            self.blocks.free(va);
        } else if !self.pages.contains(va)
            || self.pages.free_pages(va, frames, space).is_err()
        {
            panic!("trying to free {va:p}, which is not allocated");
        }
    }

    fn reallocate(
        &mut self,
        va: Option<VirtAddr>,
        new_size: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Option<VirtAddr> {
        let va = match va {
            Some(va) => va,
            None => return self.allocate(new_size, frames, space),
        };

        if va <= self.layout.hard_limit && new_size <= MAX_BLOCK_SIZE {
            let mut growth = BreakGrowth {
                brk: &mut self.brk,
                floor: self.layout.start,
                limit: self.layout.hard_limit,
                frames,
                space,
            };
            return self.blocks.reallocate(Some(va), new_size, &mut growth);
        }

        if new_size == 0 {
            self.free(va, frames, space);
            return None;
        }

        if va <= self.layout.hard_limit {
            // block region -> page run
            let payload = block_size(va) - BLOCK_METADATA;
            return self.relocate(va, payload.min(new_size), new_size, frames, space);
        }

        if !self.pages.contains(va) {
            return None;
        }

        if new_size <= MAX_BLOCK_SIZE {
            // page run -> block region
            return self.relocate(va, new_size, new_size, frames, space);
        }

        let run_pages = self.pages.run_len(va)?;
        match self
            .pages
            .resize_pages(va, round_up_pages(new_size), frames, space)
        {
            Ok(()) => Some(va),
            Err(ResizePagesError::NoRoom) => {
                let old_bytes = run_pages * PAGE_SIZE;
                self.relocate(va, old_bytes.min(new_size), new_size, frames, space)
            }
            Err(ResizePagesError::NotRunStart) | Err(ResizePagesError::MappingFailed) => None,
        }
    }

    /// Allocate-copy-free across regions. The old allocation survives a
    /// failed allocation of the new one.
    fn relocate(
        &mut self,
        old: VirtAddr,
        copy: usize,
        new_size: usize,
        frames: &mut impl FrameProvider,
        space: &mut impl AddressSpace,
    ) -> Option<VirtAddr> {
        let new = self.allocate(new_size, frames, space)?;
        unsafe { raw::copy_bytes(new, old, copy) };
        self.free(old, frames, space);
        Some(new)
    }
}

/// Break mover shared by direct `sbrk` calls and block-allocator growth.
struct BreakGrowth<'a, F: FrameProvider, S: AddressSpace> {
    brk: &'a mut VirtAddr,
    floor: VirtAddr,
    limit: VirtAddr,
    frames: &'a mut F,
    space: &'a mut S,
}

impl<F: FrameProvider, S: AddressSpace> Sbrk for BreakGrowth<'_, F, S> {
    fn sbrk(&mut self, delta_pages: isize) -> Result<VirtAddr, SbrkError> {
        let old = *self.brk;
        if delta_pages == 0 {
            return Ok(old);
        }
        if delta_pages > 0 {
            let new = old + (delta_pages as usize * PAGE_SIZE) as u64;
            if new > self.limit {
                return Err(SbrkError::LimitReached);
            }
            map_range(old, new, self.frames, self.space)
                .map_err(|_| SbrkError::OutOfFrames)?;
            *self.brk = new;
        } else {
            let shrink = (delta_pages.unsigned_abs() * PAGE_SIZE) as u64;
            if old - self.floor < shrink {
                return Err(SbrkError::LimitReached);
            }
            let new = old - shrink;
            let mut page = new;
            while page < old {
                if let Some(frame) = self.space.unmap(page) {
                    self.frames.free_frame(frame);
                }
                page += PAGE_SIZE as u64;
            }
            self.space.flush_tlb();
            *self.brk = new;
        }
        Ok(old)
    }
}

/// Maps `[from, to)` present and writable, unwinding on failure.
fn map_range(
    from: VirtAddr,
    to: VirtAddr,
    frames: &mut impl FrameProvider,
    space: &mut impl AddressSpace,
) -> Result<(), HeapInitError> {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let mut page = from;
    while page < to {
        let mapped = frames
            .allocate_frame()
            .and_then(|frame| match space.map(page, frame, flags) {
                Ok(()) => Some(()),
                Err(_) => {
                    frames.free_frame(frame);
                    None
                }
            });
        if mapped.is_none() {
            let mut undo = from;
            while undo < page {
                if let Some(frame) = space.unmap(undo) {
                    frames.free_frame(frame);
                }
                undo += PAGE_SIZE as u64;
            }
            return Err(HeapInitError::MappingFailed);
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Arena, SimAddressSpace, SimFrameProvider};

    /// Layout carved out of one arena so every address the facade hands out
    /// is real, mappable-by-simulation memory: 4 pages of block region
    /// capacity, a guard page, then an 8-page page-allocator range.
    fn setup() -> (Arena, KernelHeap, SimFrameProvider, SimAddressSpace) {
        let arena = Arena::new(16 * PAGE_SIZE);
        let layout = HeapLayout {
            start: arena.base(),
            hard_limit: arena.base() + (4 * PAGE_SIZE) as u64,
            heap_max: arena.base() + (13 * PAGE_SIZE) as u64,
        };
        let mut frames = SimFrameProvider::new(64);
        let mut space = SimAddressSpace::new();
        let heap = KernelHeap::init(
            layout,
            2 * PAGE_SIZE,
            PlacementPolicy::FirstFit,
            &mut frames,
            &mut space,
        )
        .unwrap();
        (arena, heap, frames, space)
    }

    #[test]
    fn init_maps_the_initial_region() {
        let (arena, _heap, frames, space) = setup();
        assert_eq!(space.mapped_pages(), 2);
        assert!(space.frame_of(arena.base()).is_some());
        assert_eq!(frames.available(), 62);
    }

    #[test]
    fn init_rejects_initial_size_past_the_hard_limit() {
        let arena = Arena::new(16 * PAGE_SIZE);
        let layout = HeapLayout {
            start: arena.base(),
            hard_limit: arena.base() + (4 * PAGE_SIZE) as u64,
            heap_max: arena.base() + (13 * PAGE_SIZE) as u64,
        };
        let mut frames = SimFrameProvider::new(64);
        let mut space = SimAddressSpace::new();
        let err = KernelHeap::init(
            layout,
            5 * PAGE_SIZE,
            PlacementPolicy::FirstFit,
            &mut frames,
            &mut space,
        );
        assert!(matches!(err, Err(HeapInitError::InitialExceedsLimit)));
    }

    #[test]
    fn small_and_large_requests_route_to_different_regions() {
        let (arena, heap, mut frames, mut space) = setup();
        let small = heap.allocate(128, &mut frames, &mut space).unwrap();
        let large = heap
            .allocate(3 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        let hard_limit = arena.base() + (4 * PAGE_SIZE) as u64;
        assert!(small < hard_limit);
        assert!(large > hard_limit);
        // the large allocation is frame-backed page by page
        for i in 0..3 {
            assert!(space.frame_of(large + (i * PAGE_SIZE) as u64).is_some());
        }
    }

    #[test]
    fn boundary_request_sizes_route_by_max_block_size() {
        let (arena, heap, mut frames, mut space) = setup();
        let hard_limit = arena.base() + (4 * PAGE_SIZE) as u64;
        let at_limit = heap
            .allocate(MAX_BLOCK_SIZE, &mut frames, &mut space)
            .unwrap();
        let over_limit = heap
            .allocate(MAX_BLOCK_SIZE + 1, &mut frames, &mut space)
            .unwrap();
        assert!(at_limit < hard_limit);
        assert!(over_limit > hard_limit);
    }

    #[test]
    fn block_region_grows_through_the_break() {
        let (_arena, heap, mut frames, mut space) = setup();
        // initial 2 pages minus metadata cannot hold four 2 KiB blocks
        let mut got = alloc::vec::Vec::new();
        for _ in 0..4 {
            got.push(heap.allocate(2048, &mut frames, &mut space).unwrap());
        }
        assert!(space.mapped_pages() > 2);
        assert_eq!(heap.sbrk(0, &mut frames, &mut space).unwrap().as_u64() % PAGE_SIZE as u64, 0);
        let _ = got;
    }

    #[test]
    fn growth_stops_at_the_hard_limit() {
        let (arena, heap, mut frames, mut space) = setup();
        // the block region can never exceed 4 pages; request beyond that
        let mut count = 0;
        while heap.allocate(2048, &mut frames, &mut space).is_some() {
            count += 1;
            assert!(count < 64, "block region grew past the hard limit");
        }
        let brk = heap.sbrk(0, &mut frames, &mut space).unwrap();
        assert!(brk <= arena.base() + (4 * PAGE_SIZE) as u64);
    }

    #[test]
    fn free_routes_by_address() {
        let (_arena, heap, mut frames, mut space) = setup();
        let small = heap.allocate(128, &mut frames, &mut space).unwrap();
        let large = heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space).unwrap();
        let free_before = frames.available();
        heap.free(large, &mut frames, &mut space);
        assert_eq!(frames.available(), free_before + 2);
        heap.free(small, &mut frames, &mut space);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn freeing_an_interior_run_page_is_fatal() {
        let (_arena, heap, mut frames, mut space) = setup();
        let run = heap.allocate(3 * PAGE_SIZE, &mut frames, &mut space).unwrap();
        heap.free(run + PAGE_SIZE as u64, &mut frames, &mut space);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn freeing_an_unaligned_page_address_is_fatal() {
        let (_arena, heap, mut frames, mut space) = setup();
        let run = heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space).unwrap();
        heap.free(run + 8u64, &mut frames, &mut space);
    }

    #[test]
    fn reallocate_moves_data_across_the_region_boundary() {
        let (_arena, heap, mut frames, mut space) = setup();
        let small = heap.allocate(64, &mut frames, &mut space).unwrap();
        unsafe {
            raw::write_word(small, 0xfeed);
            raw::write_word(small + 8u64, 0xbead);
        }

        // block -> page run
        let big = heap
            .reallocate(Some(small), 3 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        assert_ne!(big, small);
        assert_eq!(unsafe { raw::read_word(big) }, 0xfeed);
        assert_eq!(unsafe { raw::read_word(big + 8u64) }, 0xbead);

        // page run -> block
        let back = heap
            .reallocate(Some(big), 64, &mut frames, &mut space)
            .unwrap();
        assert_ne!(back, big);
        assert_eq!(unsafe { raw::read_word(back) }, 0xfeed);
    }

    #[test]
    fn page_run_resizes_in_place_when_the_next_run_is_free() {
        let (_arena, heap, mut frames, mut space) = setup();
        let run = heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space).unwrap();
        let grown = heap
            .reallocate(Some(run), 5 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        assert_eq!(grown, run);
        let shrunk = heap
            .reallocate(Some(run), 3 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        assert_eq!(shrunk, run);
        assert!(space.frame_of(run + (4 * PAGE_SIZE) as u64).is_none());
    }

    #[test]
    fn page_run_relocates_when_blocked_by_a_neighbor() {
        let (_arena, heap, mut frames, mut space) = setup();
        let a = heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space).unwrap();
        let _b = heap.allocate(PAGE_SIZE, &mut frames, &mut space).unwrap();
        unsafe { raw::write_word(a, 0xcafe) };
        let moved = heap
            .reallocate(Some(a), 4 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        assert_ne!(moved, a);
        assert_eq!(unsafe { raw::read_word(moved) }, 0xcafe);
    }

    #[test]
    fn reallocate_null_allocates_and_zero_size_frees() {
        let (_arena, heap, mut frames, mut space) = setup();
        let va = heap
            .reallocate(None, 3 * PAGE_SIZE, &mut frames, &mut space)
            .unwrap();
        let free_before = frames.available();
        assert!(heap.reallocate(Some(va), 0, &mut frames, &mut space).is_none());
        assert_eq!(frames.available(), free_before + 3);
    }

    #[test]
    fn sbrk_reports_grows_and_shrinks() {
        let (arena, heap, mut frames, mut space) = setup();
        let brk0 = heap.sbrk(0, &mut frames, &mut space).unwrap();
        assert_eq!(brk0, arena.base() + (2 * PAGE_SIZE) as u64);

        let old = heap.sbrk(1, &mut frames, &mut space).unwrap();
        assert_eq!(old, brk0);
        assert!(space.frame_of(brk0).is_some());

        let old = heap.sbrk(-1, &mut frames, &mut space).unwrap();
        assert_eq!(old, brk0 + PAGE_SIZE as u64);
        assert!(space.frame_of(brk0).is_none());

        // growth past the hard limit is refused with the break unchanged
        assert_eq!(
            heap.sbrk(3, &mut frames, &mut space),
            Err(SbrkError::LimitReached)
        );
        assert_eq!(heap.sbrk(0, &mut frames, &mut space).unwrap(), brk0);
    }
}
