//! Simulated machine collaborators.
//!
//! These back the unit tests and any host-side harness: a page-aligned
//! [`Arena`] standing in for mapped kernel memory, break primitives for the
//! block allocator, and bookkeeping-only implementations of the frame,
//! address-space and backing-store contracts. None of them touch real page
//! tables.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc},
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::ptr::NonNull;

use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{PageTableFlags, PhysFrame},
};

use crate::{
    faults::{BackingStore, StoreError},
    memory::{
        block::{Sbrk, SbrkError},
        layout::PAGE_SIZE,
        paging::{AddressSpace, FrameProvider, MapError},
    },
    tasks::context::ContextId,
};

/// Page-aligned, zeroed buffer whose addresses serve as virtual addresses
/// for allocators that write real metadata into memory.
pub struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        Arena {
            ptr: NonNull::new(ptr).expect("arena allocation failed"),
            layout,
        }
    }

    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(self.ptr.as_ptr() as u64)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Break that never moves.
pub struct NoGrow;

impl Sbrk for NoGrow {
    fn sbrk(&mut self, delta_pages: isize) -> Result<VirtAddr, SbrkError> {
        let _ = delta_pages;
        Err(SbrkError::LimitReached)
    }
}

/// Break over a pre-mapped range: moves freely up to `limit`, no frames
/// involved.
pub struct FixedBreak {
    brk: VirtAddr,
    limit: VirtAddr,
}

impl FixedBreak {
    pub fn new(start: VirtAddr, limit: VirtAddr) -> Self {
        FixedBreak { brk: start, limit }
    }

    pub fn brk(&self) -> VirtAddr {
        self.brk
    }
}

impl Sbrk for FixedBreak {
    fn sbrk(&mut self, delta_pages: isize) -> Result<VirtAddr, SbrkError> {
        let old = self.brk;
        let delta = delta_pages * PAGE_SIZE as isize;
        let new = if delta >= 0 {
            old + delta as u64
        } else {
            old - delta.unsigned_abs() as u64
        };
        if new > self.limit {
            return Err(SbrkError::LimitReached);
        }
        self.brk = new;
        Ok(old)
    }
}

/// Bounded pool of fake physical frames.
pub struct SimFrameProvider {
    free: Vec<PhysFrame>,
}

/// Fake frames start above the first megabyte so frame 0 never appears.
const SIM_FRAME_BASE: u64 = 0x10_0000;

impl SimFrameProvider {
    pub fn new(count: usize) -> Self {
        let free = (0..count)
            .map(|i| {
                PhysFrame::containing_address(PhysAddr::new(
                    SIM_FRAME_BASE + (i * PAGE_SIZE) as u64,
                ))
            })
            .collect();
        SimFrameProvider { free }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl FrameProvider for SimFrameProvider {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.free.pop()
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        debug_assert!(!self.free.contains(&frame), "frame freed twice");
        self.free.push(frame);
    }
}

/// Bookkeeping-only address space.
///
/// Entries persist across `unmap` with presence and the frame stripped, so
/// software bits behave as they do in a real page table. Second-level
/// tables are tracked per 2 MiB region and created implicitly by `map`.
pub struct SimAddressSpace {
    entries: BTreeMap<VirtAddr, (Option<PhysFrame>, PageTableFlags)>,
    tables: BTreeSet<VirtAddr>,
    flushes: usize,
}

/// Virtual span one second-level table covers.
const TABLE_SPAN: u64 = 512 * PAGE_SIZE as u64;

impl SimAddressSpace {
    pub fn new() -> Self {
        SimAddressSpace {
            entries: BTreeMap::new(),
            tables: BTreeSet::new(),
            flushes: 0,
        }
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.values().filter(|(frame, _)| frame.is_some()).count()
    }

    fn table_base(va: VirtAddr) -> VirtAddr {
        VirtAddr::new(va.as_u64() & !(TABLE_SPAN - 1))
    }
}

impl Default for SimAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SimAddressSpace {
    fn has_table(&self, va: VirtAddr) -> bool {
        self.tables.contains(&Self::table_base(va))
    }

    fn create_table(
        &mut self,
        va: VirtAddr,
        frames: &mut dyn FrameProvider,
    ) -> Result<(), MapError> {
        let frame = frames
            .allocate_frame()
            .ok_or(MapError::TableAllocationFailed)?;
        let _ = frame;
        self.tables.insert(Self::table_base(va));
        Ok(())
    }

    fn map(
        &mut self,
        va: VirtAddr,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        self.tables.insert(Self::table_base(va));
        let entry = self
            .entries
            .entry(va)
            .or_insert((None, PageTableFlags::empty()));
        if entry.0.is_some() {
            return Err(MapError::AlreadyMapped);
        }
        entry.0 = Some(frame);
        entry.1 |= flags | PageTableFlags::PRESENT;
        Ok(())
    }

    fn unmap(&mut self, va: VirtAddr) -> Option<PhysFrame> {
        let entry = self.entries.get_mut(&va)?;
        let frame = entry.0.take()?;
        entry.1 &= !(PageTableFlags::PRESENT | PageTableFlags::DIRTY | PageTableFlags::ACCESSED);
        Some(frame)
    }

    fn frame_of(&self, va: VirtAddr) -> Option<PhysFrame> {
        self.entries.get(&va).and_then(|(frame, _)| *frame)
    }

    fn flags_of(&self, va: VirtAddr) -> Option<PageTableFlags> {
        if !self.has_table(va) {
            return None;
        }
        Some(
            self.entries
                .get(&va)
                .map(|(_, flags)| *flags)
                .unwrap_or(PageTableFlags::empty()),
        )
    }

    fn set_flags(&mut self, va: VirtAddr, set: PageTableFlags, clear: PageTableFlags) {
        self.tables.insert(Self::table_base(va));
        let entry = self
            .entries
            .entry(va)
            .or_insert((None, PageTableFlags::empty()));
        entry.1 |= set;
        entry.1 &= !clear;
    }

    fn flush_tlb(&mut self) {
        self.flushes += 1;
    }
}

/// Backing store keyed by context and page address.
///
/// `seed` marks pages as existing in the store; reads of missing pages fail
/// the way a real page file reports an absent page, and writes record the
/// page and make later reads succeed.
pub struct SimBackingStore {
    pages: BTreeSet<(ContextId, VirtAddr)>,
    writebacks: Vec<(ContextId, VirtAddr)>,
    fail_writes: bool,
}

impl SimBackingStore {
    pub fn new() -> Self {
        SimBackingStore {
            pages: BTreeSet::new(),
            writebacks: Vec::new(),
            fail_writes: false,
        }
    }

    pub fn seed(&mut self, ctx: ContextId, va: VirtAddr) {
        self.pages.insert((ctx, va));
    }

    /// Makes every subsequent write report a full store.
    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    pub fn writebacks(&self) -> &[(ContextId, VirtAddr)] {
        &self.writebacks
    }
}

impl Default for SimBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for SimBackingStore {
    fn read_page(&mut self, ctx: ContextId, va: VirtAddr) -> Result<(), StoreError> {
        if self.pages.contains(&(ctx, va)) {
            Ok(())
        } else {
            Err(StoreError::PageMissing)
        }
    }

    fn write_page(&mut self, ctx: ContextId, va: VirtAddr) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Full);
        }
        self.pages.insert((ctx, va));
        self.writebacks.push((ctx, va));
        Ok(())
    }
}
