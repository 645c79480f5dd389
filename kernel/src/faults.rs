//! Page-fault handling and working-set replacement.
//!
//! Faults are classified in order:
//! - a fault storm (the same address from the same context, three times in a
//!   row) is fatal
//! - kernel faults at or above the heap ceiling and user faults in the
//!   stack-underflow gap are fatal
//! - a missing second-level table is installed and the fault resolved
//! - user access violations (beyond the user ceiling, unmarked heap page,
//!   write to a read-only page) terminate the context
//! - a fault on a present page is an access-rights violation and fatal
//! - otherwise the page is brought in: placement while the working set has
//!   room, N-chance clock replacement once it is full
//!
//! The clock gives used pages a fresh chance, lets sweep counters grow by a
//! per-pass increment, and evicts once a counter reaches the threshold. A
//! negative configured sweep limit grants modified pages one extra sweep.
//! Pass one records the minimum remaining distance to the threshold and
//! pass two uses it as the increment, so the second pass is guaranteed to
//! evict.

use core::ops::Range;

use x86_64::{VirtAddr, structures::paging::PageTableFlags};

use crate::{
    memory::{
        layout::{
            KERNEL_HEAP_MAX, USER_HEAP_MAX, USER_HEAP_START, USER_LIMIT, USER_STACK_BOTTOM,
            USER_STACK_TOP, page_base,
        },
        paging::{AddressSpace, FrameProvider, MARKED},
    },
    tasks::context::{ContextId, ExecutionContext},
    trace, warn,
};

/// Swap-space collaborator. Page contents move between frames and the store
/// by page address, keyed per context.
pub trait BackingStore {
    /// Brings the page at `va` into its (already mapped) frame.
    fn read_page(&mut self, ctx: ContextId, va: VirtAddr) -> Result<(), StoreError>;
    /// Writes the page at `va` out to the store, creating it if absent.
    fn write_page(&mut self, ctx: ContextId, va: VirtAddr) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The store has no copy of the page.
    PageMissing,
    /// The store is out of space.
    Full,
}

/// Why a context was terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationCause {
    /// No second-level table covers the address and none could be made.
    NoPageTable,
    /// The address is at or beyond the user ceiling.
    BeyondUserLimit,
    /// A user-heap page was touched without being marked as allocated.
    UnmarkedHeapPage,
    /// Write to a present read-only page.
    WriteToReadOnly,
    /// The page is in neither the user heap nor the user stack and the
    /// store has no copy of it.
    OutsideHeapAndStack,
}

/// How a fault was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A second-level table was installed.
    TableInstalled,
    /// The page was brought in with room to spare in the working set.
    Placed,
    /// A victim was evicted to make room.
    Replaced,
    /// The faulting context must be killed.
    Terminated(TerminationCause),
}

/// Address ranges and the replacement threshold.
///
/// `max_sweeps >= 0` is the plain threshold; a negative value means
/// `|max_sweeps|` with one extra sweep of grace for modified pages.
#[derive(Clone, Debug)]
pub struct FaultConfig {
    pub user_limit: VirtAddr,
    pub user_heap: Range<VirtAddr>,
    pub user_stack: Range<VirtAddr>,
    pub kernel_heap_max: VirtAddr,
    pub max_sweeps: i32,
}

impl FaultConfig {
    /// Standard layout from [`crate::memory::layout`], with the given sweep
    /// limit.
    pub fn standard(max_sweeps: i32) -> Self {
        FaultConfig {
            user_limit: VirtAddr::new(USER_LIMIT),
            user_heap: VirtAddr::new(USER_HEAP_START)..VirtAddr::new(USER_HEAP_MAX),
            user_stack: VirtAddr::new(USER_STACK_BOTTOM)..VirtAddr::new(USER_STACK_TOP),
            kernel_heap_max: VirtAddr::new(KERNEL_HEAP_MAX),
            max_sweeps,
        }
    }
}

/// Fault-storm detector: panics when the same address from the same context
/// faults three times in a row without another fault in between.
#[derive(Debug, Default)]
struct RepeatGuard {
    last: Option<(VirtAddr, ContextId)>,
    before_last: Option<VirtAddr>,
    repeats: u8,
}

impl RepeatGuard {
    fn observe(&mut self, va: VirtAddr, ctx: ContextId) {
        if self.last == Some((va, ctx)) {
            self.repeats += 1;
            if self.repeats == 3 {
                panic!(
                    "failed to handle fault: previous fault at {:?} causes {va:p} to fault 3 successive times",
                    self.before_last
                );
            }
        } else {
            self.before_last = self.last.map(|(last_va, _)| last_va);
            self.repeats = 0;
        }
        self.last = Some((va, ctx));
    }
}

/// The page-fault handler.
pub struct FaultHandler {
    config: FaultConfig,
    guard: spin::Mutex<RepeatGuard>,
}

impl FaultHandler {
    pub fn new(config: FaultConfig) -> Self {
        FaultHandler {
            config,
            guard: spin::Mutex::new(RepeatGuard::default()),
        }
    }

    /// Handles a fault at `fault_va` taken by `ctx`. `user` distinguishes a
    /// user-mode access from a kernel one.
    ///
    /// # Panics
    ///
    /// On fault storms, kernel heap overflow, user stack underflow and
    /// faults on present writable pages (access-rights violations): these
    /// indicate kernel bugs, not recoverable conditions.
    pub fn handle(
        &self,
        ctx: &mut ExecutionContext,
        fault_va: VirtAddr,
        user: bool,
        space: &mut impl AddressSpace,
        frames: &mut impl FrameProvider,
        store: &mut impl BackingStore,
    ) -> FaultOutcome {
        self.guard.lock().observe(fault_va, ctx.id);

        if !user {
            if fault_va >= self.config.kernel_heap_max {
                panic!("kernel: heap overflow exception at {fault_va:p}");
            }
        } else if fault_va >= self.config.user_stack.end && fault_va < self.config.user_limit {
            panic!("user: stack underflow exception at {fault_va:p}");
        }

        let page_va = page_base(fault_va);

        if !space.has_table(fault_va) {
            ctx.table_faults += 1;
            if space.create_table(fault_va, frames).is_err() {
                warn!("fault: no frame for a page table covering {fault_va:p}");
                return FaultOutcome::Terminated(TerminationCause::NoPageTable);
            }
            trace!("fault: installed table for {fault_va:p}");
            space.flush_tlb();
            return FaultOutcome::TableInstalled;
        }

        let flags = match space.flags_of(fault_va) {
            Some(flags) => flags,
            None => {
                warn!("fault: {fault_va:p} has no page table");
                return FaultOutcome::Terminated(TerminationCause::NoPageTable);
            }
        };

        if user {
            if let Some(cause) = self.check_user_access(fault_va, flags) {
                warn!("fault: terminating context {:?}: {cause:?} at {fault_va:p}", ctx.id);
                return FaultOutcome::Terminated(cause);
            }
        }

        if flags.contains(PageTableFlags::PRESENT) {
            panic!("page {fault_va:p} is present: fault due to access-rights violation");
        }

        ctx.page_faults += 1;

        let outcome = if ctx.working_set.len() < ctx.working_set.capacity() {
            self.place(ctx, page_va, space, frames, store)
        } else {
            self.replace(ctx, page_va, space, frames, store)
        };
        match outcome {
            Ok(resolution) => {
                space.flush_tlb();
                resolution
            }
            Err(cause) => {
                warn!("fault: terminating context {:?}: {cause:?} at {fault_va:p}", ctx.id);
                FaultOutcome::Terminated(cause)
            }
        }
    }

    fn check_user_access(&self, va: VirtAddr, flags: PageTableFlags) -> Option<TerminationCause> {
        if va >= self.config.user_limit {
            return Some(TerminationCause::BeyondUserLimit);
        }
        if !flags.contains(MARKED) && self.config.user_heap.contains(&va) {
            return Some(TerminationCause::UnmarkedHeapPage);
        }
        if flags.contains(PageTableFlags::PRESENT) && !flags.contains(PageTableFlags::WRITABLE) {
            return Some(TerminationCause::WriteToReadOnly);
        }
        None
    }

    /// Brings `page_va` in while the working set has room. Reaching
    /// capacity arms the clock at the oldest element.
    fn place(
        &self,
        ctx: &mut ExecutionContext,
        page_va: VirtAddr,
        space: &mut impl AddressSpace,
        frames: &mut impl FrameProvider,
        store: &mut impl BackingStore,
    ) -> Result<FaultOutcome, TerminationCause> {
        if store.read_page(ctx.id, page_va) == Err(StoreError::PageMissing)
            && !self.is_legitimate(page_va)
        {
            return Err(TerminationCause::OutsideHeapAndStack);
        }

        self.map_in(ctx, page_va, space, frames);
        ctx.working_set.push(page_va);
        if ctx.working_set.is_full() {
            ctx.working_set.arm_cursor();
        } else {
            ctx.working_set.set_cursor(None);
        }
        trace!(
            "fault: placed {page_va:p}, working set {}/{}",
            ctx.working_set.len(),
            ctx.working_set.capacity()
        );
        Ok(FaultOutcome::Placed)
    }

    /// N-chance clock over the full working set, at most two passes.
    fn replace(
        &self,
        ctx: &mut ExecutionContext,
        page_va: VirtAddr,
        space: &mut impl AddressSpace,
        frames: &mut impl FrameProvider,
        store: &mut impl BackingStore,
    ) -> Result<FaultOutcome, TerminationCause> {
        let mut replaced = false;
        let mut new_cursor: Option<usize> = None;
        let mut min_remaining = u32::MAX;
        let mut increment: u32 = 1;

        for _pass in 0..2 {
            if replaced {
                break;
            }
            for _step in 0..ctx.working_set.capacity() {
                if ctx.working_set.cursor().is_none() {
                    ctx.working_set.arm_cursor();
                }
                let index = ctx.working_set.cursor().unwrap_or(0);
                let victim_va = ctx.working_set.get(index).va;
                let flags = space.flags_of(victim_va).unwrap_or(PageTableFlags::empty());
                let modified = flags.contains(PageTableFlags::DIRTY);
                let used = flags.contains(PageTableFlags::ACCESSED);

                if used {
                    ctx.working_set.get_mut(index).sweeps = 0;
                    space.set_flags(victim_va, PageTableFlags::empty(), PageTableFlags::ACCESSED);
                } else {
                    let element = ctx.working_set.get_mut(index);
                    element.sweeps = element.sweeps.wrapping_add(increment);
                }

                let threshold = if self.config.max_sweeps >= 0 {
                    self.config.max_sweeps as u32
                } else {
                    self.config.max_sweeps.unsigned_abs() + modified as u32
                };
                let sweeps = ctx.working_set.get(index).sweeps;
                min_remaining = min_remaining.min(threshold.wrapping_sub(sweeps));

                if sweeps >= threshold {
                    self.evict_and_recycle(ctx, index, page_va, space, frames, store)?;
                    replaced = true;
                    new_cursor = Some((index + 1) % ctx.working_set.len());
                    increment = increment.wrapping_sub(1);
                    if increment == 0 {
                        break;
                    }
                }
                ctx.working_set.advance_cursor();
            }
            increment = min_remaining;
        }

        ctx.working_set.set_cursor(new_cursor.or(Some(0)));
        trace!("fault: replaced a victim with {page_va:p}");
        Ok(FaultOutcome::Replaced)
    }

    /// Evicts the element at `index` and recycles it for `page_va`: write
    /// back a modified victim, unmap it, map a frame for the faulting page
    /// and fill it from the store (or leave it zeroed if the page is a
    /// legitimate first touch).
    fn evict_and_recycle(
        &self,
        ctx: &mut ExecutionContext,
        index: usize,
        page_va: VirtAddr,
        space: &mut impl AddressSpace,
        frames: &mut impl FrameProvider,
        store: &mut impl BackingStore,
    ) -> Result<(), TerminationCause> {
        let victim_va = ctx.working_set.get(index).va;
        let flags = space.flags_of(victim_va).unwrap_or(PageTableFlags::empty());
        if flags.contains(PageTableFlags::DIRTY)
            && store.write_page(ctx.id, victim_va).is_err()
        {
            panic!("backing store full writing back {victim_va:p}");
        }
        if let Some(frame) = space.unmap(victim_va) {
            frames.free_frame(frame);
        }

        // a prior eviction in this sweep may already have mapped the page
        if let Some(frame) = space.unmap(page_va) {
            frames.free_frame(frame);
        }
        self.map_in(ctx, page_va, space, frames);

        if store.read_page(ctx.id, page_va) == Err(StoreError::PageMissing)
            && !self.is_legitimate(page_va)
        {
            if let Some(frame) = space.unmap(page_va) {
                frames.free_frame(frame);
            }
            return Err(TerminationCause::OutsideHeapAndStack);
        }

        let element = ctx.working_set.get_mut(index);
        element.va = page_va;
        element.sweeps = 0;
        Ok(())
    }

    fn map_in(
        &self,
        ctx: &ExecutionContext,
        page_va: VirtAddr,
        space: &mut impl AddressSpace,
        frames: &mut impl FrameProvider,
    ) {
        let frame = match frames.allocate_frame() {
            Some(frame) => frame,
            None => panic!("out of physical frames handling a fault for context {:?}", ctx.id),
        };
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        if space.map(page_va, frame, flags).is_err() {
            panic!("failed to map {page_va:p} while resolving a fault");
        }
    }

    fn is_legitimate(&self, va: VirtAddr) -> bool {
        self.config.user_heap.contains(&va) || self.config.user_stack.contains(&va)
    }
}
