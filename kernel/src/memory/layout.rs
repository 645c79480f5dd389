//! Address-space layout constants and the heap layout descriptor.

use x86_64::VirtAddr;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of a metadata word (block header or footer) in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Largest request served by the block allocator; anything bigger goes to
/// the page allocator.
pub const MAX_BLOCK_SIZE: usize = 2048;

/// Start of the kernel heap in virtual memory.
pub const KERNEL_HEAP_START: u64 = 0x_4444_0000_0000;

/// Initially mapped size of the block-allocator region.
pub const KERNEL_HEAP_INITIAL: usize = 128 * 1024; // 128 KiB

/// Hard limit of the block-allocator region; `sbrk` never moves the break
/// past this address.
pub const KERNEL_HEAP_LIMIT: u64 = KERNEL_HEAP_START + 0x100_0000; // 16 MiB

/// End of the kernel heap; the page allocator hands out runs below this.
pub const KERNEL_HEAP_MAX: u64 = KERNEL_HEAP_START + 0x4000_0000; // 1 GiB

/// Ceiling of the user address space. Kept below the canonical-address
/// boundary so the ceiling and addresses just past it stay representable.
pub const USER_LIMIT: u64 = 0x7F80_0000_0000;

/// User heap range (demand paged, marked-bit tracked).
pub const USER_HEAP_START: u64 = 0x2000_0000_0000;
pub const USER_HEAP_MAX: u64 = 0x3000_0000_0000;

/// User stack range; the stack grows down from its top.
pub const USER_STACK_BOTTOM: u64 = 0x7000_0000_0000;
pub const USER_STACK_TOP: u64 = 0x7000_1000_0000;

/// Bounds of one kernel heap instance.
///
/// The block allocator lives in `[start, hard_limit]` and grows its break on
/// demand; the page allocator hands out runs in
/// `[hard_limit + PAGE_SIZE, heap_max)`. Keeping the bounds in a value
/// instead of in statics lets tests run a small heap over an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapLayout {
    pub start: VirtAddr,
    pub hard_limit: VirtAddr,
    pub heap_max: VirtAddr,
}

impl HeapLayout {
    /// The canonical kernel heap layout.
    pub const fn kernel() -> Self {
        HeapLayout {
            start: VirtAddr::new_truncate(KERNEL_HEAP_START),
            hard_limit: VirtAddr::new_truncate(KERNEL_HEAP_LIMIT),
            heap_max: VirtAddr::new_truncate(KERNEL_HEAP_MAX),
        }
    }

    /// First address served by the page allocator.
    pub fn page_allocator_start(&self) -> VirtAddr {
        self.hard_limit + PAGE_SIZE as u64
    }

    /// Number of pages the page allocator manages.
    pub fn page_allocator_pages(&self) -> usize {
        ((self.heap_max - self.page_allocator_start()) / PAGE_SIZE as u64) as usize
    }
}

/// Rounds `size` up to a whole number of pages.
pub const fn round_up_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Rounds `va` down to its page base.
pub fn page_base(va: VirtAddr) -> VirtAddr {
    VirtAddr::new(va.as_u64() & !(PAGE_SIZE as u64 - 1))
}
