//! Kernel memory management.
//!
//! Layered bottom-up:
//! - [`raw`] — the only raw-pointer surface
//! - [`block`] — header/footer sub-page allocator
//! - [`tree`] — segment tree tracking page runs
//! - [`paging`] — collaborator contracts and the page-run allocator
//! - [`heap`] — the facade routing between the two allocators
//! - [`layout`] — address-space constants and the heap layout

pub mod block;
pub mod heap;
pub mod layout;
pub mod paging;
pub mod raw;
pub mod tree;

#[cfg(test)]
mod tests;

pub use block::PlacementPolicy;
pub use heap::KernelHeap;
pub use layout::HeapLayout;
pub use paging::{AddressSpace, FrameProvider, PageAllocator};
