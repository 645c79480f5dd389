//! Raw word-level access to heap memory.
//!
//! Every raw pointer dereference the block allocator performs goes through
//! these three primitives, keeping the undefined-behavior surface in one
//! place. Callers must only hand in addresses inside a region they own and
//! have mapped.

use x86_64::VirtAddr;

/// Reads one metadata word at `va`.
///
/// # Safety
/// `va` must be a readable, word-aligned address owned by the caller.
pub unsafe fn read_word(va: VirtAddr) -> usize {
    unsafe { core::ptr::read(va.as_ptr::<usize>()) }
}

/// Writes one metadata word at `va`.
///
/// # Safety
/// `va` must be a writable, word-aligned address owned by the caller.
pub unsafe fn write_word(va: VirtAddr, value: usize) {
    unsafe { core::ptr::write(va.as_mut_ptr::<usize>(), value) }
}

/// Copies `len` bytes from `src` to `dst`. The ranges must not overlap.
///
/// # Safety
/// Both ranges must be mapped and owned by the caller, and disjoint.
pub unsafe fn copy_bytes(dst: VirtAddr, src: VirtAddr, len: usize) {
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len);
    }
}
