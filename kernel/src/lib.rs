//! Memory-management core of a teaching kernel.
//!
//! This crate provides:
//! - A header/footer block allocator for sub-page allocations
//! - A segment-tree page-run allocator for page-granular allocations
//! - A kernel heap facade dispatching between the two
//! - Page-fault handling with working-set (N-chance clock) replacement
//! - A sleep/wakeup channel primitive
//!
//! Hardware concerns (frame allocation, page-table mutation, backing-store
//! I/O, scheduling) are reached through collaborator traits so the core can
//! be driven by a real machine or by the simulated one in [`testing`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod faults;
pub mod memory;
pub mod output;
pub mod serial;
pub mod sync;
pub mod tasks;
pub mod testing;
