//! Cross-module scenarios driving the whole heap facade.

use x86_64::VirtAddr;

use crate::{
    memory::{
        heap::KernelHeap,
        layout::{HeapLayout, MAX_BLOCK_SIZE, PAGE_SIZE},
        raw,
    },
    testing::{Arena, SimAddressSpace, SimFrameProvider},
};

use super::block::PlacementPolicy;

/// 8-page block region, guard page, 23-page page region.
fn setup() -> (Arena, KernelHeap, SimFrameProvider, SimAddressSpace) {
    let arena = Arena::new(32 * PAGE_SIZE);
    let layout = HeapLayout {
        start: arena.base(),
        hard_limit: arena.base() + (8 * PAGE_SIZE) as u64,
        heap_max: arena.base() + (32 * PAGE_SIZE) as u64,
    };
    let mut frames = SimFrameProvider::new(256);
    let mut space = SimAddressSpace::new();
    let heap = KernelHeap::init(
        layout,
        4 * PAGE_SIZE,
        PlacementPolicy::FirstFit,
        &mut frames,
        &mut space,
    )
    .unwrap();
    (arena, heap, frames, space)
}

fn tag_of(va: VirtAddr) -> usize {
    va.as_u64() as usize ^ 0x5a5a_5a5a
}

#[test]
fn mixed_workload_keeps_allocations_intact() {
    let (_arena, heap, mut frames, mut space) = setup();
    let mut live: Vec<(VirtAddr, usize)> = Vec::new();
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        // xorshift, deterministic across runs
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for round in 0..400 {
        let roll = next();
        if roll % 3 != 0 || live.is_empty() {
            // size straddles the routing boundary in both directions
            let size = 16 + (roll % (3 * PAGE_SIZE as u64)) as usize;
            if let Some(va) = heap.allocate(size, &mut frames, &mut space) {
                unsafe { raw::write_word(va, tag_of(va)) };
                live.push((va, size));
            }
        } else {
            let victim = (next() % live.len() as u64) as usize;
            let (va, _) = live.swap_remove(victim);
            assert_eq!(unsafe { raw::read_word(va) }, tag_of(va), "round {round}");
            heap.free(va, &mut frames, &mut space);
        }

        // nobody's first word was clobbered by someone else's allocation
        for &(va, _) in &live {
            assert_eq!(unsafe { raw::read_word(va) }, tag_of(va), "round {round}");
        }
    }

    for (va, _) in live {
        heap.free(va, &mut frames, &mut space);
    }
}

#[test]
fn page_region_exhaustion_recovers_after_frees() {
    let (_arena, heap, mut frames, mut space) = setup();

    let mut runs = Vec::new();
    while let Some(va) = heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space) {
        runs.push(va);
    }
    // 23-page region, 2-page runs
    assert_eq!(runs.len(), 11);

    // freeing every other run leaves 2-page holes, plus a 3-page one where
    // the last run meets the odd trailing page
    for va in runs.iter().step_by(2) {
        heap.free(*va, &mut frames, &mut space);
    }
    assert!(heap.allocate(4 * PAGE_SIZE, &mut frames, &mut space).is_none());
    assert!(heap.allocate(2 * PAGE_SIZE, &mut frames, &mut space).is_some());

    // freeing the rest coalesces enough for one large run again
    for va in runs.iter().skip(1).step_by(2) {
        heap.free(*va, &mut frames, &mut space);
    }
    assert!(heap.allocate(8 * PAGE_SIZE, &mut frames, &mut space).is_some());
}

#[test]
fn reallocation_chain_preserves_contents_across_regions() {
    let (_arena, heap, mut frames, mut space) = setup();

    let mut va = heap.allocate(16, &mut frames, &mut space).unwrap();
    unsafe {
        raw::write_word(va, 0xdead);
        raw::write_word(va + 8u64, 0xbeef);
    }

    for new_size in [64, 1024, MAX_BLOCK_SIZE, PAGE_SIZE, 4 * PAGE_SIZE, 256, 16] {
        va = heap
            .reallocate(Some(va), new_size, &mut frames, &mut space)
            .unwrap();
        assert_eq!(unsafe { raw::read_word(va) }, 0xdead, "size {new_size}");
        assert_eq!(unsafe { raw::read_word(va + 8u64) }, 0xbeef, "size {new_size}");
    }

    heap.free(va, &mut frames, &mut space);
}

#[test]
fn every_frame_comes_back_after_a_full_teardown() {
    let (_arena, heap, mut frames, mut space) = setup();
    let baseline = frames.available();

    let a = heap.allocate(5 * PAGE_SIZE, &mut frames, &mut space).unwrap();
    let b = heap.allocate(PAGE_SIZE, &mut frames, &mut space).unwrap();
    let c = heap
        .reallocate(Some(a), 7 * PAGE_SIZE, &mut frames, &mut space)
        .unwrap();
    heap.free(b, &mut frames, &mut space);
    heap.free(c, &mut frames, &mut space);

    assert_eq!(frames.available(), baseline);
}
