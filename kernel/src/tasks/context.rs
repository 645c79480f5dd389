//! Per-context state the memory subsystem tracks.

use alloc::vec::Vec;

use x86_64::VirtAddr;

/// Identifies one execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u32);

/// One resident page tracked by the replacement clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkingSetElement {
    pub va: VirtAddr,
    /// Sweeps survived since the page was last seen used.
    pub sweeps: u32,
}

/// Fixed-capacity set of resident pages with a circular clock cursor.
///
/// The cursor is `None` until the set first fills; arming it starts the
/// clock at the oldest element.
#[derive(Clone, Debug)]
pub struct WorkingSet {
    elements: Vec<WorkingSetElement>,
    capacity: usize,
    cursor: Option<usize>,
}

impl WorkingSet {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "working set needs room for at least one page");
        WorkingSet {
            elements: Vec::with_capacity(capacity),
            capacity,
            cursor: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.elements.len() == self.capacity
    }

    /// Appends a fresh element and returns its index. The set must not be
    /// full.
    pub fn push(&mut self, va: VirtAddr) -> usize {
        debug_assert!(!self.is_full());
        self.elements.push(WorkingSetElement { va, sweeps: 0 });
        self.elements.len() - 1
    }

    /// Index of the element tracking `va`, if resident.
    pub fn find(&self, va: VirtAddr) -> Option<usize> {
        self.elements.iter().position(|e| e.va == va)
    }

    pub fn get(&self, index: usize) -> &WorkingSetElement {
        &self.elements[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut WorkingSetElement {
        &mut self.elements[index]
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Points the clock at the oldest element.
    pub fn arm_cursor(&mut self) {
        self.cursor = Some(0);
    }

    pub fn set_cursor(&mut self, cursor: Option<usize>) {
        debug_assert!(cursor.is_none_or(|c| c < self.elements.len()));
        self.cursor = cursor;
    }

    /// Moves the clock hand one element forward, wrapping.
    pub fn advance_cursor(&mut self) {
        if let Some(cursor) = self.cursor {
            self.cursor = Some((cursor + 1) % self.elements.len());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkingSetElement> {
        self.elements.iter()
    }
}

/// One context as the memory subsystem sees it.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub working_set: WorkingSet,
    /// Faults taken because no second-level table covered the address.
    pub table_faults: u64,
    /// Faults resolved by placement or replacement.
    pub page_faults: u64,
}

impl ExecutionContext {
    pub fn new(id: ContextId, working_set_capacity: usize) -> Self {
        ExecutionContext {
            id,
            working_set: WorkingSet::new(working_set_capacity),
            table_faults: 0,
            page_faults: 0,
        }
    }
}
