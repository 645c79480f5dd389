//! Sleep/wakeup channel.
//!
//! A [`Channel`] names a condition contexts can block on. [`Channel::sleep`]
//! atomically releases the caller's lock and parks the context; a wakeup
//! arriving between the release and the park is not lost, because the
//! context is taken off the ready set while both the caller's lock and the
//! channel's queue lock are still held. Callers re-check their condition in
//! a loop, since wakeup means "look again", not "the condition holds".

use alloc::collections::vec_deque::VecDeque;
use spin::{Mutex, MutexGuard};

use crate::{tasks::Scheduler, trace};

/// Wait queue for one condition.
#[derive(Debug)]
pub struct Channel {
    name: &'static str,
    queue: Mutex<VecDeque<crate::tasks::ContextId>>,
}

impl Channel {
    pub const fn new(name: &'static str) -> Self {
        Channel {
            name,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Contexts currently parked on this channel. Diagnostic only; the
    /// count can change before the caller acts on it.
    pub fn sleeper_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Releases `guard`, parks the current context on this channel, and
    /// reacquires `lock` once woken.
    ///
    /// `guard` must have been produced by `lock`; the caller's condition
    /// must be re-checked on return.
    pub fn sleep<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        scheduler: &impl Scheduler,
    ) -> MutexGuard<'a, T> {
        let me = scheduler.current();
        let mut queue = self.queue.lock();
        // leave the ready set before dropping either lock, so a wakeup
        // racing with this sleep finds us already parked
        scheduler.mark_blocked(me);
        queue.push_back(me);
        trace!("channel {}: context {:?} sleeping", self.name, me);
        drop(guard);
        drop(queue);
        scheduler.yield_now();
        lock.lock()
    }

    /// Wakes the longest-sleeping context, if any. Returns whether one was
    /// woken.
    pub fn wake_one(&self, scheduler: &impl Scheduler) -> bool {
        let woken = self.queue.lock().pop_front();
        match woken {
            Some(ctx) => {
                trace!("channel {}: waking context {:?}", self.name, ctx);
                scheduler.mark_ready(ctx);
                true
            }
            None => false,
        }
    }

    /// Wakes every sleeping context. Returns how many were woken.
    pub fn wake_all(&self, scheduler: &impl Scheduler) -> usize {
        let drained: VecDeque<_> = core::mem::take(&mut *self.queue.lock());
        let count = drained.len();
        for ctx in drained {
            scheduler.mark_ready(ctx);
        }
        if count > 0 {
            trace!("channel {}: woke {} contexts", self.name, count);
        }
        count
    }
}
