//! Scheduling contract the channel primitive relies on.

use super::context::ContextId;

/// Minimal dispatch interface.
///
/// Methods take `&self`: implementations are shared between contexts and
/// synchronize internally.
pub trait Scheduler {
    /// Context running on this CPU.
    fn current(&self) -> ContextId;

    /// Takes `ctx` off the ready set. The context keeps running until it
    /// yields.
    fn mark_blocked(&self, ctx: ContextId);

    /// Puts `ctx` back on the ready set.
    fn mark_ready(&self, ctx: ContextId);

    /// Gives up the CPU. Returns once the current context is scheduled
    /// again; if it is still ready this may return immediately.
    fn yield_now(&self);
}
