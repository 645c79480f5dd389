//! Execution contexts and the scheduling contract.
//!
//! A context is the unit the fault handler and the channel primitive act
//! on: it carries the working set the replacement clock sweeps and the
//! fault counters. Actual dispatch lives behind the [`scheduler::Scheduler`]
//! trait.

pub mod context;
pub mod scheduler;

pub use context::{ContextId, ExecutionContext, WorkingSet, WorkingSetElement};
pub use scheduler::Scheduler;
