//! Blocking synchronization primitives.

pub mod channel;

pub use channel::Channel;
