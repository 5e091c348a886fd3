//! In-process brokers with the delivery semantics the bindings rely on:
//! committed offsets and unacked deliveries survive a reconnect.

mod log;
mod queue;

pub use self::log::MemoryLog;
pub use self::queue::MemoryQueue;
