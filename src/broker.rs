//! Queue consumer adapters: one consumer contract over a partitioned log
//! broker and a queue broker, plus the supervised reconnect loop.

pub mod error;
pub mod log;
pub mod memory;
pub mod queue;
pub mod session;
pub mod supervisor;

pub use error::BrokerError;
pub use log::{LogBroker, LogConsumer, LogRecord, LogTransport, DEFAULT_COMMIT_RETRIES};
pub use memory::{MemoryLog, MemoryQueue};
pub use queue::{QueueBroker, QueueChannel, QueueDelivery, QueueTransport};
pub use session::{Broker, ConsumerSession, Delivery};
pub use supervisor::{supervise, DEFAULT_RECONNECT_DELAY};
