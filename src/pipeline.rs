//! The harvesting pipeline: an explicit per-process context, per-delivery
//! processing with outcome routing, and the consumer loop that feeds it.

pub mod consumer;
pub mod context;
pub mod destinations;
pub mod handler;
pub mod harvester;
pub mod records;


pub use consumer::consume;
pub use context::HarvestContext;
pub use destinations::{BrokerFlavor, Destinations};
pub use handler::{process, Outcome, ProcessError};
pub use harvester::Harvester;
pub use records::{FailureRecord, ListingSummary, ScrapedRecord};
