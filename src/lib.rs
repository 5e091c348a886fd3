pub mod broker;
pub mod domain;
pub mod fetch;
pub mod gate;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod runtime;
pub mod search;

pub use broker::{Broker, BrokerError, ConsumerSession, Delivery, LogBroker, MemoryLog, MemoryQueue, QueueBroker};
pub use domain::{Cell, CellStatus, Coordinate, JobStatus, Vehicle, WorkItem, WorkKind};
pub use fetch::{FetchError, FetchRequest, FetchWorker, HttpWorkerConfig, HttpWorkerFactory, WorkerFactory};
pub use gate::{GateDecision, HttpJobStatusClient, JobGate, JobStatusSource, MemoryJobStatus};
pub use metadata::{MetadataCounts, MetadataStore};
pub use pipeline::{BrokerFlavor, Destinations, HarvestContext, Harvester, Outcome};
pub use pool::{PoolConfig, PoolError, PoolStats, WorkerPool};
pub use runtime::config::{HarvesterConfig, HarvesterConfigBuilder, HarvesterConfigParams};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use search::{AdaptiveSearch, RefineParams, RetryPolicy};
