//! Fetch workers: long-lived sessions bound to one proxy egress that execute
//! single marketplace API calls, plus the request shapes and response checks
//! shared by every worker implementation.

pub mod auth;
#[cfg(feature = "chromium")]
pub mod chromium;
pub mod error;
pub mod governor;
pub mod http;
pub mod request;
pub mod worker;

pub use auth::ProxyConfig;
pub use error::FetchError;
pub use governor::{ByteBudget, DEFAULT_GOVERNOR_CEILING_BYTES};
pub use http::{HttpFetchWorker, HttpWorkerConfig, HttpWorkerFactory};
pub use request::{
    FetchRequest, HttpMethod, RequestKind, SearchFilters, SearchOptions, SearchPage, SearchSort,
    SortDirection,
};
pub use worker::{FetchResponse, FetchWorker, WorkerFactory, WorkerId};
