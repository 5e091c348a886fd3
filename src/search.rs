//! Adaptive spatial search: retried fetches and quadtree refinement.

pub mod refine;
pub mod retry;

pub use refine::{
    AdaptiveSearch, Leaf, LeafOutcome, RefineError, RefineParams, RefineReport, DEFAULT_DIVIDER,
    DEFAULT_MAX_RECURSION_DEPTH, DEFAULT_SPLIT_DELAY_MAX, DEFAULT_SPLIT_DELAY_MIN,
    DEFAULT_THRESHOLD,
};
pub use retry::{fetch_with_retry, RetryPolicy};
