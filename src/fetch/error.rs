use std::fmt;

/// Failure of a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure: connect, TLS, proxy, timeout, or body read.
    Network(String),
    /// The endpoint answered with a non-success status.
    HttpStatus { code: u16 },
    /// The body was not JSON or lacked the fields the request kind needs.
    MalformedResponse(String),
    /// The operation received more bytes than its ceiling allows.
    PayloadLimit { limit: usize },
    /// The worker has been destroyed.
    WorkerClosed,
}

impl FetchError {
    /// Whether retrying on a fresh worker can plausibly succeed.
    ///
    /// Client errors other than 403, 408 and 429 describe the request itself
    /// (unknown listing, bad window) and are terminal on the first attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { code } => {
                !(400..500).contains(code) || matches!(code, 403 | 408 | 429)
            }
            FetchError::Network(_)
            | FetchError::MalformedResponse(_)
            | FetchError::PayloadLimit { .. }
            | FetchError::WorkerClosed => true,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Network(reason) => write!(f, "network error: {reason}"),
            FetchError::HttpStatus { code } => write!(f, "http status {code}"),
            FetchError::MalformedResponse(reason) => write!(f, "malformed response: {reason}"),
            FetchError::PayloadLimit { limit } => {
                write!(f, "response exceeded the {limit} byte ceiling")
            }
            FetchError::WorkerClosed => write!(f, "fetch worker is closed"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::HttpStatus {
                code: status.as_u16(),
            },
            None => FetchError::Network(err.to_string()),
        }
    }
}
