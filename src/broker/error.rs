use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection or channel is gone; the supervisor reconnects.
    Connection(String),
    /// An ack or offset commit was refused.
    Settle(String),
    Publish(String),
    /// The transport has shut down for good.
    Closed,
}

impl BrokerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Connection(reason) => write!(f, "broker connection error: {reason}"),
            BrokerError::Settle(reason) => write!(f, "failed to settle delivery: {reason}"),
            BrokerError::Publish(reason) => write!(f, "failed to publish: {reason}"),
            BrokerError::Closed => write!(f, "broker transport closed"),
        }
    }
}

impl std::error::Error for BrokerError {}
