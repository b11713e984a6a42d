use bytestring::ByteString;
use thiserror::Error;

use crate::types::{DestinationName, HandleId, QueueName, TxId};

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Destination or queue is full, the message was not admitted
    #[error("queue {queue} is full, max depth {max_depth}")]
    Capacity { queue: QueueName, max_depth: usize },
    #[error("invalid destination, {0}")]
    InvalidDestination(DestinationName),
    #[error("invalid subscription, {0}")]
    InvalidSubscription(ByteString),
    #[error("invalid selector {0:?}, {1}")]
    InvalidSelector(ByteString, String),
    #[error("invalid transaction {0}, {1}")]
    InvalidTransaction(TxId, String),
    #[error("transaction {0} rolled back, {1}")]
    TransactionRolledBack(TxId, String),
    #[error("store error, {0}")]
    Store(String),
    #[error("connection error, {0}")]
    Connection(String),
    #[error("security error, {0}")]
    Security(String),
    #[error("service unavailable")]
    ServiceUnavailable,
    /// Programming error: the handle was removed and must not be used again
    #[error("message handle {0} has been removed")]
    HandleRemoved(HandleId),
    /// Programming error: a handle was about to enter a second in-flight entry
    #[error("message handle {0} is already in flight")]
    DuplicateInflight(HandleId),
    #[error("{} fan-out failures: {}", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Composite(Vec<BrokerError>),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(anyhow::Error),
}

impl BrokerError {
    /// Faults that signal a broken invariant rather than a recoverable condition.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::HandleRemoved(_) | BrokerError::DuplicateInflight(_) => true,
            BrokerError::Composite(errs) => errs.iter().any(|e| e.is_fatal()),
            _ => false,
        }
    }

    #[inline]
    pub fn is_capacity(&self) -> bool {
        match self {
            BrokerError::Capacity { .. } => true,
            BrokerError::Composite(errs) => errs.iter().all(|e| e.is_capacity()),
            _ => false,
        }
    }
}

impl From<String> for BrokerError {
    #[inline]
    fn from(e: String) -> Self {
        BrokerError::Msg(e)
    }
}

impl From<&str> for BrokerError {
    #[inline]
    fn from(e: &str) -> Self {
        BrokerError::Msg(e.to_string())
    }
}

impl From<anyhow::Error> for BrokerError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Anyhow(e)
    }
}

impl From<bincode::Error> for BrokerError {
    #[inline]
    fn from(e: bincode::Error) -> Self {
        BrokerError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Msg(e.to_string())
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
