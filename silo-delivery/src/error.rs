//! Typed error handling for delivery operations.
//!
//! Failures are split by who can do something about them:
//! - queue refusals (duplicate or exhausted) are logged and recovered from
//!   the store on a later pass
//! - store and transport errors are logged and retried on the next cycle
//! - query build errors fail closed, skipping the batch
//! - system errors mean the pipeline was used before `init()` or misconfigured

use silo_store::{MessageId, StoreError};
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The retry queue refused an entry.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The batched reload query could not be built.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// The outbound transport rejected a request.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Intake refused a message.
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    /// System-level error.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Reasons the retry queue refuses an entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The message already has an entry in the queue.
    #[error("message {0} is already queued")]
    Duplicate(MessageId),

    /// The queue is at capacity.
    #[error("retry queue exhausted at {capacity} entries")]
    Exhausted { capacity: usize },
}

/// Failures building the batched reload query. The batch is skipped rather
/// than sending a partial statement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// No identifiers to load.
    #[error("empty batch")]
    EmptyBatch,

    /// The statement would not fit in the query buffer.
    #[error("query exceeds {limit} bytes")]
    TooLong { limit: usize },

    /// Formatting the statement failed.
    #[error("failed to format query")]
    Format,
}

impl From<std::fmt::Error> for QueryError {
    fn from(_: std::fmt::Error) -> Self {
        Self::Format
    }
}

/// Errors raised synchronously by an outbound transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be handed to the transaction layer.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The transport is shutting down.
    #[error("transport closed")]
    Closed,
}

/// Reasons a message is refused at intake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    /// The message has no body.
    #[error("message has no body")]
    EmptyBody,

    /// The owner address has no user part.
    #[error("owner has no user part")]
    MissingUser,

    /// The owner already has the configured maximum of stored messages.
    #[error("too many messages for {owner}: limit is {limit}")]
    QuotaExceeded { owner: String, limit: usize },
}

/// System-level errors.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The pipeline was used before `init()`.
    #[error("Delivery pipeline not initialized: {0}")]
    NotInitialized(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A worker thread could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}
