//! Offline message delivery for the silo store
//!
//! This crate provides functionality to:
//! - Store messages for recipients who are offline
//! - Queue stored messages for delivery once their recipient registers
//! - Deliver queued messages from a pool of worker threads, with retries
//! - Reconcile delivery outcomes with the store
//! - Send scheduled reminders

pub mod completion;
mod error;
pub mod intake;
pub mod ledger;
pub mod message;
mod processor;
pub mod queue;
pub mod reconciler;
pub mod reminder;
pub mod signal;
mod stats;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export error types
pub use error::{
    DeliveryError, IntakeError, QueryError, QueueError, SystemError, TransportError,
};
// Re-export core types
pub use completion::{Outcome, handle_completion};
pub use intake::StoreRequest;
pub use ledger::{Flags, Ledger, LedgerEntry};
pub use processor::{
    Silo,
    context::{DeliveryContext, Settings, SiloHandle},
};
pub use queue::{EntryHandle, RetryEntry, RetryQueue};
pub use reconciler::{Reconciler, SweepReport};
pub use stats::{Stats, StatsSnapshot};
pub use transport::{
    Completion, CompletionSender, CompletionToken, LoopbackTransport, Origin, OutboundRequest,
    TestTransport, Transport, TransportConfig,
};
pub use worker::{WorkerPool, WorkerState};
