//! State shared by every worker, the completion handler, and the timers

use std::{sync::Arc, time::Duration};

use silo_common::unix_now;
use silo_store::{Connection, MessageId, Schema, Store, StoreError};

use crate::{
    error::{DeliveryError, QueueError},
    intake::{self, StoreRequest},
    ledger::Ledger,
    queue::{EntryHandle, RetryQueue},
    signal::WakeSignal,
    stats::{Stats, StatsSnapshot},
    transport::{CompletionSender, Transport},
};

/// Runtime copy of the delivery settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Retries allowed after the first attempt
    pub retry_count: u32,
    pub batch_size: usize,
    /// Longest a worker sleeps on the wake signal before re-checking
    pub wait: Duration,
    pub schema: Schema,
    pub outbound_proxy: Option<String>,
    pub from_address: Option<String>,
    pub contact_hdr: Option<String>,
    pub content_type_hdr: Option<String>,
    pub offline_message: Option<String>,
    pub reminder: Option<String>,
    pub use_contact: bool,
    pub add_date: bool,
    pub max_messages: usize,
    pub expire_time_secs: i64,
    pub check_time_secs: u64,
    pub clean_period: u64,
    pub in_flight_timeout_secs: i64,
    pub reload_backoff_secs: i64,
    pub delete_batch_size: usize,
    pub queue_capacity: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        super::Silo::default().settings()
    }
}

/// Everything a delivery participant needs, shared behind an `Arc`
#[derive(Debug)]
pub struct DeliveryContext {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub signal: WakeSignal,
    pub ledger: Ledger,
    pub stats: Stats,
    pub completions: CompletionSender,
}

impl DeliveryContext {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        completions: CompletionSender,
    ) -> Self {
        let queue = settings
            .queue_capacity
            .map_or_else(RetryQueue::new, RetryQueue::with_capacity);

        Self {
            settings,
            store,
            transport,
            signal: WakeSignal::new(queue),
            ledger: Ledger::new(),
            stats: Stats::default(),
            completions,
        }
    }

    /// Open a connection bound to the message table
    ///
    /// # Errors
    /// If the store refuses the connection or does not know the table.
    pub fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        let mut conn = self.store.connect()?;
        conn.use_table(&self.settings.schema.table)?;
        Ok(conn)
    }
}

/// Producer-side interface of a running pipeline
///
/// Cheap to clone; every call that touches the store opens its own
/// connection.
#[derive(Debug, Clone)]
pub struct SiloHandle {
    pub(crate) context: Arc<DeliveryContext>,
}

impl SiloHandle {
    pub const fn new(context: Arc<DeliveryContext>) -> Self {
        Self { context }
    }

    /// Queue an attempt and wake the workers
    ///
    /// # Errors
    /// When the message is already queued or the queue is full. The message
    /// stays in the store either way.
    pub fn enqueue_retry(
        &self,
        message_id: MessageId,
        retry_count: u32,
        not_before: i64,
    ) -> Result<EntryHandle, QueueError> {
        self.context.signal.enqueue(message_id, retry_count, not_before)
    }

    /// Whether the message is already in flight or awaiting reconciliation
    ///
    /// Registers the message as in flight when it was not.
    pub fn was_already_handled(&self, message_id: MessageId) -> bool {
        self.context.ledger.check_message(message_id).already_handled
    }

    /// Wake every worker without queueing anything
    pub fn signal_work(&self) {
        self.context.signal.notify();
    }

    /// Persist a message for a recipient who is offline
    ///
    /// # Errors
    /// See [`intake::store_message`].
    pub fn store_message(&self, request: &StoreRequest) -> Result<MessageId, DeliveryError> {
        let mut conn = self.context.connect()?;
        intake::store_message(&self.context, conn.as_mut(), request, unix_now())
    }

    /// Queue every stored message of `user@host` for delivery
    ///
    /// # Errors
    /// See [`intake::dump`].
    pub fn dump(&self, user: &str, host: &str) -> Result<usize, DeliveryError> {
        let mut conn = self.context.connect()?;
        intake::dump(&self.context, conn.as_mut(), user, host, unix_now())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Entries owned by the retry queue, queued or in flight
    pub fn queued(&self) -> usize {
        self.context.signal.with_queue(|queue| queue.len())
    }
}
