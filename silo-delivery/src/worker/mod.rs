//! Worker pool draining the retry queue
//!
//! Each worker is a named OS thread looping over:
//! 1. wait on the wake signal (bounded) and claim a batch
//! 2. poll until every entry of the batch is eligible
//! 3. reload the batch's rows with one query on the worker's own connection
//! 4. hand each row to the transport with its completion token
//! 5. unlink the batch from the queue
//!
//! Shutdown clears the running flag and broadcasts; workers notice it after
//! at most one wait period and exit without touching the queue again.

pub mod batch;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ahash::AHashSet;
use silo_common::{internal, unix_now};
use silo_store::{Connection, MessageId, Row, StoreError};
use tracing::{debug, error, info, warn};

use crate::{
    error::SystemError,
    message::{BodyKind, build_body, build_headers},
    processor::context::DeliveryContext,
    queue::RetryEntry,
    transport::{CompletionToken, MESSAGE_METHOD, OutboundRequest},
};

/// Granularity of the wait for a batch to become eligible
const ELIGIBILITY_POLL: Duration = Duration::from_millis(25);

/// Status code standing in for a send the transport refused outright
pub const LOCAL_FAILURE_CODE: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Waiting = 0,
    Peeking = 1,
    Sending = 2,
    Terminated = 3,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Peeking,
            2 => Self::Sending,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Peeking => "peeking",
            Self::Sending => "sending",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

/// The running worker threads
///
/// Dropping the pool shuts it down and joins every thread, so the wake
/// signal cannot be released while a worker might still wait on it.
#[derive(Debug)]
pub struct WorkerPool {
    context: Arc<DeliveryContext>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `count` workers
    ///
    /// # Errors
    /// If a thread cannot be spawned; workers started before the failure are
    /// stopped again.
    pub fn spawn(context: &Arc<DeliveryContext>, count: usize) -> Result<Self, SystemError> {
        let mut pool = Self {
            context: Arc::clone(context),
            workers: Vec::with_capacity(count),
        };

        for id in 0..count {
            let state = Arc::new(AtomicU8::new(WorkerState::Waiting as u8));
            let thread = {
                let context = Arc::clone(context);
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name(format!("silo-worker-{id}"))
                    .spawn(move || run(id, &context, &state))?
            };

            pool.workers.push(Worker {
                id,
                state,
                thread: Some(thread),
            });
        }

        internal!("Started {count} delivery workers");
        Ok(pool)
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|w| WorkerState::from_u8(w.state.load(Ordering::Acquire)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker and wait for it to exit
    pub fn shutdown(&mut self) {
        self.context.signal.shutdown();

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                error!(worker = worker.id, "Delivery worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn set_state(state: &AtomicU8, value: WorkerState) {
    state.store(value as u8, Ordering::Release);
}

fn run(id: usize, context: &DeliveryContext, state: &AtomicU8) {
    let settings = &context.settings;
    let mut connection: Option<Box<dyn Connection>> = None;

    debug!(worker = id, "Delivery worker started");

    loop {
        set_state(state, WorkerState::Waiting);

        let Some(batch) = context
            .signal
            .next_batch(settings.batch_size, settings.wait, unix_now)
        else {
            break;
        };

        if batch.is_empty() {
            continue;
        }

        set_state(state, WorkerState::Peeking);

        if !wait_until_eligible(context, &batch) {
            break;
        }

        process_batch(id, context, &mut connection, &batch, state);
        context.signal.with_queue(|queue| queue.remove_links(&batch));
    }

    set_state(state, WorkerState::Terminated);
    debug!(worker = id, "Delivery worker stopped");
}

/// Poll until every entry may be sent; `false` if shutdown interrupted
fn wait_until_eligible(context: &DeliveryContext, batch: &[RetryEntry]) -> bool {
    let Some(not_before) = batch.iter().map(|e| e.not_before).max() else {
        return true;
    };

    while unix_now() < not_before {
        if !context.signal.is_running() {
            return false;
        }
        thread::sleep(ELIGIBILITY_POLL);
    }

    true
}

fn connection<'a>(
    context: &DeliveryContext,
    slot: &'a mut Option<Box<dyn Connection>>,
) -> Result<&'a mut Box<dyn Connection>, StoreError> {
    if slot.is_none() {
        *slot = Some(context.connect()?);
    }

    slot.as_mut()
        .ok_or_else(|| StoreError::Unavailable("no connection".to_string()))
}

fn process_batch(
    id: usize,
    context: &DeliveryContext,
    slot: &mut Option<Box<dyn Connection>>,
    batch: &[RetryEntry],
    state: &AtomicU8,
) {
    let ids: Vec<MessageId> = batch.iter().map(|e| e.message_id).collect();

    let sql = match batch::build_reload_query(&context.settings.schema, &ids) {
        Ok(sql) => sql,
        Err(e) => {
            error!(worker = id, "Skipping batch of {}: {e}", batch.len());
            release_batch(context, batch);
            return;
        }
    };

    debug!(worker = id, "Reloading batch: {sql}");

    let rows = match connection(context, slot).and_then(|conn| conn.raw_query(&sql)) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(worker = id, "Failed to reload batch of {}: {e}", batch.len());
            // Reconnect on the next batch
            *slot = None;
            requeue_batch(context, batch);
            return;
        }
    };

    set_state(state, WorkerState::Sending);
    info!(
        worker = id,
        "Resending {} of {} queued messages",
        rows.len(),
        batch.len()
    );

    let mut found = AHashSet::with_capacity(rows.len());

    for row in &rows {
        let Some(message_id) = row.message_id(batch::column::MID) else {
            warn!(worker = id, "Reloaded row without an identifier");
            continue;
        };

        let Some(entry) = batch.iter().find(|e| e.message_id == message_id) else {
            error!(worker = id, %message_id, "Reloaded message is not part of the batch");
            continue;
        };
        found.insert(message_id);

        send(id, context, entry, row);
    }

    // Left claimed; the reconciler expires them once they time out
    for entry in batch.iter().filter(|e| !found.contains(&e.message_id)) {
        warn!(
            worker = id,
            message_id = %entry.message_id,
            "Queued message is no longer in the store"
        );
    }
}

fn send(id: usize, context: &DeliveryContext, entry: &RetryEntry, row: &Row) {
    let token = CompletionToken::queued(entry.handle, entry.message_id, entry.retry_count);

    let request = reload_request(context, row);
    debug!(
        worker = id,
        message_id = %entry.message_id,
        retry_count = entry.retry_count,
        "Sending to {}",
        request.uri
    );

    if let Err(e) = context
        .transport
        .request_send(request, context.completions.clone(), token)
    {
        warn!(
            worker = id,
            message_id = %entry.message_id,
            "Transport refused message: {e}"
        );
        context.completions.complete(token, LOCAL_FAILURE_CODE);
    }
}

/// Outbound request for one reloaded row
pub(crate) fn reload_request(context: &DeliveryContext, row: &Row) -> OutboundRequest {
    use batch::column;

    let settings = &context.settings;
    let from = row.text(column::FROM).unwrap_or_default();
    let to = row.text(column::TO).unwrap_or_default();
    let body = row.text(column::BODY).unwrap_or_default();
    let ctype = row.text(column::CTYPE).unwrap_or_default();
    let received = row.int(column::INC_TIME).unwrap_or_default();

    OutboundRequest {
        method: MESSAGE_METHOD,
        uri: to.clone(),
        to,
        from,
        headers: build_headers(&ctype, settings.contact_hdr.as_deref()),
        body: build_body(&body, &ctype, BodyKind::Offline, received, settings.add_date),
        outbound_proxy: settings.outbound_proxy.clone(),
    }
}

/// Return a batch to the queue after a store failure, same counters
fn requeue_batch(context: &DeliveryContext, batch: &[RetryEntry]) {
    let not_before = unix_now() + context.settings.reload_backoff_secs;

    context.signal.with_queue(|queue| {
        for entry in batch {
            queue.requeue(entry.handle, entry.retry_count, not_before);
        }
    });
}

/// Drop a batch that cannot be loaded; the rows stay in the store for a
/// later dump
fn release_batch(context: &DeliveryContext, batch: &[RetryEntry]) {
    let released: Vec<MessageId> = context.signal.with_queue(|queue| {
        batch
            .iter()
            .filter_map(|entry| queue.release(entry.handle))
            .map(|entry| entry.message_id)
            .collect()
    });

    context.ledger.forget(&released);
}
