//! Turns send outcomes into ledger flags and queue transitions
//!
//! Runs on the async side for every [`Completion`] the transports report.
//! Never touches the store; the reconciler applies the outcomes later.

use silo_common::unix_now;
use tracing::{debug, info, warn};

use crate::{
    error::QueueError,
    ledger::Flags,
    processor::context::DeliveryContext,
    transport::{Completion, Origin},
};

/// What a completion led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Queued again with the given attempt number
    Retried(u32),
    Delivered,
    /// Out of retries, or a failed reminder
    Failed,
    /// A failure reported for an attempt that a newer entry has replaced
    Superseded,
}

enum Requeue {
    Queued,
    /// The message already has a live entry
    AlreadyQueued,
    Refused,
}

pub fn handle_completion(context: &DeliveryContext, completion: Completion) -> Outcome {
    let Completion { token, code } = completion;
    let message_id = token.message_id;

    debug!(
        %message_id,
        retry_count = token.retry_count,
        code,
        "Delivery completed"
    );

    let superseded = token.handle.is_some_and(|handle| {
        context.signal.with_queue(|queue| {
            queue
                .handle_of(message_id)
                .is_some_and(|live| live != handle)
        })
    });

    if completion.is_success() {
        context.ledger.set_flag(message_id, Flags::DONE);
        if superseded {
            // Delivered after all; the newer attempt must not go out
            let cancelled = context
                .signal
                .with_queue(|queue| queue.cancel_queued(message_id));
            if cancelled.is_some() {
                debug!(%message_id, "Cancelled queued attempt of a delivered message");
            }
        } else {
            release(context, completion);
        }
        return Outcome::Delivered;
    }

    if superseded {
        debug!(%message_id, code, "Ignoring failure of a replaced attempt");
        return Outcome::Superseded;
    }

    let may_retry =
        token.origin == Origin::Queue && token.retry_count < context.settings.retry_count;

    if may_retry {
        let next = token.retry_count + 1;
        match requeue(context, completion, next) {
            Requeue::Queued => {
                context.ledger.set_retry(message_id, next);
                context.stats.record_retry();
                context.signal.notify();
                info!(%message_id, retry_count = next, code, "Delivery failed, retrying");
                return Outcome::Retried(next);
            }
            Requeue::AlreadyQueued => {
                debug!(%message_id, "Already queued again, leaving the live entry");
                return Outcome::Superseded;
            }
            Requeue::Refused => {}
        }
    }

    warn!(
        %message_id,
        retry_count = token.retry_count,
        code,
        "Delivery failed permanently"
    );
    context.ledger.set_flag(message_id, Flags::ERROR);
    release(context, completion);
    Outcome::Failed
}

/// Reuse the attempt's slot, or queue afresh if the slot has moved on
fn requeue(context: &DeliveryContext, completion: Completion, retry_count: u32) -> Requeue {
    let token = completion.token;
    let now = unix_now();

    context.signal.with_queue(|queue| {
        if let Some(handle) = token.handle
            && queue.requeue(handle, retry_count, now)
        {
            return Requeue::Queued;
        }

        match queue.add(token.message_id, retry_count, now) {
            Ok(_) => Requeue::Queued,
            Err(QueueError::Duplicate(_)) => Requeue::AlreadyQueued,
            Err(e) => {
                warn!(message_id = %token.message_id, "Unable to requeue: {e}");
                Requeue::Refused
            }
        }
    })
}

fn release(context: &DeliveryContext, completion: Completion) {
    if let Some(handle) = completion.token.handle {
        let released = context.signal.with_queue(|queue| queue.release(handle));
        if released.is_none() {
            debug!(
                message_id = %completion.token.message_id,
                "Completion for an entry that already left the queue"
            );
        }
    }
}
