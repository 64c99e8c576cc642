//! Periodic sweep applying delivery outcomes to the store
//!
//! Every tick:
//! - delivered messages are deleted from the store, a chunk at a time
//! - failed reminders get their send time cleared
//! - queue entries whose completion never arrived are expired
//!
//! Every `clean_period` ticks, rows past their expiry time are deleted too.
//! Store failures are logged and the affected outcomes go back into the
//! ledger for the next tick.

use std::fmt;

use silo_store::{Condition, Connection, MessageId, Op, Value};
use tracing::{debug, error, info, warn};

use crate::{
    ledger::{Flags, LedgerEntry},
    processor::context::DeliveryContext,
};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Delivered rows deleted
    pub deleted: usize,
    /// Failed reminders whose send time was cleared
    pub reset: usize,
    /// Rows evicted for being past their expiry time
    pub expired: usize,
    /// Queue entries dropped for never completing
    pub orphaned: usize,
    /// Store operations that failed
    pub failures: usize,
}

#[derive(Default)]
pub struct Reconciler {
    /// Seconds since the first sweep, advanced by `check_time_secs` per tick
    ticks: u64,
    connection: Option<Box<dyn Connection>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one sweep
    pub fn sweep(&mut self, context: &DeliveryContext, now: i64) -> SweepReport {
        let settings = &context.settings;
        self.ticks = self.ticks.wrapping_add(settings.check_time_secs);

        let mut report = SweepReport::default();
        let ledger = context.ledger.reset();

        if !ledger.is_empty() {
            debug!("Reconciling {} delivery outcomes", ledger.entries.len());
        }

        let (delivered, failed): (Vec<LedgerEntry>, Vec<LedgerEntry>) = ledger
            .entries
            .into_iter()
            .partition(|e| e.flags.contains(Flags::DONE));

        let mut restore = Vec::new();

        for chunk in delivered.chunks(settings.delete_batch_size.max(1)) {
            let ids: Vec<MessageId> = chunk.iter().map(|e| e.message_id).collect();
            let filter = [Condition::any_of(settings.schema.mid.as_str(), ids)];

            match self.with_connection(context, |conn| conn.delete(&filter)) {
                Ok(deleted) => {
                    report.deleted += deleted;
                    record(context, chunk);
                }
                Err(e) => {
                    error!("Failed to delete {} delivered messages: {e}", chunk.len());
                    report.failures += 1;
                    restore.extend_from_slice(chunk);
                }
            }
        }

        for entry in &failed {
            if entry.flags.contains(Flags::REMINDER) {
                let filter = [Condition::eq(settings.schema.mid.as_str(), entry.message_id)];
                let values = [(settings.schema.snd_time.as_str(), Value::Int(0))];

                if let Err(e) = self.with_connection(context, |conn| conn.update(&filter, &values)) {
                    error!(message_id = %entry.message_id, "Failed to reset send time: {e}");
                    report.failures += 1;
                    restore.push(*entry);
                    continue;
                }
                report.reset += 1;
            }
            record(context, std::slice::from_ref(entry));
        }

        if !restore.is_empty() {
            context.ledger.restore(restore);
        }

        let claimed_before = now - settings.in_flight_timeout_secs;
        let orphaned = context
            .signal
            .with_queue(|queue| queue.expire_in_flight(claimed_before));
        if !orphaned.is_empty() {
            warn!(
                "Expired {} queue entries that never completed",
                orphaned.len()
            );
            context.ledger.forget(&orphaned);
            report.orphaned = orphaned.len();
        }

        if self.expiry_due(settings.check_time_secs, settings.clean_period) {
            debug!("Cleaning expired messages");
            let filter = [Condition::new(
                settings.schema.exp_time.as_str(),
                Op::Leq,
                now,
            )];

            match self.with_connection(context, |conn| conn.delete(&filter)) {
                Ok(expired) => report.expired = expired,
                Err(e) => {
                    error!("Failed to clean expired messages: {e}");
                    report.failures += 1;
                }
            }
        }

        if report.deleted > 0 || report.expired > 0 || report.orphaned > 0 {
            info!(
                deleted = report.deleted,
                reset = report.reset,
                expired = report.expired,
                orphaned = report.orphaned,
                ticks = self.ticks,
                "Reconciled store"
            );
        }

        report
    }

    const fn expiry_due(&self, check_time: u64, clean_period: u64) -> bool {
        let period = check_time.saturating_mul(clean_period);
        period == 0 || self.ticks % period < check_time
    }

    fn with_connection<T>(
        &mut self,
        context: &DeliveryContext,
        f: impl FnOnce(&mut dyn Connection) -> silo_store::Result<T>,
    ) -> silo_store::Result<T> {
        if self.connection.is_none() {
            self.connection = Some(context.connect()?);
        }

        let Some(conn) = self.connection.as_mut() else {
            return Err(silo_store::StoreError::Unavailable(
                "no connection".to_string(),
            ));
        };

        let result = f(conn.as_mut());
        if result.is_err() {
            // Reconnect on the next operation
            self.connection = None;
        }
        result
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("ticks", &self.ticks)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

fn record(context: &DeliveryContext, entries: &[LedgerEntry]) {
    for entry in entries {
        context.stats.record_outcome(
            entry.flags.contains(Flags::REMINDER),
            entry.flags.contains(Flags::DONE),
        );
    }
}
