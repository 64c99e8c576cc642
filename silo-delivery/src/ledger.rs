//! Per-message delivery outcomes awaiting reconciliation with the store

use std::{fmt, ops::BitOr};

use ahash::AHashMap;
use parking_lot::Mutex;
use silo_store::MessageId;

/// Delivery status bits of a ledger entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Self = Self(0);
    /// Handed to a worker, outcome pending
    pub const SENT: Self = Self(1);
    /// The send was a reminder rather than a redelivery
    pub const REMINDER: Self = Self(1 << 1);
    pub const DONE: Self = Self(1 << 2);
    pub const ERROR: Self = Self(1 << 3);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` once `DONE` or `ERROR` is set
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.0 & (Self::DONE.0 | Self::ERROR.0) != 0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::SENT, "SENT"),
            (Self::REMINDER, "REMINDER"),
            (Self::DONE, "DONE"),
            (Self::ERROR, "ERROR"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();

        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub message_id: MessageId,
    pub flags: Flags,
    pub retry_count: u32,
}

/// What [`Ledger::check_message`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStatus {
    pub already_handled: bool,
    pub retry_count: u32,
    pub flags: Flags,
}

/// Terminal entries detached by [`Ledger::reset`]
#[derive(Debug, Default)]
pub struct LedgerSweep {
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSweep {
    /// Identifiers of delivered messages, ascending
    pub fn done(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|e| e.flags.contains(Flags::DONE))
            .map(|e| e.message_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Failed reminder sends, whose send time goes back to "not yet sent"
    pub fn failed_reminders(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|e| e.flags.contains(Flags::ERROR | Flags::REMINDER))
            .map(|e| e.message_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Status ledger
///
/// Written by the dump path and the completion handler, drained by the
/// reconciler. The lock is only held for map operations, never across store
/// I/O.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Mutex<AHashMap<MessageId, LedgerEntry>>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a message up, registering it as `SENT` when it is unknown
    ///
    /// Registering on a miss closes the window in which two dumps could both
    /// see the message as new and enqueue it twice.
    pub fn check_message(&self, message_id: MessageId) -> MessageStatus {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&message_id) {
            return MessageStatus {
                already_handled: true,
                retry_count: entry.retry_count,
                flags: entry.flags,
            };
        }

        entries.insert(
            message_id,
            LedgerEntry {
                message_id,
                flags: Flags::SENT,
                retry_count: 0,
            },
        );

        MessageStatus {
            already_handled: false,
            retry_count: 0,
            flags: Flags::NONE,
        }
    }

    /// OR `flag` into the message's entry, creating it if absent
    ///
    /// Entries that already carry a terminal marker are left untouched.
    /// Returns `false` in that case.
    pub fn set_flag(&self, message_id: MessageId, flag: Flags) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(message_id).or_insert(LedgerEntry {
            message_id,
            flags: Flags::NONE,
            retry_count: 0,
        });

        if entry.flags.is_terminal() {
            return false;
        }

        entry.flags = entry.flags | flag;
        true
    }

    /// Record the attempt number of an in-flight message
    pub fn set_retry(&self, message_id: MessageId, retry_count: u32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&message_id)
            && !entry.flags.is_terminal()
        {
            entry.retry_count = retry_count;
        }
    }

    /// Detach every terminal entry for reconciliation
    ///
    /// In-flight entries stay so that duplicate detection keeps working while
    /// their sends are outstanding.
    pub fn reset(&self) -> LedgerSweep {
        let mut entries = self.entries.lock();
        let terminal: Vec<MessageId> = entries
            .values()
            .filter(|e| e.flags.is_terminal())
            .map(|e| e.message_id)
            .collect();

        LedgerSweep {
            entries: terminal
                .into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect(),
        }
    }

    /// Put back outcomes a sweep could not apply
    pub fn restore(&self, detached: Vec<LedgerEntry>) {
        let mut entries = self.entries.lock();
        for entry in detached {
            let settled = entries
                .get(&entry.message_id)
                .is_some_and(|current| current.flags.is_terminal());

            if !settled {
                entries.insert(entry.message_id, entry);
            }
        }
    }

    /// Drop the non-terminal entries of `ids`
    pub fn forget(&self, ids: &[MessageId]) {
        let mut entries = self.entries.lock();
        for id in ids {
            if entries.get(id).is_some_and(|e| !e.flags.is_terminal()) {
                entries.remove(id);
            }
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<LedgerEntry> {
        self.entries.lock().get(&message_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
