//! Retry queue: pending (re)delivery attempts in arrival order
//!
//! Entries live in a slab and are chained into a FIFO list through slot
//! indices. Peeking claims entries for one worker without freeing them; the
//! slot stays owned by the queue until the attempt is released, requeued, or
//! expired. Handles carry a generation so a late completion for a reused slot
//! is detected instead of acting on the wrong message.
//!
//! The queue itself is not synchronized: it lives inside the wake signal's
//! mutex together with the running flag.

use ahash::AHashMap;
use silo_store::MessageId;

use crate::error::QueueError;

/// Stable reference to a queue slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: u32,
    generation: u32,
}

/// Snapshot of one pending delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEntry {
    pub handle: EntryHandle,
    pub message_id: MessageId,
    pub retry_count: u32,
    /// Earliest unix time the attempt may be sent
    pub not_before: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Queued,
    /// Claimed by a worker at the given unix time
    InFlight(i64),
}

#[derive(Debug)]
struct Node {
    message_id: MessageId,
    retry_count: u32,
    not_before: i64,
    state: State,
    linked: bool,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    index: AHashMap<MessageId, u32>,
    queued: usize,
    capacity: Option<usize>,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue holding at most `capacity` entries, queued and in flight
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Append an attempt at the tail
    ///
    /// # Errors
    /// [`QueueError::Duplicate`] if the message already has an entry, and
    /// [`QueueError::Exhausted`] when the queue is full. Either way the
    /// message is still in the store and will be found again by a later dump.
    pub fn add(
        &mut self,
        message_id: MessageId,
        retry_count: u32,
        not_before: i64,
    ) -> Result<EntryHandle, QueueError> {
        if self.index.contains_key(&message_id) {
            return Err(QueueError::Duplicate(message_id));
        }

        if let Some(capacity) = self.capacity
            && self.index.len() >= capacity
        {
            return Err(QueueError::Exhausted { capacity });
        }

        let node = Node {
            message_id,
            retry_count,
            not_before,
            state: State::Queued,
            linked: false,
            prev: None,
            next: None,
        };

        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].node = Some(node);
            slot
        } else {
            let slot = u32::try_from(self.slots.len()).map_err(|_| QueueError::Exhausted {
                capacity: self.slots.len(),
            })?;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            slot
        };

        self.index.insert(message_id, slot);
        self.link_tail(slot);
        self.queued += 1;

        Ok(EntryHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        })
    }

    /// Claim up to `max` of the oldest queued entries
    ///
    /// Claimed entries stay linked and owned by the queue, but are not handed
    /// out again until they are requeued.
    pub fn peek_batch(&mut self, max: usize, now: i64) -> Vec<RetryEntry> {
        let mut batch = Vec::with_capacity(max.min(self.queued));
        let mut cursor = self.head;

        while let Some(slot) = cursor {
            if batch.len() >= max {
                break;
            }

            let generation = self.slots[slot as usize].generation;
            let Some(node) = self.slots[slot as usize].node.as_mut() else {
                break;
            };
            cursor = node.next;

            if node.state == State::Queued {
                node.state = State::InFlight(now);
                batch.push(RetryEntry {
                    handle: EntryHandle { slot, generation },
                    message_id: node.message_id,
                    retry_count: node.retry_count,
                    not_before: node.not_before,
                });
            }
        }

        self.queued -= batch.len();
        batch
    }

    /// `true` when nothing is waiting to be peeked
    pub const fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Unlink a processed batch from the list
    ///
    /// The entries themselves stay allocated until their completion releases
    /// or requeues them. Entries that have already been requeued are left
    /// where they are.
    pub fn remove_links(&mut self, batch: &[RetryEntry]) {
        for entry in batch {
            let in_flight = self
                .node(entry.handle)
                .is_some_and(|node| node.linked && matches!(node.state, State::InFlight(_)));

            if in_flight {
                self.unlink(entry.handle.slot);
            }
        }
    }

    /// Reuse an entry's slot for its next attempt, linking it at the tail
    ///
    /// Returns `false` if the handle is stale.
    pub fn requeue(&mut self, handle: EntryHandle, retry_count: u32, not_before: i64) -> bool {
        let Some(node) = self.node_mut(handle) else {
            return false;
        };

        let was_queued = node.state == State::Queued;
        node.retry_count = retry_count;
        node.not_before = not_before;
        node.state = State::Queued;

        if node.linked {
            self.unlink(handle.slot);
        }
        self.link_tail(handle.slot);

        if !was_queued {
            self.queued += 1;
        }
        true
    }

    /// Free an entry once its attempt is final
    ///
    /// Returns the entry as it was, or `None` for a stale handle.
    pub fn release(&mut self, handle: EntryHandle) -> Option<RetryEntry> {
        let node = self.node(handle)?;
        let entry = RetryEntry {
            handle,
            message_id: node.message_id,
            retry_count: node.retry_count,
            not_before: node.not_before,
        };
        let (linked, queued) = (node.linked, node.state == State::Queued);

        if linked {
            self.unlink(handle.slot);
        }
        if queued {
            self.queued -= 1;
        }

        let slot = &mut self.slots[handle.slot as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        self.index.remove(&entry.message_id);

        Some(entry)
    }

    /// Free a message's entry if no worker has claimed it yet
    ///
    /// Returns the entry, or `None` when the message has no entry or its
    /// entry is in flight.
    pub fn cancel_queued(&mut self, message_id: MessageId) -> Option<RetryEntry> {
        let handle = self.handle_of(message_id)?;
        if self.node(handle)?.state != State::Queued {
            return None;
        }
        self.release(handle)
    }

    /// Current handle for a message, if it has an entry
    pub fn handle_of(&self, message_id: MessageId) -> Option<EntryHandle> {
        self.index.get(&message_id).map(|slot| EntryHandle {
            slot: *slot,
            generation: self.slots[*slot as usize].generation,
        })
    }

    /// Free claimed entries whose completion never came back
    ///
    /// Returns the identifiers of the messages dropped from the queue.
    pub fn expire_in_flight(&mut self, claimed_before: i64) -> Vec<MessageId> {
        let stale: Vec<EntryHandle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| match s.node.as_ref()?.state {
                State::InFlight(since) if since < claimed_before => Some(EntryHandle {
                    slot: u32::try_from(slot).ok()?,
                    generation: s.generation,
                }),
                _ => None,
            })
            .collect();

        stale
            .into_iter()
            .filter_map(|handle| self.release(handle))
            .map(|entry| entry.message_id)
            .collect()
    }

    /// Entries owned by the queue, queued or in flight
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Entries claimed by a worker and awaiting completion
    pub fn in_flight(&self) -> usize {
        self.index.len() - self.queued
    }

    /// The message's entry, queued or in flight
    pub fn get(&self, message_id: MessageId) -> Option<RetryEntry> {
        let handle = self.handle_of(message_id)?;
        let node = self.node(handle)?;
        Some(RetryEntry {
            handle,
            message_id,
            retry_count: node.retry_count,
            not_before: node.not_before,
        })
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.index.contains_key(&message_id)
    }

    fn node(&self, handle: EntryHandle) -> Option<&Node> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation == handle.generation {
            slot.node.as_ref()
        } else {
            None
        }
    }

    fn node_mut(&mut self, handle: EntryHandle) -> Option<&mut Node> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation == handle.generation {
            slot.node.as_mut()
        } else {
            None
        }
    }

    fn link_tail(&mut self, slot: u32) {
        let old_tail = self.tail;

        if let Some(node) = self.slots[slot as usize].node.as_mut() {
            node.prev = old_tail;
            node.next = None;
            node.linked = true;
        }

        match old_tail.and_then(|t| self.slots[t as usize].node.as_mut()) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn unlink(&mut self, slot: u32) {
        let Some(node) = self.slots[slot as usize].node.as_mut() else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        node.linked = false;

        match prev.and_then(|p| self.slots[p as usize].node.as_mut()) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slots[n as usize].node.as_mut()) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn mid(id: i64) -> MessageId {
        MessageId::new(id)
    }

    fn ids(batch: &[RetryEntry]) -> Vec<i64> {
        batch.iter().map(|e| e.message_id.get()).collect()
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut queue = RetryQueue::new();

        queue.add(mid(1), 0, 0).unwrap();
        assert_eq!(queue.add(mid(1), 3, 0), Err(QueueError::Duplicate(mid(1))));
        assert_eq!(queue.len(), 1);

        // Still a duplicate while in flight
        let batch = queue.peek_batch(10, 0);
        queue.remove_links(&batch);
        assert_eq!(queue.add(mid(1), 0, 0), Err(QueueError::Duplicate(mid(1))));
    }

    #[test]
    fn test_peek_batch_is_fifo_and_claims() {
        let mut queue = RetryQueue::new();
        for id in [5, 3, 9, 1] {
            queue.add(mid(id), 0, 0).unwrap();
        }

        let first = queue.peek_batch(3, 100);
        assert_eq!(ids(&first), vec![5, 3, 9]);
        assert!(!queue.is_empty());

        let second = queue.peek_batch(3, 100);
        assert_eq!(ids(&second), vec![1]);
        assert!(queue.is_empty());
        assert!(queue.peek_batch(3, 100).is_empty());

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.in_flight(), 4);
    }

    #[test]
    fn test_remove_links_keeps_ownership() {
        let mut queue = RetryQueue::new();
        queue.add(mid(1), 0, 0).unwrap();
        queue.add(mid(2), 0, 0).unwrap();

        let batch = queue.peek_batch(1, 0);
        queue.remove_links(&batch);

        assert!(queue.contains(mid(1)));
        assert_eq!(ids(&queue.peek_batch(10, 0)), vec![2]);

        let released = queue.release(batch[0].handle).unwrap();
        assert_eq!(released.message_id, mid(1));
        assert!(!queue.contains(mid(1)));
    }

    #[test]
    fn test_requeue_moves_to_tail_with_new_counter() {
        let mut queue = RetryQueue::new();
        queue.add(mid(1), 0, 0).unwrap();
        queue.add(mid(2), 0, 0).unwrap();

        let batch = queue.peek_batch(1, 0);
        queue.remove_links(&batch);
        assert!(queue.requeue(batch[0].handle, 1, 50));

        let next = queue.peek_batch(10, 0);
        assert_eq!(ids(&next), vec![2, 1]);
        assert_eq!(next[1].retry_count, 1);
        assert_eq!(next[1].not_before, 50);
        assert_eq!(next[1].handle, batch[0].handle);
    }

    #[test]
    fn test_requeue_before_unlink_is_not_unlinked_again() {
        let mut queue = RetryQueue::new();
        queue.add(mid(7), 0, 0).unwrap();

        // Completion raced ahead of the worker's unlink
        let batch = queue.peek_batch(1, 0);
        assert!(queue.requeue(batch[0].handle, 1, 0));
        queue.remove_links(&batch);

        assert!(!queue.is_empty());
        assert_eq!(ids(&queue.peek_batch(1, 0)), vec![7]);
    }

    #[test]
    fn test_stale_handle_after_release() {
        let mut queue = RetryQueue::new();
        let handle = queue.add(mid(1), 0, 0).unwrap();
        queue.release(handle).unwrap();

        let reused = queue.add(mid(2), 0, 0).unwrap();
        assert_ne!(handle, reused);
        assert!(queue.release(handle).is_none());
        assert!(!queue.requeue(handle, 1, 0));
        assert!(queue.contains(mid(2)));
    }

    #[test]
    fn test_release_queued_entry() {
        let mut queue = RetryQueue::new();
        let a = queue.add(mid(1), 0, 0).unwrap();
        queue.add(mid(2), 0, 0).unwrap();

        queue.release(a).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(ids(&queue.peek_batch(10, 0)), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_queued_skips_claimed_entries() {
        let mut queue = RetryQueue::new();
        queue.add(mid(1), 0, 0).unwrap();
        queue.add(mid(2), 0, 0).unwrap();
        let claimed = queue.peek_batch(1, 0);

        assert!(queue.cancel_queued(mid(1)).is_none());
        assert_eq!(queue.cancel_queued(mid(2)).map(|e| e.message_id), Some(mid(2)));
        assert!(queue.cancel_queued(mid(3)).is_none());

        assert_eq!(ids(&claimed), vec![1]);
        assert_eq!(queue.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut queue = RetryQueue::with_capacity(1);
        queue.add(mid(1), 0, 0).unwrap();
        assert_eq!(
            queue.add(mid(2), 0, 0),
            Err(QueueError::Exhausted { capacity: 1 })
        );
    }

    #[test]
    fn test_expire_in_flight() {
        let mut queue = RetryQueue::new();
        queue.add(mid(1), 0, 0).unwrap();
        queue.add(mid(2), 0, 0).unwrap();

        let old = queue.peek_batch(1, 10);
        queue.remove_links(&old);
        let _recent = queue.peek_batch(1, 100);

        assert_eq!(queue.expire_in_flight(50), vec![mid(1)]);
        assert!(!queue.contains(mid(1)));
        assert!(queue.contains(mid(2)));
        assert_eq!(queue.in_flight(), 1);
    }
}
