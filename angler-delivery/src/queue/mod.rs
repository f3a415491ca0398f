//! Due-time ordered queue of message IDs

use std::{cmp::Reverse, collections::BinaryHeap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::MessageId;

/// Shared priority queue of messages waiting for an attempt.
///
/// Entries are ordered by due time, ties broken by message ID (ULIDs sort by
/// creation). The queue holds IDs only; whether an entry is still eligible is
/// decided by the state machine when it is popped, so stale entries are
/// harmless.
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, MessageId)>>>,
    notify: Notify,
}

enum Head {
    Ready(MessageId),
    Wait(std::time::Duration),
    Empty,
}

impl DueQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: MessageId, due: DateTime<Utc>) {
        self.heap.lock().push(Reverse((due, id)));
        self.notify.notify_waiters();
    }

    /// Pop up to `max` entries that are due at `now`, in order.
    pub fn try_pop_due(&self, max: usize, now: DateTime<Utc>) -> Vec<MessageId> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();

        while due.len() < max && heap.peek().is_some_and(|Reverse((at, _))| *at <= now) {
            if let Some(Reverse((_, id))) = heap.pop() {
                due.push(id);
            }
        }

        due
    }

    /// Wait until the head of the queue is due, then pop it.
    ///
    /// Cancel safe: nothing is removed unless this returns.
    pub async fn next(&self) -> MessageId {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.head(Utc::now()) {
                Head::Ready(id) => return id,
                Head::Wait(delay) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = &mut notified => {}
                    }
                }
                Head::Empty => notified.await,
            }
        }
    }

    fn head(&self, now: DateTime<Utc>) -> Head {
        let mut heap = self.heap.lock();
        let Some(due) = heap.peek().map(|Reverse((due, _))| *due) else {
            return Head::Empty;
        };

        if due > now {
            return Head::Wait((due - now).to_std().unwrap_or_default());
        }

        heap.pop().map_or(Head::Empty, |Reverse((_, id))| Head::Ready(id))
    }

    /// Due time of the head entry.
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().peek().map(|Reverse((due, _))| *due)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
