//! Cross-media duplicate suppression
//!
//! With redundant media the same transfer arrives once per healthy link;
//! whichever link completes reassembly first wins and the stragglers must
//! be dropped. A small recency cache keyed by (source, transfer id) covers
//! this: entries older than the transfer-id timeout no longer count, which
//! keeps the 5-bit CAN counter safe across wrap-around.

use heapless::Vec;

use crate::core::{Duration, TimePoint, TransferId};

#[derive(Debug, Clone, Copy)]
struct Entry {
    source: u16,
    transfer_id: TransferId,
    timestamp: TimePoint,
}

/// LRU cache of recently completed transfers, bounded capacity.
#[derive(Debug, Default)]
pub struct RecentTransfers {
    // Most recent first.
    entries: Vec<Entry, 8>,
}

impl RecentTransfers {
    /// Records a completed transfer; true when it is new within `timeout`,
    /// false when it duplicates a recently recorded one.
    pub fn insert(
        &mut self,
        source: u16,
        transfer_id: TransferId,
        timestamp: TimePoint,
        timeout: Duration,
    ) -> bool {
        let existing = self
            .entries
            .iter()
            .position(|e| e.source == source && e.transfer_id == transfer_id);

        if let Some(index) = existing {
            let entry = self.entries.remove(index);
            let fresh = timestamp <= entry.timestamp + timeout;
            // Either way the entry moves to the front with its original
            // timestamp kept on duplicates, so a burst of replicas does not
            // extend the suppression window indefinitely.
            let timestamp = if fresh { entry.timestamp } else { timestamp };
            self.push_front(Entry {
                source,
                transfer_id,
                timestamp,
            });
            return !fresh;
        }

        self.push_front(Entry {
            source,
            transfer_id,
            timestamp,
        });
        true
    }

    fn push_front(&mut self, entry: Entry) {
        if self.entries.is_full() {
            self.entries.pop();
        }
        self.entries.insert(0, entry).ok();
    }
}
