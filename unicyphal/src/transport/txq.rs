//! Deadline-ordered outgoing frame queue, shared by both transports
//!
//! Frames leave in (deadline ascending, priority descending, insertion)
//! order. Capacity is fixed at transport creation; segmentation code checks
//! room up front so a transfer is queued either completely or not at all.

use alloc::collections::BTreeMap;

use crate::core::{Priority, TimePoint};

/// What the queue needs to know about a frame.
pub(crate) trait QueuedFrame {
    /// Groups the frames of one transfer for whole-transfer drops.
    fn transfer_seq(&self) -> u64;
}

type QueueKey = (TimePoint, u8, u64);

#[derive(Debug)]
pub(crate) struct TxQueue<F> {
    frames: BTreeMap<QueueKey, F>,
    capacity: usize,
}

impl<F: QueuedFrame> TxQueue<F> {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn has_room_for(&self, frame_count: usize) -> bool {
        self.frames.len() + frame_count <= self.capacity
    }

    pub fn front(&self) -> Option<&F> {
        self.frames.values().next()
    }

    pub fn pop_front(&mut self) -> Option<F> {
        let key = *self.frames.keys().next()?;
        self.frames.remove(&key)
    }

    pub fn insert(&mut self, deadline: TimePoint, priority: Priority, seq: u64, frame: F) {
        self.frames.insert((deadline, priority.into_u8(), seq), frame);
    }

    /// Removes every frame of the given transfer; their buffers return to
    /// the memory resource as they drop.
    pub fn drop_transfer(&mut self, transfer_seq: u64) {
        self.frames
            .retain(|_key, frame| frame.transfer_seq() != transfer_seq);
    }
}
