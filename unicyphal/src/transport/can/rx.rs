//! Transfer reassembly state machine
//!
//! One `Reassembly` instance tracks one (port, source) pair. The rules
//! follow the tail-byte discipline of [1; 4.2.3]; where the document leaves
//! behavior open, the stricter reading wins:
//!
//! * A frame without data carries no tail byte and is ignored.
//! * A start-of-transfer frame must carry the initial toggle value; it
//!   restarts reassembly unconditionally (a new transfer id ends any
//!   unfinished predecessor).
//! * Within a transfer, frames must alternate the toggle. A repeat of the
//!   previous mid-transfer frame is treated as a duplicate and skipped; a
//!   repeat directly after start-of-transfer, or on an end-of-transfer
//!   frame, is a sequencing violation and voids the transfer.
//! * Non-final frames must occupy a full classic or FD MTU.
//! * Frames separated from the start of their transfer by more than the
//!   transfer-id timeout do not belong to it.
//! * The CRC-16 spans everything between the tail bytes, padding included;
//!   a mismatch on the final frame voids the transfer and is reported.
//!
//! Payload is accumulated into an extent-sized buffer; bytes beyond the
//! extent still feed the CRC but are not stored.
//!
//! # References
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>

use log::debug;

use crate::core::{Duration, Priority, TimePoint};
use crate::crc::Crc16;
use crate::mem::{Memory, Payload};
use crate::transport::can::wire::{TailByte, SOT_TOGGLE};
use crate::transport::{AnyFailure, ProtocolError};

/// A fully reassembled transfer, wire fields only.
#[derive(Debug, PartialEq)]
pub(crate) struct CompletedTransfer {
    pub transfer_id: u8,
    pub priority: Priority,
    /// First-frame reception instant.
    pub timestamp: TimePoint,
    pub payload: Payload,
}

#[derive(Debug)]
enum State {
    Idle,
    Assembling(Assembling),
    /// Entered on a sequencing violation; only a new start-of-transfer
    /// frame leaves it.
    Error,
}

#[derive(Debug)]
struct Assembling {
    transfer_id: u8,
    last_toggle: bool,
    sot_timestamp: TimePoint,
    buffer: Payload,
    /// Bytes stored into the buffer (bounded by the extent).
    stored: usize,
    /// Bytes seen on the wire, CRC included.
    total: usize,
    /// Frames accepted so far.
    frames: usize,
    crc: Crc16,
}

/// Reassembly state of one (port, source) pair.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    state: Option<State>,
}

impl Reassembly {
    /// Feeds one frame; returns a completed transfer when this frame
    /// finished one.
    ///
    /// `Err` reports conditions the transient error handler should see:
    /// allocation failure of the reassembly buffer and CRC mismatches.
    pub fn push_frame(
        &mut self,
        memory: &Memory,
        extent: usize,
        timeout: Duration,
        priority: Priority,
        data: &[u8],
        timestamp: TimePoint,
    ) -> Result<Option<CompletedTransfer>, AnyFailure> {
        let Some((&tail_byte, body)) = data.split_last() else {
            return Ok(None);
        };
        let tail = TailByte::from(tail_byte);

        if tail.sot() {
            return self.start(memory, extent, tail, body, priority, timestamp);
        }

        let state = self.state.take().unwrap_or(State::Idle);
        let State::Assembling(assembling) = state else {
            self.state = Some(state);
            return Ok(None);
        };
        self.continue_transfer(assembling, extent, timeout, tail, body, priority, timestamp)
    }

    fn start(
        &mut self,
        memory: &Memory,
        extent: usize,
        tail: TailByte,
        body: &[u8],
        priority: Priority,
        timestamp: TimePoint,
    ) -> Result<Option<CompletedTransfer>, AnyFailure> {
        if tail.toggle() != SOT_TOGGLE {
            debug!("can rx: sot frame with inverted toggle, transfer voided");
            self.state = Some(State::Error);
            return Ok(None);
        }

        if tail.eot() {
            self.state = Some(State::Idle);
            let length = body.len().min(extent);
            let mut payload = memory.allocate(length).ok_or(AnyFailure::Memory)?;
            payload.copy_from_slice(&body[..length]);
            return Ok(Some(CompletedTransfer {
                transfer_id: tail.transfer_id(),
                priority,
                timestamp,
                payload,
            }));
        }

        // First frame of a multi-frame transfer must fill an MTU.
        if !is_full_mtu(data_len(body)) {
            self.state = Some(State::Error);
            return Ok(None);
        }

        let buffer = match memory.allocate(extent) {
            Some(buffer) => buffer,
            None => {
                self.state = Some(State::Idle);
                return Err(AnyFailure::Memory);
            }
        };
        let mut assembling = Assembling {
            transfer_id: tail.transfer_id(),
            last_toggle: SOT_TOGGLE,
            sot_timestamp: timestamp,
            buffer,
            stored: 0,
            total: 0,
            frames: 1,
            crc: Crc16::new(),
        };
        assembling.append(body, extent);
        self.state = Some(State::Assembling(assembling));
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn continue_transfer(
        &mut self,
        mut assembling: Assembling,
        extent: usize,
        timeout: Duration,
        tail: TailByte,
        body: &[u8],
        priority: Priority,
        timestamp: TimePoint,
    ) -> Result<Option<CompletedTransfer>, AnyFailure> {
        let belongs = tail.transfer_id() == assembling.transfer_id
            && timestamp <= assembling.sot_timestamp + timeout;
        if !belongs {
            debug!("can rx: stray continuation frame, transfer voided");
            self.state = Some(State::Error);
            return Ok(None);
        }

        if tail.toggle() == assembling.last_toggle {
            // A duplicate of the previous frame is tolerated mid-transfer;
            // anywhere else a repeated toggle voids the transfer.
            if !tail.eot() && assembling.frames > 1 {
                self.state = Some(State::Assembling(assembling));
                return Ok(None);
            }
            self.state = Some(State::Error);
            return Ok(None);
        }

        if tail.eot() {
            if body.is_empty() {
                self.state = Some(State::Error);
                return Ok(None);
            }
            assembling.append(body, extent);
            if !assembling.crc.is_residue() || assembling.total < Crc16::LENGTH {
                self.state = Some(State::Error);
                return Err(AnyFailure::Protocol(ProtocolError::CrcMismatch));
            }
            self.state = Some(State::Idle);
            let mut payload = assembling.buffer;
            payload.set_len((assembling.total - Crc16::LENGTH).min(extent));
            return Ok(Some(CompletedTransfer {
                transfer_id: assembling.transfer_id,
                priority,
                timestamp: assembling.sot_timestamp,
                payload,
            }));
        }

        if !is_full_mtu(data_len(body)) {
            self.state = Some(State::Error);
            return Ok(None);
        }
        assembling.last_toggle = tail.toggle();
        assembling.frames += 1;
        assembling.append(body, extent);
        self.state = Some(State::Assembling(assembling));
        Ok(None)
    }

    /// Whether this pair holds partial state older than `timeout`.
    pub fn is_stale(&self, now: TimePoint, timeout: Duration) -> bool {
        match &self.state {
            Some(State::Assembling(a)) => now > a.sot_timestamp + timeout,
            _ => false,
        }
    }
}

impl Assembling {
    fn append(&mut self, body: &[u8], extent: usize) {
        let space = extent - self.stored.min(extent);
        let copy = body.len().min(space);
        self.buffer[self.stored..self.stored + copy].copy_from_slice(&body[..copy]);
        self.stored += copy;
        self.total += body.len();
        self.crc.add(body);
    }
}

fn data_len(body: &[u8]) -> usize {
    body.len() + 1
}

fn is_full_mtu(frame_len: usize) -> bool {
    frame_len == 8 || frame_len == 64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapMemory;
    use alloc::rc::Rc;

    const TIMEOUT: Duration = Duration::from_millis(200);
    const PRIORITY: Priority = Priority::Nominal;

    fn memory() -> Memory {
        Memory::new(Rc::new(HeapMemory))
    }

    fn ts(ms: i64) -> TimePoint {
        TimePoint::EPOCH + Duration::from_millis(ms)
    }

    fn push(
        r: &mut Reassembly,
        memory: &Memory,
        extent: usize,
        data: &[u8],
        at: TimePoint,
    ) -> Result<Option<CompletedTransfer>, AnyFailure> {
        r.push_frame(memory, extent, TIMEOUT, PRIORITY, data, at)
    }

    #[test]
    fn test_single_frame_transfer() {
        let memory = memory();
        let mut r = Reassembly::default();

        let transfer = push(&mut r, &memory, 8, &[42, 147, 0b111_11101], ts(0))
            .unwrap()
            .unwrap();
        assert_eq!(transfer.transfer_id, 0x1d);
        assert_eq!(transfer.timestamp, ts(0));
        assert_eq!(&transfer.payload[..], &[42, 147]);
    }

    #[test]
    fn test_two_frame_transfer_with_extent_truncation() {
        let memory = memory();
        let mut r = Reassembly::default();

        // "0123456789" with CRC 0x7d61, split 7 + 3+crc, tid 0x1e.
        let first = [b'0', b'1', b'2', b'3', b'4', b'5', b'6', 0b101_11110];
        let second = [b'7', b'8', b'9', 0x7d, 0x61, 0b010_11110];

        assert!(push(&mut r, &memory, 8, &first, ts(0)).unwrap().is_none());
        let transfer = push(&mut r, &memory, 8, &second, ts(10))
            .unwrap()
            .unwrap();
        assert_eq!(transfer.transfer_id, 0x1e);
        assert_eq!(transfer.timestamp, ts(0));
        assert_eq!(&transfer.payload[..], b"01234567");
    }

    #[test]
    fn test_crc_mismatch_is_reported() {
        let memory = memory();
        let mut r = Reassembly::default();

        let first = [b'0', b'1', b'2', b'3', b'4', b'5', b'6', 0b101_11110];
        let second = [b'7', b'8', b'9', 0x7d, 0x62, 0b010_11110];

        assert!(push(&mut r, &memory, 16, &first, ts(0)).unwrap().is_none());
        assert_eq!(
            push(&mut r, &memory, 16, &second, ts(10)),
            Err(AnyFailure::Protocol(ProtocolError::CrcMismatch))
        );
    }

    #[test]
    fn test_empty_frame_is_ignored() {
        let memory = memory();
        let mut r = Reassembly::default();
        assert!(push(&mut r, &memory, 8, &[], ts(0)).unwrap().is_none());
    }

    #[test]
    fn test_continuation_without_start_is_ignored() {
        let memory = memory();
        let mut r = Reassembly::default();
        assert!(push(&mut r, &memory, 8, &[1, 0b010_11110], ts(0))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_mid_frame_is_skipped() {
        let memory = memory();
        let mut r = Reassembly::default();

        let payload: alloc::vec::Vec<u8> = (0u8..13).collect();
        let mut crc = Crc16::new();
        crc.add(&payload);
        let crc = crc.get().to_be_bytes();

        let f0 = [0, 1, 2, 3, 4, 5, 6, 0b101_00001];
        let f1 = [7, 8, 9, 10, 11, 12, crc[0], 0b000_00001];
        let f2 = [crc[1], 0b011_00001];

        assert!(push(&mut r, &memory, 16, &f0, ts(0)).unwrap().is_none());
        assert!(push(&mut r, &memory, 16, &f1, ts(1)).unwrap().is_none());
        assert!(push(&mut r, &memory, 16, &f1, ts(2)).unwrap().is_none());
        let transfer = push(&mut r, &memory, 16, &f2, ts(3)).unwrap().unwrap();
        assert_eq!(&transfer.payload[..], &payload[..]);
    }

    #[test]
    fn test_timeout_voids_transfer() {
        let memory = memory();
        let mut r = Reassembly::default();

        let first = [b'0', b'1', b'2', b'3', b'4', b'5', b'6', 0b101_11110];
        let second = [b'7', b'8', b'9', 0x7d, 0x61, 0b010_11110];

        assert!(push(&mut r, &memory, 8, &first, ts(0)).unwrap().is_none());
        assert!(push(&mut r, &memory, 8, &second, ts(300)).unwrap().is_none());
    }

    #[test]
    fn test_interrupting_transfer_id_voids_transfer() {
        let memory = memory();
        let mut r = Reassembly::default();

        let first = [0, 1, 2, 3, 4, 5, 6, 0b101_11110];
        // Continuation of a different transfer id.
        let stray = [9, 0b000_11111];
        let second = [7, 0x17, 0x8d, 0b010_11110];

        assert!(push(&mut r, &memory, 8, &first, ts(0)).unwrap().is_none());
        assert!(push(&mut r, &memory, 8, &stray, ts(1)).unwrap().is_none());
        assert!(push(&mut r, &memory, 8, &second, ts(2)).unwrap().is_none());
    }

    #[test]
    fn test_sot_restarts_unfinished_transfer() {
        let memory = memory();
        let mut r = Reassembly::default();

        let unfinished = [0, 1, 2, 3, 4, 5, 6, 0b101_00001];
        assert!(push(&mut r, &memory, 8, &unfinished, ts(0)).unwrap().is_none());

        let single = [5, 0b111_00010];
        let transfer = push(&mut r, &memory, 8, &single, ts(1)).unwrap().unwrap();
        assert_eq!(transfer.transfer_id, 2);
        assert_eq!(&transfer.payload[..], &[5]);
    }

    #[test]
    fn test_stale_detection() {
        let memory = memory();
        let mut r = Reassembly::default();
        assert!(!r.is_stale(ts(1000), TIMEOUT));

        let first = [0, 1, 2, 3, 4, 5, 6, 0b101_00001];
        assert!(push(&mut r, &memory, 8, &first, ts(0)).unwrap().is_none());
        assert!(!r.is_stale(ts(100), TIMEOUT));
        assert!(r.is_stale(ts(300), TIMEOUT));
    }
}
