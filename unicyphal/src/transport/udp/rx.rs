//! Transfer reassembly for Cyphal/UDP
//!
//! One `UdpReassembly` instance tracks one (port, source) pair. Frames
//! carry an explicit index; anything out of order voids the transfer (the
//! 64-bit transfer id never wraps, so a lost frame cannot be recovered by
//! a later replica of the same transfer id from the same link — redundancy
//! across links covers that case instead).
//!
//! The transfer payload terminates with its CRC-32C. Because the four CRC
//! bytes may straddle a frame boundary, the accumulator withholds the last
//! four bytes of the stream from both storage and the running checksum
//! until further data proves them to be payload.

use log::debug;

use crate::core::{Duration, Priority, TimePoint};
use crate::crc::Crc32C;
use crate::mem::{Memory, Payload};
use crate::transport::udp::wire::Header;
use crate::transport::{AnyFailure, ProtocolError};

/// A fully reassembled transfer, wire fields only.
#[derive(Debug, PartialEq)]
pub(crate) struct CompletedTransfer {
    pub transfer_id: u64,
    pub priority: Priority,
    pub timestamp: TimePoint,
    pub payload: Payload,
}

#[derive(Debug)]
struct Inflight {
    transfer_id: u64,
    next_index: u32,
    sot_timestamp: TimePoint,
    priority: Priority,
    buffer: Payload,
    /// Bytes committed into the buffer (bounded by the extent).
    stored: usize,
    /// Bytes committed to the checksum.
    committed: usize,
    /// The last up-to-four stream bytes, withheld as the candidate CRC.
    held: [u8; 4],
    held_len: usize,
    crc: Crc32C,
}

impl Inflight {
    fn feed(&mut self, bytes: &[u8], extent: usize) {
        for &byte in bytes {
            if self.held_len == 4 {
                let oldest = self.held[0];
                self.held.copy_within(1.., 0);
                self.held[3] = byte;
                self.commit(oldest, extent);
            } else {
                self.held[self.held_len] = byte;
                self.held_len += 1;
            }
        }
    }

    fn commit(&mut self, byte: u8, extent: usize) {
        if self.stored < extent {
            self.buffer[self.stored] = byte;
            self.stored += 1;
        }
        self.committed += 1;
        self.crc.add_byte(byte);
    }

    fn finish(mut self, extent: usize) -> Result<Payload, AnyFailure> {
        if self.held_len < 4 {
            return Err(AnyFailure::Protocol(ProtocolError::MalformedFrame));
        }
        if self.crc.get() != u32::from_le_bytes(self.held) {
            return Err(AnyFailure::Protocol(ProtocolError::CrcMismatch));
        }
        let length = self.committed.min(extent);
        self.buffer.set_len(length);
        Ok(self.buffer)
    }
}

/// Reassembly state of one (port, source) pair.
#[derive(Debug, Default)]
pub(crate) struct UdpReassembly {
    state: Option<Inflight>,
}

impl UdpReassembly {
    /// Feeds one frame; returns a completed transfer when this frame
    /// finished one.
    pub fn push_frame(
        &mut self,
        memory: &Memory,
        extent: usize,
        timeout: Duration,
        header: &Header,
        body: &[u8],
        timestamp: TimePoint,
    ) -> Result<Option<CompletedTransfer>, AnyFailure> {
        if header.frame_index == 0 {
            let buffer = memory.allocate(extent).ok_or(AnyFailure::Memory)?;
            let mut inflight = Inflight {
                transfer_id: header.transfer_id,
                next_index: 1,
                sot_timestamp: timestamp,
                priority: header.priority,
                buffer,
                stored: 0,
                committed: 0,
                held: [0; 4],
                held_len: 0,
                crc: Crc32C::new(),
            };
            inflight.feed(body, extent);
            if header.end_of_transfer {
                self.state = None;
                return finish(inflight, extent);
            }
            self.state = Some(inflight);
            return Ok(None);
        }

        let Some(mut inflight) = self.state.take() else {
            debug!("udp rx: continuation frame without a start, ignored");
            return Ok(None);
        };
        let belongs = inflight.transfer_id == header.transfer_id
            && inflight.next_index == header.frame_index
            && timestamp <= inflight.sot_timestamp + timeout;
        if !belongs {
            debug!("udp rx: out-of-order frame, transfer voided");
            return Ok(None);
        }

        inflight.next_index += 1;
        inflight.feed(body, extent);
        if header.end_of_transfer {
            return finish(inflight, extent);
        }
        self.state = Some(inflight);
        Ok(None)
    }

    /// Whether this pair holds partial state older than `timeout`.
    pub fn is_stale(&self, now: TimePoint, timeout: Duration) -> bool {
        match &self.state {
            Some(inflight) => now > inflight.sot_timestamp + timeout,
            None => false,
        }
    }
}

fn finish(inflight: Inflight, extent: usize) -> Result<Option<CompletedTransfer>, AnyFailure> {
    let transfer_id = inflight.transfer_id;
    let priority = inflight.priority;
    let timestamp = inflight.sot_timestamp;
    let payload = inflight.finish(extent)?;
    Ok(Some(CompletedTransfer {
        transfer_id,
        priority,
        timestamp,
        payload,
    }))
}
