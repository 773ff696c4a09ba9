//! Outgoing transfer segmentation for Cyphal/CAN

use embedded_can::ExtendedId;

use crate::can_media::{dlc_ceil, Mtu};
use crate::core::{Priority, TimePoint};
use crate::crc::Crc16;
use crate::mem::{Memory, Payload};
use crate::transport::can::wire::{TailByte, SOT_TOGGLE};
use crate::transport::txq::{QueuedFrame, TxQueue};
use crate::transport::AnyFailure;

/// One wire frame awaiting transmission.
#[derive(Debug)]
pub(crate) struct TxFrame {
    pub deadline: TimePoint,
    pub can_id: ExtendedId,
    /// Full frame data, tail byte included.
    pub data: Payload,
    pub transfer_seq: u64,
}

impl QueuedFrame for TxFrame {
    fn transfer_seq(&self) -> u64 {
        self.transfer_seq
    }
}

pub(crate) type CanTxQueue = TxQueue<TxFrame>;

/// Splits one transfer into frames and queues them atomically.
///
/// Single-frame transfers carry no CRC; multi-frame transfers append the
/// CRC-16 big-endian after the payload, with FD padding (zero bytes,
/// included in the CRC) inserted so every frame lands on a DLC-expressible
/// length. Either every frame is queued or none is.
#[allow(clippy::too_many_arguments)]
pub(crate) fn push_transfer(
    queue: &mut CanTxQueue,
    memory: &Memory,
    mtu: Mtu,
    can_id: ExtendedId,
    deadline: TimePoint,
    priority: Priority,
    transfer_id: u8,
    payload: &[u8],
    next_seq: &mut u64,
) -> Result<(), AnyFailure> {
    let chunk = mtu.as_usize() - 1;

    if payload.len() <= chunk {
        if !queue.has_room_for(1) {
            return Err(AnyFailure::Capacity);
        }
        let padded = dlc_ceil(payload.len() + 1).expect("bounded by mtu");
        let mut data = memory.allocate(padded).ok_or(AnyFailure::Memory)?;
        data[..payload.len()].copy_from_slice(payload);
        let tail = TailByte::new(true, true, SOT_TOGGLE, transfer_id);
        data[padded - 1] = tail.into();

        let seq = bump(next_seq);
        queue.insert(
            deadline,
            priority,
            seq,
            TxFrame {
                deadline,
                can_id,
                data,
                transfer_seq: seq,
            },
        );
        return Ok(());
    }

    // Multi-frame: segment the logical stream payload | padding | crc.
    let core_len = payload.len() + Crc16::LENGTH;
    let frame_count = core_len.div_ceil(chunk);
    let last_content = core_len - (frame_count - 1) * chunk;
    let padding = dlc_ceil(last_content + 1).expect("bounded by mtu") - 1 - last_content;

    let mut crc = Crc16::new();
    crc.add(payload);
    for _ in 0..padding {
        crc.add_byte(0);
    }
    let crc_bytes = crc.get().to_be_bytes();

    if !queue.has_room_for(frame_count) {
        return Err(AnyFailure::Capacity);
    }

    let stream_len = payload.len() + padding + Crc16::LENGTH;
    let transfer_seq = *next_seq;
    let mut toggle = SOT_TOGGLE;
    let mut offset = 0;
    while offset < stream_len {
        let content = chunk.min(stream_len - offset);
        let mut data = match memory.allocate(content + 1) {
            Some(data) => data,
            None => {
                queue.drop_transfer(transfer_seq);
                return Err(AnyFailure::Memory);
            }
        };
        for (i, byte) in data[..content].iter_mut().enumerate() {
            *byte = stream_byte(payload, padding, &crc_bytes, offset + i);
        }
        let sot = offset == 0;
        let eot = offset + content == stream_len;
        data[content] = TailByte::new(sot, eot, toggle, transfer_id).into();
        toggle = !toggle;

        let seq = bump(next_seq);
        queue.insert(
            deadline,
            priority,
            seq,
            TxFrame {
                deadline,
                can_id,
                data,
                transfer_seq,
            },
        );
        offset += content;
    }

    Ok(())
}

fn bump(seq: &mut u64) -> u64 {
    let value = *seq;
    *seq += 1;
    value
}

fn stream_byte(payload: &[u8], padding: usize, crc: &[u8; 2], index: usize) -> u8 {
    if index < payload.len() {
        payload[index]
    } else if index < payload.len() + padding {
        0
    } else {
        crc[index - payload.len() - padding]
    }
}
