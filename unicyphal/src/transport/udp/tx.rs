//! Outgoing transfer segmentation for Cyphal/UDP

use crate::core::TimePoint;
use crate::crc::Crc32C;
use crate::mem::{Memory, Payload};
use crate::transport::txq::{QueuedFrame, TxQueue};
use crate::transport::udp::wire::{Header, HEADER_SIZE};
use crate::transport::AnyFailure;
use crate::udp_media::IpEndpoint;

/// Transfers use the default DSCP class; QoS remapping belongs to the
/// platform socket configuration.
pub(crate) const DSCP: u8 = 0;

/// One datagram awaiting transmission.
#[derive(Debug)]
pub(crate) struct TxFrame {
    pub deadline: TimePoint,
    pub destination: IpEndpoint,
    /// Full datagram: header plus payload slice.
    pub data: Payload,
    pub transfer_seq: u64,
}

impl QueuedFrame for TxFrame {
    fn transfer_seq(&self) -> u64 {
        self.transfer_seq
    }
}

pub(crate) type UdpTxQueue = TxQueue<TxFrame>;

/// Splits one transfer into datagrams and queues them atomically.
///
/// The logical stream is the payload followed by its CRC-32C
/// (little-endian); each datagram carries the header plus up to
/// `mtu - 24` stream bytes. Either every datagram is queued or none is.
pub(crate) fn push_transfer(
    queue: &mut UdpTxQueue,
    memory: &Memory,
    mtu: usize,
    template: Header,
    destination: IpEndpoint,
    deadline: TimePoint,
    payload: &[u8],
    next_seq: &mut u64,
) -> Result<(), AnyFailure> {
    let chunk = mtu.saturating_sub(HEADER_SIZE).max(1);

    let mut crc = Crc32C::new();
    crc.add(payload);
    let crc_bytes = crc.get().to_le_bytes();

    let stream_len = payload.len() + Crc32C::LENGTH;
    let frame_count = stream_len.div_ceil(chunk);
    if !queue.has_room_for(frame_count) {
        return Err(AnyFailure::Capacity);
    }

    let transfer_seq = *next_seq;
    let mut offset = 0;
    let mut frame_index = 0u32;
    while offset < stream_len {
        let content = chunk.min(stream_len - offset);
        let mut data = match memory.allocate(HEADER_SIZE + content) {
            Some(data) => data,
            None => {
                queue.drop_transfer(transfer_seq);
                return Err(AnyFailure::Memory);
            }
        };
        let header = Header {
            frame_index,
            end_of_transfer: offset + content == stream_len,
            ..template
        };
        data[..HEADER_SIZE].copy_from_slice(&header.serialize());
        for (i, byte) in data[HEADER_SIZE..].iter_mut().enumerate() {
            let index = offset + i;
            *byte = if index < payload.len() {
                payload[index]
            } else {
                crc_bytes[index - payload.len()]
            };
        }

        let seq = bump(next_seq);
        queue.insert(
            deadline,
            template.priority,
            seq,
            TxFrame {
                deadline,
                destination,
                data,
                transfer_seq,
            },
        );
        offset += content;
        frame_index += 1;
    }

    Ok(())
}

fn bump(seq: &mut u64) -> u64 {
    let value = *seq;
    *seq += 1;
    value
}
