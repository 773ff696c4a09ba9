//! Cyphal/UDP frame format
//!
//! Every frame is one UDP datagram: a 24-byte little-endian header followed
//! by a slice of the transfer payload. The transfer payload is terminated
//! by its CRC-32C, so single-frame transfers carry payload plus four CRC
//! bytes. Subjects and services map to distinct multicast groups on one
//! fixed UDP port.

use crate::core::{NodeId, Priority};
use crate::crc::Crc16;
use crate::udp_media::{IpEndpoint, CYPHAL_PORT};

pub const HEADER_SIZE: usize = 24;
pub const VERSION: u8 = 1;

/// Wire encoding of "no node": anonymous sources, broadcast destinations.
pub const NODE_ID_UNSET: u16 = 0xffff;
pub const NODE_ID_MAX: u16 = 0xfffe;
pub const SUBJECT_ID_MAX: u16 = 0x1fff;
pub const SERVICE_ID_MAX: u16 = 0x1ff;

const DATA_SPECIFIER_SERVICE: u16 = 1 << 15;
const DATA_SPECIFIER_REQUEST: u16 = 1 << 14;

const FRAME_INDEX_EOT: u32 = 1 << 31;

/// Multicast group of a subject: `239.0.0.0 | subject`.
pub fn message_endpoint(subject_id: u16) -> IpEndpoint {
    IpEndpoint {
        address: 0xef00_0000 | u32::from(subject_id & SUBJECT_ID_MAX),
        port: CYPHAL_PORT,
    }
}

/// Multicast group of a node's RPC plane: `239.1.0.0 | node`.
pub fn service_endpoint(node_id: u16) -> IpEndpoint {
    IpEndpoint {
        address: 0xef01_0000 | u32::from(node_id),
        port: CYPHAL_PORT,
    }
}

/// Port addressing and transfer kind, as packed into the data specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSpecifier {
    Message { subject_id: u16 },
    Request { service_id: u16 },
    Response { service_id: u16 },
}

impl DataSpecifier {
    fn pack(self) -> u16 {
        match self {
            DataSpecifier::Message { subject_id } => subject_id & SUBJECT_ID_MAX,
            DataSpecifier::Request { service_id } => {
                DATA_SPECIFIER_SERVICE | DATA_SPECIFIER_REQUEST | (service_id & SERVICE_ID_MAX)
            }
            DataSpecifier::Response { service_id } => {
                DATA_SPECIFIER_SERVICE | (service_id & SERVICE_ID_MAX)
            }
        }
    }

    fn unpack(raw: u16) -> Option<Self> {
        if raw & DATA_SPECIFIER_SERVICE == 0 {
            (raw <= SUBJECT_ID_MAX).then_some(DataSpecifier::Message { subject_id: raw })
        } else {
            let service_id = raw & !(DATA_SPECIFIER_SERVICE | DATA_SPECIFIER_REQUEST);
            if service_id > SERVICE_ID_MAX {
                return None;
            }
            if raw & DATA_SPECIFIER_REQUEST != 0 {
                Some(DataSpecifier::Request { service_id })
            } else {
                Some(DataSpecifier::Response { service_id })
            }
        }
    }
}

/// The decoded 24-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub priority: Priority,
    /// `None` for anonymous publishers.
    pub source: Option<NodeId>,
    /// `None` for broadcast (all message traffic).
    pub destination: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: u64,
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

impl Header {
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = VERSION;
        bytes[1] = self.priority.into_u8();
        let source = self.source.map_or(NODE_ID_UNSET, NodeId::into_u16);
        bytes[2..4].copy_from_slice(&source.to_le_bytes());
        let destination = self.destination.map_or(NODE_ID_UNSET, NodeId::into_u16);
        bytes[4..6].copy_from_slice(&destination.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data_specifier.pack().to_le_bytes());
        bytes[8..16].copy_from_slice(&self.transfer_id.to_le_bytes());
        let index_eot =
            (self.frame_index & !FRAME_INDEX_EOT) | if self.end_of_transfer { FRAME_INDEX_EOT } else { 0 };
        bytes[16..20].copy_from_slice(&index_eot.to_le_bytes());
        // bytes 20..22: user data, transmitted as zero.
        let mut crc = Crc16::new();
        crc.add(&bytes[..22]);
        bytes[22..24].copy_from_slice(&crc.get().to_be_bytes());
        bytes
    }

    /// Parses and validates a header. `None` means the datagram is not a
    /// valid Cyphal/UDP frame and must be ignored.
    pub fn parse(bytes: &[u8]) -> Option<Header> {
        if bytes.len() < HEADER_SIZE || bytes[0] != VERSION {
            return None;
        }
        let mut crc = Crc16::new();
        crc.add(&bytes[..HEADER_SIZE]);
        if !crc.is_residue() {
            return None;
        }

        let priority = Priority::try_from_u8(bytes[1])?;
        let source = u16::from_le_bytes([bytes[2], bytes[3]]);
        let destination = u16::from_le_bytes([bytes[4], bytes[5]]);
        let data_specifier =
            DataSpecifier::unpack(u16::from_le_bytes([bytes[6], bytes[7]]))?;
        let transfer_id = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let index_eot = u32::from_le_bytes(bytes[16..20].try_into().ok()?);

        let source = match source {
            NODE_ID_UNSET => None,
            value => Some(NodeId::new(value)?),
        };
        let destination = match destination {
            NODE_ID_UNSET => None,
            value => Some(NodeId::new(value)?),
        };

        Some(Header {
            priority,
            source,
            destination,
            data_specifier,
            transfer_id,
            frame_index: index_eot & !FRAME_INDEX_EOT,
            end_of_transfer: index_eot & FRAME_INDEX_EOT != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            priority: Priority::Fast,
            source: NodeId::new(0x31),
            destination: NodeId::new(0x107),
            data_specifier: DataSpecifier::Request { service_id: 0x181 },
            transfer_id: 0xdead_beef_cafe,
            frame_index: 3,
            end_of_transfer: true,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let original = header();
        let bytes = original.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Header::parse(&bytes), Some(original));
    }

    #[test]
    fn test_header_field_layout() {
        let bytes = header().serialize();
        assert_eq!(bytes[0], 1); // version
        assert_eq!(bytes[1], 2); // Fast
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 0x31);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x107);
        // Request: service bit | request bit | service id.
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0xc181);
        assert_eq!(
            u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            0xdead_beef_cafe
        );
        assert_eq!(
            u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            (1 << 31) | 3
        );
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 0);
    }

    #[test]
    fn test_corrupted_header_rejected() {
        let mut bytes = header().serialize();
        bytes[9] ^= 0x01;
        assert_eq!(Header::parse(&bytes), None);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut bytes = header().serialize();
        bytes[0] = 0;
        assert_eq!(Header::parse(&bytes), None);
    }

    #[test]
    fn test_broadcast_and_anonymous_sentinels() {
        let mut h = header();
        h.source = None;
        h.destination = None;
        h.data_specifier = DataSpecifier::Message { subject_id: 0x123 };
        let bytes = h.serialize();
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), NODE_ID_UNSET);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), NODE_ID_UNSET);
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed.source, None);
        assert_eq!(parsed.destination, None);
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(message_endpoint(0x1234).address, 0xef00_1234);
        assert_eq!(message_endpoint(0x1234).port, CYPHAL_PORT);
        assert_eq!(service_endpoint(0x0045).address, 0xef01_0045);
    }
}
