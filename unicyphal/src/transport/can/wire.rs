//! Cyphal/CAN frame format [1; 4.2]
//!
//! The 29-bit CAN identifier encodes priority, transfer kind, port id and
//! node addresses; the last data byte of every frame is the tail byte
//! carrying the reassembly discipline bits and the 5-bit transfer id.
//!
//! # References
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>

use embedded_can::ExtendedId;

use crate::can_media::Filter;
use crate::core::{NodeId, Priority, ServiceId, SubjectId};

pub const NODE_ID_MAX: u16 = 0x7f;
pub const SERVICE_ID_MAX: u16 = 0x1ff;
pub const SUBJECT_ID_MAX: u16 = 0x1fff;

/// The wire transfer-id counter is 5 bits wide.
pub const TRANSFER_ID_MODULO: u64 = 32;

const FLAG_SERVICE_NOT_MESSAGE: u32 = 1 << 25;
const FLAG_ANONYMOUS: u32 = 1 << 24;
const FLAG_REQUEST_NOT_RESPONSE: u32 = 1 << 24;
const FLAG_RESERVED_23: u32 = 1 << 23;
// Message-frame reserved bits 21/22, transmitted as ones, ignored on RX.
const MESSAGE_RESERVED_BITS: u32 = 0b11 << 21;

const OFFSET_PRIORITY: u32 = 26;
const OFFSET_SUBJECT: u32 = 8;
const OFFSET_SERVICE: u32 = 14;
const OFFSET_DESTINATION: u32 = 7;

/// Decoded form of a frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanId {
    Message {
        priority: Priority,
        subject_id: SubjectId,
        /// `None` for anonymous publishers.
        source: Option<NodeId>,
    },
    Service {
        priority: Priority,
        request_not_response: bool,
        service_id: ServiceId,
        destination: NodeId,
        source: NodeId,
    },
}

impl CanId {
    pub fn priority(&self) -> Priority {
        match *self {
            CanId::Message { priority, .. } | CanId::Service { priority, .. } => priority,
        }
    }

    /// Parses a received identifier. `None` means the frame is not a valid
    /// Cyphal/CAN frame and must be ignored.
    pub fn parse(raw: u32) -> Option<CanId> {
        if raw & FLAG_RESERVED_23 != 0 {
            return None;
        }
        let priority = Priority::from_u8_truncating((raw >> OFFSET_PRIORITY) as u8);
        let source = NodeId::new((raw & NODE_ID_MAX as u32) as u16)?;

        if raw & FLAG_SERVICE_NOT_MESSAGE == 0 {
            let subject_id =
                SubjectId::from_u16_truncating((raw >> OFFSET_SUBJECT) as u16 & SUBJECT_ID_MAX);
            let source = (raw & FLAG_ANONYMOUS == 0).then_some(source);
            Some(CanId::Message {
                priority,
                subject_id,
                source,
            })
        } else {
            let service_id =
                ServiceId::from_u16_truncating((raw >> OFFSET_SERVICE) as u16 & SERVICE_ID_MAX);
            let destination =
                NodeId::new((raw >> OFFSET_DESTINATION) as u16 & NODE_ID_MAX).expect("7-bit field");
            Some(CanId::Service {
                priority,
                request_not_response: raw & FLAG_REQUEST_NOT_RESPONSE != 0,
                service_id,
                destination,
                source,
            })
        }
    }
}

fn extended(raw: u32) -> ExtendedId {
    ExtendedId::new(raw & ExtendedId::MAX.as_raw()).unwrap_or(ExtendedId::ZERO)
}

/// Identifier of a regular (sourced) message frame.
pub fn message_id(priority: Priority, subject_id: u16, source: u16) -> ExtendedId {
    extended(
        (u32::from(priority.into_u8()) << OFFSET_PRIORITY)
            | MESSAGE_RESERVED_BITS
            | (u32::from(subject_id & SUBJECT_ID_MAX) << OFFSET_SUBJECT)
            | u32::from(source & NODE_ID_MAX),
    )
}

/// Identifier of an anonymous message frame; `pseudo_source` provides the
/// collision-avoidance entropy in the source field.
pub fn anonymous_message_id(priority: Priority, subject_id: u16, pseudo_source: u16) -> ExtendedId {
    extended(message_id(priority, subject_id, pseudo_source).as_raw() | FLAG_ANONYMOUS)
}

/// Identifier of a service frame.
pub fn service_id(
    priority: Priority,
    request_not_response: bool,
    service_id: u16,
    destination: u16,
    source: u16,
) -> ExtendedId {
    let rnr = if request_not_response {
        FLAG_REQUEST_NOT_RESPONSE
    } else {
        0
    };
    extended(
        (u32::from(priority.into_u8()) << OFFSET_PRIORITY)
            | FLAG_SERVICE_NOT_MESSAGE
            | rnr
            | (u32::from(service_id & SERVICE_ID_MAX) << OFFSET_SERVICE)
            | (u32::from(destination & NODE_ID_MAX) << OFFSET_DESTINATION)
            | u32::from(source & NODE_ID_MAX),
    )
}

/// Acceptance filter matching one subject.
pub fn subject_filter(subject_id: u16) -> Filter {
    Filter {
        id: u32::from(subject_id & SUBJECT_ID_MAX) << OFFSET_SUBJECT,
        mask: (u32::from(SUBJECT_ID_MAX) << OFFSET_SUBJECT)
            | FLAG_SERVICE_NOT_MESSAGE
            | FLAG_RESERVED_23,
    }
}

/// Acceptance filter matching all service frames addressed to `local`.
pub fn service_filter(local: u16) -> Filter {
    Filter {
        id: (u32::from(local & NODE_ID_MAX) << OFFSET_DESTINATION) | FLAG_SERVICE_NOT_MESSAGE,
        mask: (u32::from(NODE_ID_MAX) << OFFSET_DESTINATION)
            | FLAG_SERVICE_NOT_MESSAGE
            | FLAG_RESERVED_23,
    }
}

/// Toggle bit value of a start-of-transfer frame [1; table 4.4].
pub const SOT_TOGGLE: bool = true;

/// The trailing byte of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailByte(u8);

impl TailByte {
    const SOT: u8 = 1 << 7;
    const EOT: u8 = 1 << 6;
    const TOGGLE: u8 = 1 << 5;

    pub fn new(sot: bool, eot: bool, toggle: bool, transfer_id: u8) -> Self {
        Self(
            (u8::from(sot) * Self::SOT)
                | (u8::from(eot) * Self::EOT)
                | (u8::from(toggle) * Self::TOGGLE)
                | (transfer_id & 0x1f),
        )
    }

    pub fn sot(self) -> bool {
        self.0 & Self::SOT != 0
    }

    pub fn eot(self) -> bool {
        self.0 & Self::EOT != 0
    }

    pub fn toggle(self) -> bool {
        self.0 & Self::TOGGLE != 0
    }

    pub fn transfer_id(self) -> u8 {
        self.0 & 0x1f
    }
}

impl From<u8> for TailByte {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<TailByte> for u8 {
    fn from(value: TailByte) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_encoding() {
        // priority High, request, service 0x17B, destination 0x31, source 0x13
        let id = service_id(Priority::High, true, 0x17b, 0x31, 0x13);
        assert_eq!(id.as_raw(), 0b011_1_1_0_101111011_0110001_0010011);
    }

    #[test]
    fn test_service_id_parse() {
        let parsed = CanId::parse(0b011_1_1_0_101111011_0110001_0010011).unwrap();
        assert_eq!(
            parsed,
            CanId::Service {
                priority: Priority::High,
                request_not_response: true,
                service_id: ServiceId::new(0x17b).unwrap(),
                destination: NodeId::new(0x31).unwrap(),
                source: NodeId::new(0x13).unwrap(),
            }
        );
    }

    #[test]
    fn test_message_id_round_trip() {
        let id = message_id(Priority::Nominal, 6144, 0x7e);
        let parsed = CanId::parse(id.as_raw()).unwrap();
        assert_eq!(
            parsed,
            CanId::Message {
                priority: Priority::Nominal,
                subject_id: SubjectId::new(6144).unwrap(),
                source: Some(NodeId::new(0x7e).unwrap()),
            }
        );
    }

    #[test]
    fn test_anonymous_message_parse() {
        let id = anonymous_message_id(Priority::Low, 10, 0x55);
        match CanId::parse(id.as_raw()).unwrap() {
            CanId::Message { source, .. } => assert_eq!(source, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserved_bit_23_rejects() {
        assert_eq!(CanId::parse(FLAG_RESERVED_23), None);
    }

    #[test]
    fn test_tail_byte() {
        let tail = TailByte::new(true, true, true, 0x1d);
        assert_eq!(u8::from(tail), 0b111_11101);
        assert!(tail.sot() && tail.eot() && tail.toggle());
        assert_eq!(tail.transfer_id(), 0x1d);

        let tail = TailByte::from(0b010_11110);
        assert!(!tail.sot() && tail.eot() && !tail.toggle());
        assert_eq!(tail.transfer_id(), 0x1e);
    }

    #[test]
    fn test_subject_filter_accepts_own_subject_only() {
        let filter = subject_filter(0x123);
        let id = message_id(Priority::Nominal, 0x123, 5).as_raw();
        assert_eq!(id & filter.mask, filter.id);
        let other = message_id(Priority::Nominal, 0x124, 5).as_raw();
        assert_ne!(other & filter.mask, filter.id);
    }

    #[test]
    fn test_service_filter_matches_destination() {
        let filter = service_filter(0x31);
        let id = service_id(Priority::Fast, false, 1, 0x31, 0x13).as_raw();
        assert_eq!(id & filter.mask, filter.id);
        let elsewhere = service_id(Priority::Fast, false, 1, 0x32, 0x13).as_raw();
        assert_ne!(elsewhere & filter.mask, filter.id);
    }
}
