//! UDP transport over mock media: redundancy, lifecycle, and the registry
//! provider answering over the real wire format.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use unicyphal::core::{Duration, NodeId, Priority, TimePoint};
use unicyphal::data_types::{ListResponse, LIST_SERVICE_ID};
use unicyphal::registry::{Options, Registry, RegistryProvider};
use unicyphal::transport::udp::wire::{
    message_endpoint, service_endpoint, DataSpecifier, Header, HEADER_SIZE,
};
use unicyphal::transport::udp::UdpTransport;
use unicyphal::transport::{
    AnyFailure, MessageRxParams, MessageRxSession, MessageTxParams, MessageTxSession,
    TransferMetadata, Transport, TxSession,
};

use common::{tracking_memory, MockUdpMedia};

fn at(s: i64) -> TimePoint {
    TimePoint::EPOCH + Duration::from_secs(s)
}

fn ms(value: i64) -> Duration {
    Duration::from_millis(value)
}

/// Payload followed by its CRC-32C, as the wire carries it.
fn with_crc(payload: &[u8]) -> Vec<u8> {
    // Bitwise CRC-32C, reflected, as in RFC 3720.
    let mut crc: u32 = 0xffff_ffff;
    for &byte in payload {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82f6_3b78
            } else {
                crc >> 1
            };
        }
    }
    let mut bytes = payload.to_vec();
    bytes.extend_from_slice(&(crc ^ 0xffff_ffff).to_le_bytes());
    bytes
}

fn message_datagram(subject_id: u16, transfer_id: u64, payload: &[u8]) -> Vec<u8> {
    let header = Header {
        priority: Priority::Nominal,
        source: NodeId::new(0x31),
        destination: None,
        data_specifier: DataSpecifier::Message { subject_id },
        transfer_id,
        frame_index: 0,
        end_of_transfer: true,
    };
    let mut datagram = header.serialize().to_vec();
    datagram.extend_from_slice(&with_crc(payload));
    datagram
}

#[test]
fn test_redundant_media_deliver_exactly_once() {
    let (resource, memory) = tracking_memory();
    {
        let (state_a, media_a) = MockUdpMedia::new(memory.clone());
        let (state_b, media_b) = MockUdpMedia::new(memory.clone());
        let mut transport = UdpTransport::make(memory, vec![media_a, media_b], 8).unwrap();

        let mut session = transport
            .make_message_rx_session(MessageRxParams {
                extent_bytes: 16,
                subject_id: 0x123,
            })
            .unwrap();

        // The first run creates one subject socket per media.
        transport.run(at(1)).unwrap();
        let socket_a = state_a
            .borrow()
            .rx_socket(message_endpoint(0x123))
            .expect("socket on media a");
        let socket_b = state_b
            .borrow()
            .rx_socket(message_endpoint(0x123))
            .expect("socket on media b");

        // Both links carry the same transfer.
        let datagram = message_datagram(0x123, 77, b"redundant");
        socket_a.borrow_mut().rx.push_back((at(2), datagram.clone()));
        socket_b.borrow_mut().rx.push_back((at(2), datagram));
        transport.run(at(2)).unwrap();

        let transfer = session.receive().expect("exactly one delivery");
        assert_eq!(transfer.metadata.base.transfer_id, 77);
        assert_eq!(
            transfer.metadata.source_node_id,
            Some(NodeId::new(0x31).unwrap())
        );
        assert_eq!(&transfer.payload[..], b"redundant");
        drop(transfer);
        assert!(session.receive().is_none());

        // A later replica within the timeout window is still suppressed.
        let datagram = message_datagram(0x123, 77, b"redundant");
        socket_a.borrow_mut().rx.push_back((at(2) + ms(50), datagram));
        transport.run(at(2) + ms(50)).unwrap();
        assert!(session.receive().is_none());
    }
    assert!(resource.balanced());
}

#[test]
fn test_local_node_id_is_set_once() {
    let (_resource, memory) = tracking_memory();
    let (_state, media) = MockUdpMedia::new(memory.clone());
    let mut transport = UdpTransport::make(memory, vec![media], 8).unwrap();

    assert_eq!(transport.local_node_id(), None);
    transport.set_local_node_id(0x107).unwrap();
    // Idempotent for the same value, an error for any other.
    transport.set_local_node_id(0x107).unwrap();
    assert!(matches!(
        transport.set_local_node_id(0x108),
        Err(AnyFailure::Argument)
    ));
    assert!(matches!(
        transport.set_local_node_id(0xffff),
        Err(AnyFailure::Argument)
    ));
    assert_eq!(transport.local_node_id(), NodeId::new(0x107));
}

#[test]
fn test_expired_transfer_is_dropped_before_send() {
    let (resource, memory) = tracking_memory();
    {
        let (state, media) = MockUdpMedia::new(memory.clone());
        let mut transport = UdpTransport::make(memory, vec![media], 8).unwrap();
        transport.set_local_node_id(5).unwrap();

        let mut session = transport
            .make_message_tx_session(MessageTxParams { subject_id: 0x10 })
            .unwrap();
        session.set_send_timeout(Duration::ZERO);
        session
            .send(
                &TransferMetadata {
                    transfer_id: 1,
                    priority: Priority::Nominal,
                    timestamp: at(1),
                },
                &[b"late"],
            )
            .unwrap();

        // Deadline equals now: the whole transfer is dropped unsent.
        transport.run(at(1)).unwrap();
        assert!(state.borrow().sent.borrow().is_empty());
    }
    assert!(resource.balanced());
}

#[test]
fn test_registry_provider_answers_list_over_the_wire() {
    let (resource, memory) = tracking_memory();
    {
        let (state, media) = MockUdpMedia::new(memory.clone());
        let mut transport = UdpTransport::make(memory, vec![media], 8).unwrap();
        transport.set_local_node_id(0x107).unwrap();

        let registry = Registry::new();
        let _register = registry.parameterize("abc", 1u32, Options::default());
        let shared: Rc<RefCell<Registry>> = Rc::new(RefCell::new(registry));
        let _provider = RegistryProvider::make(&mut transport, shared).unwrap();

        // The RPC socket exists as soon as the node id and a service
        // session are both present.
        let rpc_socket = state
            .borrow()
            .rx_socket(service_endpoint(0x107))
            .expect("rpc socket");

        // List.Request { index: 0 } from client 0x31.
        let request_header = Header {
            priority: Priority::Fast,
            source: NodeId::new(0x31),
            destination: NodeId::new(0x107),
            data_specifier: DataSpecifier::Request {
                service_id: LIST_SERVICE_ID,
            },
            transfer_id: 123,
            frame_index: 0,
            end_of_transfer: true,
        };
        let mut datagram = request_header.serialize().to_vec();
        datagram.extend_from_slice(&with_crc(&[0, 0]));
        rpc_socket.borrow_mut().rx.push_back((at(2), datagram));

        // First run receives and queues the response; the next one
        // transmits it.
        transport.run(at(2)).unwrap();
        transport.run(at(2) + ms(10)).unwrap();

        let sent = state.borrow().sent.clone();
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        let response = &sent[0];
        assert_eq!(response.destination, service_endpoint(0x31));
        assert_eq!(response.deadline, at(2) + Duration::from_secs(1));

        let header = Header::parse(&response.bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(
            header.data_specifier,
            DataSpecifier::Response {
                service_id: LIST_SERVICE_ID
            }
        );
        assert_eq!(header.source, NodeId::new(0x107));
        assert_eq!(header.destination, NodeId::new(0x31));
        assert_eq!(header.transfer_id, 123);
        assert_eq!(header.priority, Priority::Fast);
        assert!(header.end_of_transfer);

        let body = &response.bytes[HEADER_SIZE..];
        let payload = &body[..body.len() - 4];
        assert_eq!(
            ListResponse::deserialize(payload),
            Ok(ListResponse {
                name: b"abc".to_vec()
            })
        );
    }
    assert!(resource.balanced());
}
