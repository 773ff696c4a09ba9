//! Transport layer: shared contracts of the CAN and UDP transports
//!
//! A transport is created by a protocol-specific factory over a set of
//! redundant media interfaces. It hands out sessions — one interface trait
//! per session kind, one concrete type per (protocol, kind) pair — and is
//! driven by repeated `run(now)` calls from the executor thread.
//!
//! Session uniqueness: at most one RX session may exist per (kind, port id)
//! per transport; a second factory call returns [`AnyFailure::AlreadyExists`].
//! TX sessions are not deduplicated.

use alloc::boxed::Box;
use core::fmt;

use crate::core::{Duration, NodeId, Priority, TimePoint, TransferId};
use crate::mem::Payload;
use crate::PlatformError;

pub mod can;
pub(crate) mod dedup;
pub(crate) mod txq;
pub mod udp;

/// Default deadline margin of TX sessions: `deadline = timestamp + timeout`.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Default retention of partial RX reassembly state.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw (not yet validated) port identifier as carried in session params.
pub type PortId = u16;

/// Static properties of a transport's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Inclusive upper bound of wire transfer-id values.
    pub max_transfer_id: TransferId,
    /// Smallest MTU across the transport's media.
    pub mtu_bytes: usize,
    /// Size of the node id space, including the broadcast/unset sentinel.
    pub max_nodes: u32,
}

/// Per-transfer metadata shared by all session kinds.
///
/// On TX, `timestamp` is the moment the payload was produced; the transport
/// derives the wire deadline as `timestamp + send_timeout`. On RX it is the
/// reception instant of the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMetadata {
    pub transfer_id: TransferId,
    pub priority: Priority,
    pub timestamp: TimePoint,
}

/// TX metadata of a service response; the remote node is the client that
/// issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTxMetadata {
    pub base: TransferMetadata,
    pub remote_node_id: u16,
}

/// RX metadata of a message transfer. Anonymous publishers have no node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRxMetadata {
    pub base: TransferMetadata,
    pub source_node_id: Option<NodeId>,
}

/// RX metadata of a service transfer; the remote node is the client (for
/// requests) or the server (for responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRxMetadata {
    pub base: TransferMetadata,
    pub remote_node_id: NodeId,
}

/// A completed incoming message transfer. The payload is owned; dropping
/// the transfer returns the buffer to its memory resource.
#[derive(Debug)]
pub struct MessageRxTransfer {
    pub metadata: MessageRxMetadata,
    pub payload: Payload,
}

/// A completed incoming service transfer.
#[derive(Debug)]
pub struct ServiceRxTransfer {
    pub metadata: ServiceRxMetadata,
    pub payload: Payload,
}

// MARK: Session parameters

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRxParams {
    /// Reassembled payloads are truncated to this many bytes.
    pub extent_bytes: usize,
    pub subject_id: PortId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTxParams {
    pub subject_id: PortId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRxParams {
    pub extent_bytes: usize,
    pub service_id: PortId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTxParams {
    pub service_id: PortId,
    /// The server this client session addresses.
    pub server_node_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRxParams {
    pub extent_bytes: usize,
    pub service_id: PortId,
    /// Responses are accepted from this server only.
    pub server_node_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTxParams {
    pub service_id: PortId,
}

// MARK: Failures

/// Violation of the wire rules detected on a received transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Transfer checksum mismatch on an otherwise well-formed transfer.
    CrcMismatch,
    /// A frame header that cannot be parsed at all.
    MalformedFrame,
}

/// The failure vocabulary of every stack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyFailure {
    /// An input violates its contract (port id out of range, double-set
    /// node id, service send without a local node id).
    Argument,
    /// A memory resource returned `None`.
    Memory,
    /// A fixed-capacity TX queue is full.
    Capacity,
    /// An RX session for this (kind, port) already exists.
    AlreadyExists,
    /// A received transfer violates the wire rules.
    Protocol(ProtocolError),
    /// A media interface or socket reported a device fault.
    Platform(PlatformError),
}

impl fmt::Display for AnyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyFailure::Argument => f.write_str("argument contract violated"),
            AnyFailure::Memory => f.write_str("memory resource exhausted"),
            AnyFailure::Capacity => f.write_str("tx queue capacity exhausted"),
            AnyFailure::AlreadyExists => f.write_str("rx session already exists"),
            AnyFailure::Protocol(e) => write!(f, "protocol violation: {:?}", e),
            AnyFailure::Platform(e) => write!(f, "platform error {}", e.0),
        }
    }
}

impl From<PlatformError> for AnyFailure {
    fn from(value: PlatformError) -> Self {
        AnyFailure::Platform(value)
    }
}

// MARK: Transient error reporting

/// The operation during which a transient per-media error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSite {
    /// Receiving a frame from CAN media.
    MediaPop,
    /// Pushing a frame to CAN media.
    MediaPush,
    /// Applying acceptance filters to CAN media.
    MediaConfig,
    /// Creating a UDP RX socket.
    MakeRxSocket,
    /// Creating a UDP TX socket.
    MakeTxSocket,
    /// Receiving a datagram from a UDP RX socket.
    SocketReceive,
    /// Sending a datagram through a UDP TX socket.
    SocketSend,
    /// Enqueueing an outgoing transfer into a media TX queue.
    TxPush,
    /// Accepting a received frame into reassembly.
    Accept,
}

/// A transient error attributed to one media interface of a transport.
///
/// The media index is the position of the culprit in the media collection
/// passed to the transport factory; it is stable for the transport's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientErrorReport {
    pub site: ErrorSite,
    pub media_index: u8,
    pub failure: AnyFailure,
}

/// A user hook consulted before a transient error propagates.
///
/// Returning `None` declares the error handled: the transport continues
/// with the next media (or the next frame). Returning a failure aborts the
/// current operation with it. The handler must not re-enter the transport
/// (no `run`, no session calls).
pub type TransientErrorHandler = Box<dyn FnMut(&TransientErrorReport) -> Option<AnyFailure>>;

// MARK: Session interfaces

/// Common surface of TX sessions.
pub trait TxSession {
    /// Replaces the margin used to derive frame deadlines from transfer
    /// timestamps. Default [`DEFAULT_SEND_TIMEOUT`].
    fn set_send_timeout(&mut self, timeout: Duration);
}

/// Common surface of RX sessions.
pub trait RxSession {
    /// Replaces the retention window of partial reassembly state, measured
    /// from the first-frame timestamp. Default
    /// [`DEFAULT_TRANSFER_ID_TIMEOUT`].
    fn set_transfer_id_timeout(&mut self, timeout: Duration);
}

pub trait MessageTxSession: TxSession {
    fn params(&self) -> MessageTxParams;

    /// Queues one message transfer on every media of the transport.
    fn send(
        &mut self,
        metadata: &TransferMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), AnyFailure>;
}

pub trait MessageRxSession: RxSession {
    fn params(&self) -> MessageRxParams;

    /// Takes the latest completed transfer, if one is pending.
    fn receive(&mut self) -> Option<MessageRxTransfer>;

    /// Installs (or clears) a delivery callback invoked synchronously from
    /// the transport's `run`. While set, `receive` never observes data.
    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(MessageRxTransfer)>>);
}

pub trait RequestTxSession: TxSession {
    fn params(&self) -> RequestTxParams;

    /// Queues one request transfer addressed to the session's server.
    fn send(
        &mut self,
        metadata: &TransferMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), AnyFailure>;
}

pub trait RequestRxSession: RxSession {
    fn params(&self) -> RequestRxParams;

    fn receive(&mut self) -> Option<ServiceRxTransfer>;

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceRxTransfer)>>);
}

pub trait ResponseTxSession: TxSession {
    fn params(&self) -> ResponseTxParams;

    /// Queues one response transfer addressed to the client named in the
    /// metadata.
    fn send(
        &mut self,
        metadata: &ServiceTxMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), AnyFailure>;
}

pub trait ResponseRxSession: RxSession {
    fn params(&self) -> ResponseRxParams;

    fn receive(&mut self) -> Option<ServiceRxTransfer>;

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceRxTransfer)>>);
}

// MARK: Transport interface

/// Protocol-independent surface of a transport.
///
/// The concrete types additionally expose `set_transient_error_handler`
/// and their factory functions.
pub trait Transport {
    fn protocol_params(&self) -> ProtocolParams;

    fn local_node_id(&self) -> Option<NodeId>;

    /// Sets the local node id, once.
    ///
    /// Setting the same value again is idempotent; a different value or a
    /// value outside the protocol's range fails with `Argument`.
    fn set_local_node_id(&mut self, node_id: u16) -> Result<(), AnyFailure>;

    fn make_message_rx_session(
        &mut self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, AnyFailure>;

    fn make_message_tx_session(
        &mut self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, AnyFailure>;

    fn make_request_rx_session(
        &mut self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, AnyFailure>;

    fn make_request_tx_session(
        &mut self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, AnyFailure>;

    fn make_response_rx_session(
        &mut self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, AnyFailure>;

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, AnyFailure>;

    /// One cooperative step: drain media TX queues, then pull received
    /// frames through reassembly and deliver completed transfers.
    ///
    /// Returns the first unhandled transient error, if any.
    fn run(&mut self, now: TimePoint) -> Result<(), AnyFailure>;
}
