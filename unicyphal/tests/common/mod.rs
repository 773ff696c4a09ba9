//! Shared test doubles: memory resources, media mocks, a transport mock.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use unicyphal::can_media::{self, Filter, Mtu, RxFrame};
use unicyphal::core::TimePoint;
use unicyphal::mem::{Memory, MemoryResource, TrackingMemory};
use unicyphal::transport::{
    AnyFailure, MessageRxParams, MessageRxSession, MessageTxParams, MessageTxSession,
    ProtocolParams, RequestRxParams, RequestRxSession, RequestTxParams, RequestTxSession,
    ResponseRxParams, ResponseRxSession, ResponseTxParams, ResponseTxSession, ServiceRxTransfer,
    ServiceTxMetadata, Transport,
};
use unicyphal::udp_media::{self, Datagram, IpEndpoint, RxSocket, TxSocket};
use unicyphal::PlatformError;

// MARK: Memory

/// A tracking resource that can be told to deny the next N allocations.
#[derive(Debug, Default)]
pub struct ScriptedMemory {
    inner: TrackingMemory,
    deny_next: Cell<usize>,
}

impl ScriptedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_next(&self, count: usize) {
        self.deny_next.set(count);
    }

    pub fn balanced(&self) -> bool {
        self.inner.total_allocated_bytes() == self.inner.total_deallocated_bytes()
            && self.inner.live_allocations() == 0
    }

    pub fn total_allocated_bytes(&self) -> u64 {
        self.inner.total_allocated_bytes()
    }
}

impl MemoryResource for ScriptedMemory {
    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        let deny = self.deny_next.get();
        if deny > 0 {
            self.deny_next.set(deny - 1);
            return None;
        }
        self.inner.allocate(size)
    }

    fn deallocate(&self, storage: Vec<u8>) {
        self.inner.deallocate(storage);
    }
}

pub fn tracking_memory() -> (Rc<ScriptedMemory>, Memory) {
    let resource = Rc::new(ScriptedMemory::new());
    let memory = Memory::new(resource.clone());
    (resource, memory)
}

// MARK: CAN media mock

#[derive(Default)]
pub struct CanMediaState {
    /// Frames the transport will pop, oldest first.
    pub rx: VecDeque<(TimePoint, u32, Vec<u8>)>,
    /// Frames the transport pushed.
    pub pushed: Vec<(TimePoint, u32, Vec<u8>)>,
    /// The latest filter configuration.
    pub filters: Vec<Filter>,
    /// When false, `push` reports backpressure.
    pub accepting: bool,
}

pub struct MockCanMedia {
    pub state: Rc<RefCell<CanMediaState>>,
}

impl MockCanMedia {
    pub fn new() -> (Rc<RefCell<CanMediaState>>, Box<dyn can_media::Media>) {
        let state = Rc::new(RefCell::new(CanMediaState {
            accepting: true,
            ..CanMediaState::default()
        }));
        (state.clone(), Box::new(MockCanMedia { state }))
    }
}

impl can_media::Media for MockCanMedia {
    fn mtu(&self) -> Mtu {
        Mtu::Classic
    }

    fn pop(&mut self, buffer: &mut [u8]) -> Result<Option<RxFrame>, PlatformError> {
        let Some((timestamp, raw_id, data)) = self.state.borrow_mut().rx.pop_front() else {
            return Ok(None);
        };
        buffer[..data.len()].copy_from_slice(&data);
        Ok(Some(RxFrame {
            timestamp,
            can_id: embedded_can::ExtendedId::new(raw_id).expect("29-bit id"),
            length: data.len(),
        }))
    }

    fn push(
        &mut self,
        deadline: TimePoint,
        can_id: embedded_can::ExtendedId,
        data: &[u8],
    ) -> Result<bool, PlatformError> {
        let mut state = self.state.borrow_mut();
        if !state.accepting {
            return Ok(false);
        }
        state.pushed.push((deadline, can_id.as_raw(), data.to_vec()));
        Ok(true)
    }

    fn configure_filters(&mut self, filters: &[Filter]) -> Result<(), PlatformError> {
        self.state.borrow_mut().filters = filters.to_vec();
        Ok(())
    }
}

// MARK: UDP media mock

#[derive(Default)]
pub struct UdpSocketState {
    /// Datagrams the transport will receive, oldest first.
    pub rx: VecDeque<(TimePoint, Vec<u8>)>,
}

#[derive(Debug)]
pub struct SentDatagram {
    pub deadline: TimePoint,
    pub destination: IpEndpoint,
    pub bytes: Vec<u8>,
}

pub struct UdpMediaState {
    memory: Memory,
    /// RX sockets created so far, with their bound endpoints.
    pub rx_sockets: Vec<(IpEndpoint, Rc<RefCell<UdpSocketState>>)>,
    /// Everything sent through any TX socket of this media.
    pub sent: Rc<RefCell<Vec<SentDatagram>>>,
}

impl UdpMediaState {
    /// The RX socket bound to `endpoint`, if the transport created one.
    pub fn rx_socket(&self, endpoint: IpEndpoint) -> Option<Rc<RefCell<UdpSocketState>>> {
        self.rx_sockets
            .iter()
            .find(|(bound, _)| *bound == endpoint)
            .map(|(_, socket)| socket.clone())
    }
}

pub struct MockUdpMedia {
    pub state: Rc<RefCell<UdpMediaState>>,
}

impl MockUdpMedia {
    pub fn new(memory: Memory) -> (Rc<RefCell<UdpMediaState>>, Box<dyn udp_media::Media>) {
        let state = Rc::new(RefCell::new(UdpMediaState {
            memory,
            rx_sockets: Vec::new(),
            sent: Rc::new(RefCell::new(Vec::new())),
        }));
        (state.clone(), Box::new(MockUdpMedia { state }))
    }
}

struct MockRxSocket {
    memory: Memory,
    state: Rc<RefCell<UdpSocketState>>,
}

impl RxSocket for MockRxSocket {
    fn receive(&mut self) -> Result<Option<Datagram>, PlatformError> {
        let Some((timestamp, bytes)) = self.state.borrow_mut().rx.pop_front() else {
            return Ok(None);
        };
        let mut payload = self.memory.allocate(bytes.len()).ok_or(PlatformError(-12))?;
        payload.copy_from_slice(&bytes);
        Ok(Some(Datagram { timestamp, payload }))
    }
}

struct MockTxSocket {
    sent: Rc<RefCell<Vec<SentDatagram>>>,
}

impl TxSocket for MockTxSocket {
    fn send(
        &mut self,
        deadline: TimePoint,
        destination: IpEndpoint,
        _dscp: u8,
        fragments: &[&[u8]],
    ) -> Result<bool, PlatformError> {
        let bytes = fragments.concat();
        self.sent.borrow_mut().push(SentDatagram {
            deadline,
            destination,
            bytes,
        });
        Ok(true)
    }
}

impl udp_media::Media for MockUdpMedia {
    fn make_rx_socket(
        &mut self,
        endpoint: IpEndpoint,
    ) -> Result<Box<dyn RxSocket>, PlatformError> {
        let socket_state = Rc::new(RefCell::new(UdpSocketState::default()));
        let mut state = self.state.borrow_mut();
        state.rx_sockets.push((endpoint, socket_state.clone()));
        Ok(Box::new(MockRxSocket {
            memory: state.memory.clone(),
            state: socket_state,
        }))
    }

    fn make_tx_socket(&mut self) -> Result<Box<dyn TxSocket>, PlatformError> {
        Ok(Box::new(MockTxSocket {
            sent: self.state.borrow().sent.clone(),
        }))
    }
}

// MARK: Transport mock (for the registry provider tests)

pub type RequestCallback = Rc<RefCell<Option<Box<dyn FnMut(ServiceRxTransfer)>>>>;

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub metadata: ServiceTxMetadata,
    pub bytes: Vec<u8>,
    /// The session's send timeout at the moment of the send.
    pub send_timeout: unicyphal::core::Duration,
}

#[derive(Default)]
pub struct MockTransportState {
    pub request_rx_made: Vec<RequestRxParams>,
    pub response_tx_made: Vec<ResponseTxParams>,
    /// Installed `on_receive` callbacks, by request service id.
    pub request_callbacks: Vec<(u16, RequestCallback)>,
    /// Everything sent, by response service id.
    pub sends: Rc<RefCell<Vec<(u16, RecordedSend)>>>,
    /// Sessions dropped so far (service id, kind tag).
    pub dropped: Rc<RefCell<Vec<(u16, &'static str)>>>,
    /// Scripted outcomes for upcoming `make_request_rx_session` calls:
    /// `Some(failure)` fails that call, `None` lets it succeed.
    pub fail_request_rx: VecDeque<Option<AnyFailure>>,
}

impl MockTransportState {
    pub fn request_callback(&self, service_id: u16) -> Option<RequestCallback> {
        self.request_callbacks
            .iter()
            .find(|(id, _)| *id == service_id)
            .map(|(_, cb)| cb.clone())
    }
}

pub struct MockTransport {
    pub state: Rc<RefCell<MockTransportState>>,
    memory: Memory,
}

impl MockTransport {
    /// Charge accounted per mock session, so allocation-balance checks
    /// observe session lifetimes.
    pub const SESSION_CHARGE: usize = 48;

    pub fn new(memory: Memory) -> (Rc<RefCell<MockTransportState>>, Self) {
        let state = Rc::new(RefCell::new(MockTransportState::default()));
        (state.clone(), Self { state, memory })
    }
}

struct MockRequestRxSession {
    params: RequestRxParams,
    callback: RequestCallback,
    dropped: Rc<RefCell<Vec<(u16, &'static str)>>>,
    _charge: unicyphal::mem::Payload,
}

impl unicyphal::transport::RxSession for MockRequestRxSession {
    fn set_transfer_id_timeout(&mut self, _timeout: unicyphal::core::Duration) {}
}

impl RequestRxSession for MockRequestRxSession {
    fn params(&self) -> RequestRxParams {
        self.params
    }

    fn receive(&mut self) -> Option<ServiceRxTransfer> {
        None
    }

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceRxTransfer)>>) {
        *self.callback.borrow_mut() = callback;
    }
}

impl Drop for MockRequestRxSession {
    fn drop(&mut self) {
        self.dropped
            .borrow_mut()
            .push((self.params.service_id, "request_rx"));
    }
}

struct MockResponseTxSession {
    params: ResponseTxParams,
    send_timeout: unicyphal::core::Duration,
    sends: Rc<RefCell<Vec<(u16, RecordedSend)>>>,
    dropped: Rc<RefCell<Vec<(u16, &'static str)>>>,
    _charge: unicyphal::mem::Payload,
}

impl unicyphal::transport::TxSession for MockResponseTxSession {
    fn set_send_timeout(&mut self, timeout: unicyphal::core::Duration) {
        self.send_timeout = timeout;
    }
}

impl ResponseTxSession for MockResponseTxSession {
    fn params(&self) -> ResponseTxParams {
        self.params
    }

    fn send(
        &mut self,
        metadata: &ServiceTxMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), AnyFailure> {
        self.sends.borrow_mut().push((
            self.params.service_id,
            RecordedSend {
                metadata: *metadata,
                bytes: fragments.concat(),
                send_timeout: self.send_timeout,
            },
        ));
        Ok(())
    }
}

impl Drop for MockResponseTxSession {
    fn drop(&mut self) {
        self.dropped
            .borrow_mut()
            .push((self.params.service_id, "response_tx"));
    }
}

impl Transport for MockTransport {
    fn protocol_params(&self) -> ProtocolParams {
        ProtocolParams {
            max_transfer_id: u64::MAX,
            mtu_bytes: 1384,
            max_nodes: 65535,
        }
    }

    fn local_node_id(&self) -> Option<unicyphal::core::NodeId> {
        unicyphal::core::NodeId::new(0x107)
    }

    fn set_local_node_id(&mut self, _node_id: u16) -> Result<(), AnyFailure> {
        Err(AnyFailure::Argument)
    }

    fn make_message_rx_session(
        &mut self,
        _params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, AnyFailure> {
        Err(AnyFailure::Argument)
    }

    fn make_message_tx_session(
        &mut self,
        _params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, AnyFailure> {
        Err(AnyFailure::Argument)
    }

    fn make_request_rx_session(
        &mut self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, AnyFailure> {
        let mut state = self.state.borrow_mut();
        if let Some(Some(failure)) = state.fail_request_rx.pop_front() {
            return Err(failure);
        }
        let charge = self
            .memory
            .allocate(Self::SESSION_CHARGE)
            .ok_or(AnyFailure::Memory)?;
        state.request_rx_made.push(params);
        let callback: RequestCallback = Rc::new(RefCell::new(None));
        state
            .request_callbacks
            .push((params.service_id, callback.clone()));
        Ok(Box::new(MockRequestRxSession {
            params,
            callback,
            dropped: state.dropped.clone(),
            _charge: charge,
        }))
    }

    fn make_request_tx_session(
        &mut self,
        _params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, AnyFailure> {
        Err(AnyFailure::Argument)
    }

    fn make_response_rx_session(
        &mut self,
        _params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, AnyFailure> {
        Err(AnyFailure::Argument)
    }

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, AnyFailure> {
        let mut state = self.state.borrow_mut();
        let charge = self
            .memory
            .allocate(Self::SESSION_CHARGE)
            .ok_or(AnyFailure::Memory)?;
        state.response_tx_made.push(params);
        Ok(Box::new(MockResponseTxSession {
            params,
            send_timeout: unicyphal::transport::DEFAULT_SEND_TIMEOUT,
            sends: state.sends.clone(),
            dropped: state.dropped.clone(),
            _charge: charge,
        }))
    }

    fn run(&mut self, _now: TimePoint) -> Result<(), AnyFailure> {
        Ok(())
    }
}
