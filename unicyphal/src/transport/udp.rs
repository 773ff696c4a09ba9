//! Cyphal/UDP transport
//!
//! Transfers map to sequences of UDP datagrams; subjects and services use
//! distinct multicast groups on one fixed port. Sockets are created lazily:
//! TX sockets when the first TX session appears, subject RX sockets while
//! a matching subscription exists, and the local RPC socket once the node
//! id is known (setting it computes the RPC endpoint and arms the RX path).
//!
//! Incoming service datagrams take a two-level route: the dispatcher maps
//! the data specifier to the matching RX session tree node, then the
//! session's reassembly accepts the frame.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::mem::size_of;

use log::trace;

use crate::core::{NodeId, TimePoint};
use crate::mem::{Memory, Payload};
use crate::transport::{
    AnyFailure, ErrorSite, MessageRxParams, MessageRxSession, MessageRxTransfer, MessageTxParams,
    MessageTxSession, ProtocolParams, RequestRxParams, RequestRxSession, RequestTxParams,
    RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams, ResponseTxSession,
    ServiceRxTransfer, TransientErrorHandler, TransientErrorReport, Transport,
};
use crate::udp_media::{IpEndpoint, Media, RxSocket, TxSocket, DEFAULT_MTU};

mod rx;
mod session;
mod tx;
pub mod wire;

pub use session::{
    UdpMessageRxSession, UdpMessageTxSession, UdpRequestRxSession, UdpRequestTxSession,
    UdpResponseRxSession, UdpResponseTxSession,
};
use session::{UdpMessageRxCore, UdpServiceRxCore};
use tx::UdpTxQueue;

/// Redundant interfaces supported per transport.
pub const MEDIA_COUNT_MAX: usize = 3;

pub(crate) struct MediaEntry {
    iface: Box<dyn Media>,
    queue: UdpTxQueue,
    tx_socket: Option<Box<dyn TxSocket>>,
    svc_socket: Option<Box<dyn RxSocket>>,
    pub msg_sockets: BTreeMap<u16, Box<dyn RxSocket>>,
}

impl MediaEntry {
    fn mtu(&self) -> usize {
        self.tx_socket.as_ref().map_or(DEFAULT_MTU, |s| s.mtu())
    }
}

pub(crate) struct Delegate {
    pub memory: Memory,
    pub local_node_id: Option<NodeId>,
    media: Vec<MediaEntry>,
    frame_seq: u64,
    pub msg_rx: BTreeMap<u16, Weak<RefCell<UdpMessageRxCore>>>,
    pub req_rx: BTreeMap<u16, Weak<RefCell<UdpServiceRxCore>>>,
    pub resp_rx: BTreeMap<u16, Weak<RefCell<UdpServiceRxCore>>>,
    transient_handler: Option<TransientErrorHandler>,
    /// Computed when the local node id is set; its presence arms the
    /// service RX path.
    pub rpc_endpoint: Option<IpEndpoint>,
}

impl Delegate {
    pub fn media_count(&self) -> usize {
        self.media.len()
    }

    pub fn media_mut(&mut self) -> impl Iterator<Item = &mut MediaEntry> {
        self.media.iter_mut()
    }

    pub fn min_mtu(&self) -> usize {
        self.media.iter().map(MediaEntry::mtu).min().unwrap_or(DEFAULT_MTU)
    }

    /// Segments and queues one transfer on the given media, using that
    /// media's socket MTU.
    pub fn queue_transfer(
        &mut self,
        media_index: usize,
        template: wire::Header,
        destination: IpEndpoint,
        deadline: TimePoint,
        payload: &[u8],
    ) -> Result<(), AnyFailure> {
        let memory = self.memory.clone();
        let mtu = self.media[media_index].mtu();
        tx::push_transfer(
            &mut self.media[media_index].queue,
            &memory,
            mtu,
            template,
            destination,
            deadline,
            payload,
            &mut self.frame_seq,
        )
    }
}

/// Consults the transient error handler outside of any delegate borrow.
///
/// Without a handler every transient error propagates.
pub(crate) fn consult(
    delegate: &Rc<RefCell<Delegate>>,
    site: ErrorSite,
    media_index: u8,
    failure: AnyFailure,
) -> Option<AnyFailure> {
    let handler = delegate.borrow_mut().transient_handler.take();
    let Some(mut handler) = handler else {
        return Some(failure);
    };
    let report = TransientErrorReport {
        site,
        media_index,
        failure,
    };
    let verdict = handler(&report);
    let mut d = delegate.borrow_mut();
    if d.transient_handler.is_none() {
        d.transient_handler = Some(handler);
    }
    verdict
}

/// The Cyphal/UDP transport over up to [`MEDIA_COUNT_MAX`] redundant
/// interfaces.
pub struct UdpTransport {
    delegate: Rc<RefCell<Delegate>>,
}

impl UdpTransport {
    /// Creates a transport. `tx_capacity` bounds the number of datagrams
    /// queued per media. The local node id starts unset.
    pub fn make(
        memory: Memory,
        media: Vec<Box<dyn Media>>,
        tx_capacity: usize,
    ) -> Result<Self, AnyFailure> {
        if media.is_empty() || media.len() > MEDIA_COUNT_MAX {
            return Err(AnyFailure::Argument);
        }

        let media = media
            .into_iter()
            .map(|iface| MediaEntry {
                iface,
                queue: UdpTxQueue::new(tx_capacity),
                tx_socket: None,
                svc_socket: None,
                msg_sockets: BTreeMap::new(),
            })
            .collect();

        Ok(Self {
            delegate: Rc::new(RefCell::new(Delegate {
                memory,
                local_node_id: None,
                media,
                frame_seq: 0,
                msg_rx: BTreeMap::new(),
                req_rx: BTreeMap::new(),
                resp_rx: BTreeMap::new(),
                transient_handler: None,
                rpc_endpoint: None,
            })),
        })
    }

    /// Installs (or clears) the transient error handler.
    pub fn set_transient_error_handler(&mut self, handler: Option<TransientErrorHandler>) {
        self.delegate.borrow_mut().transient_handler = handler;
    }

    /// Creates missing TX sockets, consulting the handler per media.
    fn ensure_tx_sockets(&mut self) -> Result<(), AnyFailure> {
        let media_count = self.delegate.borrow().media_count();
        for index in 0..media_count {
            let outcome = {
                let mut d = self.delegate.borrow_mut();
                let entry = &mut d.media[index];
                if entry.tx_socket.is_some() {
                    continue;
                }
                match entry.iface.make_tx_socket() {
                    Ok(socket) => {
                        entry.tx_socket = Some(socket);
                        Ok(())
                    }
                    Err(e) => Err(AnyFailure::from(e)),
                }
            };
            if let Err(failure) = outcome {
                if let Some(failure) =
                    consult(&self.delegate, ErrorSite::MakeTxSocket, index as u8, failure)
                {
                    return Err(failure);
                }
            }
        }
        Ok(())
    }

    /// Creates missing RX sockets: the RPC socket once the endpoint is
    /// known, and one socket per subscribed subject group.
    fn ensure_rx_sockets(&mut self) -> Result<(), AnyFailure> {
        let media_count = self.delegate.borrow().media_count();
        for index in 0..media_count {
            // Service RPC socket.
            let outcome = {
                let mut d = self.delegate.borrow_mut();
                let rpc_endpoint = d.rpc_endpoint;
                let wanted = rpc_endpoint.is_some()
                    && (!d.req_rx.is_empty() || !d.resp_rx.is_empty());
                let entry = &mut d.media[index];
                if wanted && entry.svc_socket.is_none() {
                    match entry.iface.make_rx_socket(rpc_endpoint.expect("endpoint known")) {
                        Ok(socket) => {
                            entry.svc_socket = Some(socket);
                            Ok(())
                        }
                        Err(e) => Err(AnyFailure::from(e)),
                    }
                } else {
                    Ok(())
                }
            };
            if let Err(failure) = outcome {
                if let Some(failure) =
                    consult(&self.delegate, ErrorSite::MakeRxSocket, index as u8, failure)
                {
                    return Err(failure);
                }
            }

            // Subject multicast sockets.
            let subjects: Vec<u16> = {
                let d = self.delegate.borrow();
                d.msg_rx
                    .keys()
                    .filter(|&&s| !d.media[index].msg_sockets.contains_key(&s))
                    .copied()
                    .collect()
            };
            for subject in subjects {
                let outcome = {
                    let mut d = self.delegate.borrow_mut();
                    let entry = &mut d.media[index];
                    match entry.iface.make_rx_socket(wire::message_endpoint(subject)) {
                        Ok(socket) => {
                            entry.msg_sockets.insert(subject, socket);
                            Ok(())
                        }
                        Err(e) => Err(AnyFailure::from(e)),
                    }
                };
                if let Err(failure) = outcome {
                    if let Some(failure) =
                        consult(&self.delegate, ErrorSite::MakeRxSocket, index as u8, failure)
                    {
                        return Err(failure);
                    }
                }
            }
        }
        Ok(())
    }

    fn run_media_transmit(&mut self, now: TimePoint) -> Result<(), AnyFailure> {
        self.ensure_tx_sockets()?;
        let media_count = self.delegate.borrow().media_count();
        for index in 0..media_count {
            loop {
                enum Step {
                    Idle,
                    Sent,
                    Expired,
                    Backpressure,
                    Failed(AnyFailure),
                }
                let step = {
                    let mut d = self.delegate.borrow_mut();
                    let entry = &mut d.media[index];
                    let Some(socket) = entry.tx_socket.as_mut() else {
                        break;
                    };
                    match entry.queue.front() {
                        None => Step::Idle,
                        Some(frame) if frame.deadline <= now => {
                            let seq = frame.transfer_seq;
                            entry.queue.drop_transfer(seq);
                            trace!("udp tx: expired transfer dropped, media {}", index);
                            Step::Expired
                        }
                        Some(frame) => {
                            match socket.send(
                                frame.deadline,
                                frame.destination,
                                tx::DSCP,
                                &[&frame.data[..]],
                            ) {
                                Ok(true) => {
                                    entry.queue.pop_front();
                                    Step::Sent
                                }
                                Ok(false) => Step::Backpressure,
                                Err(e) => {
                                    let seq = frame.transfer_seq;
                                    entry.queue.drop_transfer(seq);
                                    Step::Failed(e.into())
                                }
                            }
                        }
                    }
                };
                match step {
                    Step::Sent | Step::Expired => continue,
                    Step::Idle | Step::Backpressure => break,
                    Step::Failed(failure) => {
                        if let Some(failure) =
                            consult(&self.delegate, ErrorSite::SocketSend, index as u8, failure)
                        {
                            return Err(failure);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn run_media_receive(&mut self) -> Result<(), AnyFailure> {
        self.ensure_rx_sockets()?;
        let media_count = self.delegate.borrow().media_count();
        for index in 0..media_count {
            // One datagram per socket per run: the RPC socket first, then
            // every subject socket.
            let received = {
                let mut d = self.delegate.borrow_mut();
                match d.media[index].svc_socket.as_mut() {
                    Some(socket) => socket.receive(),
                    None => Ok(None),
                }
            };
            self.route_received(index as u8, received)?;

            let subjects: Vec<u16> = {
                let d = self.delegate.borrow();
                d.media[index].msg_sockets.keys().copied().collect()
            };
            for subject in subjects {
                let received = {
                    let mut d = self.delegate.borrow_mut();
                    match d.media[index].msg_sockets.get_mut(&subject) {
                        Some(socket) => socket.receive(),
                        None => Ok(None),
                    }
                };
                self.route_received(index as u8, received)?;
            }
        }
        Ok(())
    }

    fn route_received(
        &mut self,
        media_index: u8,
        received: Result<Option<crate::udp_media::Datagram>, crate::PlatformError>,
    ) -> Result<(), AnyFailure> {
        match received {
            Err(e) => {
                if let Some(failure) = consult(
                    &self.delegate,
                    ErrorSite::SocketReceive,
                    media_index,
                    e.into(),
                ) {
                    return Err(failure);
                }
            }
            Ok(None) => {}
            Ok(Some(datagram)) => {
                self.accept_datagram(media_index, datagram.timestamp, datagram.payload)?;
            }
        }
        Ok(())
    }

    fn accept_datagram(
        &mut self,
        media_index: u8,
        timestamp: TimePoint,
        datagram: Payload,
    ) -> Result<(), AnyFailure> {
        let Some(header) = wire::Header::parse(&datagram) else {
            trace!("udp rx: malformed datagram ignored");
            return Ok(());
        };
        let body = &datagram[wire::HEADER_SIZE..];

        match header.data_specifier {
            wire::DataSpecifier::Message { subject_id } => {
                let core = {
                    let d = self.delegate.borrow();
                    d.msg_rx.get(&subject_id).and_then(Weak::upgrade)
                };
                let Some(core) = core else {
                    return Ok(());
                };
                let outcome = core.borrow_mut().accept_frame(&header, body, timestamp);
                match outcome {
                    Err(failure) => {
                        if let Some(failure) =
                            consult(&self.delegate, ErrorSite::Accept, media_index, failure)
                        {
                            return Err(failure);
                        }
                    }
                    Ok(Some(transfer)) => deliver_message(&core, transfer),
                    Ok(None) => {}
                }
            }
            wire::DataSpecifier::Request { service_id }
            | wire::DataSpecifier::Response { service_id } => {
                let request =
                    matches!(header.data_specifier, wire::DataSpecifier::Request { .. });
                let (local, core) = {
                    let d = self.delegate.borrow();
                    let tree = if request { &d.req_rx } else { &d.resp_rx };
                    (
                        d.local_node_id,
                        tree.get(&service_id).and_then(Weak::upgrade),
                    )
                };
                // Service frames are unicast in meaning: they must name us.
                if header.destination.is_none() || header.destination != local {
                    return Ok(());
                }
                let Some(source) = header.source else {
                    return Ok(());
                };
                let Some(core) = core else {
                    return Ok(());
                };
                let outcome = core
                    .borrow_mut()
                    .accept_frame(source, &header, body, timestamp);
                match outcome {
                    Err(failure) => {
                        if let Some(failure) =
                            consult(&self.delegate, ErrorSite::Accept, media_index, failure)
                        {
                            return Err(failure);
                        }
                    }
                    Ok(Some(transfer)) => deliver_service(&core, transfer),
                    Ok(None) => {}
                }
            }
        }
        Ok(())
    }
}

/// Invokes the session callback with no borrows held, so the callback may
/// freely call back into the transport (send a response, drop the session).
fn deliver_message(core: &Rc<RefCell<UdpMessageRxCore>>, transfer: MessageRxTransfer) {
    let callback = core.borrow_mut().on_receive.take();
    match callback {
        Some(mut callback) => {
            callback(transfer);
            let mut c = core.borrow_mut();
            if c.on_receive.is_none() {
                c.on_receive = Some(callback);
            }
        }
        None => core.borrow_mut().latest = Some(transfer),
    }
}

fn deliver_service(core: &Rc<RefCell<UdpServiceRxCore>>, transfer: ServiceRxTransfer) {
    let callback = core.borrow_mut().on_receive.take();
    match callback {
        Some(mut callback) => {
            callback(transfer);
            let mut c = core.borrow_mut();
            if c.on_receive.is_none() {
                c.on_receive = Some(callback);
            }
        }
        None => core.borrow_mut().latest = Some(transfer),
    }
}

impl Transport for UdpTransport {
    fn protocol_params(&self) -> ProtocolParams {
        let d = self.delegate.borrow();
        ProtocolParams {
            max_transfer_id: u64::MAX,
            mtu_bytes: d.min_mtu().saturating_sub(wire::HEADER_SIZE),
            max_nodes: u32::from(wire::NODE_ID_MAX) + 1,
        }
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.delegate.borrow().local_node_id
    }

    fn set_local_node_id(&mut self, node_id: u16) -> Result<(), AnyFailure> {
        if node_id > wire::NODE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        let mut d = self.delegate.borrow_mut();
        match d.local_node_id {
            Some(current) if current.into_u16() == node_id => Ok(()),
            Some(_) => Err(AnyFailure::Argument),
            None => {
                d.local_node_id = NodeId::new(node_id);
                d.rpc_endpoint = Some(wire::service_endpoint(node_id));
                Ok(())
            }
        }
    }

    fn make_message_rx_session(
        &mut self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, AnyFailure> {
        if params.subject_id > wire::SUBJECT_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        let mut d = self.delegate.borrow_mut();
        if d.msg_rx
            .get(&params.subject_id)
            .is_some_and(|w| w.strong_count() > 0)
        {
            return Err(AnyFailure::AlreadyExists);
        }
        let charge = d
            .memory
            .allocate(size_of::<UdpMessageRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(UdpMessageRxCore::new(params, d.memory.clone())));
        d.msg_rx.insert(params.subject_id, Rc::downgrade(&core));
        drop(d);

        Ok(Box::new(UdpMessageRxSession::new(
            Rc::downgrade(&self.delegate),
            core,
            charge,
        )))
    }

    fn make_message_tx_session(
        &mut self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, AnyFailure> {
        if params.subject_id > wire::SUBJECT_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        self.ensure_tx_sockets()?;
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<UdpMessageTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(UdpMessageTxSession::new(
            Rc::downgrade(&self.delegate),
            params,
            charge,
        )))
    }

    fn make_request_rx_session(
        &mut self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, AnyFailure> {
        if params.service_id > wire::SERVICE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        let mut d = self.delegate.borrow_mut();
        if d.req_rx
            .get(&params.service_id)
            .is_some_and(|w| w.strong_count() > 0)
        {
            return Err(AnyFailure::AlreadyExists);
        }
        let charge = d
            .memory
            .allocate(size_of::<UdpServiceRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(UdpServiceRxCore::new(
            params.extent_bytes,
            params.service_id,
            None,
            d.memory.clone(),
        )));
        d.req_rx.insert(params.service_id, Rc::downgrade(&core));
        drop(d);
        self.ensure_rx_sockets()?;

        Ok(Box::new(UdpRequestRxSession::new(
            Rc::downgrade(&self.delegate),
            core,
            charge,
        )))
    }

    fn make_request_tx_session(
        &mut self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, AnyFailure> {
        if params.service_id > wire::SERVICE_ID_MAX || params.server_node_id > wire::NODE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        self.ensure_tx_sockets()?;
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<UdpRequestTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(UdpRequestTxSession::new(
            Rc::downgrade(&self.delegate),
            params,
            charge,
        )))
    }

    fn make_response_rx_session(
        &mut self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, AnyFailure> {
        if params.service_id > wire::SERVICE_ID_MAX || params.server_node_id > wire::NODE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        let mut d = self.delegate.borrow_mut();
        if d.resp_rx
            .get(&params.service_id)
            .is_some_and(|w| w.strong_count() > 0)
        {
            return Err(AnyFailure::AlreadyExists);
        }
        let charge = d
            .memory
            .allocate(size_of::<UdpServiceRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(UdpServiceRxCore::new(
            params.extent_bytes,
            params.service_id,
            Some(params.server_node_id),
            d.memory.clone(),
        )));
        d.resp_rx.insert(params.service_id, Rc::downgrade(&core));
        drop(d);
        self.ensure_rx_sockets()?;

        Ok(Box::new(UdpResponseRxSession::new(
            Rc::downgrade(&self.delegate),
            core,
            charge,
        )))
    }

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, AnyFailure> {
        if params.service_id > wire::SERVICE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        self.ensure_tx_sockets()?;
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<UdpResponseTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(UdpResponseTxSession::new(
            Rc::downgrade(&self.delegate),
            params,
            charge,
        )))
    }

    fn run(&mut self, now: TimePoint) -> Result<(), AnyFailure> {
        // TX first: transmission frees queue slots before new datagrams
        // are admitted, mirroring the resource pressure order of the wire.
        self.run_media_transmit(now)?;
        self.run_media_receive()
    }
}
