//! Concrete UDP session types, one per session kind

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

use crate::core::{Duration, NodeId, TimePoint};
use crate::mem::{Memory, Payload};
use crate::transport::dedup::RecentTransfers;
use crate::transport::udp::rx::UdpReassembly;
use crate::transport::udp::wire::{self, DataSpecifier, Header};
use crate::transport::udp::{consult, Delegate};
use crate::transport::{
    AnyFailure, ErrorSite, MessageRxMetadata, MessageRxParams, MessageRxSession,
    MessageRxTransfer, MessageTxParams, MessageTxSession, RequestRxParams, RequestRxSession,
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams,
    ResponseTxSession, RxSession, ServiceRxMetadata, ServiceRxTransfer, ServiceTxMetadata,
    TransferMetadata, TxSession, DEFAULT_SEND_TIMEOUT, DEFAULT_TRANSFER_ID_TIMEOUT,
};
use crate::udp_media::IpEndpoint;

// MARK: RX session state

pub(crate) struct UdpMessageRxCore {
    pub params: MessageRxParams,
    pub transfer_id_timeout: Duration,
    memory: Memory,
    sources: BTreeMap<u16, UdpReassembly>,
    dedup: RecentTransfers,
    pub latest: Option<MessageRxTransfer>,
    pub on_receive: Option<Box<dyn FnMut(MessageRxTransfer)>>,
}

impl UdpMessageRxCore {
    pub fn new(params: MessageRxParams, memory: Memory) -> Self {
        Self {
            params,
            transfer_id_timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            memory,
            sources: BTreeMap::new(),
            dedup: RecentTransfers::default(),
            latest: None,
            on_receive: None,
        }
    }

    pub fn accept_frame(
        &mut self,
        header: &Header,
        body: &[u8],
        timestamp: TimePoint,
    ) -> Result<Option<MessageRxTransfer>, AnyFailure> {
        let timeout = self.transfer_id_timeout;
        self.sources.retain(|_, r| !r.is_stale(timestamp, timeout));

        let completed = match header.source {
            Some(node) => {
                let slot = self.sources.entry(node.into_u16()).or_default();
                let completed = slot.push_frame(
                    &self.memory,
                    self.params.extent_bytes,
                    timeout,
                    header,
                    body,
                    timestamp,
                )?;
                match completed {
                    Some(c)
                        if self.dedup.insert(
                            node.into_u16(),
                            c.transfer_id,
                            c.timestamp,
                            timeout,
                        ) =>
                    {
                        Some(c)
                    }
                    _ => None,
                }
            }
            // Anonymous transfers are single-frame; no source to key
            // reassembly or deduplication by.
            None => UdpReassembly::default().push_frame(
                &self.memory,
                self.params.extent_bytes,
                timeout,
                header,
                body,
                timestamp,
            )?,
        };

        Ok(completed.map(|c| MessageRxTransfer {
            metadata: MessageRxMetadata {
                base: TransferMetadata {
                    transfer_id: c.transfer_id,
                    priority: c.priority,
                    timestamp: c.timestamp,
                },
                source_node_id: header.source,
            },
            payload: c.payload,
        }))
    }
}

pub(crate) struct UdpServiceRxCore {
    pub extent_bytes: usize,
    pub service_id: u16,
    /// Responses are accepted from this node only; `None` for requests.
    pub only_from: Option<u16>,
    pub transfer_id_timeout: Duration,
    memory: Memory,
    sources: BTreeMap<u16, UdpReassembly>,
    dedup: RecentTransfers,
    pub latest: Option<ServiceRxTransfer>,
    pub on_receive: Option<Box<dyn FnMut(ServiceRxTransfer)>>,
}

impl UdpServiceRxCore {
    pub fn new(extent_bytes: usize, service_id: u16, only_from: Option<u16>, memory: Memory) -> Self {
        Self {
            extent_bytes,
            service_id,
            only_from,
            transfer_id_timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            memory,
            sources: BTreeMap::new(),
            dedup: RecentTransfers::default(),
            latest: None,
            on_receive: None,
        }
    }

    pub fn accept_frame(
        &mut self,
        source: NodeId,
        header: &Header,
        body: &[u8],
        timestamp: TimePoint,
    ) -> Result<Option<ServiceRxTransfer>, AnyFailure> {
        if let Some(only) = self.only_from {
            if only != source.into_u16() {
                return Ok(None);
            }
        }

        let timeout = self.transfer_id_timeout;
        self.sources.retain(|_, r| !r.is_stale(timestamp, timeout));

        let slot = self.sources.entry(source.into_u16()).or_default();
        let completed = slot.push_frame(
            &self.memory,
            self.extent_bytes,
            timeout,
            header,
            body,
            timestamp,
        )?;
        let Some(c) = completed else {
            return Ok(None);
        };
        if !self
            .dedup
            .insert(source.into_u16(), c.transfer_id, c.timestamp, timeout)
        {
            return Ok(None);
        }

        Ok(Some(ServiceRxTransfer {
            metadata: ServiceRxMetadata {
                base: TransferMetadata {
                    transfer_id: c.transfer_id,
                    priority: c.priority,
                    timestamp: c.timestamp,
                },
                remote_node_id: source,
            },
            payload: c.payload,
        }))
    }
}

// MARK: RX sessions

pub struct UdpMessageRxSession {
    delegate: Weak<RefCell<Delegate>>,
    pub(crate) core: Rc<RefCell<UdpMessageRxCore>>,
    _charge: Payload,
}

impl UdpMessageRxSession {
    pub(crate) fn new(
        delegate: Weak<RefCell<Delegate>>,
        core: Rc<RefCell<UdpMessageRxCore>>,
        charge: Payload,
    ) -> Self {
        Self {
            delegate,
            core,
            _charge: charge,
        }
    }
}

impl RxSession for UdpMessageRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.core.borrow_mut().transfer_id_timeout = timeout;
    }
}

impl MessageRxSession for UdpMessageRxSession {
    fn params(&self) -> MessageRxParams {
        self.core.borrow().params
    }

    fn receive(&mut self) -> Option<MessageRxTransfer> {
        self.core.borrow_mut().latest.take()
    }

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(MessageRxTransfer)>>) {
        self.core.borrow_mut().on_receive = callback;
    }
}

impl Drop for UdpMessageRxSession {
    fn drop(&mut self) {
        if let Some(delegate) = self.delegate.upgrade() {
            let subject = self.core.borrow().params.subject_id;
            let mut delegate = delegate.borrow_mut();
            delegate.msg_rx.remove(&subject);
            // The subject's multicast sockets are no longer needed.
            for media in delegate.media_mut() {
                media.msg_sockets.remove(&subject);
            }
        }
    }
}

macro_rules! udp_svc_rx_session {
    ($name:ident, $iface:ident, $params_ty:ident, $tree:ident, $params_fn:expr) => {
        pub struct $name {
            delegate: Weak<RefCell<Delegate>>,
            pub(crate) core: Rc<RefCell<UdpServiceRxCore>>,
            _charge: Payload,
        }

        impl $name {
            pub(crate) fn new(
                delegate: Weak<RefCell<Delegate>>,
                core: Rc<RefCell<UdpServiceRxCore>>,
                charge: Payload,
            ) -> Self {
                Self {
                    delegate,
                    core,
                    _charge: charge,
                }
            }
        }

        impl RxSession for $name {
            fn set_transfer_id_timeout(&mut self, timeout: Duration) {
                self.core.borrow_mut().transfer_id_timeout = timeout;
            }
        }

        impl $iface for $name {
            fn params(&self) -> $params_ty {
                let core = self.core.borrow();
                ($params_fn)(&*core)
            }

            fn receive(&mut self) -> Option<ServiceRxTransfer> {
                self.core.borrow_mut().latest.take()
            }

            fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceRxTransfer)>>) {
                self.core.borrow_mut().on_receive = callback;
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if let Some(delegate) = self.delegate.upgrade() {
                    let service = self.core.borrow().service_id;
                    delegate.borrow_mut().$tree.remove(&service);
                }
            }
        }
    };
}

udp_svc_rx_session!(
    UdpRequestRxSession,
    RequestRxSession,
    RequestRxParams,
    req_rx,
    |core: &UdpServiceRxCore| RequestRxParams {
        extent_bytes: core.extent_bytes,
        service_id: core.service_id,
    }
);

udp_svc_rx_session!(
    UdpResponseRxSession,
    ResponseRxSession,
    ResponseRxParams,
    resp_rx,
    |core: &UdpServiceRxCore| ResponseRxParams {
        extent_bytes: core.extent_bytes,
        service_id: core.service_id,
        server_node_id: core.only_from.unwrap_or(0),
    }
);

// MARK: TX sessions

/// Queues one transfer on every media, consulting the transient error
/// handler per media. Each media segments with its own socket MTU.
fn queue_on_all_media(
    delegate: &Rc<RefCell<Delegate>>,
    template: Header,
    destination: IpEndpoint,
    deadline: TimePoint,
    payload: &[u8],
) -> Result<(), AnyFailure> {
    let media_count = delegate.borrow().media_count();
    for index in 0..media_count {
        let outcome =
            delegate
                .borrow_mut()
                .queue_transfer(index, template, destination, deadline, payload);
        if let Err(failure) = outcome {
            if let Some(failure) = consult(delegate, ErrorSite::TxPush, index as u8, failure) {
                return Err(failure);
            }
        }
    }
    Ok(())
}

fn with_contiguous<R>(
    memory: &Memory,
    fragments: &[&[u8]],
    f: impl FnOnce(&[u8]) -> Result<R, AnyFailure>,
) -> Result<R, AnyFailure> {
    let mut non_empty = fragments.iter().filter(|f| !f.is_empty());
    match (non_empty.next(), non_empty.next()) {
        (None, _) => f(&[]),
        (Some(single), None) => f(single),
        (Some(_), Some(_)) => {
            let payload = memory.concat(fragments).ok_or(AnyFailure::Memory)?;
            f(&payload)
        }
    }
}

pub struct UdpMessageTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: MessageTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl UdpMessageTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: MessageTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for UdpMessageTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl MessageTxSession for UdpMessageTxSession {
    fn params(&self) -> MessageTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TransferMetadata, fragments: &[&[u8]]) -> Result<(), AnyFailure> {
        let delegate = self.delegate.upgrade().ok_or(AnyFailure::Argument)?;
        let (memory, local, min_mtu) = {
            let d = delegate.borrow();
            (d.memory.clone(), d.local_node_id, d.min_mtu())
        };
        let deadline = metadata.timestamp + self.send_timeout;

        with_contiguous(&memory, fragments, |payload| {
            // Anonymous transfers must fit one datagram on every media.
            if local.is_none()
                && payload.len() + crate::crc::Crc32C::LENGTH
                    > min_mtu.saturating_sub(wire::HEADER_SIZE)
            {
                return Err(AnyFailure::Argument);
            }
            let template = Header {
                priority: metadata.priority,
                source: local,
                destination: None,
                data_specifier: DataSpecifier::Message {
                    subject_id: self.params.subject_id,
                },
                transfer_id: metadata.transfer_id,
                frame_index: 0,
                end_of_transfer: false,
            };
            queue_on_all_media(
                &delegate,
                template,
                wire::message_endpoint(self.params.subject_id),
                deadline,
                payload,
            )
        })
    }
}

pub struct UdpRequestTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: RequestTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl UdpRequestTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: RequestTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for UdpRequestTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl RequestTxSession for UdpRequestTxSession {
    fn params(&self) -> RequestTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TransferMetadata, fragments: &[&[u8]]) -> Result<(), AnyFailure> {
        let delegate = self.delegate.upgrade().ok_or(AnyFailure::Argument)?;
        let (memory, local) = {
            let d = delegate.borrow();
            (d.memory.clone(), d.local_node_id)
        };
        // Service transfers cannot be anonymous.
        let local = local.ok_or(AnyFailure::Argument)?;
        let deadline = metadata.timestamp + self.send_timeout;

        with_contiguous(&memory, fragments, |payload| {
            let template = Header {
                priority: metadata.priority,
                source: Some(local),
                destination: NodeId::new(self.params.server_node_id),
                data_specifier: DataSpecifier::Request {
                    service_id: self.params.service_id,
                },
                transfer_id: metadata.transfer_id,
                frame_index: 0,
                end_of_transfer: false,
            };
            queue_on_all_media(
                &delegate,
                template,
                wire::service_endpoint(self.params.server_node_id),
                deadline,
                payload,
            )
        })
    }
}

pub struct UdpResponseTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: ResponseTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl UdpResponseTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: ResponseTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for UdpResponseTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl ResponseTxSession for UdpResponseTxSession {
    fn params(&self) -> ResponseTxParams {
        self.params
    }

    fn send(&mut self, metadata: &ServiceTxMetadata, fragments: &[&[u8]]) -> Result<(), AnyFailure> {
        if metadata.remote_node_id > wire::NODE_ID_MAX {
            return Err(AnyFailure::Argument);
        }
        let delegate = self.delegate.upgrade().ok_or(AnyFailure::Argument)?;
        let (memory, local) = {
            let d = delegate.borrow();
            (d.memory.clone(), d.local_node_id)
        };
        let local = local.ok_or(AnyFailure::Argument)?;
        let deadline = metadata.base.timestamp + self.send_timeout;

        with_contiguous(&memory, fragments, |payload| {
            let template = Header {
                priority: metadata.base.priority,
                source: Some(local),
                destination: NodeId::new(metadata.remote_node_id),
                data_specifier: DataSpecifier::Response {
                    service_id: self.params.service_id,
                },
                transfer_id: metadata.base.transfer_id,
                frame_index: 0,
                end_of_transfer: false,
            };
            queue_on_all_media(
                &delegate,
                template,
                wire::service_endpoint(metadata.remote_node_id),
                deadline,
                payload,
            )
        })
    }
}
