//! Concrete CAN session types, one per session kind
//!
//! RX session state ("cores") is shared between the owning session handle
//! and the transport's session tree: the handle holds the strong reference,
//! the tree a weak one, so dropping the handle both unlinks the tree node
//! and releases the state.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

use crate::core::{Duration, NodeId, Priority, TimePoint};
use crate::crc::Crc16;
use crate::mem::{Memory, Payload};
use crate::transport::can::rx::Reassembly;
use crate::transport::can::wire::{self, TRANSFER_ID_MODULO};
use crate::transport::can::{consult, Delegate};
use crate::transport::dedup::RecentTransfers;
use crate::transport::{
    AnyFailure, ErrorSite, MessageRxMetadata, MessageRxParams, MessageRxSession,
    MessageRxTransfer, MessageTxParams, MessageTxSession, RequestRxParams, RequestRxSession,
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams,
    ResponseTxSession, RxSession, ServiceRxMetadata, ServiceRxTransfer, ServiceTxMetadata,
    TransferMetadata, TxSession, DEFAULT_SEND_TIMEOUT, DEFAULT_TRANSFER_ID_TIMEOUT,
};

// MARK: RX session state

pub(crate) struct MessageRxCore {
    pub params: MessageRxParams,
    pub transfer_id_timeout: Duration,
    memory: Memory,
    sources: BTreeMap<u16, Reassembly>,
    dedup: RecentTransfers,
    pub latest: Option<MessageRxTransfer>,
    pub on_receive: Option<Box<dyn FnMut(MessageRxTransfer)>>,
}

impl MessageRxCore {
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
        source: Option<NodeId>,
        priority: Priority,
        data: &[u8],
        timestamp: TimePoint,
    ) -> Result<Option<MessageRxTransfer>, AnyFailure> {
        let timeout = self.transfer_id_timeout;
        self.sources.retain(|_, r| !r.is_stale(timestamp, timeout));

        let completed = match source {
            Some(node) => {
                let slot = self.sources.entry(node.into_u16()).or_default();
                let completed = slot.push_frame(
                    &self.memory,
                    self.params.extent_bytes,
                    timeout,
                    priority,
                    data,
                    timestamp,
                )?;
                match completed {
                    Some(c)
                        if self.dedup.insert(
                            node.into_u16(),
                            c.transfer_id.into(),
                            c.timestamp,
                            timeout,
                        ) =>
                    {
                        Some(c)
                    }
                    _ => None,
                }
            }
            // Anonymous transfers are single-frame; there is no source to
            // key reassembly or deduplication by.
            None => Reassembly::default().push_frame(
                &self.memory,
                self.params.extent_bytes,
                timeout,
                priority,
                data,
                timestamp,
            )?,
        };

        Ok(completed.map(|c| MessageRxTransfer {
            metadata: MessageRxMetadata {
                base: TransferMetadata {
                    transfer_id: c.transfer_id.into(),
                    priority: c.priority,
                    timestamp: c.timestamp,
                },
                source_node_id: source,
            },
            payload: c.payload,
        }))
    }
}

pub(crate) struct ServiceRxCore {
    pub extent_bytes: usize,
    pub service_id: u16,
    /// Responses are accepted from this node only; `None` for requests.
    pub only_from: Option<u16>,
    pub transfer_id_timeout: Duration,
    memory: Memory,
    sources: BTreeMap<u16, Reassembly>,
    dedup: RecentTransfers,
    pub latest: Option<ServiceRxTransfer>,
    pub on_receive: Option<Box<dyn FnMut(ServiceRxTransfer)>>,
}

impl ServiceRxCore {
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
        priority: Priority,
        data: &[u8],
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
            priority,
            data,
            timestamp,
        )?;
        let Some(c) = completed else {
            return Ok(None);
        };
        if !self
            .dedup
            .insert(source.into_u16(), c.transfer_id.into(), c.timestamp, timeout)
        {
            return Ok(None);
        }

        Ok(Some(ServiceRxTransfer {
            metadata: ServiceRxMetadata {
                base: TransferMetadata {
                    transfer_id: c.transfer_id.into(),
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

pub struct CanMessageRxSession {
    delegate: Weak<RefCell<Delegate>>,
    pub(crate) core: Rc<RefCell<MessageRxCore>>,
    _charge: Payload,
}

impl CanMessageRxSession {
    pub(crate) fn new(
        delegate: Weak<RefCell<Delegate>>,
        core: Rc<RefCell<MessageRxCore>>,
        charge: Payload,
    ) -> Self {
        Self {
            delegate,
            core,
            _charge: charge,
        }
    }
}

impl RxSession for CanMessageRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.core.borrow_mut().transfer_id_timeout = timeout;
    }
}

impl MessageRxSession for CanMessageRxSession {
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

impl Drop for CanMessageRxSession {
    fn drop(&mut self) {
        if let Some(delegate) = self.delegate.upgrade() {
            let subject = self.core.borrow().params.subject_id;
            let mut delegate = delegate.borrow_mut();
            delegate.msg_rx.remove(&subject);
            delegate.filters_dirty = true;
        }
    }
}

macro_rules! svc_rx_session {
    ($name:ident, $iface:ident, $params_ty:ident, $tree:ident, $params_fn:expr) => {
        pub struct $name {
            delegate: Weak<RefCell<Delegate>>,
            pub(crate) core: Rc<RefCell<ServiceRxCore>>,
            _charge: Payload,
        }

        impl $name {
            pub(crate) fn new(
                delegate: Weak<RefCell<Delegate>>,
                core: Rc<RefCell<ServiceRxCore>>,
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
                    let mut delegate = delegate.borrow_mut();
                    delegate.$tree.remove(&service);
                    delegate.filters_dirty = true;
                }
            }
        }
    };
}

svc_rx_session!(
    CanRequestRxSession,
    RequestRxSession,
    RequestRxParams,
    req_rx,
    |core: &ServiceRxCore| RequestRxParams {
        extent_bytes: core.extent_bytes,
        service_id: core.service_id,
    }
);

svc_rx_session!(
    CanResponseRxSession,
    ResponseRxSession,
    ResponseRxParams,
    resp_rx,
    |core: &ServiceRxCore| ResponseRxParams {
        extent_bytes: core.extent_bytes,
        service_id: core.service_id,
        server_node_id: core.only_from.unwrap_or(0),
    }
);

// MARK: TX sessions

fn wire_transfer_id(metadata: &TransferMetadata) -> u8 {
    (metadata.transfer_id % TRANSFER_ID_MODULO) as u8
}

/// Queues one encoded transfer on every media, consulting the transient
/// error handler per media.
fn queue_on_all_media(
    delegate: &Rc<RefCell<Delegate>>,
    can_id: embedded_can::ExtendedId,
    deadline: TimePoint,
    priority: Priority,
    transfer_id: u8,
    payload: &[u8],
) -> Result<(), AnyFailure> {
    let media_count = delegate.borrow().media.len();
    for index in 0..media_count {
        let outcome = delegate.borrow_mut().queue_transfer(
            index,
            can_id,
            deadline,
            priority,
            transfer_id,
            payload,
        );
        if let Err(failure) = outcome {
            if let Some(failure) = consult(delegate, ErrorSite::TxPush, index as u8, failure) {
                return Err(failure);
            }
        }
    }
    Ok(())
}

/// Borrows the fragments as one contiguous slice, concatenating through the
/// memory resource only when there is more than one non-empty fragment.
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

pub struct CanMessageTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: MessageTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl CanMessageTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: MessageTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for CanMessageTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl MessageTxSession for CanMessageTxSession {
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
            let can_id = match local {
                Some(node) => wire::message_id(
                    metadata.priority,
                    self.params.subject_id,
                    node.into_u16(),
                ),
                None => {
                    // Anonymous transfers must fit one frame on every media.
                    if payload.len() + 1 > min_mtu {
                        return Err(AnyFailure::Argument);
                    }
                    let mut crc = Crc16::new();
                    crc.add(payload);
                    wire::anonymous_message_id(
                        metadata.priority,
                        self.params.subject_id,
                        crc.get(),
                    )
                }
            };
            queue_on_all_media(
                &delegate,
                can_id,
                deadline,
                metadata.priority,
                wire_transfer_id(metadata),
                payload,
            )
        })
    }
}

pub struct CanRequestTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: RequestTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl CanRequestTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: RequestTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for CanRequestTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl RequestTxSession for CanRequestTxSession {
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
            let can_id = wire::service_id(
                metadata.priority,
                true,
                self.params.service_id,
                self.params.server_node_id,
                local.into_u16(),
            );
            queue_on_all_media(
                &delegate,
                can_id,
                deadline,
                metadata.priority,
                wire_transfer_id(metadata),
                payload,
            )
        })
    }
}

pub struct CanResponseTxSession {
    delegate: Weak<RefCell<Delegate>>,
    params: ResponseTxParams,
    send_timeout: Duration,
    _charge: Payload,
}

impl CanResponseTxSession {
    pub(crate) fn new(delegate: Weak<RefCell<Delegate>>, params: ResponseTxParams, charge: Payload) -> Self {
        Self {
            delegate,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            _charge: charge,
        }
    }
}

impl TxSession for CanResponseTxSession {
    fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }
}

impl ResponseTxSession for CanResponseTxSession {
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
            let can_id = wire::service_id(
                metadata.base.priority,
                false,
                self.params.service_id,
                metadata.remote_node_id,
                local.into_u16(),
            );
            queue_on_all_media(
                &delegate,
                can_id,
                deadline,
                metadata.base.priority,
                wire_transfer_id(&metadata.base),
                payload,
            )
        })
    }
}
