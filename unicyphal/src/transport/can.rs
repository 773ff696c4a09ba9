//! Cyphal/CAN transport
//!
//! Frames from every redundant CAN interface feed a shared set of RX
//! sessions; outgoing transfers are queued independently per interface.
//! Duplicate completed transfers (the same transfer seen on more than one
//! interface) are suppressed inside each RX session.
//!
//! `run` performs one cooperative step: drain each TX queue until its media
//! exerts backpressure, refresh hardware acceptance filters if the session
//! population changed, then pop at most one frame per media into
//! reassembly. RX session callbacks fire synchronously from here.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::mem::size_of;
use embedded_can::ExtendedId;

use log::trace;

use crate::can_media::{Filter, Media, Mtu};
use crate::core::{NodeId, Priority, TimePoint};
use crate::mem::Memory;
use crate::transport::{
    AnyFailure, ErrorSite, MessageRxParams, MessageRxSession, MessageRxTransfer, MessageTxParams,
    MessageTxSession, ProtocolParams, RequestRxParams, RequestRxSession, RequestTxParams,
    RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams, ResponseTxSession,
    ServiceRxTransfer, TransientErrorHandler, TransientErrorReport, Transport,
};

mod rx;
mod session;
mod tx;
pub mod wire;

pub use session::{
    CanMessageRxSession, CanMessageTxSession, CanRequestRxSession, CanRequestTxSession,
    CanResponseRxSession, CanResponseTxSession,
};
use session::{MessageRxCore, ServiceRxCore};
use tx::CanTxQueue;

/// Redundant interfaces supported per transport.
pub const MEDIA_COUNT_MAX: usize = 3;

struct MediaEntry {
    iface: Box<dyn Media>,
    queue: CanTxQueue,
    mtu: Mtu,
}

pub(crate) struct Delegate {
    pub memory: Memory,
    pub local_node_id: Option<NodeId>,
    media: Vec<MediaEntry>,
    frame_seq: u64,
    pub msg_rx: BTreeMap<u16, Weak<RefCell<MessageRxCore>>>,
    pub req_rx: BTreeMap<u16, Weak<RefCell<ServiceRxCore>>>,
    pub resp_rx: BTreeMap<u16, Weak<RefCell<ServiceRxCore>>>,
    transient_handler: Option<TransientErrorHandler>,
    pub filters_dirty: bool,
}

impl Delegate {
    pub fn min_mtu(&self) -> usize {
        self.media
            .iter()
            .map(|m| m.mtu.as_usize())
            .min()
            .unwrap_or(Mtu::Classic.as_usize())
    }

    /// Segments and queues one transfer on the given media.
    pub fn queue_transfer(
        &mut self,
        media_index: usize,
        can_id: ExtendedId,
        deadline: TimePoint,
        priority: Priority,
        transfer_id: u8,
        payload: &[u8],
    ) -> Result<(), AnyFailure> {
        let memory = self.memory.clone();
        let entry = &mut self.media[media_index];
        tx::push_transfer(
            &mut entry.queue,
            &memory,
            entry.mtu,
            can_id,
            deadline,
            priority,
            transfer_id,
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

/// The Cyphal/CAN transport over up to [`MEDIA_COUNT_MAX`] redundant
/// interfaces.
pub struct CanTransport {
    delegate: Rc<RefCell<Delegate>>,
}

impl CanTransport {
    /// Creates a transport.
    ///
    /// `tx_capacity` bounds the number of frames queued per media.
    /// `local_node_id`, when given, must fit the CAN 7-bit range; it may
    /// also be set later, once, via `set_local_node_id`.
    pub fn make(
        memory: Memory,
        media: Vec<Box<dyn Media>>,
        tx_capacity: usize,
        local_node_id: Option<u16>,
    ) -> Result<Self, AnyFailure> {
        if media.is_empty() || media.len() > MEDIA_COUNT_MAX {
            return Err(AnyFailure::Argument);
        }
        let local_node_id = match local_node_id {
            None => None,
            Some(id) if id <= wire::NODE_ID_MAX => NodeId::new(id),
            Some(_) => return Err(AnyFailure::Argument),
        };

        let media = media
            .into_iter()
            .map(|iface| {
                let mtu = iface.mtu();
                MediaEntry {
                    iface,
                    queue: CanTxQueue::new(tx_capacity),
                    mtu,
                }
            })
            .collect();

        Ok(Self {
            delegate: Rc::new(RefCell::new(Delegate {
                memory,
                local_node_id,
                media,
                frame_seq: 0,
                msg_rx: BTreeMap::new(),
                req_rx: BTreeMap::new(),
                resp_rx: BTreeMap::new(),
                transient_handler: None,
                filters_dirty: true,
            })),
        })
    }

    /// Installs (or clears) the transient error handler.
    pub fn set_transient_error_handler(&mut self, handler: Option<TransientErrorHandler>) {
        self.delegate.borrow_mut().transient_handler = handler;
    }

    fn run_media_transmit(&mut self, now: TimePoint) -> Result<(), AnyFailure> {
        let media_count = self.delegate.borrow().media.len();
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
                    match entry.queue.front() {
                        None => Step::Idle,
                        Some(frame) if frame.deadline <= now => {
                            let seq = frame.transfer_seq;
                            entry.queue.drop_transfer(seq);
                            trace!("can tx: expired transfer dropped, media {}", index);
                            Step::Expired
                        }
                        Some(frame) => {
                            match entry.iface.push(frame.deadline, frame.can_id, &frame.data) {
                                Ok(true) => {
                                    entry.queue.pop_front();
                                    Step::Sent
                                }
                                Ok(false) => Step::Backpressure,
                                Err(e) => {
                                    // The media rejected this frame for good;
                                    // the rest of its transfer is no longer
                                    // meaningful.
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
                            consult(&self.delegate, ErrorSite::MediaPush, index as u8, failure)
                        {
                            return Err(failure);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reconfigure_filters(&mut self) -> Result<(), AnyFailure> {
        if !self.delegate.borrow().filters_dirty {
            return Ok(());
        }

        let filters: Vec<Filter> = {
            let d = self.delegate.borrow();
            let mut filters: Vec<Filter> =
                d.msg_rx.keys().map(|&s| wire::subject_filter(s)).collect();
            if let Some(local) = d.local_node_id {
                if !d.req_rx.is_empty() || !d.resp_rx.is_empty() {
                    filters.push(wire::service_filter(local.into_u16()));
                }
            }
            filters
        };

        self.delegate.borrow_mut().filters_dirty = false;
        let media_count = self.delegate.borrow().media.len();
        for index in 0..media_count {
            let outcome = {
                let mut d = self.delegate.borrow_mut();
                d.media[index].iface.configure_filters(&filters)
            };
            if let Err(e) = outcome {
                // Retry on the next run regardless of the handler verdict.
                self.delegate.borrow_mut().filters_dirty = true;
                if let Some(failure) =
                    consult(&self.delegate, ErrorSite::MediaConfig, index as u8, e.into())
                {
                    return Err(failure);
                }
            }
        }
        Ok(())
    }

    fn run_media_receive(&mut self, _now: TimePoint) -> Result<(), AnyFailure> {
        let media_count = self.delegate.borrow().media.len();
        for index in 0..media_count {
            let mut buffer = [0u8; 64];
            let popped = {
                let mut d = self.delegate.borrow_mut();
                d.media[index].iface.pop(&mut buffer)
            };
            match popped {
                Err(e) => {
                    if let Some(failure) =
                        consult(&self.delegate, ErrorSite::MediaPop, index as u8, e.into())
                    {
                        return Err(failure);
                    }
                }
                Ok(None) => {}
                Ok(Some(frame)) => {
                    let length = frame.length.min(buffer.len());
                    self.accept_frame(
                        index as u8,
                        frame.timestamp,
                        frame.can_id.as_raw(),
                        &buffer[..length],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn accept_frame(
        &mut self,
        media_index: u8,
        timestamp: TimePoint,
        raw_id: u32,
        data: &[u8],
    ) -> Result<(), AnyFailure> {
        let Some(id) = wire::CanId::parse(raw_id) else {
            trace!("can rx: non-cyphal frame ignored");
            return Ok(());
        };

        match id {
            wire::CanId::Message {
                priority,
                subject_id,
                source,
            } => {
                let core = {
                    let d = self.delegate.borrow();
                    d.msg_rx.get(&subject_id.into_u16()).and_then(Weak::upgrade)
                };
                let Some(core) = core else {
                    return Ok(());
                };
                let outcome = core
                    .borrow_mut()
                    .accept_frame(source, priority, data, timestamp);
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
            wire::CanId::Service {
                priority,
                request_not_response,
                service_id,
                destination,
                source,
            } => {
                let (local, core) = {
                    let d = self.delegate.borrow();
                    let tree = if request_not_response {
                        &d.req_rx
                    } else {
                        &d.resp_rx
                    };
                    (
                        d.local_node_id,
                        tree.get(&service_id.into_u16()).and_then(Weak::upgrade),
                    )
                };
                if local != Some(destination) {
                    return Ok(());
                }
                let Some(core) = core else {
                    return Ok(());
                };
                let outcome = core
                    .borrow_mut()
                    .accept_frame(source, priority, data, timestamp);
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
fn deliver_message(core: &Rc<RefCell<MessageRxCore>>, transfer: MessageRxTransfer) {
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

fn deliver_service(core: &Rc<RefCell<ServiceRxCore>>, transfer: ServiceRxTransfer) {
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

impl Transport for CanTransport {
    fn protocol_params(&self) -> ProtocolParams {
        let d = self.delegate.borrow();
        ProtocolParams {
            max_transfer_id: wire::TRANSFER_ID_MODULO - 1,
            mtu_bytes: d.min_mtu(),
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
                d.filters_dirty = true;
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
            .allocate(size_of::<MessageRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(MessageRxCore::new(params, d.memory.clone())));
        d.msg_rx.insert(params.subject_id, Rc::downgrade(&core));
        d.filters_dirty = true;
        drop(d);

        Ok(Box::new(CanMessageRxSession::new(
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
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<CanMessageTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(CanMessageTxSession::new(
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
            .allocate(size_of::<ServiceRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(ServiceRxCore::new(
            params.extent_bytes,
            params.service_id,
            None,
            d.memory.clone(),
        )));
        d.req_rx.insert(params.service_id, Rc::downgrade(&core));
        d.filters_dirty = true;
        drop(d);

        Ok(Box::new(CanRequestRxSession::new(
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
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<CanRequestTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(CanRequestTxSession::new(
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
            .allocate(size_of::<ServiceRxCore>())
            .ok_or(AnyFailure::Memory)?;
        let core = Rc::new(RefCell::new(ServiceRxCore::new(
            params.extent_bytes,
            params.service_id,
            Some(params.server_node_id),
            d.memory.clone(),
        )));
        d.resp_rx.insert(params.service_id, Rc::downgrade(&core));
        d.filters_dirty = true;
        drop(d);

        Ok(Box::new(CanResponseRxSession::new(
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
        let charge = self
            .delegate
            .borrow()
            .memory
            .allocate(size_of::<CanResponseTxSession>())
            .ok_or(AnyFailure::Memory)?;
        Ok(Box::new(CanResponseTxSession::new(
            Rc::downgrade(&self.delegate),
            params,
            charge,
        )))
    }

    fn run(&mut self, now: TimePoint) -> Result<(), AnyFailure> {
        // TX first: transmission frees queue slots before new frames come
        // in, mirroring the resource pressure order of the wire.
        self.run_media_transmit(now)?;
        self.reconfigure_filters()?;
        self.run_media_receive(now)
    }
}
