//! Remote register access: the `List`/`Access` service provider
//!
//! Owns one request-RX and one response-TX session per service. Requests
//! are answered from within the transport's `run` (the RX sessions'
//! `on_receive` callbacks); the response deadline is derived from the
//! request timestamp plus the configurable response timeout.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use log::warn;

use crate::core::Duration;
use crate::data_types::register::name_to_string;
use crate::data_types::{
    AccessRequest, AccessResponse, ListRequest, ListResponse, Value, ACCESS_REQUEST_EXTENT,
    ACCESS_SERVICE_ID, LIST_REQUEST_EXTENT, LIST_SERVICE_ID,
};
use crate::registry::IntrospectableRegistry;
use crate::transport::{
    AnyFailure, RequestRxParams, RequestRxSession, ResponseTxParams, ResponseTxSession,
    ServiceRxTransfer, ServiceTxMetadata, Transport,
};

type SharedRegistry = Rc<RefCell<dyn IntrospectableRegistry>>;
type SharedTxSession = Rc<RefCell<Box<dyn ResponseTxSession>>>;

/// Serves `uavcan.register.List.1.0` and `uavcan.register.Access.1.0`
/// over one transport, answering from the given registry.
///
/// Construction acquires all four sessions before wiring any callback;
/// any failure unwinds completely, leaving no partial state behind.
/// Dropping the provider releases the sessions.
pub struct RegistryProvider {
    _list_rx: Box<dyn RequestRxSession>,
    _access_rx: Box<dyn RequestRxSession>,
    list_tx: SharedTxSession,
    access_tx: SharedTxSession,
}

impl RegistryProvider {
    pub fn make(
        transport: &mut dyn Transport,
        registry: SharedRegistry,
    ) -> Result<RegistryProvider, AnyFailure> {
        let mut list_rx = transport.make_request_rx_session(RequestRxParams {
            extent_bytes: LIST_REQUEST_EXTENT,
            service_id: LIST_SERVICE_ID,
        })?;
        let list_tx: SharedTxSession = Rc::new(RefCell::new(
            transport.make_response_tx_session(ResponseTxParams {
                service_id: LIST_SERVICE_ID,
            })?,
        ));
        let mut access_rx = transport.make_request_rx_session(RequestRxParams {
            extent_bytes: ACCESS_REQUEST_EXTENT,
            service_id: ACCESS_SERVICE_ID,
        })?;
        let access_tx: SharedTxSession = Rc::new(RefCell::new(
            transport.make_response_tx_session(ResponseTxParams {
                service_id: ACCESS_SERVICE_ID,
            })?,
        ));

        {
            let registry = registry.clone();
            let session = list_tx.clone();
            list_rx.set_on_receive(Some(Box::new(move |transfer| {
                on_list_request(&registry, &session, transfer);
            })));
        }
        {
            let session = access_tx.clone();
            access_rx.set_on_receive(Some(Box::new(move |transfer| {
                on_access_request(&registry, &session, transfer);
            })));
        }

        Ok(RegistryProvider {
            _list_rx: list_rx,
            _access_rx: access_rx,
            list_tx,
            access_tx,
        })
    }

    /// Replaces the response deadline margin of both services.
    /// Default [`crate::transport::DEFAULT_SEND_TIMEOUT`].
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.list_tx.borrow_mut().set_send_timeout(timeout);
        self.access_tx.borrow_mut().set_send_timeout(timeout);
    }
}

/// Echoes the request's transfer id, priority, and timestamp; the TX
/// session turns the timestamp into the response deadline.
fn response_metadata(request: &ServiceRxTransfer) -> ServiceTxMetadata {
    ServiceTxMetadata {
        base: request.metadata.base,
        remote_node_id: request.metadata.remote_node_id.into_u16(),
    }
}

fn on_list_request(
    registry: &SharedRegistry,
    session: &SharedTxSession,
    transfer: ServiceRxTransfer,
) {
    let Ok(request) = ListRequest::deserialize(&transfer.payload) else {
        return;
    };
    let name = registry
        .borrow()
        .index(usize::from(request.index))
        .unwrap_or_default();

    let response = ListResponse {
        name: name.into_bytes(),
    };
    let mut bytes = Vec::new();
    response.serialize(&mut bytes);

    let metadata = response_metadata(&transfer);
    if let Err(failure) = session.borrow_mut().send(&metadata, &[&bytes]) {
        warn!("registry provider: list response dropped: {}", failure);
    }
}

fn on_access_request(
    registry: &SharedRegistry,
    session: &SharedTxSession,
    transfer: ServiceRxTransfer,
) {
    let Ok(request) = AccessRequest::deserialize(&transfer.payload) else {
        return;
    };
    let name = name_to_string(&request.name).unwrap_or_default();

    // A non-empty value is a write attempt; the outcome is reported only
    // through the read-back below, per the service contract.
    if !matches!(request.value, Value::Empty) {
        let _ = registry.borrow_mut().set(&name, &request.value);
    }

    let response = match registry.borrow().get(&name) {
        Some(found) => AccessResponse {
            timestamp_usec: 0,
            mutable: found.flags.mutable,
            persistent: found.flags.persistent,
            value: found.value,
        },
        None => AccessResponse {
            timestamp_usec: 0,
            mutable: false,
            persistent: false,
            value: Value::Empty,
        },
    };
    let mut bytes = Vec::new();
    response.serialize(&mut bytes);

    let metadata = response_metadata(&transfer);
    if let Err(failure) = session.borrow_mut().send(&metadata, &[&bytes]) {
        warn!("registry provider: access response dropped: {}", failure);
    }
}
