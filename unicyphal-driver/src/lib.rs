//! Unicyphal platform interface
//!
//! The crate defines the contracts between platform code and the Unicyphal
//! stack. Limited scope facilitates compatibility across versions.
//! Platform crates (CAN controller drivers, UDP socket shims, memory pools)
//! should depend on this crate. Stack users should depend on the `unicyphal`
//! crate instead.
//!
//! Three families of contracts live here:
//! * [`mem`] — fallible memory resources. The stack performs no hidden
//!   allocation; every buffer and every piece of per-session state is
//!   admitted through a user-supplied resource and returned to it on drop.
//! * [`can`] — a classic CAN / CAN FD interface: frame pop and push with
//!   timestamps and transmission deadlines, plus hardware acceptance filter
//!   reconfiguration.
//! * [`udp`] — a Cyphal/UDP interface: factories for multicast RX sockets
//!   and TX sockets. Sockets hand received datagrams to the stack as owned
//!   [`mem::Payload`] buffers, so ownership travels with the bytes all the
//!   way to the application and the backing storage returns to the media's
//!   own resource when the application drops the transfer.
//!
//! Unlike interrupt-driven stacks, Unicyphal pulls data: the transport `run`
//! method polls each interface once per invocation. Interfaces therefore
//! must never block; "nothing available" and "not accepted, retry later"
//! are ordinary results, not errors. Genuine device faults are reported as
//! [`PlatformError`] values and routed through the transport's transient
//! error handler.
#![no_std]

extern crate alloc;

pub mod can;
pub mod mem;
pub mod udp;

/// Opaque platform-specific failure of a media interface or socket.
///
/// The code is reported to the transient error handler untouched; the stack
/// attaches the media index and the operation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformError(pub i32);
