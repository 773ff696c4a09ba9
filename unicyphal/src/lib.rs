//! # Unicyphal
//!
//! A portable implementation of the Cyphal protocol stack \[1\]: the
//! Cyphal/CAN and Cyphal/UDP transport layers, the application-layer
//! register facility, and a deterministic cooperative executor that binds
//! them. Platform specifics (CAN controllers, UDP sockets, memory pools)
//! stay behind the `unicyphal-driver` interfaces.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐      ┌────────────────────┐
//!  │   Executor   │─────►│ transport.run(now) │
//!  └──────────────┘      └─────────┬──────────┘
//!        ▲                         ▼
//!  ┌─────┴──────┐     ┌─────────────────────────┐     ┌───────────┐
//!  │ Callbacks  │     │  CanTransport /         │◄───►│  Media    │
//!  │ (user app, │     │  UdpTransport           │     │ (driver)  │
//!  │  provider) │     │  ├ TX queues per media  │     └───────────┘
//!  └────────────┘     │  ├ RX session trees     │
//!        ▲            │  └ reassembly per port  │
//!        │            └───────────┬─────────────┘
//!  ┌─────┴────────────┐           ▼
//!  │ RegistryProvider │◄── sessions (msg/req/resp × tx/rx)
//!  │  over Registry   │
//!  └──────────────────┘
//! ```
//!
//! Everything runs on one thread. The executor dispatches due callbacks in
//! monotonic time order; one recurring callback is typically the
//! transport's `run`, which drains media RX into per-port reassembly state,
//! delivers completed transfers to RX sessions (invoking their `on_receive`
//! synchronously), and then drains the per-media TX queues until the media
//! exert backpressure.
//!
//! Memory is explicit: all allocations are admitted through a user-supplied
//! [`mem::MemoryResource`] and every failure path is a value, not a panic.
//!
//! ## Concurrency model
//!
//! Single-threaded, cooperative, no suspension points. Media interfaces are
//! polled; "not ready" is an ordinary result and the transport retries on
//! its next run. Virtual time is first class: the executor is parametrized
//! by its time source, so tests drive the whole stack deterministically.
//!
//! # References
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>
#![no_std]

extern crate alloc;

pub use unicyphal_core as core;
pub use unicyphal_driver::{can as can_media, mem, udp as udp_media, PlatformError};

pub(crate) mod crc;

pub mod data_types;
pub mod executor;
pub mod registry;
pub mod transport;
