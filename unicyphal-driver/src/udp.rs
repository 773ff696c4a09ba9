//! Cyphal/UDP media interface

use alloc::boxed::Box;
use core::fmt;
use unicyphal_core::TimePoint;

use crate::mem::Payload;
use crate::PlatformError;

/// The fixed UDP port of all Cyphal/UDP traffic.
pub const CYPHAL_PORT: u16 = 9382;

/// Datagram payload capacity assumed until a TX socket reports its own.
///
/// 1408 fits an Ethernet frame with common tunneling overheads.
pub const DEFAULT_MTU: usize = 1408;

/// An IPv4 endpoint in host byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpEndpoint {
    pub address: u32,
    pub port: u16,
}

impl fmt::Debug for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.address;
        write!(
            f,
            "{}.{}.{}.{}:{}",
            (a >> 24) & 0xff,
            (a >> 16) & 0xff,
            (a >> 8) & 0xff,
            a & 0xff,
            self.port
        )
    }
}

/// A received datagram with an owned payload.
///
/// The payload buffer is allocated by the media from its own memory
/// resource; ownership travels with the datagram through reassembly into the
/// application, and the storage returns to that resource when the final
/// owner drops it.
#[derive(Debug)]
pub struct Datagram {
    pub timestamp: TimePoint,
    pub payload: Payload,
}

/// A bound-and-joined receiving socket.
pub trait RxSocket {
    /// Takes the next pending datagram, if any. Non-blocking.
    fn receive(&mut self) -> Result<Option<Datagram>, PlatformError>;
}

/// A sending socket.
pub trait TxSocket {
    /// Usable datagram payload capacity of this socket's path.
    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    /// Offers a datagram (the concatenation of `fragments`) for sending.
    ///
    /// Returns `Ok(false)` when the socket cannot accept it right now; the
    /// transport keeps the frame queued and retries on the next run.
    fn send(
        &mut self,
        deadline: TimePoint,
        destination: IpEndpoint,
        dscp: u8,
        fragments: &[&[u8]],
    ) -> Result<bool, PlatformError>;
}

/// A UDP network interface as the transport consumes it.
///
/// Sockets are created lazily by the transport: TX sockets when the first
/// TX session appears, RX sockets when there is something to listen for
/// (a subscribed subject group, or the local RPC endpoint once the node id
/// is known).
pub trait Media {
    fn make_rx_socket(&mut self, endpoint: IpEndpoint) -> Result<Box<dyn RxSocket>, PlatformError>;

    fn make_tx_socket(&mut self) -> Result<Box<dyn TxSocket>, PlatformError>;
}
