/*! Interface to the IPv4 layer the TCP engine runs on.

The engine does not own an IP stack; it talks to one through the narrow
[`Ip4Tx`] trait. An implementation typically sits on top of an Ethernet
interface with ARP, routing and fragmentation of its own — none of which
the engine needs to know about. The receive direction has no trait: the
IP layer calls [`Engine::process`](crate::tcp::Engine::process) for every
delivered protocol-6 payload, and
[`Engine::process_icmp_ptb`](crate::tcp::Engine::process_icmp_ptb) for
ICMP "fragmentation needed" messages.
*/

use core::fmt;

use crate::wire::{IpProtocol, Ipv4Address};

/// Egress information for a destination, as resolved by the IP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Source address the egress interface would use.
    pub src_addr: Ipv4Address,
    /// MTU of the egress interface, in octets, including the IP header.
    pub mtu: u16,
    /// Whether the destination is directly attached (no gateway hop).
    pub is_local: bool,
}

/// Per-datagram metadata handed to [`Ip4Tx::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Meta {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub tos: u8,
    /// Set the Don't Fragment bit. Always set on TCP segments so that
    /// Path-MTU discovery sees the losses.
    pub dont_frag: bool,
}

/// Error returned by [`Ip4Tx::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No route to the destination.
    NoRoute,
    /// The device transmit queue is full; retrying shortly may succeed.
    BufferFull,
    /// The datagram exceeds the egress MTU and DF was set. Carries the
    /// MTU the datagram would have to fit, like a local ICMP type 3
    /// code 4 message would.
    FragNeeded(u16),
    /// Any other transmit failure.
    Other,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::NoRoute => write!(f, "no route"),
            SendError::BufferFull => write!(f, "buffer full"),
            SendError::FragNeeded(mtu) => write!(f, "fragmentation needed (mtu {mtu})"),
            SendError::Other => write!(f, "transmit error"),
        }
    }
}

impl std::error::Error for SendError {}

/// The transmit half of an IPv4 layer.
pub trait Ip4Tx {
    /// Resolve the egress route for `dst_addr`, or `None` when the
    /// destination is unreachable.
    fn route(&self, dst_addr: Ipv4Address) -> Option<Route>;

    /// Send one datagram with a payload of exactly `payload_len` octets.
    ///
    /// `emit` is called at most once, with a zeroed buffer of
    /// `payload_len` octets to fill in. It is not called when the
    /// transmit fails before buffer allocation.
    fn transmit(
        &mut self,
        meta: &Ipv4Meta,
        payload_len: usize,
        emit: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), SendError>;
}
