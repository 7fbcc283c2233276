/*! A user-space TCP/IPv4 protocol engine.

The crate implements the connection-oriented half of a small IPv4
networking stack: an RFC 793 TCP engine (with the congestion control of
RFC 5681, the retransmission timer of RFC 6298, the acceptance rules of
RFC 5961 and the window scaling of RFC 1323) together with the Path-MTU
cache discovery depends on. It plugs into a host IPv4 layer through the
narrow [`ip::Ip4Tx`] trait and is driven from a single thread: received
protocol-6 payloads go into [`tcp::Engine::process`], timers fire from
[`tcp::Engine::poll`], and [`tcp::Engine::poll_at`] tells the event
loop when to come back.

There is no internal locking and no hidden clock; every entry point
takes the current [`time::Instant`], which keeps the engine fully
deterministic under test.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod ip;
pub mod pmtu;
mod rand;
pub mod storage;
pub mod tcp;
pub mod time;
pub mod wire;
