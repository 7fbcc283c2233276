/*! Transmission Control Protocol engine.

The [`Engine`] owns every protocol control block, the listener table,
the four-tuple lookup index and the [Path-MTU cache](crate::pmtu). It is
single-threaded and cooperative: the IP layer feeds received segments
into [`Engine::process`], an event loop calls [`Engine::poll`] no later
than [`Engine::poll_at`], and the user talks to connections through
[`ConnHandle`]s.

Connections are exclusively owned by the engine. A [`ConnHandle`] is a
weak reference: once the PCB terminates, every operation on the handle
fails with [`Error::ConnectionAborted`].

User notifications ([`ConnectionEvents`], [`ListenerEvents`]) are
invoked in issuance order at the end of the work unit that caused them
(one received segment, one timer expiry). Callbacks are free to call
back into the engine.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::ip::Ip4Tx;
use crate::pmtu::{self, PmtuCache};
use crate::rand::Rand;
use crate::time::{Duration, Instant};
use crate::wire::{
    IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv4AddressExt, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber,
};

mod index;
mod input;
mod output;
mod pcb;
mod rtt;

#[cfg(test)]
mod tests;

use self::index::{Index, Tuple};
use self::pcb::{Ctx, Pcb, Timer, HEADER_OVERHEAD, MIN_ALLOWED_MSS};

pub use self::pcb::State;

/// A TCP ring buffer over user-provided (or owned) storage.
pub type SocketBuffer<'a> = crate::storage::RingBuffer<'a, u8>;

/// Largest window either side may operate with: 2^30 - 1, the RFC 1323
/// limit for a shift count of 14.
pub const MAX_WINDOW: u32 = 0x3fff_ffff;

/// Runtime engine configuration. The defaults are the values every
/// deployment starts from; embedded targets mostly shrink the timers.
#[derive(Debug, Clone)]
pub struct Config {
    /// RTO before the first round-trip measurement (RFC 6298: 1 s).
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// How long a passive open may sit in SYN-RECEIVED.
    pub syn_rcvd_timeout: Duration,
    /// How long an active open may sit in SYN-SENT.
    pub syn_sent_timeout: Duration,
    /// 2MSL quarantine of a closed connection's four-tuple.
    pub time_wait_time: Duration,
    /// Teardown budget of an abandoned (dropped-by-user) connection.
    pub abandoned_timeout: Duration,
    /// Coalescing delay between a user write and segment emission.
    pub output_delay: Duration,
    /// Output retry delay after a device-full transmit error.
    pub output_retry_full: Duration,
    /// Output retry delay after any other transmit error.
    pub output_retry_other: Duration,
    /// Minimum spacing of challenge ACKs per connection (RFC 5961).
    pub challenge_ack_interval: Duration,
    /// How often lowered Path-MTU estimates probe back up.
    pub pmtu_refresh_interval: Duration,
    /// Smallest receive-window growth worth a pure window update.
    pub wnd_ann_threshold: u32,
    /// Window-update granularity on abandoned connections.
    pub min_abandon_wnd_incr: u32,
    /// RFC 5961 §5: how far behind SND.UNA an ACK may fall before it is
    /// ignored.
    pub max_ack_before: u32,
    /// Duplicate ACKs that trigger fast retransmit (RFC 5681: 3).
    pub fast_rtx_dup_acks: u8,
    /// Duplicate ACKs past the trigger that still inflate cwnd.
    pub max_additional_dup_acks: u8,
    /// Receive window scale shift offered in our SYN (RFC 1323, <= 14).
    pub rcv_wnd_shift: u8,
    pub ttl: u8,
    pub tos: u8,
    /// Nagle's algorithm default for new connections.
    pub nagle: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(250),
            rto_max: Duration::from_secs(60),
            syn_rcvd_timeout: Duration::from_secs(20),
            syn_sent_timeout: Duration::from_secs(30),
            time_wait_time: Duration::from_secs(120),
            abandoned_timeout: Duration::from_secs(30),
            output_delay: Duration::from_micros(500),
            output_retry_full: Duration::from_millis(100),
            output_retry_other: Duration::from_secs(2),
            challenge_ack_interval: Duration::from_secs(1),
            pmtu_refresh_interval: Duration::from_secs(600),
            wnd_ann_threshold: 2700,
            min_abandon_wnd_incr: 65535,
            max_ack_before: 0xffff,
            fast_rtx_dup_acks: 3,
            max_additional_dup_acks: 32,
            rcv_wnd_shift: 6,
            ttl: 64,
            tos: 0,
            nagle: true,
        }
    }
}

/// User-visible failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No route to the remote address.
    NoRoute,
    /// A bounded table (PMTU cache, ephemeral ports) is exhausted.
    NoSlot,
    /// The listen endpoint is already taken.
    AddrInUse,
    /// The peer answered the SYN with a RST.
    ConnectionRefused,
    /// The peer reset an established connection.
    ConnectionReset,
    /// The handshake timed out.
    ConnectionTimeout,
    /// The connection is gone; the handle is stale.
    ConnectionAborted,
    /// The operation does not fit the connection's current state.
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NoRoute => write!(f, "no route"),
            Error::NoSlot => write!(f, "out of slots"),
            Error::AddrInUse => write!(f, "address in use"),
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::ConnectionReset => write!(f, "connection reset"),
            Error::ConnectionTimeout => write!(f, "connection timed out"),
            Error::ConnectionAborted => write!(f, "connection aborted"),
            Error::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl std::error::Error for Error {}

/// Result returned by [`Engine::poll`] and [`Engine::process`].
///
/// This contains information on whether socket states might have changed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PollResult {
    /// Socket state is guaranteed to not have changed.
    None,
    /// You should check the state of connections again for received
    /// data or completion of operations.
    SocketStateChanged,
}

/// Weak reference to a connection owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    index: usize,
    gen: u32,
}

/// Weak reference to a listener owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    index: usize,
    gen: u32,
}

/// Per-connection notifications. All methods default to no-ops so
/// implementors override only what they care about.
pub trait ConnectionEvents {
    /// An active open completed its handshake.
    fn on_established(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle) {}
    /// `len` new bytes are readable from the receive ring.
    fn on_data_received(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, _len: usize) {}
    /// The peer acknowledged `len` bytes; that much send-ring space was
    /// reclaimed.
    fn on_send_acked(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, _len: usize) {}
    /// The peer closed its send direction (EOF after the buffered data).
    fn on_peer_closed(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle) {}
    /// The connection failed; the handle is dead.
    fn on_error(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, _error: Error) {}
}

/// Listener notifications.
pub trait ListenerEvents {
    /// A handshake completed; [`Engine::accept`] will yield it.
    fn on_accept(&mut self, _tcp: &mut Engine<'_>, _listener: ListenerHandle) {}
}

pub(crate) enum ConnEvent {
    Established,
    DataReceived(usize),
    SendAcked(usize),
    PeerClosed,
    Error(Error),
}

/// A queued user notification. Holds the callback object itself so that
/// delivery survives the PCB slot being reused within the work unit.
pub(crate) enum Pending {
    Conn {
        events: Rc<RefCell<dyn ConnectionEvents>>,
        conn: ConnHandle,
        kind: ConnEvent,
    },
    Accept {
        events: Rc<RefCell<dyn ListenerEvents>>,
        listener: ListenerHandle,
    },
}

/// A RST waiting for a transmit opportunity, from `abort()` calls made
/// while no IP device was at hand.
pub(crate) struct PendingReset {
    tuple: Tuple,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
}

struct PcbSlot<'a> {
    gen: u32,
    pcb: Option<Pcb<'a>>,
}

pub(crate) struct Listener {
    endpoint: IpListenEndpoint,
    backlog: usize,
    init_rcv_wnd: u32,
    events: Rc<RefCell<dyn ListenerEvents>>,
    /// Established connections waiting in [`Engine::accept`].
    queue: VecDeque<ConnHandle>,
    /// Half-open plus queued children, bounded by `backlog`.
    pending: usize,
}

pub(crate) struct ListenerSlot {
    gen: u32,
    listener: Option<Listener>,
}

/// The TCP protocol engine.
pub struct Engine<'a> {
    config: Config,
    rand: Rand,
    now: Instant,
    pcbs: Vec<PcbSlot<'a>>,
    listeners: Vec<ListenerSlot>,
    index: Index,
    pmtu: PmtuCache,
    pending: VecDeque<Pending>,
    resets: Vec<PendingReset>,
}

impl<'a> Engine<'a> {
    /// Create an engine.
    ///
    /// `seed` feeds initial sequence number and ephemeral port
    /// selection; it should differ on every boot.
    pub fn new(config: Config, now: Instant, seed: u64) -> Engine<'a> {
        let pmtu = PmtuCache::new(now, config.pmtu_refresh_interval);
        Engine {
            rand: Rand::new(seed),
            now,
            pcbs: Vec::new(),
            listeners: Vec::new(),
            index: Index::new(),
            pmtu,
            pending: VecDeque::new(),
            resets: Vec::new(),
            config,
        }
    }

    /// Start listening on `endpoint`.
    ///
    /// `backlog` bounds half-open plus not-yet-accepted connections;
    /// excess SYNs are silently dropped. `init_rcv_wnd` is the receive
    /// window advertised during the handshake, before the accepting
    /// user attaches buffers.
    pub fn listen<T: Into<IpListenEndpoint>>(
        &mut self,
        endpoint: T,
        backlog: usize,
        init_rcv_wnd: u32,
        events: Rc<RefCell<dyn ListenerEvents>>,
    ) -> Result<ListenerHandle, Error> {
        let endpoint = endpoint.into();
        if endpoint.port == 0 {
            return Err(Error::InvalidState);
        }

        let slot = match self.listeners.iter().position(|s| s.listener.is_none()) {
            Some(slot) => slot,
            None => {
                self.listeners.push(ListenerSlot {
                    gen: 0,
                    listener: None,
                });
                self.listeners.len() - 1
            }
        };
        self.index
            .insert_listener(endpoint.port, endpoint.addr, slot)
            .map_err(|_| Error::AddrInUse)?;

        self.listeners[slot].listener = Some(Listener {
            endpoint,
            backlog: backlog.max(1),
            init_rcv_wnd: init_rcv_wnd.min(MAX_WINDOW),
            events,
            queue: VecDeque::new(),
            pending: 0,
        });
        net_trace!("tcp: listening on {}", endpoint);
        Ok(ListenerHandle {
            index: slot,
            gen: self.listeners[slot].gen,
        })
    }

    /// Stop listening. Connections not yet handed out through
    /// [`accept`](Self::accept) are aborted with a RST.
    pub fn close_listener(&mut self, handle: ListenerHandle) {
        let Some(slot) = self
            .listeners
            .get_mut(handle.index)
            .filter(|slot| slot.gen == handle.gen)
        else {
            return;
        };
        let Some(listener) = slot.listener.take() else {
            return;
        };
        slot.gen = slot.gen.wrapping_add(1);
        self.index
            .remove_listener(listener.endpoint.port, listener.endpoint.addr);
        net_trace!("tcp: closed listener on {}", listener.endpoint);

        for i in 0..self.pcbs.len() {
            let belongs = self.pcbs[i]
                .pcb
                .as_ref()
                .map_or(false, |pcb| pcb.listener == Some(handle));
            if belongs {
                let (pcb, mut ctx) = self.split(i);
                pcb.listener = None;
                pcb.abort(&mut ctx, None);
            }
        }
        self.sweep();
    }

    /// Take one established connection off a listener's queue,
    /// attaching buffers and callbacks. Returns `None` when the queue
    /// is empty or the listener is gone.
    pub fn accept(
        &mut self,
        handle: ListenerHandle,
        rx_buffer: SocketBuffer<'a>,
        tx_buffer: SocketBuffer<'a>,
        events: Rc<RefCell<dyn ConnectionEvents>>,
    ) -> Option<ConnHandle> {
        let listener = self
            .listeners
            .get_mut(handle.index)
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.listener.as_mut())?;
        let conn = listener.queue.pop_front()?;
        listener.pending = listener.pending.saturating_sub(1);

        let pcb = self.pcbs[conn.index].pcb.as_mut()?;
        pcb.listener = None;
        pcb.events = Some(events);
        pcb.rx_buffer = rx_buffer;
        pcb.tx_buffer = tx_buffer;
        Some(conn)
    }

    /// Open a connection to `remote`.
    ///
    /// The route is resolved, an ephemeral port picked, a PMTU observer
    /// registered and the SYN transmitted before this returns.
    pub fn connect(
        &mut self,
        ip: &mut dyn Ip4Tx,
        remote: IpEndpoint,
        rx_buffer: SocketBuffer<'a>,
        tx_buffer: SocketBuffer<'a>,
        events: Rc<RefCell<dyn ConnectionEvents>>,
    ) -> Result<ConnHandle, Error> {
        if remote.port == 0 || !remote.addr.x_is_unicast() {
            return Err(Error::NoRoute);
        }
        let route = ip.route(remote.addr).ok_or(Error::NoRoute)?;

        let mut local_port = None;
        for _ in 0..64 {
            let candidate = self.rand.rand_source_port();
            let tuple = Tuple {
                local: IpEndpoint::new(route.src_addr, candidate),
                remote,
            };
            if !self.index.contains(&tuple) {
                local_port = Some(candidate);
                break;
            }
        }
        let local_port = local_port.ok_or(Error::NoSlot)?;
        let tuple = Tuple {
            local: IpEndpoint::new(route.src_addr, local_port),
            remote,
        };

        let (mtu_handle, _) = self
            .pmtu
            .observe(self.now, remote.addr, Some(&route))
            .map_err(|err| match err {
                pmtu::Error::NoRoute => Error::NoRoute,
                pmtu::Error::NoSlot => Error::NoSlot,
            })?;

        let slot = self.alloc_pcb_slot();
        let handle = ConnHandle {
            index: slot,
            gen: self.pcbs[slot].gen,
        };
        let iss = self.initial_seq(&tuple);

        let mut pcb = Pcb::new(handle, tuple, &self.config, self.now);
        pcb.state = State::SynSent;
        pcb.events = Some(events);
        pcb.rx_buffer = rx_buffer;
        pcb.tx_buffer = tx_buffer;
        pcb.snd_una = iss;
        pcb.snd_nxt = iss;
        pcb.rcv_mss = route
            .mtu
            .saturating_sub(HEADER_OVERHEAD)
            .max(MIN_ALLOWED_MSS);
        pcb.base_snd_mss = pcb.rcv_mss;
        pcb.snd_mss = pcb.rcv_mss;
        pcb.mtu = Some(mtu_handle);
        pcb.sync_mss(&self.pmtu);
        pcb.expires = Some(self.now + self.config.syn_sent_timeout);

        if self.index.insert(&tuple, slot).is_err() {
            // The ephemeral port scan makes this unreachable.
            debug_assert!(false, "four-tuple collision on connect");
            if let Some(h) = pcb.mtu.take() {
                self.pmtu.release(h);
            }
            return Err(Error::NoSlot);
        }
        net_trace!("tcp: connecting {} -> {}", tuple.local, tuple.remote);
        self.pcbs[slot].pcb = Some(pcb);

        let (pcb, mut ctx) = self.split(slot);
        pcb.send_syn(&mut ctx, ip);
        Ok(handle)
    }

    /// Copy data into the send ring; returns how much fit. The segments
    /// go out after at most the configured output delay.
    pub fn send(&mut self, conn: ConnHandle, data: &[u8]) -> Result<usize, Error> {
        let at = self.now + self.config.output_delay;
        let pcb = self.conn_mut(conn)?;
        if !(pcb.state.is_snd_open() || pcb.state.is_syn_sent_or_rcvd()) {
            return Err(Error::InvalidState);
        }
        let len = pcb.tx_buffer.enqueue_slice(data);
        if len > 0 {
            pcb.schedule_output(at);
        }
        Ok(len)
    }

    /// Borrow the free region of the send ring for in-place filling;
    /// commit with [`provide_send`](Self::provide_send).
    pub fn send_ranges(&mut self, conn: ConnHandle) -> Result<(&mut [u8], &mut [u8]), Error> {
        let pcb = self.conn_mut(conn)?;
        if !(pcb.state.is_snd_open() || pcb.state.is_syn_sent_or_rcvd()) {
            return Err(Error::InvalidState);
        }
        Ok(pcb.tx_buffer.unallocated_ranges())
    }

    /// Commit `len` bytes previously written through
    /// [`send_ranges`](Self::send_ranges), without copying.
    pub fn provide_send(&mut self, conn: ConnHandle, len: usize) -> Result<(), Error> {
        let at = self.now + self.config.output_delay;
        let pcb = self.conn_mut(conn)?;
        if !(pcb.state.is_snd_open() || pcb.state.is_syn_sent_or_rcvd()) {
            return Err(Error::InvalidState);
        }
        if len > pcb.tx_buffer.window() {
            return Err(Error::InvalidState);
        }
        pcb.tx_buffer.enqueue_unallocated(len);
        if len > 0 {
            pcb.schedule_output(at);
        }
        Ok(())
    }

    /// Bytes queued in the send ring (sent-unacked plus unsent).
    pub fn send_queue(&self, conn: ConnHandle) -> Result<usize, Error> {
        Ok(self.conn(conn)?.tx_buffer.len())
    }

    /// Free space in the send ring.
    pub fn send_free(&self, conn: ConnHandle) -> Result<usize, Error> {
        Ok(self.conn(conn)?.tx_buffer.window())
    }

    /// Borrow the readable region of the receive ring: the stretch up
    /// to the wrap point first, the remainder second. Release with
    /// [`consume_recv`](Self::consume_recv).
    pub fn recv_ranges(&self, conn: ConnHandle) -> Result<(&[u8], &[u8]), Error> {
        Ok(self.conn(conn)?.rx_buffer.data_ranges())
    }

    /// Bytes waiting in the receive ring.
    pub fn recv_queue(&self, conn: ConnHandle) -> Result<usize, Error> {
        Ok(self.conn(conn)?.rx_buffer.len())
    }

    /// Release `len` bytes of the receive ring back to the window. A
    /// pure window update goes out once the window has grown by at
    /// least the announce threshold.
    pub fn consume_recv(&mut self, conn: ConnHandle, len: usize) -> Result<(), Error> {
        let now = self.now;
        let threshold = self.config.wnd_ann_threshold;
        let pcb = self.conn_mut(conn)?;
        if len > pcb.rx_buffer.len() {
            return Err(Error::InvalidState);
        }
        pcb.rx_buffer.dequeue_allocated(len);
        let wnd = pcb.rcv_wnd();
        if wnd.saturating_sub(pcb.rcv_ann_wnd) >= threshold.min(pcb.rx_buffer.capacity() as u32) {
            pcb.ack_pending = true;
            pcb.schedule_output(now);
        }
        Ok(())
    }

    /// Close the send direction: queue a FIN after the buffered data.
    /// Receiving remains possible until the peer closes too.
    pub fn shutdown_send(&mut self, conn: ConnHandle) -> Result<(), Error> {
        let now = self.now;
        let pcb = self.conn_mut(conn)?;
        match pcb.state {
            State::Established => pcb.state = State::FinWait1,
            State::CloseWait => pcb.state = State::LastAck,
            _ => return Err(Error::InvalidState),
        }
        pcb.fin_pending = true;
        pcb.schedule_output(now);
        Ok(())
    }

    /// Reset the connection. The peer gets a RST at the next transmit
    /// opportunity; the handle is dead immediately.
    pub fn abort(&mut self, conn: ConnHandle) {
        if self.conn(conn).is_err() {
            return;
        }
        let (pcb, mut ctx) = self.split(conn.index);
        pcb.abort(&mut ctx, None);
        self.sweep();
    }

    /// Give the connection up without resetting it: teardown finishes
    /// unattended (graceful close, bounded by the abandoned timeout),
    /// and the handle is dead immediately.
    pub fn close(&mut self, conn: ConnHandle) {
        if self.conn(conn).is_err() {
            return;
        }
        let abandoned_timeout = self.config.abandoned_timeout;
        let (pcb, mut ctx) = self.split(conn.index);
        pcb.events = None;
        pcb.abandoned = true;
        let drained = pcb.rx_buffer.len();
        if drained > 0 {
            pcb.rx_buffer.dequeue_allocated(drained);
        }
        match pcb.state {
            State::SynSent => pcb.enter_closed(&mut ctx, None),
            State::Established => {
                pcb.state = State::FinWait1;
                pcb.fin_pending = true;
                pcb.schedule_output(ctx.now);
            }
            State::CloseWait => {
                pcb.state = State::LastAck;
                pcb.fin_pending = true;
                pcb.schedule_output(ctx.now);
            }
            _ => {}
        }
        // TIME-WAIT keeps its own (longer) deadline.
        if !matches!(pcb.state, State::Closed | State::TimeWait | State::FinWait2TimeWait) {
            let deadline = ctx.now + abandoned_timeout;
            pcb.expires = Some(match pcb.expires {
                Some(t) if t <= deadline => t,
                _ => deadline,
            });
        }
        // The handle is dead from the user's point of view.
        self.pcbs[conn.index].gen = self.pcbs[conn.index].gen.wrapping_add(1);
        self.sweep();
    }

    /// Number of connections past their handshake and not yet parked
    /// in TIME-WAIT.
    pub fn active_connections(&self) -> usize {
        self.pcbs
            .iter()
            .filter_map(|slot| slot.pcb.as_ref())
            .filter(|pcb| pcb.state.is_active())
            .count()
    }

    /// The connection's state, as visible to the user.
    pub fn state(&self, conn: ConnHandle) -> Result<State, Error> {
        Ok(match self.conn(conn)?.state {
            State::FinWait2TimeWait => State::TimeWait,
            state => state,
        })
    }

    /// Whether the peer has closed its send direction.
    pub fn peer_closed(&self, conn: ConnHandle) -> Result<bool, Error> {
        Ok(self.conn(conn)?.rcv_fin)
    }

    /// Process one received TCP segment. This is the IPv4 receive
    /// callback for protocol 6; `src_addr`/`dst_addr` come from the IP
    /// header, `_df` is the Don't Fragment bit.
    pub fn process(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        _df: bool,
        segment: &[u8],
    ) -> PollResult {
        self.now = now;
        self.flush_resets(ip);

        let packet = match TcpPacket::new_checked(segment) {
            Ok(packet) => packet,
            Err(_) => {
                net_trace!("tcp: truncated segment from {}", src_addr);
                return PollResult::None;
            }
        };
        let repr = match TcpRepr::parse(&packet, &src_addr, &dst_addr) {
            Ok(repr) => repr,
            Err(_) => {
                net_trace!("tcp: malformed segment from {}", src_addr);
                return PollResult::None;
            }
        };
        net_trace!("tcp: received {}", repr);

        let tuple = Tuple {
            local: IpEndpoint::new(dst_addr, repr.dst_port),
            remote: IpEndpoint::new(src_addr, repr.src_port),
        };
        if let Some(slot) = self.index.lookup(&tuple) {
            let (pcb, mut ctx) = self.split(slot);
            pcb.process(&mut ctx, ip, &repr);
        } else if let Some(listener) = self.index.lookup_listener(dst_addr, repr.dst_port) {
            self.passive_open(ip, listener, &tuple, &repr);
        } else {
            self.reset_reply(ip, &tuple, &repr);
        }
        self.finish(ip)
    }

    /// Feed an ICMP "fragmentation needed" message into the PMTU cache
    /// and re-clamp the segment size of affected connections.
    pub fn process_icmp_ptb(&mut self, now: Instant, remote: Ipv4Address, mtu: Option<u16>) {
        self.now = now;
        if self.pmtu.report_frag_needed(now, remote, mtu).is_some() {
            self.sync_all_mss();
            for slot in &mut self.pcbs {
                if let Some(pcb) = slot.pcb.as_mut() {
                    if pcb.tuple.remote.addr == remote && pcb.state.can_output() {
                        pcb.schedule_output(now);
                    }
                }
            }
        }
    }

    /// Dispatch every due timer. Call no later than
    /// [`poll_at`](Self::poll_at) says.
    pub fn poll(&mut self, now: Instant, ip: &mut dyn Ip4Tx) -> PollResult {
        self.now = now;
        self.flush_resets(ip);
        if self.pmtu.refresh(now) {
            self.sync_all_mss();
        }
        for i in 0..self.pcbs.len() {
            if self.pcbs[i].pcb.is_some() {
                self.dispatch_timers(i, ip);
            }
        }
        self.finish(ip)
    }

    /// The earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn poll_at(&self) -> Option<Instant> {
        if !self.resets.is_empty() || !self.pending.is_empty() {
            return Some(self.now);
        }
        let mut at = self.pmtu.poll_at();
        for slot in &self.pcbs {
            if let Some(t) = slot.pcb.as_ref().and_then(|pcb| pcb.poll_at()) {
                if t < at {
                    at = t;
                }
            }
        }
        Some(at)
    }

    /// An advisory wait before the next [`poll`](Self::poll).
    pub fn poll_delay(&self, now: Instant) -> Option<Duration> {
        match self.poll_at() {
            Some(at) if now < at => Some(at - now),
            Some(_) => Some(Duration::ZERO),
            None => None,
        }
    }

    fn dispatch_timers(&mut self, i: usize, ip: &mut dyn Ip4Tx) {
        let now = self.now;

        let expired = self.pcbs[i]
            .pcb
            .as_ref()
            .unwrap()
            .expires
            .map_or(false, |t| now >= t);
        if expired {
            let (pcb, mut ctx) = self.split(i);
            pcb.expires = None;
            match pcb.state {
                State::SynSent | State::SynReceived => {
                    net_trace!("tcp: {}: handshake timed out", pcb.tuple.remote);
                    pcb.enter_closed(&mut ctx, Some(Error::ConnectionTimeout));
                }
                State::TimeWait => pcb.enter_closed(&mut ctx, None),
                _ if pcb.abandoned => {
                    net_trace!("tcp: {}: abandoned teardown timed out", pcb.tuple.remote);
                    pcb.abort(&mut ctx, None);
                }
                _ => {}
            }
            if self.pcbs[i].pcb.as_ref().unwrap().state == State::Closed {
                return;
            }
        }

        // Retransmission fires before any coalesced output.
        let timer = self.pcbs[i].pcb.as_ref().unwrap().timer;
        match timer {
            Timer::Retransmit { expires_at } if now >= expires_at => {
                let (pcb, mut ctx) = self.split(i);
                pcb.on_retransmit_timeout(&mut ctx, ip);
            }
            Timer::Persist { expires_at, delay } if now >= expires_at => {
                let (pcb, mut ctx) = self.split(i);
                pcb.on_persist_timeout(&mut ctx, ip, delay);
            }
            _ => {}
        }

        let out_due = self.pcbs[i]
            .pcb
            .as_ref()
            .unwrap()
            .out_at
            .map_or(false, |t| now >= t);
        if out_due {
            let (pcb, mut ctx) = self.split(i);
            pcb.out_at = None;
            pcb.dispatch(&mut ctx, ip);
        }
    }

    fn passive_open(&mut self, ip: &mut dyn Ip4Tx, lslot: usize, tuple: &Tuple, repr: &TcpRepr) {
        match (repr.control, repr.ack_number) {
            (TcpControl::Syn, None) => {}
            (TcpControl::Rst, _) => return,
            _ => {
                self.reset_reply(ip, tuple, repr);
                return;
            }
        }
        let Some(listener) = self.listeners[lslot].listener.as_ref() else {
            return;
        };
        if listener.pending >= listener.backlog {
            net_trace!("tcp: {}: backlog full, dropping SYN", listener.endpoint);
            return;
        }
        let parent = ListenerHandle {
            index: lslot,
            gen: self.listeners[lslot].gen,
        };
        let init_rcv_wnd = listener.init_rcv_wnd;

        let Some(route) = ip.route(tuple.remote.addr) else {
            net_trace!("tcp: no route back to {}, dropping SYN", tuple.remote);
            return;
        };
        let peer_mss = repr.max_seg_size.unwrap_or(536);
        if peer_mss < MIN_ALLOWED_MSS {
            net_debug!("tcp: {}: peer MSS {} too small", tuple.remote, peer_mss);
            return;
        }
        let Ok((mtu_handle, _)) = self.pmtu.observe(self.now, tuple.remote.addr, Some(&route))
        else {
            net_debug!("tcp: no PMTU slot for {}, dropping SYN", tuple.remote);
            return;
        };

        let slot = self.alloc_pcb_slot();
        let handle = ConnHandle {
            index: slot,
            gen: self.pcbs[slot].gen,
        };
        let iss = self.initial_seq(tuple);

        let mut pcb = Pcb::new(handle, *tuple, &self.config, self.now);
        pcb.state = State::SynReceived;
        pcb.listener = Some(parent);
        pcb.rcv_nxt = repr.seq_number + 1;
        pcb.snd_una = iss;
        pcb.snd_nxt = iss;
        pcb.snd_wnd = repr.window_len as u32; // never scaled on a SYN
        pcb.snd_wl1 = repr.seq_number;
        pcb.snd_wl2 = iss;
        pcb.rcv_mss = route
            .mtu
            .saturating_sub(HEADER_OVERHEAD)
            .max(MIN_ALLOWED_MSS);
        pcb.base_snd_mss = peer_mss.min(pcb.rcv_mss);
        pcb.snd_mss = pcb.base_snd_mss;
        pcb.mtu = Some(mtu_handle);
        pcb.init_rcv_wnd = init_rcv_wnd;
        if let Some(shift) = repr.window_scale {
            pcb.wnd_scale = true;
            pcb.snd_wnd_shift = shift;
            pcb.rcv_wnd_shift = self.config.rcv_wnd_shift.min(14);
        }
        pcb.expires = Some(self.now + self.config.syn_rcvd_timeout);

        if self.index.insert(tuple, slot).is_err() {
            debug_assert!(false, "lookup missed an indexed tuple");
            if let Some(handle) = pcb.mtu.take() {
                self.pmtu.release(handle);
            }
            return;
        }
        net_trace!("tcp: {} -> {}: passive open", tuple.remote, tuple.local);
        self.pcbs[slot].pcb = Some(pcb);
        if let Some(listener) = self.listeners[lslot].listener.as_mut() {
            listener.pending += 1;
        }

        let (pcb, mut ctx) = self.split(slot);
        pcb.sync_mss(ctx.pmtu);
        pcb.send_syn(&mut ctx, ip);
    }

    /// RFC 793 RST generation for segments without a matching PCB.
    fn reset_reply(&mut self, ip: &mut dyn Ip4Tx, tuple: &Tuple, repr: &TcpRepr) {
        if repr.control == TcpControl::Rst {
            return;
        }
        net_trace!("tcp: no connection for {}, resetting", tuple.remote);
        let (seq, ack) = match repr.ack_number {
            Some(ack) => (ack, None),
            None => (TcpSeqNumber(0), Some(repr.seq_number + repr.segment_len())),
        };
        output::send_rst(ip, &self.config, tuple, seq, ack);
    }

    fn finish(&mut self, ip: &mut dyn Ip4Tx) -> PollResult {
        self.flush_resets(ip);
        let result = self.drain_events();
        self.sweep();
        result
    }

    fn drain_events(&mut self) -> PollResult {
        let mut result = PollResult::None;
        while let Some(event) = self.pending.pop_front() {
            result = PollResult::SocketStateChanged;
            match event {
                Pending::Conn { events, conn, kind } => {
                    let mut events = events.borrow_mut();
                    match kind {
                        ConnEvent::Established => events.on_established(self, conn),
                        ConnEvent::DataReceived(len) => events.on_data_received(self, conn, len),
                        ConnEvent::SendAcked(len) => events.on_send_acked(self, conn, len),
                        ConnEvent::PeerClosed => events.on_peer_closed(self, conn),
                        ConnEvent::Error(error) => events.on_error(self, conn, error),
                    }
                }
                Pending::Accept { events, listener } => {
                    events.borrow_mut().on_accept(self, listener)
                }
            }
        }
        result
    }

    /// Resolve transient states and free CLOSED slots. Runs at the end
    /// of every work unit, after the user callbacks.
    fn sweep(&mut self) {
        let time_wait = self.config.time_wait_time;
        let now = self.now;
        for slot in &mut self.pcbs {
            let Some(pcb) = slot.pcb.as_mut() else {
                continue;
            };
            if pcb.state == State::FinWait2TimeWait {
                pcb.state = State::TimeWait;
                pcb.timer = Timer::Idle;
                pcb.expires = Some(now + time_wait);
            }
            if pcb.state == State::Closed {
                slot.gen = slot.gen.wrapping_add(1);
                slot.pcb = None;
            }
        }
    }

    fn flush_resets(&mut self, ip: &mut dyn Ip4Tx) {
        for reset in self.resets.drain(..) {
            output::send_rst(ip, &self.config, &reset.tuple, reset.seq, reset.ack);
        }
    }

    fn sync_all_mss(&mut self) {
        let Engine { pcbs, pmtu, .. } = self;
        for slot in pcbs.iter_mut() {
            if let Some(pcb) = slot.pcb.as_mut() {
                pcb.sync_mss(pmtu);
            }
        }
    }

    fn alloc_pcb_slot(&mut self) -> usize {
        match self.pcbs.iter().position(|slot| slot.pcb.is_none()) {
            Some(slot) => slot,
            None => {
                self.pcbs.push(PcbSlot { gen: 0, pcb: None });
                self.pcbs.len() - 1
            }
        }
    }

    /// Initial send sequence: randomized per four-tuple, reseeded from
    /// the clock at engine construction.
    fn initial_seq(&mut self, tuple: &Tuple) -> TcpSeqNumber {
        let mut mix = self.rand.rand_seq_no();
        mix = mix.wrapping_add(u32::from(tuple.local.addr)).rotate_left(7);
        mix = mix
            .wrapping_add(u32::from(tuple.remote.addr))
            .rotate_left(7);
        mix = mix.wrapping_add(((tuple.local.port as u32) << 16) | tuple.remote.port as u32);
        TcpSeqNumber(mix ^ self.now.total_micros() as u32)
    }

    fn conn(&self, handle: ConnHandle) -> Result<&Pcb<'a>, Error> {
        self.pcbs
            .get(handle.index)
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.pcb.as_ref())
            .ok_or(Error::ConnectionAborted)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Result<&mut Pcb<'a>, Error> {
        self.pcbs
            .get_mut(handle.index)
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.pcb.as_mut())
            .ok_or(Error::ConnectionAborted)
    }

    fn split(&mut self, slot: usize) -> (&mut Pcb<'a>, Ctx<'_>) {
        let Engine {
            config,
            now,
            pcbs,
            listeners,
            index,
            pmtu,
            pending,
            resets,
            ..
        } = self;
        let pcb = pcbs[slot].pcb.as_mut().expect("empty pcb slot");
        (
            pcb,
            Ctx {
                config,
                now: *now,
                pmtu,
                index,
                listeners,
                pending,
                resets,
            },
        )
    }
}
