use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::pmtu::{MtuHandle, PmtuCache};
use crate::time::{Duration, Instant};
use crate::wire::{TcpSeqNumber, IPV4_HEADER_LEN, TCP_HEADER_LEN};

use super::index::{Index, Tuple};
use super::rtt::RttEstimator;
use super::{
    Config, ConnEvent, ConnHandle, ConnectionEvents, Error, ListenerHandle, ListenerSlot, Pending,
    PendingReset, SocketBuffer, MAX_WINDOW,
};

/// Combined IPv4 and TCP header overhead, the difference between a path
/// MTU and the segment payload that fits it.
pub(super) const HEADER_OVERHEAD: u16 = (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16;

/// Smallest MSS a connection is allowed to run with: what remains of the
/// minimum IPv4 MTU after the headers. Peers demanding less are refused.
pub(super) const MIN_ALLOWED_MSS: u16 = crate::wire::IPV4_MIN_MTU as u16 - HEADER_OVERHEAD;

/// The state of a TCP connection, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    /// A FIN arrived in FIN-WAIT-2. The connection sits in this state
    /// only until the user callbacks for the current work unit have run,
    /// then moves on to TIME-WAIT; user-facing state queries already
    /// report `TimeWait`.
    FinWait2TimeWait,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    pub(super) fn is_syn_sent_or_rcvd(self) -> bool {
        match self {
            State::SynSent | State::SynReceived => true,
            State::Closed
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::FinWait2TimeWait
            | State::CloseWait
            | State::Closing
            | State::LastAck
            | State::TimeWait => false,
        }
    }

    /// Whether incoming payload bytes can still be accepted.
    pub(super) fn is_accepting_data(self) -> bool {
        match self {
            State::Established | State::FinWait1 | State::FinWait2 => true,
            State::Closed
            | State::SynSent
            | State::SynReceived
            | State::FinWait2TimeWait
            | State::CloseWait
            | State::Closing
            | State::LastAck
            | State::TimeWait => false,
        }
    }

    /// Whether the output path may emit data or FIN segments.
    pub(super) fn can_output(self) -> bool {
        match self {
            State::Established
            | State::FinWait1
            | State::Closing
            | State::CloseWait
            | State::LastAck => true,
            State::Closed
            | State::SynSent
            | State::SynReceived
            | State::FinWait2
            | State::FinWait2TimeWait
            | State::TimeWait => false,
        }
    }

    /// Whether the user may still queue data for sending.
    pub(super) fn is_snd_open(self) -> bool {
        match self {
            State::Established | State::CloseWait => true,
            State::Closed
            | State::SynSent
            | State::SynReceived
            | State::FinWait1
            | State::FinWait2
            | State::FinWait2TimeWait
            | State::Closing
            | State::LastAck
            | State::TimeWait => false,
        }
    }

    /// Whether the connection is past its handshake and not yet parked.
    pub(super) fn is_active(self) -> bool {
        match self {
            State::Closed | State::SynSent | State::SynReceived | State::TimeWait => false,
            State::Established
            | State::FinWait1
            | State::FinWait2
            | State::FinWait2TimeWait
            | State::CloseWait
            | State::Closing
            | State::LastAck => true,
        }
    }

    pub(super) fn is_synchronized(self) -> bool {
        match self {
            State::Closed | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }
}

/// The retransmission timer slot. Doubles as the zero-window persist
/// timer, which is mutually exclusive with retransmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Timer {
    Idle,
    Retransmit { expires_at: Instant },
    Persist { expires_at: Instant, delay: Duration },
}

impl Timer {
    pub(super) fn poll_at(&self) -> Option<Instant> {
        match *self {
            Timer::Idle => None,
            Timer::Retransmit { expires_at } | Timer::Persist { expires_at, .. } => {
                Some(expires_at)
            }
        }
    }
}

/// Borrowed engine context threaded through PCB processing, so that a
/// PCB can touch the shared tables while the engine holds it mutably.
pub(super) struct Ctx<'e> {
    pub(super) config: &'e Config,
    pub(super) now: Instant,
    pub(super) pmtu: &'e mut PmtuCache,
    pub(super) index: &'e mut Index,
    pub(super) listeners: &'e mut Vec<ListenerSlot>,
    pub(super) pending: &'e mut VecDeque<Pending>,
    pub(super) resets: &'e mut Vec<PendingReset>,
}

/// A protocol control block: the entire per-connection engine state.
pub(super) struct Pcb<'a> {
    pub(super) handle: ConnHandle,
    pub(super) state: State,
    pub(super) tuple: Tuple,
    /// Parent listener while the connection has not been accepted.
    pub(super) listener: Option<ListenerHandle>,
    pub(super) events: Option<Rc<RefCell<dyn ConnectionEvents>>>,
    /// The user gave the connection up; teardown continues unattended.
    pub(super) abandoned: bool,

    // Send sequence space.
    pub(super) snd_una: TcpSeqNumber,
    pub(super) snd_nxt: TcpSeqNumber,
    pub(super) snd_wnd: u32,
    pub(super) snd_wl1: TcpSeqNumber,
    pub(super) snd_wl2: TcpSeqNumber,

    // Receive sequence space.
    pub(super) rcv_nxt: TcpSeqNumber,
    /// Receive window most recently advertised on the wire, relative to
    /// `rcv_nxt` as of that segment.
    pub(super) rcv_ann_wnd: u32,
    /// Window advertised while no receive buffer is attached yet
    /// (between SYN-ACK and accept).
    pub(super) init_rcv_wnd: u32,

    // Segment sizing.
    /// The MSS we advertised, derived from the egress interface MTU.
    pub(super) rcv_mss: u16,
    /// min(peer MSS, interface MSS); the ceiling `snd_mss` returns to
    /// when the path MTU estimate recovers.
    pub(super) base_snd_mss: u16,
    /// Effective segment payload limit: `base_snd_mss` clamped by the
    /// current path MTU estimate.
    pub(super) snd_mss: u16,

    // Congestion control (RFC 5681).
    pub(super) cwnd: u32,
    pub(super) ssthresh: u32,
    pub(super) cwnd_acked: u32,
    pub(super) dup_acks: u8,
    /// End of the recovery epoch; `Some` while in fast recovery or
    /// timeout recovery.
    pub(super) recover: Option<TcpSeqNumber>,
    /// Timeout recovery in progress; suppresses RTT sampling.
    pub(super) rtx_active: bool,

    pub(super) rtte: RttEstimator,

    // Window scaling (RFC 1323). Shifts stay zero unless `wnd_scale`.
    pub(super) wnd_scale: bool,
    /// Applies to window fields the peer sends us.
    pub(super) snd_wnd_shift: u8,
    /// Applies to window fields we put on the wire.
    pub(super) rcv_wnd_shift: u8,

    pub(super) tx_buffer: SocketBuffer<'a>,
    pub(super) rx_buffer: SocketBuffer<'a>,

    // Pending-work flags.
    pub(super) ack_pending: bool,
    /// The user has shut the send side down; FIN not yet on the wire.
    pub(super) fin_pending: bool,
    /// Our FIN occupies the sequence number before `snd_nxt`.
    pub(super) fin_sent: bool,
    /// The peer's FIN has been consumed; receive side is closed.
    pub(super) rcv_fin: bool,

    // Timers.
    pub(super) timer: Timer,
    /// State deadline: handshake timeouts, TIME-WAIT expiry, abandoned
    /// teardown limit.
    pub(super) expires: Option<Instant>,
    /// Delayed or retried output dispatch.
    pub(super) out_at: Option<Instant>,
    pub(super) challenge_ack_at: Instant,
    pub(super) last_send: Instant,

    pub(super) nagle: bool,
    pub(super) mtu: Option<MtuHandle>,
}

impl<'a> Pcb<'a> {
    pub(super) fn new(handle: ConnHandle, tuple: Tuple, config: &Config, now: Instant) -> Pcb<'a> {
        Pcb {
            handle,
            state: State::Closed,
            tuple,
            listener: None,
            events: None,
            abandoned: false,
            snd_una: TcpSeqNumber(0),
            snd_nxt: TcpSeqNumber(0),
            snd_wnd: 0,
            snd_wl1: TcpSeqNumber(0),
            snd_wl2: TcpSeqNumber(0),
            rcv_nxt: TcpSeqNumber(0),
            rcv_ann_wnd: 0,
            init_rcv_wnd: 0,
            rcv_mss: MIN_ALLOWED_MSS,
            base_snd_mss: MIN_ALLOWED_MSS,
            snd_mss: MIN_ALLOWED_MSS,
            cwnd: initial_cwnd(MIN_ALLOWED_MSS),
            ssthresh: MAX_WINDOW,
            cwnd_acked: 0,
            dup_acks: 0,
            recover: None,
            rtx_active: false,
            rtte: RttEstimator::new(config),
            wnd_scale: false,
            snd_wnd_shift: 0,
            rcv_wnd_shift: 0,
            tx_buffer: SocketBuffer::new(Vec::new()),
            rx_buffer: SocketBuffer::new(Vec::new()),
            ack_pending: false,
            fin_pending: false,
            fin_sent: false,
            rcv_fin: false,
            timer: Timer::Idle,
            expires: None,
            out_at: None,
            challenge_ack_at: now,
            last_send: now,
            nagle: config.nagle,
            mtu: None,
        }
    }

    /// Sequence space between `snd_una` and `snd_nxt`.
    pub(super) fn in_flight(&self) -> u32 {
        self.snd_nxt - self.snd_una
    }

    /// Payload bytes of the ring that have been sent but not acked,
    /// which is the in-flight count minus any SYN or FIN in it.
    pub(super) fn sent_data(&self) -> usize {
        let mut flight = self.in_flight() as usize;
        if self.state.is_syn_sent_or_rcvd() && flight > 0 {
            flight -= 1;
        }
        if self.fin_sent {
            debug_assert!(flight > 0);
            flight = flight.saturating_sub(1);
        }
        flight
    }

    /// Payload bytes queued in the ring but never transmitted.
    pub(super) fn unsent_data(&self) -> usize {
        self.tx_buffer.len() - self.sent_data()
    }

    /// The receive window backing the acceptance test and the window we
    /// put on the wire.
    pub(super) fn rcv_wnd(&self) -> u32 {
        let wnd = if self.rx_buffer.capacity() > 0 {
            self.rx_buffer.window() as u32
        } else {
            self.init_rcv_wnd
        };
        wnd.min(MAX_WINDOW)
    }

    /// Re-derive the effective MSS from the path MTU estimate.
    pub(super) fn sync_mss(&mut self, pmtu: &PmtuCache) {
        if let Some(handle) = &self.mtu {
            let estimate = pmtu.pmtu(handle);
            let path_mss = estimate.saturating_sub(HEADER_OVERHEAD).max(MIN_ALLOWED_MSS);
            let new = self.base_snd_mss.min(path_mss);
            if new != self.snd_mss {
                net_trace!(
                    "tcp: {}: snd_mss {} -> {}",
                    self.tuple.remote,
                    self.snd_mss,
                    new
                );
                self.snd_mss = new;
            }
        }
    }

    /// The earliest instant any of this PCB's timers wants dispatching.
    pub(super) fn poll_at(&self) -> Option<Instant> {
        let mut at = self.timer.poll_at();
        for t in [self.expires, self.out_at].into_iter().flatten() {
            at = Some(match at {
                Some(cur) if cur <= t => cur,
                _ => t,
            });
        }
        at
    }

    /// Ask for an output pass at `at`, keeping any earlier request.
    pub(super) fn schedule_output(&mut self, at: Instant) {
        self.out_at = Some(match self.out_at {
            Some(cur) if cur <= at => cur,
            _ => at,
        });
    }

    pub(super) fn queue_event(&self, ctx: &mut Ctx, kind: ConnEvent) {
        if let Some(events) = &self.events {
            ctx.pending.push_back(Pending::Conn {
                events: events.clone(),
                conn: self.handle,
                kind,
            });
        }
    }

    /// Tear the PCB down to CLOSED: unindex it, give the PMTU observer
    /// slot back, detach from the parent listener, and surface `error`
    /// to the user if one is attached. The engine frees the slot at the
    /// end of the work unit.
    pub(super) fn enter_closed(&mut self, ctx: &mut Ctx, error: Option<Error>) {
        if self.state == State::Closed {
            return;
        }
        net_trace!("tcp: {}: closed ({:?})", self.tuple.remote, error);

        ctx.index.remove(&self.tuple);
        if let Some(handle) = self.mtu.take() {
            ctx.pmtu.release(handle);
        }
        if let Some(parent) = self.listener.take() {
            if let Some(slot) = ctx.listeners.get_mut(parent.index) {
                if slot.gen == parent.gen {
                    if let Some(listener) = slot.listener.as_mut() {
                        listener.pending = listener.pending.saturating_sub(1);
                        let own = self.handle;
                        listener.queue.retain(|&queued| queued != own);
                    }
                }
            }
        }

        self.state = State::Closed;
        self.timer = Timer::Idle;
        self.expires = None;
        self.out_at = None;
        self.fin_pending = false;
        self.ack_pending = false;

        if let Some(error) = error {
            self.queue_event(ctx, ConnEvent::Error(error));
        }
    }

    /// Abort with a RST on the wire (queued, emitted at the next flush)
    /// and enter CLOSED.
    pub(super) fn abort(&mut self, ctx: &mut Ctx, error: Option<Error>) {
        if self.state.is_synchronized() || self.state == State::SynReceived {
            ctx.resets.push(PendingReset {
                tuple: self.tuple,
                seq: self.snd_nxt,
                ack: Some(self.rcv_nxt),
            });
        }
        self.enter_closed(ctx, error);
    }
}

/// RFC 3390 initial congestion window.
pub(super) fn initial_cwnd(mss: u16) -> u32 {
    let mss = mss as u32;
    if mss <= 1095 {
        4 * mss
    } else if mss <= 2190 {
        3 * mss
    } else {
        2 * mss
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_initial_cwnd_thresholds() {
        assert_eq!(initial_cwnd(536), 4 * 536);
        assert_eq!(initial_cwnd(1095), 4 * 1095);
        assert_eq!(initial_cwnd(1096), 3 * 1096);
        assert_eq!(initial_cwnd(1460), 3 * 1460);
        assert_eq!(initial_cwnd(2190), 3 * 2190);
        assert_eq!(initial_cwnd(8960), 2 * 8960);
    }

    #[test]
    fn test_state_predicates() {
        use State::*;
        for state in [
            Closed,
            SynSent,
            SynReceived,
            Established,
            FinWait1,
            FinWait2,
            FinWait2TimeWait,
            CloseWait,
            Closing,
            LastAck,
            TimeWait,
        ] {
            assert_eq!(
                state.is_syn_sent_or_rcvd(),
                matches!(state, SynSent | SynReceived)
            );
            assert_eq!(
                state.is_accepting_data(),
                matches!(state, Established | FinWait1 | FinWait2)
            );
            assert_eq!(
                state.can_output(),
                matches!(state, Established | FinWait1 | Closing | CloseWait | LastAck)
            );
            assert_eq!(state.is_snd_open(), matches!(state, Established | CloseWait));
            assert_eq!(
                state.is_active(),
                !matches!(state, Closed | SynSent | SynReceived | TimeWait)
            );
        }
    }
}
