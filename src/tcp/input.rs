use crate::ip::Ip4Tx;
use crate::wire::{TcpControl, TcpRepr};

use super::output::send_rst;
use super::pcb::{initial_cwnd, Ctx, Pcb, Timer, MIN_ALLOWED_MSS};
use super::{ConnEvent, Error, Pending, State, MAX_WINDOW};

impl<'a> Pcb<'a> {
    /// Process one segment addressed to this connection. The engine has
    /// already matched the four-tuple and verified the checksum.
    pub(super) fn process(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx, repr: &TcpRepr) {
        debug_assert!(self.state != State::Closed);
        match self.state {
            State::SynSent => self.process_syn_sent(ctx, ip, repr),
            State::SynReceived => self.process_syn_rcvd(ctx, ip, repr),
            State::TimeWait | State::FinWait2TimeWait => {
                // The quarantined tuple answers everything except RST
                // with a challenge ACK.
                if repr.control != TcpControl::Rst {
                    self.challenge_ack(ctx, ip);
                }
            }
            _ => self.process_synchronized(ctx, ip, repr),
        }
        if self.state != State::Closed {
            self.dispatch(ctx, ip);
        }
    }

    fn process_syn_sent(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx, repr: &TcpRepr) {
        // An ACK, when present, has to cover our SYN exactly.
        if let Some(ack) = repr.ack_number {
            if ack != self.snd_nxt {
                net_trace!("tcp: {}: bad ACK in SYN-SENT", self.tuple.remote);
                if repr.control != TcpControl::Rst {
                    send_rst(ip, ctx.config, &self.tuple, ack, None);
                }
                return;
            }
        }

        match repr.control {
            TcpControl::Rst => {
                if repr.ack_number.is_some() {
                    self.enter_closed(ctx, Some(Error::ConnectionRefused));
                }
            }
            TcpControl::Syn => {
                self.rcv_nxt = repr.seq_number + 1;

                // RFC 1122: assume 536 when the peer sent no MSS option.
                let peer_mss = repr.max_seg_size.unwrap_or(536);
                if peer_mss < MIN_ALLOWED_MSS {
                    net_debug!("tcp: {}: peer MSS {} too small", self.tuple.remote, peer_mss);
                    self.abort(ctx, Some(Error::ConnectionRefused));
                    return;
                }
                self.base_snd_mss = peer_mss.min(self.rcv_mss);
                self.snd_mss = self.base_snd_mss;
                self.sync_mss(ctx.pmtu);

                // Scaling applies iff both SYNs carried the option; ours
                // always does.
                if let Some(shift) = repr.window_scale {
                    self.wnd_scale = true;
                    self.snd_wnd_shift = shift;
                    self.rcv_wnd_shift = ctx.config.rcv_wnd_shift.min(14);
                }
                self.snd_wnd = repr.window_len as u32; // never scaled on a SYN
                self.snd_wl1 = repr.seq_number;
                self.snd_wl2 = self.snd_una;

                if repr.ack_number.is_some() {
                    self.snd_una = self.snd_nxt;
                    self.snd_wl2 = self.snd_nxt;
                    self.establish(ctx);
                    self.ack_pending = true;
                    self.queue_event(ctx, ConnEvent::Established);
                } else {
                    // Simultaneous open: answer the crossed SYN with a
                    // SYN-ACK and meet the peer in SYN-RECEIVED.
                    net_trace!("tcp: {}: simultaneous open", self.tuple.remote);
                    self.state = State::SynReceived;
                    self.expires = Some(ctx.now + ctx.config.syn_rcvd_timeout);
                    self.send_syn(ctx, ip);
                }
            }
            _ => {}
        }
    }

    fn process_syn_rcvd(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx, repr: &TcpRepr) {
        if repr.control == TcpControl::Rst {
            // A refused passive open dies silently; a simultaneous open
            // surfaces the refusal.
            let error = if self.events.is_some() {
                Some(Error::ConnectionRefused)
            } else {
                None
            };
            self.enter_closed(ctx, error);
            return;
        }
        if repr.control == TcpControl::Syn {
            if repr.seq_number + 1 == self.rcv_nxt {
                // Retransmitted SYN: the SYN-ACK got lost, repeat it.
                self.send_syn(ctx, ip);
            } else {
                self.challenge_ack(ctx, ip);
            }
            return;
        }
        if !self.seq_acceptable(repr) {
            self.challenge_ack(ctx, ip);
            return;
        }
        let Some(ack) = repr.ack_number else { return };
        if ack != self.snd_nxt {
            // RFC 793: <SEQ=SEG.ACK><CTL=RST>
            send_rst(ip, ctx.config, &self.tuple, ack, None);
            return;
        }

        self.snd_una = ack;
        self.snd_wnd = (repr.window_len as u32) << self.snd_wnd_shift;
        self.snd_wl1 = repr.seq_number;
        self.snd_wl2 = ack;
        self.establish(ctx);
        net_trace!("tcp: {}: established", self.tuple.remote);

        if let Some(parent) = self.listener {
            let listener = ctx
                .listeners
                .get_mut(parent.index)
                .filter(|slot| slot.gen == parent.gen)
                .and_then(|slot| slot.listener.as_mut());
            match listener {
                Some(listener) => {
                    listener.queue.push_back(self.handle);
                    ctx.pending.push_back(Pending::Accept {
                        events: listener.events.clone(),
                        listener: parent,
                    });
                }
                None => {
                    self.abort(ctx, None);
                    return;
                }
            }
        } else {
            // A simultaneous open completes like an active connect.
            self.queue_event(ctx, ConnEvent::Established);
        }

        // Data or a FIN may ride on the handshake-completing ACK.
        self.process_data(ctx, repr);
    }

    fn process_synchronized(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx, repr: &TcpRepr) {
        // RFC 793 §3.9 sequence acceptability. Rejected segments still
        // earn a "keep-alive" ACK so the peer can re-synchronize.
        if !self.seq_acceptable(repr) {
            if repr.control != TcpControl::Rst {
                net_trace!(
                    "tcp: {}: unacceptable seq {}, re-acking",
                    self.tuple.remote,
                    repr.seq_number
                );
                self.challenge_ack(ctx, ip);
            }
            return;
        }
        if repr.control == TcpControl::Rst {
            // RFC 5961 §3: only an exact RCV.NXT match resets; anything
            // else in the window gets a challenge.
            if repr.seq_number == self.rcv_nxt {
                self.enter_closed(ctx, Some(Error::ConnectionReset));
            } else {
                self.challenge_ack(ctx, ip);
            }
            return;
        }
        if repr.control == TcpControl::Syn {
            // RFC 5961 §4.
            self.challenge_ack(ctx, ip);
            return;
        }
        let Some(ack) = repr.ack_number else {
            net_trace!("tcp: {}: segment without ACK dropped", self.tuple.remote);
            return;
        };
        // RFC 5961 §5 acceptance: SND.UNA - MAX.SND.WND =< SEG.ACK =< SND.NXT.
        let base = self.snd_una - ctx.config.max_ack_before as usize;
        if !ack.between(base, self.snd_nxt) {
            if ack.gt(self.snd_nxt) {
                // Acks data never sent.
                self.challenge_ack(ctx, ip);
            }
            return;
        }

        self.process_ack(ctx, ip, repr, ack);
        if self.state == State::Closed {
            return;
        }
        self.process_data(ctx, repr);
    }

    fn process_ack(
        &mut self,
        ctx: &mut Ctx,
        ip: &mut dyn Ip4Tx,
        repr: &TcpRepr,
        ack: crate::wire::TcpSeqNumber,
    ) {
        let acked = ack - self.snd_una;
        let seg_wnd = (repr.window_len as u32) << self.snd_wnd_shift;
        let is_dup = acked == 0
            && repr.payload.is_empty()
            && repr.control.quash_psh() == TcpControl::None
            && seg_wnd == self.snd_wnd
            && self.in_flight() > 0;

        // Window update, (WL1, WL2) ordered so reordered segments never
        // roll the window back.
        if self.snd_wl1.lt(repr.seq_number)
            || (self.snd_wl1 == repr.seq_number && self.snd_wl2.le(ack))
        {
            let was_zero = self.snd_wnd == 0;
            self.snd_wnd = seg_wnd;
            self.snd_wl1 = repr.seq_number;
            self.snd_wl2 = ack;
            if was_zero && seg_wnd > 0 {
                // The window reopened; persist probing is over.
                if matches!(self.timer, Timer::Persist { .. }) {
                    self.timer = if self.in_flight() > 0 {
                        Timer::Retransmit {
                            expires_at: ctx.now + self.rtte.rto(),
                        }
                    } else {
                        Timer::Idle
                    };
                }
            }
        }

        if acked > 0 {
            self.snd_una = ack;
            let data_acked = (acked as usize).min(self.tx_buffer.len());
            if data_acked > 0 {
                self.tx_buffer.dequeue_allocated(data_acked);
            }
            let fin_acked = self.fin_sent && self.snd_una == self.snd_nxt;

            if !self.rtx_active {
                self.rtte.on_ack(ctx.config, ctx.now, ack);
            }

            match self.recover {
                Some(recover) if ack.ge(recover) => {
                    // Recovery epoch complete.
                    self.cwnd = self.ssthresh;
                    self.cwnd_acked = 0;
                    self.recover = None;
                    self.rtx_active = false;
                    self.dup_acks = 0;
                }
                Some(_) if !self.rtx_active => {
                    // Partial ACK in SACK-free fast recovery: the next
                    // segment is lost too (RFC 6582).
                    self.retransmit_one(ctx, ip);
                }
                _ => {
                    self.grow_cwnd(acked);
                    self.dup_acks = 0;
                }
            }

            if data_acked > 0 {
                self.queue_event(ctx, ConnEvent::SendAcked(data_acked));
            }

            // The retransmission timer tracks the oldest outstanding
            // byte, so every cumulative ACK restarts it.
            if self.in_flight() > 0 {
                if !matches!(self.timer, Timer::Persist { .. }) {
                    self.timer = Timer::Retransmit {
                        expires_at: ctx.now + self.rtte.rto(),
                    };
                }
            } else if matches!(self.timer, Timer::Retransmit { .. }) {
                self.timer = Timer::Idle;
            }

            if fin_acked {
                match self.state {
                    State::FinWait1 => self.state = State::FinWait2,
                    State::Closing => {
                        self.state = State::TimeWait;
                        self.timer = Timer::Idle;
                        self.expires = Some(ctx.now + ctx.config.time_wait_time);
                    }
                    State::LastAck => self.enter_closed(ctx, None),
                    _ => {}
                }
            }
        } else if is_dup {
            self.on_duplicate_ack(ctx, ip);
        }
    }

    fn grow_cwnd(&mut self, acked: u32) {
        let mss = self.snd_mss as u32;
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd = (self.cwnd + acked.min(mss)).min(MAX_WINDOW);
        } else {
            // Congestion avoidance: one MSS per window's worth of ACKs.
            self.cwnd_acked += acked;
            if self.cwnd_acked >= self.cwnd {
                self.cwnd_acked -= self.cwnd;
                self.cwnd = (self.cwnd + mss).min(MAX_WINDOW);
            }
        }
    }

    fn on_duplicate_ack(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        let config = ctx.config;
        self.dup_acks = self.dup_acks.saturating_add(1);

        if self.dup_acks == config.fast_rtx_dup_acks && self.recover.is_none() {
            // Fast retransmit (RFC 5681).
            let mss = self.snd_mss as u32;
            self.ssthresh = (self.in_flight() / 2).max(2 * mss);
            self.cwnd = self.ssthresh + config.fast_rtx_dup_acks as u32 * mss;
            self.recover = Some(self.snd_nxt);
            net_trace!(
                "tcp: {}: fast retransmit, ssthresh={}",
                self.tuple.remote,
                self.ssthresh
            );
            self.retransmit_one(ctx, ip);
        } else if self.dup_acks > config.fast_rtx_dup_acks
            && self.dup_acks <= config.fast_rtx_dup_acks + config.max_additional_dup_acks
            && self.recover.is_some()
        {
            // Each further duplicate signals another segment left the
            // network; inflate so the output pass can fill the hole.
            self.cwnd = (self.cwnd + self.snd_mss as u32).min(MAX_WINDOW);
        }
    }

    /// Absorb in-sequence payload and FIN. Out-of-order segments are
    /// dropped whole; there is no reassembly queue, retransmission
    /// covers the gap.
    fn process_data(&mut self, ctx: &mut Ctx, repr: &TcpRepr) {
        let fin = repr.control == TcpControl::Fin;
        if repr.payload.is_empty() && !fin {
            return;
        }

        let mut seq = repr.seq_number;
        let mut data = repr.payload;
        // Trim the overlap with bytes we already have.
        if seq.lt(self.rcv_nxt) {
            let trim = ((self.rcv_nxt - seq) as usize).min(data.len());
            data = &data[trim..];
            seq = seq + trim;
        }
        if seq != self.rcv_nxt {
            net_trace!(
                "tcp: {}: out-of-order seq {} (expected {})",
                self.tuple.remote,
                seq,
                self.rcv_nxt
            );
            self.ack_pending = true;
            return;
        }

        let mut all_absorbed = true;
        if !data.is_empty() {
            if !self.state.is_accepting_data() {
                net_trace!(
                    "tcp: {}: payload in {:?} dropped",
                    self.tuple.remote,
                    self.state
                );
                self.ack_pending = true;
                return;
            }
            let wnd = self.rcv_wnd() as usize;
            let absorbed = self.rx_buffer.enqueue_slice(&data[..data.len().min(wnd)]);
            self.rcv_nxt += absorbed;
            self.rcv_ann_wnd = self.rcv_ann_wnd.saturating_sub(absorbed as u32);
            all_absorbed = absorbed == data.len();
            if absorbed > 0 {
                self.ack_pending = true;
                if self.abandoned {
                    // Nobody reads this connection anymore; drain so the
                    // window keeps the teardown moving.
                    self.rx_buffer.dequeue_allocated(absorbed);
                    if self.rcv_wnd().saturating_sub(self.rcv_ann_wnd)
                        >= ctx.config.min_abandon_wnd_incr
                    {
                        self.ack_pending = true;
                    }
                } else {
                    self.queue_event(ctx, ConnEvent::DataReceived(absorbed));
                }
            }
            if !all_absorbed {
                // The rest fell outside the window; the ACK tells the
                // peer where we stand.
                self.ack_pending = true;
            }
        }

        if fin && all_absorbed {
            self.rcv_nxt += 1;
            self.ack_pending = true;
            self.rcv_fin = true;
            net_trace!("tcp: {}: peer closed", self.tuple.remote);
            self.queue_event(ctx, ConnEvent::PeerClosed);
            match self.state {
                State::Established => self.state = State::CloseWait,
                State::FinWait1 => self.state = State::Closing,
                State::FinWait2 => self.state = State::FinWait2TimeWait,
                _ => {}
            }
        }
    }

    /// RFC 793 §3.9 segment acceptance test.
    fn seq_acceptable(&self, repr: &TcpRepr) -> bool {
        let seg_len = repr.segment_len() as u32;
        let wnd = self.rcv_wnd();
        let first = repr.seq_number - self.rcv_nxt;
        match (seg_len, wnd) {
            (0, 0) => repr.seq_number == self.rcv_nxt,
            (0, _) => first < wnd,
            (_, 0) => false,
            (_, _) => {
                let last = (repr.seq_number + seg_len as usize - 1) - self.rcv_nxt;
                first < wnd || last < wnd
            }
        }
    }

    fn establish(&mut self, ctx: &mut Ctx) {
        self.state = State::Established;
        self.expires = if self.abandoned {
            Some(ctx.now + ctx.config.abandoned_timeout)
        } else {
            None
        };
        self.timer = Timer::Idle;
        self.cwnd = initial_cwnd(self.snd_mss);
        self.cwnd_acked = 0;
        self.ssthresh = MAX_WINDOW;
    }
}
