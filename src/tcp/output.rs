use crate::ip::{Ip4Tx, Ipv4Meta, SendError};
use crate::time::Duration;
use crate::wire::{IpProtocol, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};

use super::index::Tuple;
use super::pcb::{initial_cwnd, Ctx, Pcb, Timer};
use super::{Config, State};

impl<'a> Pcb<'a> {
    /// Run the output side of a work unit: emit whatever segments the
    /// windows allow, then a pure ACK if one is owed and no segment
    /// carried it.
    pub(super) fn dispatch(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        if self.state.is_syn_sent_or_rcvd() {
            // The handshake segment could not be transmitted when the
            // PCB was set up; try again.
            if self.snd_nxt == self.snd_una {
                self.send_syn(ctx, ip);
            }
            return;
        }

        let mut sent = 0;
        if self.state.can_output() {
            sent = self.output(ctx, ip);
        }
        // A data segment carries the ACK; otherwise owe a bare one.
        if self.ack_pending && sent == 0 {
            self.send_ack(ctx, ip);
            if self.ack_pending {
                // The transmit failed; retry shortly.
                self.schedule_output(ctx.now + ctx.config.output_retry_full);
            }
        }
    }

    /// Segment and transmit queued data, RFC 793 §3.7 with the RFC 5681
    /// windows: effective window is min(SND.WND, cwnd) minus what is
    /// already in flight.
    pub(super) fn output(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) -> usize {
        if !self.state.can_output() {
            return 0;
        }
        let mut sent = 0;

        // After an idle period the peer's state is stale; restart from
        // the initial window (RFC 5681 §4.1).
        if self.in_flight() == 0
            && self.unsent_data() > 0
            && ctx.now - self.last_send >= self.rtte.rto()
        {
            self.cwnd = initial_cwnd(self.snd_mss);
            self.cwnd_acked = 0;
        }

        loop {
            let unsent = self.unsent_data();
            if unsent == 0 && !self.fin_pending {
                break;
            }

            let flight = self.in_flight();
            if self.snd_wnd == 0 && flight == 0 && unsent > 0 {
                // Zero window: probe on the persist timer instead of
                // retransmitting into a closed window.
                if !matches!(self.timer, Timer::Persist { .. }) {
                    let delay = self.rtte.rto();
                    net_trace!("tcp: {}: window closed, persisting", self.tuple.remote);
                    self.timer = Timer::Persist {
                        expires_at: ctx.now + delay,
                        delay,
                    };
                }
                break;
            }

            let wnd = self.snd_wnd.min(self.cwnd);
            let room = (wnd.saturating_sub(flight)) as usize;
            let size = unsent.min(self.snd_mss as usize).min(room);
            let is_last = size == unsent;
            let fin_now = self.fin_pending && is_last;
            if size == 0 && !fin_now {
                break;
            }
            // Nagle: while data is in flight, sub-MSS segments wait for
            // the cumulative ACK. A FIN is never held back.
            if self.nagle && flight > 0 && size < self.snd_mss as usize && !fin_now {
                break;
            }

            let control = if fin_now {
                TcpControl::Fin
            } else if is_last {
                TcpControl::Psh
            } else {
                TcpControl::None
            };
            let offset = self.sent_data();
            match self.transmit_segment(
                ctx,
                ip,
                control,
                self.snd_nxt,
                Some(self.rcv_nxt),
                None,
                None,
                offset,
                size,
            ) {
                Ok(()) => {
                    let end = self.snd_nxt + size + if fin_now { 1 } else { 0 };
                    // First fresh segment of the round starts the RTT
                    // sample; recovery rounds never do (Karn).
                    if size > 0 && self.recover.is_none() {
                        self.rtte.start_sample(ctx.now, end);
                    }
                    self.snd_nxt = end;
                    if fin_now {
                        self.fin_pending = false;
                        self.fin_sent = true;
                    }
                    self.timer = Timer::Retransmit {
                        expires_at: ctx.now + self.rtte.rto(),
                    };
                    sent += 1;
                }
                Err(SendError::FragNeeded(mtu)) => {
                    // Local packet-too-big: feed the cache and retry
                    // with the clamped MSS in the same round.
                    net_debug!(
                        "tcp: {}: fragmentation needed, mtu {}",
                        self.tuple.remote,
                        mtu
                    );
                    let remote = self.tuple.remote.addr;
                    ctx.pmtu.report_frag_needed(ctx.now, remote, Some(mtu));
                    let before = self.snd_mss;
                    self.sync_mss(ctx.pmtu);
                    if self.snd_mss >= before {
                        self.schedule_output(ctx.now + ctx.config.output_retry_other);
                        break;
                    }
                }
                Err(SendError::BufferFull) => {
                    self.schedule_output(ctx.now + ctx.config.output_retry_full);
                    break;
                }
                Err(err) => {
                    net_debug!("tcp: {}: transmit failed: {}", self.tuple.remote, err);
                    self.schedule_output(ctx.now + ctx.config.output_retry_other);
                    break;
                }
            }
        }
        sent
    }

    /// Retransmission timeout: collapse the windows, rewind SND.NXT and
    /// resend from SND.UNA (RFC 6298 §5, RFC 5681 §3.1).
    pub(super) fn on_retransmit_timeout(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        match self.state {
            State::SynSent | State::SynReceived => {
                net_trace!("tcp: {}: retransmitting SYN", self.tuple.remote);
                self.rtte.backoff(ctx.config);
                self.send_syn(ctx, ip);
            }
            _ if self.in_flight() > 0 => {
                net_trace!(
                    "tcp: {}: retransmission timeout, {} in flight",
                    self.tuple.remote,
                    self.in_flight()
                );
                let mss = self.snd_mss as u32;
                self.ssthresh = (self.in_flight() / 2).max(2 * mss);
                self.cwnd = mss;
                self.cwnd_acked = 0;
                self.rtte.backoff(ctx.config);
                self.rtte.clear_sample();
                self.recover = Some(self.snd_nxt);
                self.rtx_active = true;
                self.dup_acks = 0;
                self.snd_nxt = self.snd_una;
                if self.fin_sent {
                    self.fin_sent = false;
                    self.fin_pending = true;
                }
                self.timer = Timer::Idle;
                self.output(ctx, ip);
            }
            _ => {
                self.timer = Timer::Idle;
            }
        }
    }

    /// Persist timeout: a zero-window probe, backed off exponentially.
    pub(super) fn on_persist_timeout(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx, delay: Duration) {
        if self.snd_wnd != 0 || self.unsent_data() == 0 || !self.state.can_output() {
            self.timer = Timer::Idle;
            self.dispatch(ctx, ip);
            return;
        }

        if self.in_flight() == 0 {
            // One byte past the window edge forces a window update out
            // of the peer.
            let offset = self.sent_data();
            if self
                .transmit_segment(
                    ctx,
                    ip,
                    TcpControl::None,
                    self.snd_nxt,
                    Some(self.rcv_nxt),
                    None,
                    None,
                    offset,
                    1,
                )
                .is_ok()
            {
                self.snd_nxt = self.snd_nxt + 1;
            }
        } else {
            // The previous probe is still unacknowledged; repeat it.
            let _ = self.transmit_segment(
                ctx,
                ip,
                TcpControl::None,
                self.snd_una,
                Some(self.rcv_nxt),
                None,
                None,
                0,
                1,
            );
        }

        let delay = (delay * 2).min(ctx.config.rto_max);
        self.timer = Timer::Persist {
            expires_at: ctx.now + delay,
            delay,
        };
    }

    /// Retransmit a single segment from SND.UNA without rewinding
    /// SND.NXT; used by fast retransmit and NewReno partial ACKs.
    pub(super) fn retransmit_one(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        let size = self.tx_buffer.len().min(self.snd_mss as usize);
        let covers_fin = self.fin_sent && size == self.tx_buffer.len();
        if size == 0 && !covers_fin {
            return;
        }
        let control = if covers_fin {
            TcpControl::Fin
        } else if size == self.tx_buffer.len() {
            TcpControl::Psh
        } else {
            TcpControl::None
        };
        // Karn: a retransmitted segment must not complete an RTT sample.
        self.rtte.clear_sample();
        let _ = self.transmit_segment(
            ctx,
            ip,
            control,
            self.snd_una,
            Some(self.rcv_nxt),
            None,
            None,
            0,
            size,
        );
        self.timer = Timer::Retransmit {
            expires_at: ctx.now + self.rtte.rto(),
        };
    }

    /// Transmit the SYN or SYN-ACK for the current handshake state and
    /// arm its retransmission.
    pub(super) fn send_syn(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        let with_ack = self.state == State::SynReceived;
        let ack = if with_ack { Some(self.rcv_nxt) } else { None };
        // Offer scaling on our SYN unconditionally; on a SYN-ACK only
        // when the peer's SYN offered it too.
        let window_scale = if with_ack {
            self.wnd_scale.then_some(self.rcv_wnd_shift)
        } else {
            Some(ctx.config.rcv_wnd_shift.min(14))
        };
        let max_seg_size = Some(self.rcv_mss);

        match self.transmit_segment(
            ctx,
            ip,
            TcpControl::Syn,
            self.snd_una,
            ack,
            max_seg_size,
            window_scale,
            0,
            0,
        ) {
            Ok(()) => {
                self.snd_nxt = self.snd_una + 1;
                self.timer = Timer::Retransmit {
                    expires_at: ctx.now + self.rtte.rto(),
                };
            }
            Err(err) => {
                net_debug!("tcp: {}: SYN transmit failed: {}", self.tuple.remote, err);
                let retry = match err {
                    SendError::BufferFull => ctx.config.output_retry_full,
                    _ => ctx.config.output_retry_other,
                };
                self.schedule_output(ctx.now + retry);
            }
        }
    }

    /// Emit a bare acknowledgement of the current receive state.
    pub(super) fn send_ack(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        let _ = self.transmit_segment(
            ctx,
            ip,
            TcpControl::None,
            self.snd_nxt,
            Some(self.rcv_nxt),
            None,
            None,
            0,
            0,
        );
    }

    /// A rate-limited pure ACK, the RFC 5961 answer to everything
    /// suspicious.
    pub(super) fn challenge_ack(&mut self, ctx: &mut Ctx, ip: &mut dyn Ip4Tx) {
        if ctx.now < self.challenge_ack_at {
            return;
        }
        self.challenge_ack_at = ctx.now + ctx.config.challenge_ack_interval;
        self.send_ack(ctx, ip);
    }

    /// Build and transmit one segment. The payload is read straight out
    /// of the send ring at `payload_offset`, crossing the wrap point if
    /// needed. Sequence state is not touched; the caller advances it.
    #[allow(clippy::too_many_arguments)]
    fn transmit_segment(
        &mut self,
        ctx: &mut Ctx,
        ip: &mut dyn Ip4Tx,
        control: TcpControl,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        max_seg_size: Option<u16>,
        window_scale: Option<u8>,
        payload_offset: usize,
        payload_len: usize,
    ) -> Result<(), SendError> {
        let (window_len, announced) = self.window_to_advertise(control == TcpControl::Syn);
        let repr = TcpRepr {
            src_port: self.tuple.local.port,
            dst_port: self.tuple.remote.port,
            control,
            seq_number: seq,
            ack_number: ack,
            window_len,
            window_scale,
            max_seg_size,
            payload: &[],
        };
        let meta = Ipv4Meta {
            src_addr: self.tuple.local.addr,
            dst_addr: self.tuple.remote.addr,
            protocol: IpProtocol::Tcp,
            ttl: ctx.config.ttl,
            tos: ctx.config.tos,
            dont_frag: true,
        };
        net_trace!(
            "tcp: {}: sending {} len={}",
            self.tuple.remote,
            repr,
            payload_len
        );

        let total_len = repr.header_len() + payload_len;
        let tx_buffer = &self.tx_buffer;
        let local_addr = self.tuple.local.addr;
        let remote_addr = self.tuple.remote.addr;
        let result = ip.transmit(&meta, total_len, &mut |frame| {
            let mut packet = TcpPacket::new_unchecked(frame);
            repr.emit_header(&mut packet);
            let payload = packet.payload_mut();
            let mut copied = 0;
            while copied < payload_len {
                let chunk = tx_buffer.get_allocated(payload_offset + copied, payload_len - copied);
                debug_assert!(!chunk.is_empty());
                if chunk.is_empty() {
                    break;
                }
                payload[copied..copied + chunk.len()].copy_from_slice(chunk);
                copied += chunk.len();
            }
            packet.fill_checksum(&local_addr, &remote_addr);
        });

        if result.is_ok() {
            self.ack_pending = false;
            self.rcv_ann_wnd = announced;
            self.last_send = ctx.now;
        }
        result
    }

    /// The window field for an outgoing segment, and the octet count it
    /// stands for once the peer applies our scale shift.
    fn window_to_advertise(&self, syn: bool) -> (u16, u32) {
        let wnd = self.rcv_wnd();
        if syn {
            // Handshake segments carry unscaled windows (RFC 1323).
            let field = wnd.min(65535) as u16;
            (field, field as u32)
        } else {
            let field = (wnd >> self.rcv_wnd_shift).min(65535) as u16;
            (field, (field as u32) << self.rcv_wnd_shift)
        }
    }
}

/// Emit a RST that is not associated with any live PCB.
pub(super) fn send_rst(
    ip: &mut dyn Ip4Tx,
    config: &Config,
    tuple: &Tuple,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
) {
    let repr = TcpRepr {
        src_port: tuple.local.port,
        dst_port: tuple.remote.port,
        control: TcpControl::Rst,
        seq_number: seq,
        ack_number: ack,
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        payload: &[],
    };
    let meta = Ipv4Meta {
        src_addr: tuple.local.addr,
        dst_addr: tuple.remote.addr,
        protocol: IpProtocol::Tcp,
        ttl: config.ttl,
        tos: config.tos,
        dont_frag: true,
    };
    let local_addr = tuple.local.addr;
    let remote_addr = tuple.remote.addr;
    let result = ip.transmit(&meta, repr.buffer_len(), &mut |frame| {
        let mut packet = TcpPacket::new_unchecked(frame);
        repr.emit(&mut packet, &local_addr, &remote_addr);
    });
    if let Err(err) = result {
        net_debug!("tcp: failed to transmit RST: {}", err);
    }
}
