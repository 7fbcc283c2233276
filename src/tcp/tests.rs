use std::cell::RefCell;
use std::rc::Rc;

use crate::ip::{Ip4Tx, Ipv4Meta, Route, SendError};
use crate::time::{Duration, Instant};
use crate::wire::{IpEndpoint, Ipv4Address, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};

use super::pcb::{Pcb, Timer};
use super::*;

const LOCAL_ADDR: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const REMOTE_ADDR: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const LOCAL_PORT: u16 = 80;
const REMOTE_PORT: u16 = 49500;

/// A scripted IPv4 layer: captures everything the engine transmits and
/// lets tests inject routes and transmit failures.
struct TestIp {
    frames: Vec<(Ipv4Meta, Vec<u8>)>,
    route: Option<Route>,
    fail_next: Option<SendError>,
}

impl TestIp {
    fn new() -> TestIp {
        TestIp::with_addr(LOCAL_ADDR)
    }

    fn with_addr(src_addr: Ipv4Address) -> TestIp {
        TestIp {
            frames: Vec::new(),
            route: Some(Route {
                src_addr,
                mtu: 1500,
                is_local: true,
            }),
            fail_next: None,
        }
    }

    /// Parse and remove the oldest captured segment.
    fn pop(&mut self) -> Segment {
        assert!(!self.frames.is_empty(), "no frame was transmitted");
        let (meta, frame) = self.frames.remove(0);
        parse_frame(&meta, &frame)
    }

    fn is_quiet(&self) -> bool {
        self.frames.is_empty()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Ip4Tx for TestIp {
    fn route(&self, _dst_addr: Ipv4Address) -> Option<Route> {
        self.route
    }

    fn transmit(
        &mut self,
        meta: &Ipv4Meta,
        payload_len: usize,
        emit: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), SendError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        let mut frame = vec![0; payload_len];
        emit(&mut frame);
        self.frames.push((*meta, frame));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Segment {
    src_port: u16,
    dst_port: u16,
    control: TcpControl,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
    wnd: u16,
    mss: Option<u16>,
    ws: Option<u8>,
    payload: Vec<u8>,
}

fn parse_frame(meta: &Ipv4Meta, frame: &[u8]) -> Segment {
    // Every TCP segment leaves with DF set, for PMTU discovery.
    assert!(meta.dont_frag);
    let packet = TcpPacket::new_checked(frame).unwrap();
    let repr = TcpRepr::parse(&packet, &meta.src_addr, &meta.dst_addr).unwrap();
    Segment {
        src_port: repr.src_port,
        dst_port: repr.dst_port,
        control: repr.control,
        seq: repr.seq_number,
        ack: repr.ack_number,
        wnd: repr.window_len,
        mss: repr.max_seg_size,
        ws: repr.window_scale,
        payload: repr.payload.to_vec(),
    }
}

#[derive(Default)]
struct Record {
    established: usize,
    data_received: Vec<usize>,
    send_acked: Vec<usize>,
    peer_closed: bool,
    errors: Vec<Error>,
}

struct RecordEvents(Rc<RefCell<Record>>);

impl ConnectionEvents for RecordEvents {
    fn on_established(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle) {
        self.0.borrow_mut().established += 1;
    }
    fn on_data_received(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, len: usize) {
        self.0.borrow_mut().data_received.push(len);
    }
    fn on_send_acked(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, len: usize) {
        self.0.borrow_mut().send_acked.push(len);
    }
    fn on_peer_closed(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle) {
        self.0.borrow_mut().peer_closed = true;
    }
    fn on_error(&mut self, _tcp: &mut Engine<'_>, _conn: ConnHandle, error: Error) {
        self.0.borrow_mut().errors.push(error);
    }
}

fn record_events() -> (Rc<RefCell<Record>>, Rc<RefCell<dyn ConnectionEvents>>) {
    let record = Rc::new(RefCell::new(Record::default()));
    let events = Rc::new(RefCell::new(RecordEvents(record.clone())));
    (record, events)
}

/// Accepts every queued connection from inside the `on_accept`
/// callback, attaching fresh owned buffers.
struct AutoAccept {
    accepted: Rc<RefCell<Vec<ConnHandle>>>,
    conn_events: Rc<RefCell<dyn ConnectionEvents>>,
    buffer_size: usize,
}

impl ListenerEvents for AutoAccept {
    fn on_accept(&mut self, tcp: &mut Engine<'_>, listener: ListenerHandle) {
        while let Some(conn) = tcp.accept(
            listener,
            SocketBuffer::new(vec![0; self.buffer_size]),
            SocketBuffer::new(vec![0; self.buffer_size]),
            self.conn_events.clone(),
        ) {
            self.accepted.borrow_mut().push(conn);
        }
    }
}

/// Inject a segment as if the remote peer sent it.
fn inject(tcp: &mut Engine<'_>, ip: &mut TestIp, now: Instant, repr: &TcpRepr) -> PollResult {
    let mut bytes = vec![0; repr.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut bytes);
    repr.emit(&mut packet, &REMOTE_ADDR, &LOCAL_ADDR);
    tcp.process(now, ip, REMOTE_ADDR, LOCAL_ADDR, true, &bytes)
}

/// A segment from the scripted peer with the harness defaults.
fn seg<'p>(
    control: TcpControl,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
    payload: &'p [u8],
) -> TcpRepr<'p> {
    TcpRepr {
        src_port: REMOTE_PORT,
        dst_port: LOCAL_PORT,
        control,
        seq_number: seq,
        ack_number: ack,
        window_len: 4096,
        window_scale: None,
        max_seg_size: None,
        payload,
    }
}

fn pcb<'r, 'a>(tcp: &'r Engine<'a>, conn: ConnHandle) -> &'r Pcb<'a> {
    tcp.pcbs[conn.index].pcb.as_ref().unwrap()
}

struct Server {
    tcp: Engine<'static>,
    ip: TestIp,
    conn: ConnHandle,
    record: Rc<RefCell<Record>>,
    /// Our initial send sequence, learned from the SYN-ACK.
    iss: TcpSeqNumber,
}

/// Run a passive open to ESTABLISHED: peer SYN seq=1000, our SYN-ACK,
/// peer ACK. The connection is accepted with 64 KiB buffers.
fn establish(peer_mss: u16, peer_ws: Option<u8>) -> Server {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    let (record, conn_events) = record_events();
    let accepted = Rc::new(RefCell::new(Vec::new()));
    let listener_events = Rc::new(RefCell::new(AutoAccept {
        accepted: accepted.clone(),
        conn_events,
        buffer_size: 65536,
    }));
    tcp.listen(LOCAL_PORT, 4, 4096, listener_events).unwrap();

    let syn = TcpRepr {
        max_seg_size: Some(peer_mss),
        window_scale: peer_ws,
        ..seg(TcpControl::Syn, TcpSeqNumber(1000), None, &[])
    };
    inject(&mut tcp, &mut ip, Instant::ZERO, &syn);

    let syn_ack = ip.pop();
    assert_eq!(syn_ack.control, TcpControl::Syn);
    assert_eq!(syn_ack.ack, Some(TcpSeqNumber(1001)));
    let iss = syn_ack.seq;

    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &seg(TcpControl::None, TcpSeqNumber(1001), Some(iss + 1), &[]),
    );
    let conn = accepted.borrow()[0];
    assert_eq!(tcp.state(conn), Ok(State::Established));
    assert!(ip.is_quiet());

    Server {
        tcp,
        ip,
        conn,
        record,
        iss,
    }
}

// ===== end-to-end scenarios =====

#[test]
fn test_three_way_handshake() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    let (_, conn_events) = record_events();
    let accepted = Rc::new(RefCell::new(Vec::new()));
    let listener_events = Rc::new(RefCell::new(AutoAccept {
        accepted: accepted.clone(),
        conn_events,
        buffer_size: 65536,
    }));
    tcp.listen(LOCAL_PORT, 4, 4096, listener_events).unwrap();

    // Peer: SYN seq=1000 mss=1460 wscale=7.
    let syn = TcpRepr {
        max_seg_size: Some(1460),
        window_scale: Some(7),
        ..seg(TcpControl::Syn, TcpSeqNumber(1000), None, &[])
    };
    inject(&mut tcp, &mut ip, Instant::ZERO, &syn);

    // Us: SYN-ACK ack=1001 with MSS and a window scale of our own.
    let syn_ack = ip.pop();
    assert_eq!(syn_ack.control, TcpControl::Syn);
    assert_eq!(syn_ack.ack, Some(TcpSeqNumber(1001)));
    assert_eq!(syn_ack.mss, Some(1460));
    assert_eq!(syn_ack.ws, Some(6));
    assert_eq!(syn_ack.src_port, LOCAL_PORT);
    assert_eq!(syn_ack.dst_port, REMOTE_PORT);

    // Peer: ACK completes the handshake.
    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &seg(
            TcpControl::None,
            TcpSeqNumber(1001),
            Some(syn_ack.seq + 1),
            &[],
        ),
    );

    assert_eq!(accepted.borrow().len(), 1);
    let conn = accepted.borrow()[0];
    assert_eq!(tcp.state(conn), Ok(State::Established));
    let pcb = pcb(&tcp, conn);
    assert_eq!(pcb.snd_mss, 1460);
    assert!(pcb.wnd_scale);
    assert_eq!(pcb.snd_wnd_shift, 7);
    assert_eq!(pcb.rcv_wnd_shift, 6);
}

#[test]
fn test_data_receive_and_ack() {
    let mut srv = establish(1460, None);

    // Peer: "HELLO", seq=1001 psh.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::Psh,
            TcpSeqNumber(1001),
            Some(srv.iss + 1),
            b"HELLO",
        ),
    );

    let ack = srv.ip.pop();
    assert_eq!(ack.control, TcpControl::None);
    assert_eq!(ack.ack, Some(TcpSeqNumber(1006)));
    assert_eq!(ack.seq, srv.iss + 1);

    assert_eq!(srv.record.borrow().data_received, vec![5]);
    let (first, second) = srv.tcp.recv_ranges(srv.conn).unwrap();
    assert_eq!(first, b"HELLO");
    assert!(second.is_empty());
    srv.tcp.consume_recv(srv.conn, 5).unwrap();
    assert_eq!(srv.tcp.recv_queue(srv.conn), Ok(0));
}

#[test]
fn test_active_connect_and_send() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 7);
    let mut ip = TestIp::new();
    let (record, events) = record_events();

    let conn = tcp
        .connect(
            &mut ip,
            IpEndpoint::new(REMOTE_ADDR, REMOTE_PORT),
            SocketBuffer::new(vec![0; 65536]),
            SocketBuffer::new(vec![0; 65536]),
            events,
        )
        .unwrap();
    assert_eq!(tcp.state(conn), Ok(State::SynSent));

    let syn = ip.pop();
    assert_eq!(syn.control, TcpControl::Syn);
    assert_eq!(syn.ack, None);
    assert_eq!(syn.mss, Some(1460));
    assert_eq!(syn.ws, Some(6));
    assert_eq!(syn.dst_port, REMOTE_PORT);
    let iss = syn.seq;

    // Peer SYN-ACK, scaling enabled, window 1000.
    let syn_ack = TcpRepr {
        src_port: REMOTE_PORT,
        dst_port: syn.src_port,
        control: TcpControl::Syn,
        seq_number: TcpSeqNumber(5000),
        ack_number: Some(iss + 1),
        window_len: 1000,
        window_scale: Some(7),
        max_seg_size: Some(1460),
        payload: &[],
    };
    let mut bytes = vec![0; syn_ack.buffer_len()];
    syn_ack.emit(
        &mut TcpPacket::new_unchecked(&mut bytes[..]),
        &REMOTE_ADDR,
        &LOCAL_ADDR,
    );
    tcp.process(Instant::ZERO, &mut ip, REMOTE_ADDR, LOCAL_ADDR, true, &bytes);

    assert_eq!(tcp.state(conn), Ok(State::Established));
    assert_eq!(record.borrow().established, 1);
    let ack = ip.pop();
    assert_eq!(ack.control, TcpControl::None);
    assert_eq!(ack.ack, Some(TcpSeqNumber(5001)));

    // Window from the SYN-ACK is unscaled; later ones shift by 7.
    assert_eq!(pcb(&tcp, conn).snd_wnd, 1000);

    // Write and flush through the output timer.
    assert_eq!(tcp.send(conn, b"HELLO"), Ok(5));
    let at = tcp.poll_at().unwrap();
    assert_eq!(at, Instant::ZERO + Duration::from_micros(500));
    tcp.poll(at, &mut ip);

    let data = ip.pop();
    assert_eq!(data.control, TcpControl::Psh);
    assert_eq!(data.seq, iss + 1);
    assert_eq!(data.payload, b"HELLO");

    // Peer acks; window field now scales.
    let peer_ack = TcpRepr {
        src_port: REMOTE_PORT,
        dst_port: syn.src_port,
        control: TcpControl::None,
        seq_number: TcpSeqNumber(5001),
        ack_number: Some(iss + 6),
        window_len: 10,
        window_scale: None,
        max_seg_size: None,
        payload: &[],
    };
    let mut bytes = vec![0; peer_ack.buffer_len()];
    peer_ack.emit(
        &mut TcpPacket::new_unchecked(&mut bytes[..]),
        &REMOTE_ADDR,
        &LOCAL_ADDR,
    );
    tcp.process(at, &mut ip, REMOTE_ADDR, LOCAL_ADDR, true, &bytes);

    assert_eq!(record.borrow().send_acked, vec![5]);
    assert_eq!(pcb(&tcp, conn).snd_wnd, 10 << 7);
    assert_eq!(tcp.send_queue(conn), Ok(0));
}

#[test]
fn test_loss_and_fast_retransmit() {
    let mut srv = establish(536, None);
    let base = srv.iss + 1;

    // Three full segments go out back to back.
    srv.tcp.send(srv.conn, &[0x55; 1608]).unwrap();
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let a = srv.ip.pop();
    let b = srv.ip.pop();
    let c = srv.ip.pop();
    assert_eq!((a.seq, a.payload.len()), (base, 536));
    assert_eq!((b.seq, b.payload.len()), (base + 536, 536));
    assert_eq!((c.seq, c.payload.len()), (base + 1072, 536));
    assert!(srv.ip.is_quiet());

    // Peer acks A only.
    let ack_a = seg(TcpControl::None, TcpSeqNumber(1001), Some(base + 536), &[]);
    inject(&mut srv.tcp, &mut srv.ip, at, &ack_a);
    assert_eq!(srv.record.borrow().send_acked, vec![536]);

    // Three duplicate ACKs for the same point trigger fast retransmit.
    inject(&mut srv.tcp, &mut srv.ip, at, &ack_a);
    inject(&mut srv.tcp, &mut srv.ip, at, &ack_a);
    assert!(srv.ip.is_quiet());
    inject(&mut srv.tcp, &mut srv.ip, at, &ack_a);

    let rtx = srv.ip.pop();
    assert_eq!(rtx.seq, base + 536);
    assert_eq!(rtx.payload.len(), 536);
    assert_eq!(rtx.payload, b.payload);

    {
        let pcb = pcb(&srv.tcp, srv.conn);
        // ssthresh = max(in-flight / 2, 2 mss), cwnd = ssthresh + 3 mss.
        assert_eq!(pcb.ssthresh, 2 * 536);
        assert_eq!(pcb.cwnd, 2 * 536 + 3 * 536);
        assert_eq!(pcb.recover, Some(base + 1608));
    }

    // A fourth duplicate inflates the window one more MSS.
    inject(&mut srv.tcp, &mut srv.ip, at, &ack_a);
    assert_eq!(pcb(&srv.tcp, srv.conn).cwnd, 2 * 536 + 4 * 536);

    // The cumulative ACK ends recovery with cwnd = ssthresh.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        at,
        &seg(TcpControl::None, TcpSeqNumber(1001), Some(base + 1608), &[]),
    );
    let pcb = pcb(&srv.tcp, srv.conn);
    assert_eq!(pcb.recover, None);
    assert_eq!(pcb.cwnd, pcb.ssthresh);
    assert_eq!(pcb.ssthresh, 2 * 536);
    assert_eq!(srv.record.borrow().send_acked, vec![536, 1072]);
}

#[test]
fn test_peer_close_then_local_close() {
    let mut srv = establish(1460, None);

    // Peer closes after "HELLO".
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::Psh,
            TcpSeqNumber(1001),
            Some(srv.iss + 1),
            b"HELLO",
        ),
    );
    srv.ip.clear();
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Fin, TcpSeqNumber(1006), Some(srv.iss + 1), &[]),
    );

    assert!(srv.record.borrow().peer_closed);
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::CloseWait));
    let ack = srv.ip.pop();
    assert_eq!(ack.ack, Some(TcpSeqNumber(1007)));

    // Our FIN, acknowledged by the peer, finishes the teardown.
    srv.tcp.shutdown_send(srv.conn).unwrap();
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::LastAck));
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let fin = srv.ip.pop();
    assert_eq!(fin.control, TcpControl::Fin);
    assert_eq!(fin.seq, srv.iss + 1);
    assert_eq!(fin.ack, Some(TcpSeqNumber(1007)));

    inject(
        &mut srv.tcp,
        &mut srv.ip,
        at,
        &seg(TcpControl::None, TcpSeqNumber(1007), Some(srv.iss + 2), &[]),
    );
    assert_eq!(srv.tcp.state(srv.conn), Err(Error::ConnectionAborted));
}

#[test]
fn test_pmtu_reduction_clamps_segments() {
    let mut srv = establish(1460, None);
    let base = srv.iss + 1;

    // Peer announces plenty of window.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &TcpRepr {
            window_len: 65535,
            ..seg(TcpControl::None, TcpSeqNumber(1001), Some(base), &[])
        },
    );
    srv.ip.clear();

    srv.tcp.send(srv.conn, &[0x42; 2000]).unwrap();
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let first = srv.ip.pop();
    assert_eq!(first.payload.len(), 1460);
    // The 540-byte leftover waits on Nagle.
    assert!(srv.ip.is_quiet());

    // ICMP: fragmentation needed, next-hop MTU 576.
    srv.tcp.process_icmp_ptb(at, REMOTE_ADDR, Some(576));
    assert_eq!(pcb(&srv.tcp, srv.conn).snd_mss, 536);

    // The leftover now fills a full clamped segment.
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let clamped = srv.ip.pop();
    assert_eq!(clamped.payload.len(), 536);
    assert_eq!(clamped.seq, base + 1460);
}

#[test]
fn test_local_frag_needed_clamps_in_round() {
    let mut srv = establish(1460, None);
    let base = srv.iss + 1;

    srv.tcp.send(srv.conn, &[0x42; 536]).unwrap();
    // The device rejects the first attempt: the egress MTU shrank.
    srv.ip.fail_next = Some(SendError::FragNeeded(576));
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);

    assert_eq!(pcb(&srv.tcp, srv.conn).snd_mss, 536);
    let segment = srv.ip.pop();
    assert_eq!(segment.seq, base);
    assert_eq!(segment.payload.len(), 536);
}

#[test]
fn test_simultaneous_close() {
    let mut srv = establish(1460, None);
    let now = Instant::ZERO;

    srv.tcp.shutdown_send(srv.conn).unwrap();
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::FinWait1));
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    let fin = srv.ip.pop();
    assert_eq!(fin.control, TcpControl::Fin);

    // The peer's FIN crosses ours on the wire.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        now,
        &seg(TcpControl::Fin, TcpSeqNumber(1001), Some(srv.iss + 1), &[]),
    );
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::Closing));
    let ack = srv.ip.pop();
    assert_eq!(ack.ack, Some(TcpSeqNumber(1002)));

    // Peer acknowledges our FIN: TIME-WAIT for the full 2MSL.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        now,
        &seg(TcpControl::None, TcpSeqNumber(1002), Some(srv.iss + 2), &[]),
    );
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::TimeWait));

    let almost = now + Duration::from_secs(119);
    srv.tcp.poll(almost, &mut srv.ip);
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::TimeWait));

    let done = now + Duration::from_secs(120);
    srv.tcp.poll(done, &mut srv.ip);
    assert_eq!(srv.tcp.state(srv.conn), Err(Error::ConnectionAborted));
}

// ===== protocol details =====

#[test]
fn test_rst_for_unknown_connection() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();

    // ACK to a dead port: RST takes its sequence from the ACK field.
    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &seg(TcpControl::None, TcpSeqNumber(42), Some(TcpSeqNumber(100)), &[]),
    );
    let rst = ip.pop();
    assert_eq!(rst.control, TcpControl::Rst);
    assert_eq!(rst.seq, TcpSeqNumber(100));
    assert_eq!(rst.ack, None);

    // SYN to a dead port: RST acknowledges the SYN.
    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &seg(TcpControl::Syn, TcpSeqNumber(9000), None, &[]),
    );
    let rst = ip.pop();
    assert_eq!(rst.control, TcpControl::Rst);
    assert_eq!(rst.seq, TcpSeqNumber(0));
    assert_eq!(rst.ack, Some(TcpSeqNumber(9001)));

    // An incoming RST never triggers a RST back.
    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &seg(TcpControl::Rst, TcpSeqNumber(9000), None, &[]),
    );
    assert!(ip.is_quiet());
}

#[test]
fn test_challenge_ack_for_future_ack() {
    let mut srv = establish(1460, None);
    let before = pcb(&srv.tcp, srv.conn).snd_una;

    // RFC 5961 §5: an ACK for data never sent earns a challenge ACK.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::None,
            TcpSeqNumber(1001),
            Some(srv.iss + 1000),
            &[],
        ),
    );
    let challenge = srv.ip.pop();
    assert_eq!(challenge.control, TcpControl::None);
    assert_eq!(challenge.ack, Some(TcpSeqNumber(1001)));
    assert_eq!(pcb(&srv.tcp, srv.conn).snd_una, before);

    // Challenge ACKs are rate limited.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::None,
            TcpSeqNumber(1001),
            Some(srv.iss + 1000),
            &[],
        ),
    );
    assert!(srv.ip.is_quiet());
}

#[test]
fn test_stale_ack_ignored() {
    let mut srv = establish(1460, None);

    // Older than SND.UNA - MaxAckBefore: ignored without any reply.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::None,
            TcpSeqNumber(1001),
            Some(srv.iss + 1 - 70000usize),
            &[],
        ),
    );
    assert!(srv.ip.is_quiet());
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::Established));
}

#[test]
fn test_rst_resets_established() {
    let mut srv = establish(1460, None);

    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Rst, TcpSeqNumber(1001), None, &[]),
    );
    assert_eq!(srv.record.borrow().errors, vec![Error::ConnectionReset]);
    assert_eq!(srv.tcp.state(srv.conn), Err(Error::ConnectionAborted));
}

#[test]
fn test_in_window_rst_gets_challenge() {
    let mut srv = establish(1460, None);

    // RFC 5961 §3: in-window but not exactly at RCV.NXT.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Rst, TcpSeqNumber(1500), None, &[]),
    );
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::Established));
    let challenge = srv.ip.pop();
    assert_eq!(challenge.ack, Some(TcpSeqNumber(1001)));
}

#[test]
fn test_replayed_segment_changes_nothing_but_ack() {
    let mut srv = establish(1460, None);
    let hello = seg(
        TcpControl::Psh,
        TcpSeqNumber(1001),
        Some(srv.iss + 1),
        b"HELLO",
    );
    inject(&mut srv.tcp, &mut srv.ip, Instant::ZERO, &hello);
    srv.ip.clear();

    // The replay is fully below RCV.NXT: nothing moves, one ACK out.
    inject(&mut srv.tcp, &mut srv.ip, Instant::ZERO, &hello);
    let ack = srv.ip.pop();
    assert_eq!(ack.ack, Some(TcpSeqNumber(1006)));
    assert_eq!(srv.tcp.recv_queue(srv.conn), Ok(5));
    assert_eq!(srv.record.borrow().data_received, vec![5]);
    assert_eq!(pcb(&srv.tcp, srv.conn).rcv_nxt, TcpSeqNumber(1006));
}

#[test]
fn test_partial_overlap_absorbs_new_bytes_once() {
    let mut srv = establish(1460, None);
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::Psh,
            TcpSeqNumber(1001),
            Some(srv.iss + 1),
            b"HELLO",
        ),
    );
    srv.ip.clear();

    // Retransmission carrying five old bytes and five new ones.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::Psh,
            TcpSeqNumber(1001),
            Some(srv.iss + 1),
            b"HELLOWORLD",
        ),
    );
    let ack = srv.ip.pop();
    assert_eq!(ack.ack, Some(TcpSeqNumber(1011)));
    let (first, _) = srv.tcp.recv_ranges(srv.conn).unwrap();
    assert_eq!(first, b"HELLOWORLD");
    assert_eq!(srv.record.borrow().data_received, vec![5, 5]);
}

#[test]
fn test_out_of_order_dropped_with_dup_ack() {
    let mut srv = establish(1460, None);

    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(
            TcpControl::Psh,
            TcpSeqNumber(1101),
            Some(srv.iss + 1),
            b"LATER",
        ),
    );
    let dup = srv.ip.pop();
    assert_eq!(dup.ack, Some(TcpSeqNumber(1001)));
    assert_eq!(srv.tcp.recv_queue(srv.conn), Ok(0));
    assert!(srv.record.borrow().data_received.is_empty());
}

#[test]
fn test_zero_window_persist_probe() {
    let mut srv = establish(536, None);
    let base = srv.iss + 1;

    // Peer slams the window shut.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &TcpRepr {
            window_len: 0,
            ..seg(TcpControl::None, TcpSeqNumber(1001), Some(base), &[])
        },
    );
    assert_eq!(pcb(&srv.tcp, srv.conn).snd_wnd, 0);

    srv.tcp.send(srv.conn, b"PAYLOAD").unwrap();
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    assert!(srv.ip.is_quiet());
    assert!(matches!(
        pcb(&srv.tcp, srv.conn).timer,
        Timer::Persist { .. }
    ));

    // The probe carries exactly one byte past the window.
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let probe = srv.ip.pop();
    assert_eq!(probe.seq, base);
    assert_eq!(probe.payload, b"P");

    // Window reopens; the probe is acked and the rest flows.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        at,
        &seg(TcpControl::None, TcpSeqNumber(1001), Some(base + 1), &[]),
    );
    let rest = srv.ip.pop();
    assert_eq!(rest.seq, base + 1);
    assert_eq!(rest.payload, b"AYLOAD");
    assert!(matches!(
        pcb(&srv.tcp, srv.conn).timer,
        Timer::Retransmit { .. }
    ));
}

#[test]
fn test_retransmission_timeout_collapses_window() {
    let mut srv = establish(536, None);
    let base = srv.iss + 1;

    srv.tcp.send(srv.conn, &[0x11; 100]).unwrap();
    let at = srv.tcp.poll_at().unwrap();
    srv.tcp.poll(at, &mut srv.ip);
    let first = srv.ip.pop();
    assert_eq!(first.seq, base);

    // No ACK for a full RTO.
    let rto_at = srv.tcp.poll_at().unwrap();
    assert_eq!(rto_at, at + Duration::from_secs(1));
    srv.tcp.poll(rto_at, &mut srv.ip);

    let again = srv.ip.pop();
    assert_eq!(again.seq, base);
    assert_eq!(again.payload.len(), 100);
    let pcb = pcb(&srv.tcp, srv.conn);
    assert_eq!(pcb.cwnd, 536);
    assert_eq!(pcb.ssthresh, 2 * 536);
    assert!(pcb.rtx_active);
    // The timeout doubled the RTO.
    assert_eq!(
        pcb.timer,
        Timer::Retransmit {
            expires_at: rto_at + Duration::from_secs(2)
        }
    );
}

#[test]
fn test_listener_backlog_overflow_drops_syn() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    let (_, conn_events) = record_events();
    let listener_events = Rc::new(RefCell::new(AutoAccept {
        accepted: Rc::new(RefCell::new(Vec::new())),
        conn_events,
        buffer_size: 4096,
    }));
    tcp.listen(LOCAL_PORT, 1, 4096, listener_events).unwrap();

    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &TcpRepr {
            max_seg_size: Some(1460),
            ..seg(TcpControl::Syn, TcpSeqNumber(1000), None, &[])
        },
    );
    assert_eq!(ip.pop().control, TcpControl::Syn);

    // A second handshake attempt from another port is shed silently.
    inject(
        &mut tcp,
        &mut ip,
        Instant::ZERO,
        &TcpRepr {
            src_port: REMOTE_PORT + 1,
            max_seg_size: Some(1460),
            ..seg(TcpControl::Syn, TcpSeqNumber(2000), None, &[])
        },
    );
    assert!(ip.is_quiet());
}

#[test]
fn test_duplicate_listen_rejected() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let (_, conn_events) = record_events();
    let events = Rc::new(RefCell::new(AutoAccept {
        accepted: Rc::new(RefCell::new(Vec::new())),
        conn_events,
        buffer_size: 4096,
    }));
    tcp.listen(LOCAL_PORT, 1, 4096, events.clone()).unwrap();
    assert_eq!(
        tcp.listen(LOCAL_PORT, 1, 4096, events).unwrap_err(),
        Error::AddrInUse
    );
}

#[test]
fn test_connect_without_route_fails() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    ip.route = None;
    let (_, events) = record_events();
    assert_eq!(
        tcp.connect(
            &mut ip,
            IpEndpoint::new(REMOTE_ADDR, REMOTE_PORT),
            SocketBuffer::new(vec![0; 4096]),
            SocketBuffer::new(vec![0; 4096]),
            events,
        )
        .unwrap_err(),
        Error::NoRoute
    );
}

#[test]
fn test_syn_sent_timeout_surfaces_error() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    let (record, events) = record_events();
    let conn = tcp
        .connect(
            &mut ip,
            IpEndpoint::new(REMOTE_ADDR, REMOTE_PORT),
            SocketBuffer::new(vec![0; 4096]),
            SocketBuffer::new(vec![0; 4096]),
            events,
        )
        .unwrap();
    ip.clear();

    // The SYN is retransmitted with exponential backoff until the
    // handshake deadline.
    let first_rtx = tcp.poll_at().unwrap();
    assert_eq!(first_rtx, Instant::ZERO + Duration::from_secs(1));
    tcp.poll(first_rtx, &mut ip);
    assert_eq!(ip.pop().control, TcpControl::Syn);

    tcp.poll(Instant::ZERO + Duration::from_secs(30), &mut ip);
    assert_eq!(record.borrow().errors, vec![Error::ConnectionTimeout]);
    assert_eq!(tcp.state(conn), Err(Error::ConnectionAborted));
}

#[test]
fn test_rst_in_syn_sent_is_refused() {
    let mut tcp = Engine::new(Config::default(), Instant::ZERO, 42);
    let mut ip = TestIp::new();
    let (record, events) = record_events();
    let _conn = tcp
        .connect(
            &mut ip,
            IpEndpoint::new(REMOTE_ADDR, REMOTE_PORT),
            SocketBuffer::new(vec![0; 4096]),
            SocketBuffer::new(vec![0; 4096]),
            events,
        )
        .unwrap();
    let syn = ip.pop();

    let rst = TcpRepr {
        src_port: REMOTE_PORT,
        dst_port: syn.src_port,
        control: TcpControl::Rst,
        seq_number: TcpSeqNumber(0),
        ack_number: Some(syn.seq + 1),
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        payload: &[],
    };
    let mut bytes = vec![0; rst.buffer_len()];
    rst.emit(
        &mut TcpPacket::new_unchecked(&mut bytes[..]),
        &REMOTE_ADDR,
        &LOCAL_ADDR,
    );
    tcp.process(Instant::ZERO, &mut ip, REMOTE_ADDR, LOCAL_ADDR, true, &bytes);

    assert_eq!(record.borrow().errors, vec![Error::ConnectionRefused]);
}

#[test]
fn test_abort_sends_rst() {
    let mut srv = establish(1460, None);
    let expected_seq = pcb(&srv.tcp, srv.conn).snd_nxt;

    srv.tcp.abort(srv.conn);
    assert_eq!(srv.tcp.state(srv.conn), Err(Error::ConnectionAborted));

    // The RST leaves at the next transmit opportunity.
    srv.tcp.poll(Instant::ZERO, &mut srv.ip);
    let rst = srv.ip.pop();
    assert_eq!(rst.control, TcpControl::Rst);
    assert_eq!(rst.seq, expected_seq);
}

#[test]
fn test_close_finishes_teardown_unattended() {
    let mut srv = establish(1460, None);

    srv.tcp.close(srv.conn);
    assert_eq!(srv.tcp.state(srv.conn), Err(Error::ConnectionAborted));

    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    let fin = srv.ip.pop();
    assert_eq!(fin.control, TcpControl::Fin);

    // Peer acks and closes in turn; the engine acks the FIN on its own.
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Fin, TcpSeqNumber(1001), Some(srv.iss + 2), &[]),
    );
    let ack = srv.ip.pop();
    assert_eq!(ack.ack, Some(TcpSeqNumber(1002)));
}

#[test]
fn test_abandoned_teardown_gives_up_with_rst() {
    let mut srv = establish(1460, None);
    srv.tcp.close(srv.conn);
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    srv.ip.clear();

    // The peer never answers; retransmissions stop at the abandoned
    // deadline and the connection is reset.
    let deadline = Instant::ZERO + Duration::from_secs(30);
    srv.tcp.poll(deadline, &mut srv.ip);
    let mut saw_rst = false;
    while !srv.ip.is_quiet() {
        if srv.ip.pop().control == TcpControl::Rst {
            saw_rst = true;
        }
    }
    assert!(saw_rst);
}

#[test]
fn test_time_wait_answers_with_challenge_ack() {
    let mut srv = establish(1460, None);
    srv.tcp.shutdown_send(srv.conn).unwrap();
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Fin, TcpSeqNumber(1001), Some(srv.iss + 2), &[]),
    );
    assert_eq!(srv.tcp.state(srv.conn), Ok(State::TimeWait));
    srv.ip.clear();

    let later = Instant::ZERO + Duration::from_secs(2);
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        later,
        &seg(TcpControl::None, TcpSeqNumber(1002), Some(srv.iss + 2), &[]),
    );
    let challenge = srv.ip.pop();
    assert_eq!(challenge.ack, Some(TcpSeqNumber(1002)));
}

#[test]
fn test_nagle_holds_back_second_small_write() {
    let mut srv = establish(536, None);
    let base = srv.iss + 1;

    srv.tcp.send(srv.conn, b"FIRST").unwrap();
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    assert_eq!(srv.ip.pop().payload, b"FIRST");

    // A second small write waits for the outstanding ACK.
    srv.tcp.send(srv.conn, b"SECOND").unwrap();
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    assert!(srv.ip.is_quiet());

    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::None, TcpSeqNumber(1001), Some(base + 5), &[]),
    );
    assert_eq!(srv.ip.pop().payload, b"SECOND");
}

#[test]
fn test_window_update_announcement_threshold() {
    let mut srv = establish(1460, None);

    // Fill a chunk of the receive ring, then consume it; the reopened
    // window is announced once it crosses the threshold.
    let bulk = vec![0x33; 4000];
    inject(
        &mut srv.tcp,
        &mut srv.ip,
        Instant::ZERO,
        &seg(TcpControl::Psh, TcpSeqNumber(1001), Some(srv.iss + 1), &bulk),
    );
    srv.ip.clear();

    srv.tcp.consume_recv(srv.conn, 100).unwrap();
    srv.tcp.poll(Instant::ZERO, &mut srv.ip);
    assert!(srv.ip.is_quiet());

    srv.tcp.consume_recv(srv.conn, 3900).unwrap();
    srv.tcp.poll(Instant::ZERO, &mut srv.ip);
    let update = srv.ip.pop();
    assert_eq!(update.control, TcpControl::None);
    assert_eq!(update.ack, Some(TcpSeqNumber(5001)));
}

#[test]
fn test_zero_copy_send_path() {
    let mut srv = establish(536, None);
    let base = srv.iss + 1;

    {
        let (first, _) = srv.tcp.send_ranges(srv.conn).unwrap();
        first[..5].copy_from_slice(b"NOCPY");
    }
    srv.tcp.provide_send(srv.conn, 5).unwrap();
    srv.tcp.poll(srv.tcp.poll_at().unwrap(), &mut srv.ip);
    let segment = srv.ip.pop();
    assert_eq!(segment.seq, base);
    assert_eq!(segment.payload, b"NOCPY");
}

// ===== two engines, one wire =====

fn drain(
    from_ip: &mut TestIp,
    to: &mut Engine<'_>,
    to_ip: &mut TestIp,
    now: Instant,
) -> usize {
    let frames: Vec<_> = from_ip.frames.drain(..).collect();
    let count = frames.len();
    for (meta, frame) in frames {
        to.process(now, to_ip, meta.src_addr, meta.dst_addr, meta.dont_frag, &frame);
    }
    count
}

/// Shuttle frames both ways until the wire is quiet.
fn pump(
    a: &mut Engine<'_>,
    ipa: &mut TestIp,
    b: &mut Engine<'_>,
    ipb: &mut TestIp,
    now: Instant,
) {
    loop {
        let moved = drain(ipa, b, ipb, now) + drain(ipb, a, ipa, now);
        if moved == 0 {
            break;
        }
    }
}

struct Loopback {
    a: Engine<'static>,
    ipa: TestIp,
    b: Engine<'static>,
    ipb: TestIp,
    conn_a: ConnHandle,
    conn_b: ConnHandle,
    record_a: Rc<RefCell<Record>>,
    record_b: Rc<RefCell<Record>>,
}

fn loopback() -> Loopback {
    let mut a = Engine::new(Config::default(), Instant::ZERO, 1);
    let mut b = Engine::new(Config::default(), Instant::ZERO, 2);
    let mut ipa = TestIp::with_addr(LOCAL_ADDR);
    let mut ipb = TestIp::with_addr(REMOTE_ADDR);

    let (record_b, conn_events_b) = record_events();
    let accepted = Rc::new(RefCell::new(Vec::new()));
    b.listen(
        LOCAL_PORT,
        4,
        4096,
        Rc::new(RefCell::new(AutoAccept {
            accepted: accepted.clone(),
            conn_events: conn_events_b,
            buffer_size: 65536,
        })),
    )
    .unwrap();

    let (record_a, events_a) = record_events();
    let conn_a = a
        .connect(
            &mut ipa,
            IpEndpoint::new(REMOTE_ADDR, LOCAL_PORT),
            SocketBuffer::new(vec![0; 65536]),
            SocketBuffer::new(vec![0; 65536]),
            events_a,
        )
        .unwrap();

    pump(&mut a, &mut ipa, &mut b, &mut ipb, Instant::ZERO);
    assert_eq!(record_a.borrow().established, 1);
    assert_eq!(accepted.borrow().len(), 1);
    let conn_b = accepted.borrow()[0];
    assert_eq!(a.state(conn_a), Ok(State::Established));
    assert_eq!(b.state(conn_b), Ok(State::Established));

    Loopback {
        a,
        ipa,
        b,
        ipb,
        conn_a,
        conn_b,
        record_a,
        record_b,
    }
}

fn collect_received(tcp: &mut Engine<'_>, conn: ConnHandle, into: &mut Vec<u8>) {
    let len = {
        let (first, second) = tcp.recv_ranges(conn).unwrap();
        into.extend_from_slice(first);
        into.extend_from_slice(second);
        first.len() + second.len()
    };
    if len > 0 {
        tcp.consume_recv(conn, len).unwrap();
    }
}

#[test]
fn test_loopback_bulk_transfer_in_order() {
    let mut lo = loopback();
    let payload: Vec<u8> = (0..9000u32).map(|i| (i.wrapping_mul(7) >> 2) as u8).collect();

    let mut now = Instant::ZERO;
    let mut received = Vec::new();
    let mut offset = 0;
    while received.len() < payload.len() {
        offset += lo.a.send(lo.conn_a, &payload[offset..]).unwrap();
        now += Duration::from_millis(1);
        lo.a.poll(now, &mut lo.ipa);
        pump(&mut lo.a, &mut lo.ipa, &mut lo.b, &mut lo.ipb, now);
        collect_received(&mut lo.b, lo.conn_b, &mut received);
    }

    // Everything arrived, exactly once, in order.
    assert_eq!(received, payload);
    assert_eq!(
        lo.record_b.borrow().data_received.iter().sum::<usize>(),
        payload.len()
    );
    assert_eq!(
        lo.record_a.borrow().send_acked.iter().sum::<usize>(),
        payload.len()
    );

    // Graceful close in both directions.
    lo.a.shutdown_send(lo.conn_a).unwrap();
    now += Duration::from_millis(1);
    lo.a.poll(now, &mut lo.ipa);
    pump(&mut lo.a, &mut lo.ipa, &mut lo.b, &mut lo.ipb, now);
    assert!(lo.record_b.borrow().peer_closed);

    lo.b.shutdown_send(lo.conn_b).unwrap();
    now += Duration::from_millis(1);
    lo.b.poll(now, &mut lo.ipb);
    pump(&mut lo.a, &mut lo.ipa, &mut lo.b, &mut lo.ipb, now);

    assert_eq!(lo.a.state(lo.conn_a), Ok(State::TimeWait));
    assert_eq!(lo.b.state(lo.conn_b), Err(Error::ConnectionAborted));
}

#[test]
fn test_loopback_recovers_from_loss() {
    let mut lo = loopback();
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

    let mut now = Instant::ZERO;
    assert_eq!(lo.a.send(lo.conn_a, &payload).unwrap(), payload.len());
    now += Duration::from_millis(1);
    lo.a.poll(now, &mut lo.ipa);

    // The first segment burns up on the wire.
    assert!(lo.ipa.frames.len() >= 2);
    lo.ipa.frames.remove(0);
    pump(&mut lo.a, &mut lo.ipa, &mut lo.b, &mut lo.ipb, now);

    let mut received = Vec::new();
    collect_received(&mut lo.b, lo.conn_b, &mut received);
    assert!(received.is_empty());

    // The retransmission timer repairs the stream.
    let mut deadline = now + Duration::from_secs(200);
    while received.len() < payload.len() {
        let ta = lo.a.poll_at().unwrap();
        let tb = lo.b.poll_at().unwrap();
        let at = if ta < tb { ta } else { tb };
        assert!(at < deadline, "transfer did not converge");
        now = if at > now { at } else { now + Duration::from_millis(1) };
        lo.a.poll(now, &mut lo.ipa);
        lo.b.poll(now, &mut lo.ipb);
        pump(&mut lo.a, &mut lo.ipa, &mut lo.b, &mut lo.ipb, now);
        collect_received(&mut lo.b, lo.conn_b, &mut received);
        deadline = now + Duration::from_secs(200);
    }

    assert_eq!(received, payload);
}
