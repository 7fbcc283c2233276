//! Two TCP engines wired back to back over an in-memory IPv4 link.
//!
//! The client streams random bytes to an echo server and checks that
//! every byte comes back in order. Run with `-v` to watch the segment
//! exchange.

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;

use ripstack::ip::{Ip4Tx, Ipv4Meta, Route, SendError};
use ripstack::tcp::{
    Config, ConnHandle, ConnectionEvents, Engine, ListenerEvents, ListenerHandle, SocketBuffer,
    State,
};
use ripstack::time::{Duration, Instant};
use ripstack::wire::{IpEndpoint, Ipv4Address};

const CLIENT_ADDR: Ipv4Address = Ipv4Address::new(192, 168, 69, 1);
const SERVER_ADDR: Ipv4Address = Ipv4Address::new(192, 168, 69, 2);
const ECHO_PORT: u16 = 7;

/// A lossless in-memory link endpoint with a fixed 1500-octet MTU.
struct Wire {
    src_addr: Ipv4Address,
    frames: Vec<(Ipv4Meta, Vec<u8>)>,
}

impl Wire {
    fn new(src_addr: Ipv4Address) -> Wire {
        Wire {
            src_addr,
            frames: Vec::new(),
        }
    }
}

impl Ip4Tx for Wire {
    fn route(&self, _dst_addr: Ipv4Address) -> Option<Route> {
        Some(Route {
            src_addr: self.src_addr,
            mtu: 1500,
            is_local: true,
        })
    }

    fn transmit(
        &mut self,
        meta: &Ipv4Meta,
        payload_len: usize,
        emit: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), SendError> {
        let mut frame = vec![0; payload_len];
        emit(&mut frame);
        self.frames.push((*meta, frame));
        Ok(())
    }
}

/// Server side: echo everything back, close when the client closes.
struct Echo;

impl ConnectionEvents for Echo {
    fn on_data_received(&mut self, tcp: &mut Engine<'_>, conn: ConnHandle, _len: usize) {
        let chunk = {
            let (first, second) = tcp.recv_ranges(conn).unwrap();
            let mut chunk = first.to_vec();
            chunk.extend_from_slice(second);
            chunk
        };
        let echoed = tcp.send(conn, &chunk).unwrap();
        tcp.consume_recv(conn, echoed).unwrap();
    }

    fn on_peer_closed(&mut self, tcp: &mut Engine<'_>, conn: ConnHandle) {
        let _ = tcp.shutdown_send(conn);
    }
}

struct EchoAccept;

impl ListenerEvents for EchoAccept {
    fn on_accept(&mut self, tcp: &mut Engine<'_>, listener: ListenerHandle) {
        while let Some(_conn) = tcp.accept(
            listener,
            SocketBuffer::new(vec![0; 1 << 17]),
            SocketBuffer::new(vec![0; 1 << 17]),
            Rc::new(RefCell::new(Echo)),
        ) {
            log::info!("server: accepted a connection");
        }
    }
}

/// Client side: driven from the main loop, no callbacks needed.
struct Quiet;

impl ConnectionEvents for Quiet {}

fn pump(
    client: &mut Engine<'_>,
    client_wire: &mut Wire,
    server: &mut Engine<'_>,
    server_wire: &mut Wire,
    now: Instant,
) {
    loop {
        let mut moved = 0;
        for (meta, frame) in client_wire.frames.drain(..).collect::<Vec<_>>() {
            server.process(now, server_wire, meta.src_addr, meta.dst_addr, true, &frame);
            moved += 1;
        }
        for (meta, frame) in server_wire.frames.drain(..).collect::<Vec<_>>() {
            client.process(now, client_wire, meta.src_addr, meta.dst_addr, true, &frame);
            moved += 1;
        }
        if moved == 0 {
            break;
        }
    }
}

fn main() {
    let mut opts = getopts::Options::new();
    opts.optflag("v", "verbose", "log every segment");
    opts.optopt("c", "count", "bytes to echo (default 16384)", "BYTES");
    opts.optflag("h", "help", "print this help");
    let matches = opts.parse(std::env::args().skip(1)).unwrap();
    if matches.opt_present("h") {
        print!("{}", opts.usage("Usage: echo [-v] [-c BYTES]"));
        return;
    }
    let count: usize = matches
        .opt_str("c")
        .map(|s| s.parse().expect("invalid byte count"))
        .unwrap_or(16384);

    let mut builder = env_logger::Builder::from_default_env();
    if matches.opt_present("v") {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder.init();

    let mut server = Engine::new(Config::default(), Instant::ZERO, 0x0bad_cafe);
    let mut client = Engine::new(Config::default(), Instant::ZERO, 0xdead_beef);
    let mut server_wire = Wire::new(SERVER_ADDR);
    let mut client_wire = Wire::new(CLIENT_ADDR);

    server
        .listen(ECHO_PORT, 4, 65535, Rc::new(RefCell::new(EchoAccept)))
        .unwrap();

    let conn = client
        .connect(
            &mut client_wire,
            IpEndpoint::new(SERVER_ADDR, ECHO_PORT),
            SocketBuffer::new(vec![0; 1 << 17]),
            SocketBuffer::new(vec![0; 1 << 17]),
            Rc::new(RefCell::new(Quiet)),
        )
        .unwrap();

    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..count).map(|_| rng.gen()).collect();

    let mut now = Instant::ZERO;
    let mut written = 0;
    let mut echoed = Vec::with_capacity(count);
    while echoed.len() < count {
        now += Duration::from_millis(1);
        client.poll(now, &mut client_wire);
        server.poll(now, &mut server_wire);
        pump(&mut client, &mut client_wire, &mut server, &mut server_wire, now);

        if written < count {
            written += client.send(conn, &payload[written..]).unwrap();
        }
        let ready = {
            let (first, second) = client.recv_ranges(conn).unwrap();
            echoed.extend_from_slice(first);
            echoed.extend_from_slice(second);
            first.len() + second.len()
        };
        if ready > 0 {
            client.consume_recv(conn, ready).unwrap();
        }
    }

    assert_eq!(echoed, payload, "echoed stream differs from the original");
    log::info!(
        "client: {} active connection(s) before close",
        client.active_connections()
    );

    client.shutdown_send(conn).unwrap();
    loop {
        now += Duration::from_millis(1);
        client.poll(now, &mut client_wire);
        server.poll(now, &mut server_wire);
        pump(&mut client, &mut client_wire, &mut server, &mut server_wire, now);
        match client.state(conn) {
            Ok(State::TimeWait) | Err(_) => break,
            _ => {}
        }
    }

    println!("echoed {count} bytes in order, connection closed cleanly");
}
