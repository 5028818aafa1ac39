//! Loopback integration tests driving a real `Server`/`Client` pair over
//! TCP on an OS-assigned ephemeral port. `now_ns` is supplied by the test
//! rather than read from the wall clock, so the heartbeat-timeout case
//! doesn't need to actually wait out `ConnectionTimeout`.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tandem_net::{
    Carrier, Client, ClientHandler, Config, DisconnectReason, LoginMsg, NewConnectionDecision,
    Server, ServerHandler, SeqMismatchInfo,
};
use tandem_queues::{MapPod, PtcpQueue};
use tandem_wire::{MsgHeader, WireEndian};

fn encode_u32(v: u32) -> [u8; 4] {
    v.to_wire::<true>().to_ne_bytes()
}

fn decode_u32(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf.try_into().expect("4-byte payload")).from_wire::<true>()
}

struct TestConfig;

impl Config for TestConfig {
    const NAME_SIZE: usize = 16;
    const TCP_RECV_BUF_INIT_SIZE: usize = 256;
    const TCP_RECV_BUF_MAX_SIZE: usize = 4096;
    const TCP_NO_DELAY: bool = true;
    const CONNECTION_TIMEOUT_NS: u64 = 2_000_000_000;
    const HEART_BEAT_INTERVAL_NS: u64 = 500_000_000;
    const MAX_NEW_CONNECTIONS: usize = 4;
    const MAX_SHM_CONNS_PER_GRP: usize = 4;
    const MAX_SHM_GRPS: usize = 1;
    const MAX_TCP_CONNS_PER_GRP: usize = 4;
    const MAX_TCP_GRPS: usize = 1;
    const NEW_CONNECTION_TIMEOUT_NS: u64 = 2_000_000_000;
}

fn elapsed_ns(start: Instant) -> u64 {
    start.elapsed().as_nanos() as u64
}

struct EchoHandler {
    pending: Vec<(usize, u16, Vec<u8>)>,
}

impl ServerHandler for EchoHandler {
    fn on_login(&mut self, _login: &LoginMsg, _peer_addr: SocketAddr) -> NewConnectionDecision {
        NewConnectionDecision::Accept { use_shm: false, user_data: Vec::new() }
    }
    fn on_seq_mismatch(&mut self, _info: SeqMismatchInfo, _peer_addr: SocketAddr) {}
    fn on_established(&mut self, _conn_id: usize) {}
    fn on_message(&mut self, conn_id: usize, header: &MsgHeader, payload: &[u8]) {
        self.pending.push((conn_id, header.msg_type, payload.to_vec()));
    }
    fn on_disconnected(&mut self, _conn_id: usize, _reason: DisconnectReason) {}
}

struct RecordingHandler {
    received: Vec<Vec<u8>>,
    disconnected: Option<DisconnectReason>,
}

impl ClientHandler for RecordingHandler {
    fn on_message(&mut self, _header: &MsgHeader, payload: &[u8]) {
        self.received.push(payload.to_vec());
    }
    fn on_disconnected(&mut self, reason: DisconnectReason) {
        self.disconnected = Some(reason);
    }
}

/// Scenario 1: a client sends 10 ordered frames and gets them all back
/// unchanged and in order.
#[test]
fn tcp_echo_roundtrip() {
    let server_dir = tempfile::tempdir().unwrap();
    let mut server = Server::<TestConfig, 64, 64, true>::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_dir.path(),
        "srv",
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_server = stop.clone();
    let start = Instant::now();
    let server_thread = thread::spawn(move || {
        let mut handler = EchoHandler { pending: Vec::new() };
        while !stop_server.load(Ordering::Relaxed) {
            server.poll(&mut handler, Duration::from_millis(10), elapsed_ns(start));
            for (conn_id, msg_type, payload) in handler.pending.drain(..) {
                let Some(conn) = server.connection_mut(conn_id) else { continue };
                if let Some(buf) = conn.alloc(Carrier::Tcp, payload.len() as u16, msg_type) {
                    buf.copy_from_slice(&payload);
                    conn.push(Carrier::Tcp, elapsed_ns(start));
                }
            }
        }
    });

    let client_dir = tempfile::tempdir().unwrap();
    let mut client = Client::<TestConfig, 64, 64, true>::new(client_dir.path()).unwrap();
    client.connect(addr, "cli", "srv", false, Vec::new(), elapsed_ns(start)).unwrap();

    {
        let conn = client.connection_mut().expect("connected");
        for i in 1..=10u32 {
            let buf = conn.alloc(Carrier::Tcp, 4, 1).expect("room for frame");
            buf.copy_from_slice(&encode_u32(i));
            conn.push(Carrier::Tcp, elapsed_ns(start));
        }
    }

    let mut handler = RecordingHandler { received: Vec::new(), disconnected: None };
    let deadline = Instant::now() + Duration::from_secs(2);
    while handler.received.len() < 10 && Instant::now() < deadline {
        client.poll_tcp(&mut handler, Duration::from_millis(10), elapsed_ns(start));
    }

    stop.store(true, Ordering::Relaxed);
    server_thread.join().unwrap();

    let got: Vec<u32> = handler.received.iter().map(|p| decode_u32(p)).collect();
    assert_eq!(got, (1..=10u32).collect::<Vec<u32>>());
    assert!(handler.disconnected.is_none());
}

/// Scenario 6: silence past `ConnectionTimeout` tears the connection down
/// with `DisconnectReason::Heartbeat`, even though the socket is still open.
#[test]
fn heartbeat_timeout_disconnects_client() {
    let server_dir = tempfile::tempdir().unwrap();
    let mut server = Server::<TestConfig, 64, 64, true>::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_dir.path(),
        "srv",
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let serving = Arc::new(AtomicBool::new(true));
    let stop_server = stop.clone();
    let serving_server = serving.clone();
    let start = Instant::now();
    let server_thread = thread::spawn(move || {
        let mut handler = EchoHandler { pending: Vec::new() };
        while !stop_server.load(Ordering::Relaxed) {
            if serving_server.load(Ordering::Relaxed) {
                server.poll(&mut handler, Duration::from_millis(10), elapsed_ns(start));
                handler.pending.clear();
            } else {
                // Connection stays open (the `Server` still owns the slot)
                // but nothing -- not even heartbeats -- gets sent.
                thread::sleep(Duration::from_millis(5));
            }
        }
    });

    let client_dir = tempfile::tempdir().unwrap();
    let mut client = Client::<TestConfig, 64, 64, true>::new(client_dir.path()).unwrap();
    client.connect(addr, "cli", "srv", false, Vec::new(), elapsed_ns(start)).unwrap();

    let mut handler = RecordingHandler { received: Vec::new(), disconnected: None };
    // One live poll to let the login handshake settle before we freeze the
    // server side.
    client.poll_tcp(&mut handler, Duration::from_millis(50), elapsed_ns(start));
    serving.store(false, Ordering::Relaxed);

    let frozen_now_ns = elapsed_ns(start) + TestConfig::CONNECTION_TIMEOUT_NS + 1;
    client.poll_tcp(&mut handler, Duration::from_millis(10), frozen_now_ns);

    stop.store(true, Ordering::Relaxed);
    server_thread.join().unwrap();

    assert!(matches!(handler.disconnected, Some(DisconnectReason::Heartbeat)));
    assert!(client.connection_mut().is_none());
}

struct ReconnectHandler {
    received: Arc<std::sync::Mutex<Vec<(u16, Vec<u8>)>>>,
    mismatched: Arc<AtomicBool>,
}

impl ServerHandler for ReconnectHandler {
    fn on_login(&mut self, _login: &LoginMsg, _peer_addr: SocketAddr) -> NewConnectionDecision {
        NewConnectionDecision::Accept { use_shm: false, user_data: Vec::new() }
    }
    fn on_seq_mismatch(&mut self, _info: SeqMismatchInfo, _peer_addr: SocketAddr) {
        self.mismatched.store(true, Ordering::Relaxed);
    }
    fn on_established(&mut self, _conn_id: usize) {}
    fn on_message(&mut self, _conn_id: usize, header: &MsgHeader, payload: &[u8]) {
        self.received.lock().unwrap().push((header.msg_type, payload.to_vec()));
    }
    fn on_disconnected(&mut self, _conn_id: usize, _reason: DisconnectReason) {}
}

/// Scenario 4: a client reconnects after the peer has only acked part of
/// what it previously sent. The persisted PTCP files on both sides stand in
/// for a process that pushed 100 frames and died before any of them reached
/// the wire, and a peer that had, in a prior life of the connection, gotten
/// as far as acking the first 50. On reconnect the client must retransmit
/// only the unacked 51..100, the server must not see the first 50 again,
/// and the asymmetry must not be mistaken for `OnSeqNumberMismatch`.
#[test]
fn reconnect_retransmits_only_unacked_frames() {
    const TCP_BLKS: usize = 1024;
    type Ptcp = PtcpQueue<TCP_BLKS, true>;

    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();

    {
        let mut ptcp = MapPod::<Ptcp>::open_or_create(&client_dir.path().join("cli_srv.ptcp"))
            .unwrap();
        for i in 1..=100u32 {
            let buf = ptcp.alloc_payload(4, 1).expect("room for frame");
            buf.copy_from_slice(&encode_u32(i));
            ptcp.push();
        }
    }
    {
        let mut ptcp = MapPod::<Ptcp>::open_or_create(&server_dir.path().join("srv_cli.ptcp"))
            .unwrap();
        *ptcp.my_ack() = 50;
    }

    let mut server = Server::<TestConfig, TCP_BLKS, 64, true>::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_dir.path(),
        "srv",
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mismatched = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let stop_server = stop.clone();
    let received_server = received.clone();
    let mismatched_server = mismatched.clone();
    let start = Instant::now();
    let server_thread = thread::spawn(move || {
        let mut handler =
            ReconnectHandler { received: received_server, mismatched: mismatched_server };
        while !stop_server.load(Ordering::Relaxed) {
            server.poll(&mut handler, Duration::from_millis(10), elapsed_ns(start));
        }
    });

    let mut client = Client::<TestConfig, TCP_BLKS, 64, true>::new(client_dir.path()).unwrap();
    client.connect(addr, "cli", "srv", false, Vec::new(), elapsed_ns(start)).unwrap();

    let mut handler = RecordingHandler { received: Vec::new(), disconnected: None };
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().len() < 50 && Instant::now() < deadline {
        client.poll_tcp(&mut handler, Duration::from_millis(10), elapsed_ns(start));
    }

    stop.store(true, Ordering::Relaxed);
    server_thread.join().unwrap();

    assert!(
        !mismatched.load(Ordering::Relaxed),
        "a locally-consistent reconnect must not raise OnSeqNumberMismatch"
    );

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 50, "only the unacked tail should be retransmitted");
    assert!(got.iter().all(|(msg_type, _)| *msg_type == 1));
    let payloads: Vec<u32> = got.iter().map(|(_, p)| decode_u32(p)).collect();
    assert_eq!(payloads, (51..=100u32).collect::<Vec<u32>>());
}
