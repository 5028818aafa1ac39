//! Minimal echo service built on `tandem-net`: whatever a client sends over
//! its TCP/SHM carrier comes back verbatim on the same carrier. Exercises the
//! full login/heartbeat/reconnect path end to end against a real socket.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::{Parser, Subcommand};
use quanta::Clock;
use tandem_net::{
    Carrier, Config, DisconnectReason, LoginMsg, NewConnectionDecision, Server, ServerHandler,
    SeqMismatchInfo,
};
use tandem_wire::MsgHeader;

const TCP_BLKS: usize = 4096;
const SHM_BLKS: usize = 4096;
const TO_LITTLE: bool = true;

struct EchoConfig;

impl Config for EchoConfig {
    const NAME_SIZE: usize = 32;
    const TCP_RECV_BUF_INIT_SIZE: usize = 4096;
    const TCP_RECV_BUF_MAX_SIZE: usize = 1 << 20;
    const TCP_NO_DELAY: bool = true;
    const CONNECTION_TIMEOUT_NS: u64 = 5_000_000_000;
    const HEART_BEAT_INTERVAL_NS: u64 = 1_000_000_000;
    const MAX_NEW_CONNECTIONS: usize = 32;
    const MAX_SHM_CONNS_PER_GRP: usize = 32;
    const MAX_SHM_GRPS: usize = 1;
    const MAX_TCP_CONNS_PER_GRP: usize = 128;
    const MAX_TCP_GRPS: usize = 1;
    const NEW_CONNECTION_TIMEOUT_NS: u64 = 5_000_000_000;
}

/// Bidirectional TCP/SHM echo built on `tandem-net`.
#[derive(Parser)]
#[command(name = "tandem-echo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept logins and echo every frame back to its sender.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7799")]
        bind: SocketAddr,
        #[arg(long, default_value = "echo-server")]
        name: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Connect, send one frame per line read from stdin, print the echo.
    Connect {
        #[arg(long)]
        server: SocketAddr,
        #[arg(long, default_value = "echo-client")]
        name: String,
        #[arg(long, default_value = "echo-server")]
        remote_name: String,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        shm: bool,
    },
}

struct EchoHandler {
    pending: Vec<(usize, u16, Vec<u8>)>,
}

impl ServerHandler for EchoHandler {
    fn on_login(&mut self, login: &LoginMsg, peer_addr: SocketAddr) -> NewConnectionDecision {
        tracing::info!(client = login.client_name.as_str(), %peer_addr, use_shm = login.use_shm, "login");
        NewConnectionDecision::Accept { use_shm: login.use_shm, user_data: Vec::new() }
    }

    fn on_seq_mismatch(&mut self, info: SeqMismatchInfo, peer_addr: SocketAddr) {
        tracing::warn!(?info, %peer_addr, "sequence number mismatch, rejecting login");
    }

    fn on_established(&mut self, conn_id: usize) {
        tracing::info!(conn_id, "connection established");
    }

    fn on_message(&mut self, conn_id: usize, header: &MsgHeader, payload: &[u8]) {
        self.pending.push((conn_id, header.msg_type, payload.to_vec()));
    }

    fn on_disconnected(&mut self, conn_id: usize, reason: DisconnectReason) {
        tracing::info!(conn_id, %reason, "disconnected");
    }
}

fn install_shutdown_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .expect("failed to install Ctrl-C handler");
    running
}

fn serve(bind: SocketAddr, name: String, dir: Option<PathBuf>) {
    let dir = dir.unwrap_or_else(|| tandem_utils::directories::ptcp_dir("tandem-echo"));
    std::fs::create_dir_all(&dir).expect("create queue directory");

    let mut server = Server::<EchoConfig, TCP_BLKS, SHM_BLKS, TO_LITTLE>::bind(bind, dir.as_path(), &name)
        .expect("bind echo server");
    tracing::info!(%bind, dir = %dir.display(), "echo server listening");

    let mut handler = EchoHandler { pending: Vec::new() };
    let running = install_shutdown_flag();
    let clock = Clock::new();

    while running.load(Ordering::SeqCst) {
        let now_ns = clock.raw();
        server.poll(&mut handler, Duration::from_millis(50), now_ns);
        server.poll_shm(&mut handler);

        for (conn_id, msg_type, payload) in handler.pending.drain(..) {
            let Some(conn) = server.connection_mut(conn_id) else { continue };
            let carrier = if conn.has_shm() { Carrier::Shm } else { Carrier::Tcp };
            if let Some(buf) = conn.alloc(carrier, payload.len() as u16, msg_type) {
                buf.copy_from_slice(&payload);
                conn.push(carrier, now_ns);
            } else {
                tracing::warn!(conn_id, "queue full, dropping echo");
            }
        }
    }
    tracing::info!("shutting down");
}

fn connect(server: SocketAddr, name: String, remote_name: String, dir: Option<PathBuf>, shm: bool) {
    let dir = dir.unwrap_or_else(|| tandem_utils::directories::ptcp_dir("tandem-echo"));
    std::fs::create_dir_all(&dir).expect("create queue directory");

    let clock = Clock::new();
    let mut client = tandem_net::Client::<EchoConfig, TCP_BLKS, SHM_BLKS, TO_LITTLE>::new(dir.as_path())
        .expect("create client poller");
    client
        .connect(server, &name, &remote_name, shm, Vec::new(), clock.raw())
        .expect("login handshake failed");
    tracing::info!(%server, "connected");

    struct PrintHandler;
    impl tandem_net::ClientHandler for PrintHandler {
        fn on_message(&mut self, header: &MsgHeader, payload: &[u8]) {
            let text = String::from_utf8_lossy(payload);
            tracing::info!(msg_type = header.msg_type, %text, "echo received");
        }
        fn on_disconnected(&mut self, reason: DisconnectReason) {
            tracing::warn!(%reason, "disconnected");
        }
    }

    let mut handler = PrintHandler;
    let running = install_shutdown_flag();
    let stdin = std::io::stdin();
    let mut line = String::new();

    while running.load(Ordering::SeqCst) {
        let now_ns = clock.raw();
        client.poll_tcp(&mut handler, Duration::from_millis(20), now_ns);
        client.poll_shm(&mut handler);

        line.clear();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let text = line.trim_end();
        if text.is_empty() {
            continue;
        }
        let Some(conn) = client.connection_mut() else { break };
        let carrier = if conn.has_shm() { Carrier::Shm } else { Carrier::Tcp };
        match conn.alloc(carrier, text.len() as u16, 1) {
            Some(buf) => {
                buf.copy_from_slice(text.as_bytes());
                conn.push(carrier, now_ns);
            }
            None => tracing::warn!("queue full, dropping message"),
        }
    }
    client.stop();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve { bind, name, dir } => serve(bind, name, dir),
        Command::Connect { server, name, remote_name, dir, shm } => {
            connect(server, name, remote_name, dir, shm)
        }
    }
}
