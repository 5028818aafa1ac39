//! Single-symbol tick publisher/subscriber built on `tandem-net`, exercising
//! the one-writer-many-readers shape this crate is meant for: one `publish`
//! process ticks a fixed-size quote out to every logged-in connection, one or
//! more `subscribe` processes print it back out with end-to-end latency.

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
use tandem_wire::{MsgHeader, WireEndian};

const TCP_BLKS: usize = 8192;
const SHM_BLKS: usize = 8192;
const TO_LITTLE: bool = true;
const MSG_TYPE_TICK: u16 = 1;
const TICK_PAYLOAD_BYTES: u16 = 20;

struct MdConfig;

impl Config for MdConfig {
    const NAME_SIZE: usize = 32;
    const TCP_RECV_BUF_INIT_SIZE: usize = 4096;
    const TCP_RECV_BUF_MAX_SIZE: usize = 1 << 16;
    const TCP_NO_DELAY: bool = true;
    const CONNECTION_TIMEOUT_NS: u64 = 5_000_000_000;
    const HEART_BEAT_INTERVAL_NS: u64 = 1_000_000_000;
    const MAX_NEW_CONNECTIONS: usize = 64;
    const MAX_SHM_CONNS_PER_GRP: usize = 64;
    const MAX_SHM_GRPS: usize = 1;
    const MAX_TCP_CONNS_PER_GRP: usize = 256;
    const MAX_TCP_GRPS: usize = 1;
    const NEW_CONNECTION_TIMEOUT_NS: u64 = 5_000_000_000;
}

/// Fixed-rate market-data publisher/subscriber demo for `tandem-net`.
#[derive(Parser)]
#[command(name = "tandem-market-data")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a synthetic tick every `interval-ms` to every subscriber.
    Publish {
        #[arg(long, default_value = "127.0.0.1:7800")]
        bind: SocketAddr,
        #[arg(long, default_value = "md-server")]
        name: String,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        #[arg(long, default_value_t = 1)]
        symbol: u32,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Subscribe and print every tick with its end-to-end latency.
    Subscribe {
        #[arg(long)]
        server: SocketAddr,
        #[arg(long, default_value = "md-client")]
        name: String,
        #[arg(long, default_value = "md-server")]
        remote_name: String,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        shm: bool,
    },
}

fn encode_tick(symbol: u32, price_ticks: i64, publish_ns: u64, out: &mut [u8]) {
    out[0..4].copy_from_slice(&symbol.to_wire::<TO_LITTLE>().to_ne_bytes());
    out[4..12].copy_from_slice(&price_ticks.to_wire::<TO_LITTLE>().to_ne_bytes());
    out[12..20].copy_from_slice(&publish_ns.to_wire::<TO_LITTLE>().to_ne_bytes());
}

fn decode_tick(buf: &[u8]) -> Option<(u32, i64, u64)> {
    if buf.len() < TICK_PAYLOAD_BYTES as usize {
        return None;
    }
    let symbol = u32::from_ne_bytes(buf[0..4].try_into().ok()?).from_wire::<TO_LITTLE>();
    let price_ticks = i64::from_ne_bytes(buf[4..12].try_into().ok()?).from_wire::<TO_LITTLE>();
    let publish_ns = u64::from_ne_bytes(buf[12..20].try_into().ok()?).from_wire::<TO_LITTLE>();
    Some((symbol, price_ticks, publish_ns))
}

struct PublishHandler {
    subscribers: Vec<usize>,
}

impl ServerHandler for PublishHandler {
    fn on_login(&mut self, login: &LoginMsg, peer_addr: SocketAddr) -> NewConnectionDecision {
        tracing::info!(client = login.client_name.as_str(), %peer_addr, "subscriber login");
        NewConnectionDecision::Accept { use_shm: login.use_shm, user_data: Vec::new() }
    }

    fn on_seq_mismatch(&mut self, info: SeqMismatchInfo, peer_addr: SocketAddr) {
        tracing::warn!(?info, %peer_addr, "sequence number mismatch, rejecting login");
    }

    fn on_established(&mut self, conn_id: usize) {
        tracing::info!(conn_id, "subscriber established");
        self.subscribers.push(conn_id);
    }

    fn on_message(&mut self, _conn_id: usize, _header: &MsgHeader, _payload: &[u8]) {
        // Subscribers don't send anything back in this demo.
    }

    fn on_disconnected(&mut self, conn_id: usize, reason: DisconnectReason) {
        tracing::info!(conn_id, %reason, "subscriber disconnected");
        self.subscribers.retain(|&id| id != conn_id);
    }
}

fn install_shutdown_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .expect("failed to install Ctrl-C handler");
    running
}

fn publish(bind: SocketAddr, name: String, interval_ms: u64, symbol: u32, dir: Option<PathBuf>) {
    let dir = dir.unwrap_or_else(|| tandem_utils::directories::ptcp_dir("tandem-market-data"));
    std::fs::create_dir_all(&dir).expect("create queue directory");

    let mut server = Server::<MdConfig, TCP_BLKS, SHM_BLKS, TO_LITTLE>::bind(bind, dir.as_path(), &name)
        .expect("bind market-data server");
    tracing::info!(%bind, interval_ms, symbol, "market-data publisher listening");

    let mut handler = PublishHandler { subscribers: Vec::new() };
    let running = install_shutdown_flag();
    let clock = Clock::new();
    let interval_ns = interval_ms.saturating_mul(1_000_000).max(1);
    let mut next_tick_ns = clock.raw();
    let mut price_ticks: i64 = 100_00;

    while running.load(Ordering::SeqCst) {
        let now_ns = clock.raw();
        server.poll(&mut handler, Duration::from_millis(interval_ms.min(20)), now_ns);

        if now_ns >= next_tick_ns {
            price_ticks += if price_ticks % 2 == 0 { 1 } else { -1 };
            for &conn_id in &handler.subscribers {
                let Some(conn) = server.connection_mut(conn_id) else { continue };
                let carrier = if conn.has_shm() { Carrier::Shm } else { Carrier::Tcp };
                if let Some(buf) = conn.alloc(carrier, TICK_PAYLOAD_BYTES, MSG_TYPE_TICK) {
                    encode_tick(symbol, price_ticks, now_ns, buf);
                    conn.push(carrier, now_ns);
                } else {
                    tracing::warn!(conn_id, "queue full, dropping tick");
                }
            }
            next_tick_ns = now_ns + interval_ns;
        }
    }
    tracing::info!("shutting down");
}

fn subscribe(server: SocketAddr, name: String, remote_name: String, dir: Option<PathBuf>, shm: bool) {
    let dir = dir.unwrap_or_else(|| tandem_utils::directories::ptcp_dir("tandem-market-data"));
    std::fs::create_dir_all(&dir).expect("create queue directory");

    let clock = Clock::new();
    let mut client = tandem_net::Client::<MdConfig, TCP_BLKS, SHM_BLKS, TO_LITTLE>::new(dir.as_path())
        .expect("create client poller");
    client
        .connect(server, &name, &remote_name, shm, Vec::new(), clock.raw())
        .expect("login handshake failed");
    tracing::info!(%server, "subscribed");

    struct TickHandler {
        clock: Clock,
    }
    impl tandem_net::ClientHandler for TickHandler {
        fn on_message(&mut self, header: &MsgHeader, payload: &[u8]) {
            if header.msg_type != MSG_TYPE_TICK {
                return;
            }
            let Some((symbol, price_ticks, publish_ns)) = decode_tick(payload) else {
                tracing::warn!("malformed tick payload");
                return;
            };
            let latency_ns = self.clock.raw().saturating_sub(publish_ns);
            tracing::info!(symbol, price_ticks, latency_ns, "tick");
        }
        fn on_disconnected(&mut self, reason: DisconnectReason) {
            tracing::warn!(%reason, "disconnected");
        }
    }

    let mut handler = TickHandler { clock: clock.clone() };
    let running = install_shutdown_flag();
    while running.load(Ordering::SeqCst) {
        let now_ns = clock.raw();
        client.poll_tcp(&mut handler, Duration::from_millis(50), now_ns);
        client.poll_shm(&mut handler);
    }
    client.stop();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Publish { bind, name, interval_ms, symbol, dir } => {
            publish(bind, name, interval_ms, symbol, dir)
        }
        Command::Subscribe { server, name, remote_name, dir, shm } => {
            subscribe(server, name, remote_name, dir, shm)
        }
    }
}
