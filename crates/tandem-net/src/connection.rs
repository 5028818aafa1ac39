//! The session state machine: one TCP socket plus an optional SHM queue pair,
//! framed send/receive buffering, heartbeats and timeouts.

use std::{
    io::{self, Read, Write},
    marker::PhantomData,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use mio::net::TcpStream as MioTcpStream;
use tandem_queues::{MapPod, PtcpQueue, SpscQueue};
use tandem_utils::{ArrayStr, safe_assert};
use tandem_wire::{
    HEADER_BYTES, MSG_TYPE_HEARTBEAT, MSG_TYPE_INVALID, MSG_TYPE_LOGIN, MSG_TYPE_LOGIN_RSP,
    MsgHeader, WireEndian,
};

use crate::{config::Config, error::DisconnectReason, login::MAX_NAME_SIZE};

/// Which carrier a given `alloc`/`push` call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Carrier {
    Tcp,
    Shm,
}

fn is_reserved_msg_type(msg_type: u16) -> bool {
    matches!(msg_type, MSG_TYPE_INVALID | MSG_TYPE_LOGIN | MSG_TYPE_LOGIN_RSP | MSG_TYPE_HEARTBEAT)
}

/// `<local>_<remote>.ptcp` under `dir`. Private to this process; unlike the
/// SHM pair below, it is never mmap'd jointly with the peer.
pub fn ptcp_path(dir: &Path, local: &str, remote: &str) -> PathBuf {
    dir.join(format!("{local}_{remote}.ptcp"))
}

/// The two SHM queue file paths for a `(local, remote)` pair, from `local`'s
/// point of view: `(outbound, inbound)`.
///
/// Both ends of a connection must agree on the same two physical files, so
/// the pair is named from a canonical (lexicographically sorted) ordering of
/// the two endpoint names rather than literally `<local>_<remote>`/
/// `<local>_<remote>` independently per side, which would give each side a
/// different path for what must be one shared file.
pub fn shm_paths(dir: &Path, local: &str, remote: &str) -> (PathBuf, PathBuf) {
    let (a, b) = if local <= remote { (local, remote) } else { (remote, local) };
    let a_to_b = dir.join(format!("{a}_{b}.shm_send"));
    let b_to_a = dir.join(format!("{b}_{a}.shm_send"));
    if local <= remote { (a_to_b, b_to_a) } else { (b_to_a, a_to_b) }
}

struct ShmPair<const SHM_BLKS: usize> {
    outbound: MapPod<SpscQueue<SHM_BLKS>>,
    inbound: MapPod<SpscQueue<SHM_BLKS>>,
}

/// One session: a TCP socket carrying control/heartbeats/data framed with
/// [`tandem_wire::MsgHeader`], backed by a file-persisted [`PtcpQueue`] for
/// retransmission on reconnect, plus an optional SHM queue pair for the
/// same-host low-latency path.
///
/// Generic over the application's [`Config`] and the PTCP/SHM block counts
/// and wire endianness, which must be const generics (rather than associated
/// consts on `Config`) because they size fixed-length arrays.
pub struct Connection<
    C: Config,
    const TCP_BLKS: usize,
    const SHM_BLKS: usize,
    const TO_LITTLE: bool,
    S = (),
> {
    stream: MioTcpStream,
    peer_addr: SocketAddr,
    local_name: ArrayStr<MAX_NAME_SIZE>,
    remote_name: ArrayStr<MAX_NAME_SIZE>,

    recv_buf: Vec<u8>,
    recv_filled: usize,
    send_offset: usize,

    ptcp: MapPod<PtcpQueue<TCP_BLKS, TO_LITTLE>>,
    shm: Option<ShmPair<SHM_BLKS>>,

    last_outbound_ns: u64,
    last_activity_ns: u64,
    closed: AtomicBool,

    /// Application-defined per-connection scratch space.
    pub scratch: S,

    _cfg: PhantomData<C>,
}

impl<C: Config, const TCP_BLKS: usize, const SHM_BLKS: usize, const TO_LITTLE: bool, S: Default>
    Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>
{
    /// Builds a `Connection` from an already-logged-in socket. `now_ns`
    /// seeds both activity timers so a freshly-established connection isn't
    /// immediately judged idle or timed out.
    pub fn new(
        stream: MioTcpStream,
        peer_addr: SocketAddr,
        dir: &Path,
        local_name: ArrayStr<MAX_NAME_SIZE>,
        remote_name: ArrayStr<MAX_NAME_SIZE>,
        use_shm: bool,
        now_ns: u64,
    ) -> Result<Self, tandem_queues::PersistError> {
        stream.set_nodelay(C::TCP_NO_DELAY).ok();

        let ptcp =
            MapPod::open_or_create(&ptcp_path(dir, local_name.as_str(), remote_name.as_str()))?;

        let shm = if use_shm {
            let (out_path, in_path) = shm_paths(dir, local_name.as_str(), remote_name.as_str());
            let outbound = MapPod::open_or_create(&out_path)?;
            let inbound = MapPod::open_or_create(&in_path)?;
            Some(ShmPair { outbound, inbound })
        } else {
            None
        };

        Ok(Self {
            stream,
            peer_addr,
            local_name,
            remote_name,
            recv_buf: vec![0; C::TCP_RECV_BUF_INIT_SIZE],
            recv_filled: 0,
            send_offset: 0,
            ptcp,
            shm,
            last_outbound_ns: now_ns,
            last_activity_ns: now_ns,
            closed: AtomicBool::new(false),
            scratch: S::default(),
            _cfg: PhantomData,
        })
    }
}

impl<C: Config, const TCP_BLKS: usize, const SHM_BLKS: usize, const TO_LITTLE: bool, S>
    Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>
{
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_name(&self) -> &str {
        self.local_name.as_str()
    }

    pub fn remote_name(&self) -> &str {
        self.remote_name.as_str()
    }

    pub fn has_shm(&self) -> bool {
        self.shm.is_some()
    }

    /// `MyAck`: the number of frames this end has received from the peer so
    /// far, which is what gets stamped into the next outgoing frame's
    /// `ack_seq`.
    pub fn my_ack(&mut self) -> u32 {
        *self.ptcp.my_ack()
    }

    /// Idempotent; the owning poll loop observes this on its next iteration
    /// and tears the connection down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mio_stream_mut(&mut self) -> &mut MioTcpStream {
        &mut self.stream
    }

    pub(crate) fn ptcp_mut(&mut self) -> &mut PtcpQueue<TCP_BLKS, TO_LITTLE> {
        self.ptcp.get_mut()
    }

    /// Reserves `payload_bytes` on the chosen carrier and returns the
    /// payload bytes (not including the header) to write into. `msg_type`
    /// must not collide with a reserved control value.
    pub fn alloc(
        &mut self,
        carrier: Carrier,
        payload_bytes: u16,
        msg_type: u16,
    ) -> Option<&mut [u8]> {
        safe_assert!(
            !is_reserved_msg_type(msg_type),
            "application msg_type {msg_type} collides with a reserved control value"
        );
        match carrier {
            Carrier::Tcp => self.ptcp.alloc_payload(payload_bytes, msg_type),
            Carrier::Shm => self.shm.as_mut()?.outbound.alloc_payload(payload_bytes, msg_type),
        }
    }

    /// Publishes the frame most recently returned by `alloc` on `carrier`.
    /// `now_ns` resets the heartbeat idle timer for the TCP carrier.
    pub fn push(&mut self, carrier: Carrier, now_ns: u64) {
        match carrier {
            Carrier::Tcp => {
                self.ptcp.push();
                self.last_outbound_ns = now_ns;
            }
            Carrier::Shm => {
                if let Some(shm) = &mut self.shm {
                    shm.outbound.push();
                }
            }
        }
    }

    /// Drains every pending frame from the inbound SHM queue, if any.
    pub fn poll_shm(&self, mut on_msg: impl FnMut(&MsgHeader, &[u8])) {
        let Some(shm) = &self.shm else { return };
        while let Some((header, payload)) = shm.inbound.front_payload() {
            on_msg(header, payload);
            shm.inbound.pop();
        }
    }

    /// Drives the TCP side for one poll tick: reads and dispatches complete
    /// inbound frames, flushes sendable PTCP bytes, and emits a heartbeat if
    /// the connection has been idle outbound for `HeartBeatInterval`.
    ///
    /// Returns the reason the connection should be torn down, if any; the
    /// caller is still responsible for calling `close`/removing the slot.
    pub fn poll_tcp(
        &mut self,
        now_ns: u64,
        mut on_msg: impl FnMut(&MsgHeader, &[u8]),
    ) -> Option<DisconnectReason> {
        if let Some(reason) = self.read_frames(now_ns, &mut on_msg) {
            return Some(reason);
        }

        if now_ns.saturating_sub(self.last_activity_ns) > C::CONNECTION_TIMEOUT_NS {
            return Some(DisconnectReason::Heartbeat);
        }

        if let Err(e) = self.flush_send() {
            return Some(DisconnectReason::Io(e));
        }

        if now_ns.saturating_sub(self.last_outbound_ns) >= C::HEART_BEAT_INTERVAL_NS
            && self.ptcp.alloc_payload(0, MSG_TYPE_HEARTBEAT).is_some()
        {
            self.ptcp.push();
            self.last_outbound_ns = now_ns;
            if let Err(e) = self.flush_send() {
                return Some(DisconnectReason::Io(e));
            }
        }

        None
    }

    fn read_frames(
        &mut self,
        now_ns: u64,
        on_msg: &mut impl FnMut(&MsgHeader, &[u8]),
    ) -> Option<DisconnectReason> {
        loop {
            match self.stream.read(&mut self.recv_buf[self.recv_filled..]) {
                Ok(0) => return Some(DisconnectReason::PeerClosed),
                Ok(n) => {
                    self.recv_filled += n;
                    self.last_activity_ns = now_ns;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Some(DisconnectReason::Io(e)),
            }
            if self.recv_filled == self.recv_buf.len() {
                // Buffer's full; try to grow before the next read so a large
                // frame isn't starved of space to land a header/size in.
                if self.recv_buf.len() >= C::TCP_RECV_BUF_MAX_SIZE {
                    break;
                }
                let grown = (self.recv_buf.len() * 2).min(C::TCP_RECV_BUF_MAX_SIZE);
                self.recv_buf.resize(grown, 0);
            }
        }

        while self.recv_filled >= HEADER_BYTES {
            // SAFETY: recv_buf has at least HEADER_BYTES valid bytes.
            let header =
                unsafe { MsgHeader::read_from(self.recv_buf.as_ptr()) }.from_wire::<TO_LITTLE>();
            let size = header.size as usize;
            if size < HEADER_BYTES || size > C::TCP_RECV_BUF_MAX_SIZE {
                return Some(DisconnectReason::OversizedFrame(size));
            }
            if size > self.recv_buf.len() {
                self.recv_buf.resize(size, 0);
            }
            if self.recv_filled < size {
                break;
            }

            self.dispatch_frame(header, size, on_msg);

            self.recv_buf.copy_within(size..self.recv_filled, 0);
            self.recv_filled -= size;
        }

        if self.recv_buf.len() > C::TCP_RECV_BUF_INIT_SIZE
            && self.recv_filled <= C::TCP_RECV_BUF_INIT_SIZE
        {
            self.recv_buf.resize(C::TCP_RECV_BUF_INIT_SIZE, 0);
        }

        None
    }

    fn dispatch_frame(
        &mut self,
        header: MsgHeader,
        size: usize,
        on_msg: &mut impl FnMut(&MsgHeader, &[u8]),
    ) {
        self.ptcp.ack(header.ack_seq);

        match header.msg_type {
            MSG_TYPE_LOGIN | MSG_TYPE_LOGIN_RSP => {
                tracing::warn!(
                    msg_type = header.msg_type,
                    "unexpected control frame after login; ignoring"
                );
                return;
            }
            MSG_TYPE_HEARTBEAT => {}
            _ => {
                let payload = &self.recv_buf[HEADER_BYTES..size];
                on_msg(&header, payload);
            }
        }
        // Every frame the peer stored (heartbeats included) occupies a slot
        // in *its* PTCP queue and is only reclaimed once our ack catches up
        // to it, so the counter must advance for heartbeats too.
        *self.ptcp.my_ack() += 1;
    }

    fn flush_send(&mut self) -> io::Result<()> {
        loop {
            let (bytes, _blk_cnt) = self.ptcp.get_sendable();
            let remaining = &bytes[self.send_offset..];
            if remaining.is_empty() {
                return Ok(());
            }
            match self.stream.write(remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.send_offset += n;
                    let whole_blocks = (self.send_offset / HEADER_BYTES) as u32;
                    if whole_blocks > 0 {
                        self.ptcp.sendout(whole_blocks);
                        self.send_offset -= whole_blocks as usize * HEADER_BYTES;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_paths_agree_regardless_of_side() {
        let dir = Path::new("/tmp/tandem-test");
        let (client_out, client_in) = shm_paths(dir, "client", "server");
        let (server_out, server_in) = shm_paths(dir, "server", "client");
        assert_eq!(client_out, server_in);
        assert_eq!(client_in, server_out);
    }

    #[test]
    fn reserved_msg_types_are_rejected_by_assertion() {
        assert!(is_reserved_msg_type(MSG_TYPE_HEARTBEAT));
        assert!(is_reserved_msg_type(MSG_TYPE_LOGIN));
        assert!(is_reserved_msg_type(MSG_TYPE_LOGIN_RSP));
        assert!(is_reserved_msg_type(MSG_TYPE_INVALID));
        assert!(!is_reserved_msg_type(1));
    }
}
