//! Synchronous connect/handshake plus a non-blocking poll loop for the
//! client side of a session.

use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpStream as StdTcpStream},
    path::PathBuf,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, net::TcpStream as MioTcpStream};
use tandem_utils::ArrayStr;
use tandem_wire::{MSG_TYPE_LOGIN, MSG_TYPE_LOGIN_RSP, MsgHeader};

use crate::{
    config::Config,
    connection::Connection,
    error::{ConnectionError, DisconnectReason, LoginError},
    handshake::{read_frame_blocking, write_frame_blocking},
    login::{LoginMsg, LoginOutcome, LoginRspMsg, MAX_NAME_SIZE},
};

const CONN_TOKEN: Token = Token(0);

/// Application callbacks driven by [`Client::poll_tcp`]/[`Client::poll_shm`].
/// Neither callback is handed the [`Connection`] itself — call
/// [`Client::connection_mut`] after `poll_tcp`/`poll_shm` returns to send.
pub trait ClientHandler {
    fn on_message(&mut self, header: &MsgHeader, payload: &[u8]);
    fn on_disconnected(&mut self, reason: DisconnectReason);
}

/// Drives one outbound session: blocking connect + login handshake, then a
/// non-blocking poll loop the caller ticks from its own thread.
pub struct Client<
    C: Config,
    const TCP_BLKS: usize,
    const SHM_BLKS: usize,
    const TO_LITTLE: bool,
    S = (),
> {
    dir: PathBuf,
    poll: Poll,
    events: Events,
    conn: Option<Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>>,
}

impl<C: Config, const TCP_BLKS: usize, const SHM_BLKS: usize, const TO_LITTLE: bool, S: Default>
    Client<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>
{
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self { dir: dir.into(), poll: Poll::new()?, events: Events::with_capacity(64), conn: None })
    }

    /// Blocking connect + login. On success the session is `Established`
    /// and registered for the poll loop; `last_seq_sent`/`last_seq_received`
    /// reported by either side are reconciled against the stored PTCP queue
    /// before this returns.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        local_name: &str,
        remote_name: &str,
        use_shm: bool,
        user_data: Vec<u8>,
        now_ns: u64,
    ) -> Result<(), LoginError> {
        let local_name: ArrayStr<MAX_NAME_SIZE> = ArrayStr::from_str_truncate(local_name);
        let remote_name: ArrayStr<MAX_NAME_SIZE> = ArrayStr::from_str_truncate(remote_name);

        let mut std_stream = StdTcpStream::connect(addr).map_err(ConnectionError::from)?;
        std_stream.set_nodelay(C::TCP_NO_DELAY).ok();

        // Reconcile what we've already got stored (from a prior run) before
        // telling the peer what we claim to have sent/received.
        let ptcp_path =
            crate::connection::ptcp_path(&self.dir, local_name.as_str(), remote_name.as_str());
        let mut ptcp =
            tandem_queues::MapPod::<tandem_queues::PtcpQueue<TCP_BLKS, TO_LITTLE>>::open_or_create(
                &ptcp_path,
            )
            .map_err(ConnectionError::from)?;
        let (seq_start, seq_end) = ptcp.sanity_check().unwrap_or((0, 0));

        let login = LoginMsg {
            client_name: local_name,
            use_shm,
            last_seq_sent: seq_end,
            last_seq_received: *ptcp.my_ack(),
            user_data,
        };
        let mut payload = Vec::new();
        login.encode::<TO_LITTLE>(C::NAME_SIZE, &mut payload);
        write_frame_blocking::<_, TO_LITTLE>(&mut std_stream, MSG_TYPE_LOGIN, &payload)
            .map_err(ConnectionError::from)?;

        let (header, resp_bytes) =
            read_frame_blocking::<_, TO_LITTLE>(&mut std_stream, C::TCP_RECV_BUF_MAX_SIZE)
                .map_err(ConnectionError::from)?;
        if header.msg_type != MSG_TYPE_LOGIN_RSP {
            return Err(LoginError::MalformedResponse);
        }
        let resp = LoginRspMsg::decode::<TO_LITTLE>(&resp_bytes, C::NAME_SIZE)?;
        if let LoginOutcome::Rejected { error_msg } = &resp.outcome {
            return Err(LoginError::Rejected(error_msg.as_str().to_string()));
        }

        let my_ack = *ptcp.my_ack();
        let fresh = crate::login::reconcile(
            my_ack,
            seq_start,
            seq_end,
            resp.last_seq_sent,
            resp.last_seq_received,
        )
        .map_err(LoginError::SeqMismatch)?;
        if !fresh {
            ptcp.login_ack(resp.last_seq_received);
        }
        drop(ptcp);

        std_stream.set_nonblocking(true).map_err(ConnectionError::from)?;
        let mio_stream = MioTcpStream::from_std(std_stream);

        let use_shm_established = use_shm && matches!(resp.outcome, LoginOutcome::Accepted { .. });
        let mut conn = Connection::new(
            mio_stream,
            addr,
            &self.dir,
            local_name,
            remote_name,
            use_shm_established,
            now_ns,
        )
        .map_err(ConnectionError::from)?;
        self.poll
            .registry()
            .register(conn.mio_stream_mut(), CONN_TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(ConnectionError::from)?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Polls mio for up to `timeout`, then drives the TCP side of the
    /// connection (reads, heartbeats, timeout check) regardless of what mio
    /// reported, since a heartbeat can be due even with no socket activity.
    pub fn poll_tcp(&mut self, handler: &mut impl ClientHandler, timeout: Duration, now_ns: u64) {
        let Some(conn) = self.conn.as_mut() else { return };
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != ErrorKind::Interrupted {
                tracing::warn!(error = %e, "client poll failed");
            }
        }

        let reason = conn
            .poll_tcp(now_ns, |header, payload| handler.on_message(header, payload))
            .or_else(|| conn.is_closed().then_some(DisconnectReason::Application));

        if let Some(reason) = reason {
            self.conn = None;
            handler.on_disconnected(reason);
        }
    }

    /// Drains the inbound SHM queue, if the session negotiated one.
    pub fn poll_shm(&mut self, handler: &mut impl ClientHandler) {
        let Some(conn) = self.conn.as_mut() else { return };
        conn.poll_shm(|header, payload| handler.on_message(header, payload));
    }

    pub fn connection_mut(
        &mut self,
    ) -> Option<&mut Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>> {
        self.conn.as_mut()
    }

    pub fn stop(&mut self) {
        if let Some(conn) = &self.conn {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl ClientHandler for NullHandler {
        fn on_message(&mut self, _header: &MsgHeader, _payload: &[u8]) {}
        fn on_disconnected(&mut self, _reason: DisconnectReason) {}
    }

    #[test]
    fn poll_tcp_is_a_no_op_before_connect() {
        struct Cfg;
        impl Config for Cfg {
            const NAME_SIZE: usize = 16;
            const TCP_RECV_BUF_INIT_SIZE: usize = 256;
            const TCP_RECV_BUF_MAX_SIZE: usize = 4096;
            const TCP_NO_DELAY: bool = true;
            const CONNECTION_TIMEOUT_NS: u64 = 1_000_000_000;
            const HEART_BEAT_INTERVAL_NS: u64 = 500_000_000;
        }

        let dir = tempfile::tempdir().unwrap();
        let mut client = Client::<Cfg, 64, 64, true>::new(dir.path()).unwrap();
        let mut handler = NullHandler;
        client.poll_tcp(&mut handler, Duration::from_millis(1), 0);
        assert!(client.connection_mut().is_none());
    }
}
