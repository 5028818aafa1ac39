//! Accept loop, concurrent login dispatch, and the established-connection
//! poll loop for the server side.
//!
//! The spec this crate grew from describes per-group polling threads (one
//! per TCP group, one per SHM group) so a single slow connection can't stall
//! unrelated ones. This implementation keeps the fixed-capacity, single
//! control-thread login dispatch faithfully, but folds the group polling
//! down to one poll loop over a single pre-sized connection table; splitting
//! that table across worker threads is mechanical (partition by connection
//! id range, one `Poll` per partition) and left as a deployment-time choice
//! rather than baked into this crate.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream},
};
use tandem_utils::ArrayStr;
use tandem_wire::{MSG_TYPE_LOGIN, MSG_TYPE_LOGIN_RSP, MsgHeader};

use crate::{
    config::Config,
    connection::Connection,
    error::{DisconnectReason, SeqMismatchInfo, ServerError},
    handshake::FrameAssembler,
    login::{LoginMsg, LoginOutcome, LoginRspMsg, MAX_NAME_SIZE},
};

const LISTENER_TOKEN: Token = Token(0);

/// What the application wants done with an inbound login.
pub enum NewConnectionDecision {
    Accept { use_shm: bool, user_data: Vec<u8> },
    Reject { error_msg: ArrayStr<64> },
}

/// Application callbacks driven by [`Server::poll`].
pub trait ServerHandler {
    /// Called once a login frame has been fully read. `conn_id` is not
    /// valid yet; it's assigned only once the response has been
    /// written and accepted.
    fn on_login(&mut self, login: &LoginMsg, peer_addr: SocketAddr) -> NewConnectionDecision;
    /// Reconnect sanity check found an impossible sequence range; the login
    /// is rejected regardless of what `on_login` returned.
    fn on_seq_mismatch(&mut self, info: SeqMismatchInfo, peer_addr: SocketAddr);
    fn on_established(&mut self, conn_id: usize);
    fn on_message(&mut self, conn_id: usize, header: &MsgHeader, payload: &[u8]);
    fn on_disconnected(&mut self, conn_id: usize, reason: DisconnectReason);
}

struct PendingLogin {
    stream: MioTcpStream,
    addr: SocketAddr,
    assembler: FrameAssembler,
    start_ns: u64,
    response: Option<PendingResponse>,
}

struct PendingResponse {
    bytes: Vec<u8>,
    offset: usize,
    accepted: bool,
    use_shm: bool,
    remote_name: ArrayStr<MAX_NAME_SIZE>,
}

/// Accepts connections, dispatches logins concurrently against a bounded
/// pool of pending slots, and polls every established connection.
pub struct Server<
    C: Config,
    const TCP_BLKS: usize,
    const SHM_BLKS: usize,
    const TO_LITTLE: bool,
    S = (),
> {
    listener: MioTcpListener,
    poll: Poll,
    events: Events,
    local_name: ArrayStr<MAX_NAME_SIZE>,
    dir: PathBuf,
    pending: Vec<Option<PendingLogin>>,
    conns: Vec<Option<Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>>>,
    pending_token_base: usize,
    conn_token_base: usize,
}

impl<C: Config, const TCP_BLKS: usize, const SHM_BLKS: usize, const TO_LITTLE: bool, S: Default>
    Server<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>
{
    pub fn bind(
        addr: SocketAddr,
        dir: impl Into<PathBuf>,
        local_name: &str,
    ) -> Result<Self, ServerError> {
        let mut listener = MioTcpListener::bind(addr).map_err(ServerError::Bind)?;
        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        let pending_capacity = C::MAX_NEW_CONNECTIONS.max(1);
        let conn_capacity = (C::MAX_TCP_GRPS * C::MAX_TCP_CONNS_PER_GRP).max(1);

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(64 + pending_capacity + conn_capacity),
            local_name: ArrayStr::from_str_truncate(local_name),
            dir: dir.into(),
            pending: (0..pending_capacity).map(|_| None).collect(),
            conns: (0..conn_capacity).map(|_| None).collect(),
            pending_token_base: 1,
            conn_token_base: 1 + pending_capacity,
        })
    }

    pub fn connection_mut(
        &mut self,
        conn_id: usize,
    ) -> Option<&mut Connection<C, TCP_BLKS, SHM_BLKS, TO_LITTLE, S>> {
        self.conns.get_mut(conn_id)?.as_mut()
    }

    /// The listener's bound address; lets a caller that bound to port 0 find
    /// out which ephemeral port the OS actually assigned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// One control-thread tick: accepts new sockets, advances every pending
    /// login, sweeps expired pending slots, and drives every established
    /// connection's TCP side (reads, heartbeats, idle timeout).
    pub fn poll(&mut self, handler: &mut impl ServerHandler, timeout: Duration, now_ns: u64) {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != ErrorKind::Interrupted {
                tracing::warn!(error = %e, "server poll failed");
            }
            return;
        }

        let readable_listener = self.events.iter().any(|e| e.token() == LISTENER_TOKEN);
        if readable_listener {
            self.accept_new(now_ns);
        }

        self.advance_pending(handler, now_ns);
        self.sweep_pending(now_ns);
        self.poll_established(handler, now_ns);
    }

    fn accept_new(&mut self, now_ns: u64) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            };
            stream.set_nodelay(C::TCP_NO_DELAY).ok();

            let Some(slot) = self.pending.iter().position(Option::is_none) else {
                tracing::warn!(%addr, "no pending-login slot available, dropping connection");
                drop(stream);
                continue;
            };

            let mut stream = stream;
            let token = Token(self.pending_token_base + slot);
            if let Err(e) =
                self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                tracing::warn!(error = %e, "failed to register pending socket");
                continue;
            }

            self.pending[slot] = Some(PendingLogin {
                stream,
                addr,
                assembler: FrameAssembler::new(C::TCP_RECV_BUF_MAX_SIZE),
                start_ns: now_ns,
                response: None,
            });
        }
    }

    fn advance_pending(&mut self, handler: &mut impl ServerHandler, now_ns: u64) {
        for slot in 0..self.pending.len() {
            let Some(pending) = self.pending[slot].as_mut() else { continue };

            if pending.response.is_none() {
                match pending.assembler.try_read::<_, TO_LITTLE>(&mut pending.stream) {
                    Ok(None) => {}
                    Ok(Some((header, payload))) => {
                        if header.msg_type != MSG_TYPE_LOGIN {
                            tracing::warn!(
                                msg_type = header.msg_type,
                                "expected login frame, dropping connection"
                            );
                            self.pending[slot] = None;
                            continue;
                        }
                        let Some(login) = LoginMsg::decode::<TO_LITTLE>(&payload, C::NAME_SIZE)
                        else {
                            self.pending[slot] = None;
                            continue;
                        };
                        let decision = handler.on_login(&login, pending.addr);

                        let ptcp_path = crate::connection::ptcp_path(
                            &self.dir,
                            self.local_name.as_str(),
                            login.client_name.as_str(),
                        );
                        let mut ptcp = tandem_queues::MapPod::<
                            tandem_queues::PtcpQueue<TCP_BLKS, TO_LITTLE>,
                        >::open_or_create(&ptcp_path)
                        .ok();
                        let (start, end, my_ack) = ptcp
                            .as_mut()
                            .and_then(|q| {
                                let (start, end) = q.sanity_check().ok()?;
                                Some((start, end, *q.my_ack()))
                            })
                            .unwrap_or((0, 0, 0));

                        let mismatch = crate::login::reconcile(
                            my_ack,
                            start,
                            end,
                            login.last_seq_sent,
                            login.last_seq_received,
                        );

                        let (use_shm, outcome) = match (decision, mismatch) {
                            (_, Err(info)) => {
                                handler.on_seq_mismatch(info, pending.addr);
                                (
                                    false,
                                    LoginOutcome::Rejected {
                                        error_msg: ArrayStr::from_str_truncate(
                                            "sequence number mismatch",
                                        ),
                                    },
                                )
                            }
                            (NewConnectionDecision::Accept { use_shm, user_data }, Ok(fresh)) => {
                                if !fresh {
                                    if let Some(q) = ptcp.as_mut() {
                                        q.login_ack(login.last_seq_received);
                                    }
                                }
                                (use_shm, LoginOutcome::Accepted { user_data })
                            }
                            (NewConnectionDecision::Reject { error_msg }, Ok(_)) => {
                                (false, LoginOutcome::Rejected { error_msg })
                            }
                        };
                        drop(ptcp);

                        let accepted = matches!(outcome, LoginOutcome::Accepted { .. });
                        let resp = LoginRspMsg {
                            server_name: self.local_name,
                            last_seq_sent: end,
                            last_seq_received: my_ack,
                            outcome,
                        };
                        let mut bytes = Vec::new();
                        let size = (tandem_wire::HEADER_BYTES + {
                            let mut tmp = Vec::new();
                            resp.encode::<TO_LITTLE>(C::NAME_SIZE, &mut tmp);
                            tmp.len()
                        }) as u16;
                        let header = MsgHeader { size, msg_type: MSG_TYPE_LOGIN_RSP, ack_seq: 0 }
                            .from_wire::<TO_LITTLE>();
                        let mut header_bytes = [0u8; tandem_wire::HEADER_BYTES];
                        // SAFETY: header_bytes is exactly HEADER_BYTES long.
                        unsafe {
                            tandem_wire::MsgHeader::write_to(header, header_bytes.as_mut_ptr())
                        };
                        bytes.extend_from_slice(&header_bytes);
                        resp.encode::<TO_LITTLE>(C::NAME_SIZE, &mut bytes);

                        pending.response = Some(PendingResponse {
                            bytes,
                            offset: 0,
                            accepted,
                            use_shm,
                            remote_name: login.client_name,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, addr = %pending.addr, "pending login read failed");
                        self.pending[slot] = None;
                        continue;
                    }
                }
            }

            let Some(resp) = pending.response.as_mut() else { continue };
            loop {
                let remaining = &resp.bytes[resp.offset..];
                if remaining.is_empty() {
                    break;
                }
                match io::Write::write(&mut pending.stream, remaining) {
                    Ok(0) => {
                        self.pending[slot] = None;
                        break;
                    }
                    Ok(n) => resp.offset += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.pending[slot] = None;
                        break;
                    }
                }
            }

            let Some(pending_ref) = self.pending[slot].as_ref() else { continue };
            let Some(resp) = pending_ref.response.as_ref() else { continue };
            if resp.offset < resp.bytes.len() {
                continue;
            }

            let pending = self.pending[slot].take().expect("checked above");
            let resp = pending.response.expect("checked above");
            if !resp.accepted {
                continue;
            }
            self.promote(pending.stream, pending.addr, resp, handler, now_ns);
        }
    }

    fn promote(
        &mut self,
        stream: MioTcpStream,
        addr: SocketAddr,
        resp: PendingResponse,
        handler: &mut impl ServerHandler,
        now_ns: u64,
    ) {
        let Some(conn_slot) = self.conns.iter().position(Option::is_none) else {
            tracing::warn!(%addr, "no connection slot available, dropping newly logged-in peer");
            return;
        };

        let token = Token(self.conn_token_base + conn_slot);
        let mut stream = stream;
        if let Err(e) = self.poll.registry().reregister(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(error = %e, "failed to reregister promoted socket");
            return;
        }

        match Connection::new(
            stream,
            addr,
            &self.dir,
            self.local_name,
            resp.remote_name,
            resp.use_shm,
            now_ns,
        ) {
            Ok(conn) => {
                self.conns[conn_slot] = Some(conn);
                handler.on_established(conn_slot);
            }
            Err(e) => tracing::warn!(error = %e, %addr, "failed to establish connection"),
        }
    }

    fn sweep_pending(&mut self, now_ns: u64) {
        for slot in self.pending.iter_mut() {
            let expired = slot
                .as_ref()
                .is_some_and(|p| now_ns.saturating_sub(p.start_ns) > C::NEW_CONNECTION_TIMEOUT_NS);
            if expired {
                *slot = None;
            }
        }
    }

    fn poll_established(&mut self, handler: &mut impl ServerHandler, now_ns: u64) {
        for conn_id in 0..self.conns.len() {
            let Some(conn) = self.conns[conn_id].as_mut() else { continue };
            let reason = conn
                .poll_tcp(now_ns, |header, payload| handler.on_message(conn_id, header, payload))
                .or_else(|| conn.is_closed().then_some(DisconnectReason::Application));
            if let Some(reason) = reason {
                self.conns[conn_id] = None;
                handler.on_disconnected(conn_id, reason);
            }
        }
    }

    /// Drains every established connection's inbound SHM queue, if any.
    pub fn poll_shm(&mut self, handler: &mut impl ServerHandler) {
        for conn_id in 0..self.conns.len() {
            let Some(conn) = self.conns[conn_id].as_mut() else { continue };
            conn.poll_shm(|header, payload| handler.on_message(conn_id, header, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cfg;
    impl Config for Cfg {
        const NAME_SIZE: usize = 16;
        const TCP_RECV_BUF_INIT_SIZE: usize = 256;
        const TCP_RECV_BUF_MAX_SIZE: usize = 4096;
        const TCP_NO_DELAY: bool = true;
        const CONNECTION_TIMEOUT_NS: u64 = 1_000_000_000;
        const HEART_BEAT_INTERVAL_NS: u64 = 500_000_000;
        const MAX_NEW_CONNECTIONS: usize = 4;
        const MAX_SHM_CONNS_PER_GRP: usize = 4;
        const MAX_SHM_GRPS: usize = 1;
        const MAX_TCP_CONNS_PER_GRP: usize = 4;
        const MAX_TCP_GRPS: usize = 1;
        const NEW_CONNECTION_TIMEOUT_NS: u64 = 1_000_000_000;
    }

    struct NullHandler;
    impl ServerHandler for NullHandler {
        fn on_login(&mut self, _login: &LoginMsg, _peer_addr: SocketAddr) -> NewConnectionDecision {
            NewConnectionDecision::Reject { error_msg: ArrayStr::from_str_truncate("no") }
        }
        fn on_seq_mismatch(&mut self, _info: SeqMismatchInfo, _peer_addr: SocketAddr) {}
        fn on_established(&mut self, _conn_id: usize) {}
        fn on_message(&mut self, _conn_id: usize, _header: &MsgHeader, _payload: &[u8]) {}
        fn on_disconnected(&mut self, _conn_id: usize, _reason: DisconnectReason) {}
    }

    #[test]
    fn bind_reserves_capacity_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::<Cfg, 64, 64, true>::bind(
            "127.0.0.1:0".parse().unwrap(),
            dir.path(),
            "srv",
        )
        .unwrap();
        assert_eq!(server.pending.len(), 4);
        assert_eq!(server.conns.len(), 4);
    }

    #[test]
    fn poll_accepts_nothing_within_a_short_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut server =
            Server::<Cfg, 64, 64, true>::bind("127.0.0.1:0".parse().unwrap(), dir.path(), "srv")
                .unwrap();
        let mut handler = NullHandler;
        server.poll(&mut handler, Duration::from_millis(1), 0);
        assert!(server.conns.iter().all(Option::is_none));
    }
}
