use std::io;

use tandem_queues::PersistError;
use thiserror::Error;

/// The four sequence numbers compared at reconnect when they don't add up;
/// handed to `OnSeqNumberMismatch` verbatim so the application can log or
/// page on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqMismatchInfo {
    /// Our own `MyAck`: the number of frames we've received from the peer.
    pub local_ack_seq: u32,
    /// The end of the sequence range our stored frames claim to cover.
    pub local_seq_end: u32,
    /// Peer's claimed `last_seq_sent` from its login (response) payload.
    pub remote_last_sent: u32,
    /// Peer's claimed `last_seq_received` from its login (response) payload.
    pub remote_last_received: u32,
}

/// Why a [`crate::connection::Connection`] transitioned to its closed state.
/// Handed to `OnDisconnected`/`OnClientDisconnected`.
#[derive(Debug)]
pub enum DisconnectReason {
    /// No data arrived from the peer within `ConnectionTimeout`.
    Heartbeat,
    /// The peer closed its end of the socket (read returned 0).
    PeerClosed,
    /// A socket or mmap syscall failed.
    Io(io::Error),
    /// An inbound frame's `size` exceeded `TcpRecvBufMaxSize`.
    OversizedFrame(usize),
    /// Reconnect sanity check found an impossible sequence range.
    SeqMismatch(SeqMismatchInfo),
    /// The server rejected our login.
    LoginRejected,
    /// The application called `Close`.
    Application,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat => write!(f, "heartbeat timeout"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::OversizedFrame(n) => write!(f, "oversized frame ({n} bytes)"),
            Self::SeqMismatch(_) => write!(f, "sequence number mismatch"),
            Self::LoginRejected => write!(f, "login rejected"),
            Self::Application => write!(f, "closed by application"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("socket or mmap operation failed")]
    System(#[from] io::Error),
    #[error("PTCP/SHM file couldn't be opened or mapped")]
    File(#[from] PersistError),
    #[error("frame of {0} bytes exceeds TcpRecvBufMaxSize")]
    OversizedFrame(usize),
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("server rejected login: {0}")]
    Rejected(String),
    #[error("reconnect sequence mismatch: {0:?}")]
    SeqMismatch(SeqMismatchInfo),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("login response payload malformed")]
    MalformedResponse,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("couldn't bind listener")]
    Bind(#[source] io::Error),
    #[error("mio poll registration failed")]
    Poll(#[source] io::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
