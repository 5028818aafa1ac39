/// Compile-time configuration for a client or server built on this crate.
///
/// Implemented once per application and threaded through as a generic
/// parameter on [`crate::connection::Connection`]/[`crate::client::Client`]/
/// [`crate::server::Server`] alongside a handful of const generics
/// (`TCP_BLKS`, `SHM_BLKS`, `TO_LITTLE`) that size the PTCP/SHM queues —
/// those live as const generics rather than associated consts here because
/// stable Rust cannot yet turn an associated const into an array length.
pub trait Config: 'static {
    /// Width in bytes of a null-padded endpoint name put on the wire.
    const NAME_SIZE: usize;
    /// Initial size in bytes of a connection's TCP receive buffer.
    const TCP_RECV_BUF_INIT_SIZE: usize;
    /// Largest a TCP receive buffer may grow to accommodate one frame.
    const TCP_RECV_BUF_MAX_SIZE: usize;
    /// Whether to set `TCP_NODELAY` on accepted/connected sockets.
    const TCP_NO_DELAY: bool;
    /// Remote silence longer than this, in nanoseconds, closes the connection.
    const CONNECTION_TIMEOUT_NS: u64;
    /// Idle time, in nanoseconds, after which a heartbeat frame is emitted.
    const HEART_BEAT_INTERVAL_NS: u64;

    /// Server-only: pending-login slots.
    const MAX_NEW_CONNECTIONS: usize = 0;
    /// Server-only: SHM connections per SHM group.
    const MAX_SHM_CONNS_PER_GRP: usize = 0;
    /// Server-only: number of SHM groups.
    const MAX_SHM_GRPS: usize = 0;
    /// Server-only: TCP connections per TCP group.
    const MAX_TCP_CONNS_PER_GRP: usize = 0;
    /// Server-only: number of TCP groups.
    const MAX_TCP_GRPS: usize = 0;
    /// Server-only: time allowed to complete login before a pending slot is recycled.
    const NEW_CONNECTION_TIMEOUT_NS: u64 = 0;
}
