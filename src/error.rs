use std::io;

/// Error kinds surfaced by the session facade.
///
/// The engine recovers from transient per-datagram problems on its own (drop and
///  continue); only conditions the caller can act on are represented here. Session-fatal
///  conditions additionally drop the session to disconnected, observable through
///  [`crate::RcpSocket::is_connected`].
#[derive(Debug, thiserror::Error)]
pub enum RcpError {
    /// The facade was called in a state that does not support the operation, e.g.
    ///  `send` without an established session, or `connect` on an unbound socket.
    #[error("socket is not in a state that allows this operation")]
    NotConnected,

    /// The session died of inactivity: either an outstanding reliable packet was never
    ///  acknowledged, or the peer fell silent for the total timeout.
    #[error("session timed out")]
    Timeout,

    /// A blocked call was interrupted by [`crate::RcpSocket::cancel`].
    #[error("operation was canceled")]
    Canceled,

    /// Non-blocking receive found no committed message at the front of the delivery queue.
    #[error("no message is ready for delivery")]
    WouldBlock,

    /// The underlying UDP socket failed to send or receive.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

pub type RcpResult<T> = Result<T, RcpError>;
