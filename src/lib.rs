//! RCP is a reliable, connection-oriented, message-based protocol layered over UDP. It
//!  provides a point-to-point session between two peers that can exchange discrete
//!  messages either reliably (acknowledged and retransmitted until delivered or the
//!  session fails) or unreliably (fire-and-forget), hiding loss, reordering and
//!  duplication of the underlying datagrams.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * One session per endpoint at a time, established by an explicit handshake
//!   ([`RcpSocket::connect`] / [`RcpSocket::accept`]) and torn down by a FIN exchange
//! * Reliable messages are delivered to the application exactly once, in the order they
//!   were sent; unreliable messages are delivered in arrival order and may be lost
//! * A silent peer is detected: keepalives flow when the link is idle, and a session
//!   with nothing received for the total timeout is declared dead
//! * Blocked calls are interruptible from another task ([`RcpSocket::cancel`])
//!
//! Explicitly *not* goals: multiplexing several sessions over one socket pair,
//!  stream semantics, congestion control, encryption / authentication, NAT traversal.
//!
//! ## Header
//!
//! Every datagram starts with a fixed 12-byte header, all fields big-endian:
//!
//! ```ascii
//! 0:  sequence number (u32) - strictly increasing across every fresh transmission,
//!      including ACKs, keepalives and handshake frames
//! 4:  batch number (u32) - identifies a reliable message through its retransmission /
//!      acknowledgement cycle and its position in the receiver's ordering queue.
//!      0 for everything that is not a reliable user payload
//! 8:  flags (u32):
//!     * 1  SYN - connection requested
//!     * 2  ACK - acknowledgement, correlated by batch number
//!     * 4  FIN - no more messages
//!     * 8  KEP - keepalive
//!     * 16 REL - reliable payload, acknowledged by the receiver
//!     (bit 31 is an internal wake-up marker that never appears on the wire)
//! ```
//!
//! A receiver discards datagrams shorter than the header, datagrams from any address
//!  other than the established peer, and flag combinations other than SYN, SYN|ACK,
//!  ACK, FIN, FIN|ACK, KEP, REL and plain data (no flags).
//!
//! ## Handshakes
//!
//! ```ascii
//! connect:  -> SYN        accept:  <- SYN          close:  -> FIN
//!           <- SYN|ACK             -> SYN|ACK              <- ACK
//!           -> ACK                 <- ACK                  <- FIN (peer's own)
//!                                                          -> ACK
//! ```
//!
//! Handshake frames are resent on the short cadence until answered or the total timeout
//!  elapses. They use batch number 0 for acknowledgement, which reliable user payloads
//!  never occupy (user batches start at 1).
//!
//! ## Reliable data
//!
//! `-> REL(seq, batch=b, payload)` is answered by `<- ACK(batch=b)` and resent until the
//!  ACK arrives or the total timeout gives the session up. The receiver keeps a delivery
//!  queue that admits packets in arrival order but hands them out in batch order: when a
//!  batch arrives before its predecessors, slots for the pending batches are reserved in
//!  front of it, and each reservation is filled in place when its payload shows up.
//!  A reservation that stays empty for the total timeout is abandoned - its packet is
//!  presumed lost forever and later batches become deliverable again.
//!
//! ## Concurrency
//!
//! Two actors share the session state: the user's task calling the facade methods, and
//!  one background engine task per session that reads the socket, fires timers, sends
//!  acknowledgements and keepalives, and drives the close drain. Every access to shared
//!  structures goes through one coarse mutex, so observable transitions are totally
//!  serialized. The engine waits on the socket with the next timer deadline as its
//!  timeout; a loopback datagram carrying the internal wake-up flag makes that wait
//!  interruptible, which is what keeps cancellation responsive.

mod config;
mod delivery_queue;
mod engine;
mod error;
mod frame;
mod message;
mod retransmit;
mod scheduler;
mod send_pipeline;
mod session;
#[cfg(feature = "wire-probe")]
pub mod wire_probe;

pub use config::RcpConfig;
pub use error::{RcpError, RcpResult};
pub use frame::{FrameFlags, FrameHeader, HEADER_LEN};
pub use message::Message;
pub use session::{RcpSocket, SessionState, ANY_PORT};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init()
            .ok();
    }
}
