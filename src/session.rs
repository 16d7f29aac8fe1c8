use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::RcpConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::engine;
use crate::error::{RcpError, RcpResult};
use crate::frame::{FrameFlags, FrameHeader, HEADER_LEN};
use crate::message::Message;
use crate::retransmit::RetransmitBuffer;
use crate::send_pipeline::SendPipeline;

/// Passing this to [`RcpSocket::bind`] requests an OS-assigned port.
pub const ANY_PORT: u16 = 0;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Closing,
}

/// Everything the user task and the I/O engine share, guarded by one coarse mutex so
///  every read-modify-write of session structures is serialized.
pub(crate) struct SessionInner {
    pub socket: Option<Arc<UdpSocket>>,
    pub pipeline: Option<SendPipeline>,
    pub engine: Option<JoinHandle<()>>,
    pub handshake_in_progress: bool,

    pub state: SessionState,
    pub peer: Option<SocketAddr>,

    pub local_seq_num: u32,
    pub local_batch_num: u32,
    pub remote_seq_num: u32,
    /// Reliable batches up to and including this number have a slot that is reserved,
    ///  committed, or was abandoned; anything at or below it arriving again is a
    ///  duplicate unless its reservation is still open.
    pub remote_batch_reserved: u32,

    pub delivery: DeliveryQueue,
    pub retransmit: RetransmitBuffer,

    pub time_last_send: Instant,
    pub time_last_received: Instant,

    pub closing_since: Option<Instant>,
    pub fin_sent: bool,
    pub fin_received: bool,
}

impl SessionInner {
    pub(crate) fn new() -> SessionInner {
        let now = Instant::now();
        SessionInner {
            socket: None,
            pipeline: None,
            engine: None,
            handshake_in_progress: false,
            state: SessionState::Disconnected,
            peer: None,
            local_seq_num: 0,
            local_batch_num: 0,
            remote_seq_num: 0,
            remote_batch_reserved: 0,
            delivery: DeliveryQueue::new(),
            retransmit: RetransmitBuffer::new(),
            time_last_send: now,
            time_last_received: now,
            closing_since: None,
            fin_sent: false,
            fin_received: false,
        }
    }

    pub fn next_seq(&mut self) -> u32 {
        let seq = self.local_seq_num;
        self.local_seq_num = self.local_seq_num.wrapping_add(1);
        seq
    }

    pub fn next_batch(&mut self) -> u32 {
        // post-incremented from 0, so user batches start at 1 and batch 0 stays free
        //  for control frames that go through the ack cycle (SYN, SYN|ACK, FIN)
        self.local_batch_num = self.local_batch_num.wrapping_add(1);
        self.local_batch_num
    }

    /// Send a fresh frame to the peer, assigning the next sequence number and refreshing
    ///  the send-side liveness timestamp.
    pub async fn emit(
        &mut self,
        flags: FrameFlags,
        batch: u32,
        payload: &[u8],
    ) -> io::Result<(FrameHeader, Bytes)> {
        let peer = self
            .peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer"))?;
        let pipeline = self
            .pipeline
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not bound"))?;

        let header = FrameHeader::new(self.next_seq(), batch, flags);
        let datagram = pipeline.send_frame(peer, header, payload).await?;
        self.time_last_send = Instant::now();
        Ok((header, datagram))
    }

    /// Clear all session-scoped structures and return to the bound-but-idle state.
    ///  The engine observes the state change and winds itself down.
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.peer = None;
        self.local_seq_num = 0;
        self.local_batch_num = 0;
        self.remote_seq_num = 0;
        self.remote_batch_reserved = 0;
        self.delivery.clear();
        self.retransmit.clear();
        self.closing_since = None;
        self.fin_sent = false;
        self.fin_received = false;
    }
}

pub(crate) struct Shared {
    pub inner: Mutex<SessionInner>,
    /// Notified whenever the front of the delivery queue may have become committed, and
    ///  on every state change a blocked caller could care about.
    pub recv_notify: Notify,
    /// Monotonic cancel counter: a blocked call holding a ticket strictly below this
    ///  value has been canceled.
    pub cancel_counter: AtomicU64,
    pub blocking: AtomicBool,
    pub config: RcpConfig,
}

/// A point-to-point session endpoint: bind it to a UDP port, establish a session with
///  `connect`/`accept`, then exchange discrete messages reliably or unreliably.
///
/// All methods take `&self`; the socket is intended to be shared (e.g. behind an `Arc`)
///  so one task can block in [`receive`](RcpSocket::receive) while another calls
///  [`cancel`](RcpSocket::cancel).
pub struct RcpSocket {
    shared: Arc<Shared>,
}

impl RcpSocket {
    pub fn new() -> RcpSocket {
        Self::with_config(RcpConfig::default()).expect("default config is valid")
    }

    pub fn with_config(config: RcpConfig) -> anyhow::Result<RcpSocket> {
        config.validate()?;
        Ok(RcpSocket {
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner::new()),
                recv_notify: Notify::new(),
                cancel_counter: AtomicU64::new(0),
                blocking: AtomicBool::new(true),
                config,
            }),
        })
    }

    // --- binding ---

    pub async fn bind(&self, port: u16) -> RcpResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.socket.is_some() {
            return Err(RcpError::NotConnected);
        }

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?);
        info!("bound to {:?}", socket.local_addr()?);

        inner.pipeline = Some(SendPipeline::new(Arc::new(socket.clone())));
        inner.socket = Some(socket);
        Ok(())
    }

    pub async fn unbind(&self) -> RcpResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Disconnected {
            return Err(RcpError::NotConnected);
        }
        inner.socket = None;
        inner.pipeline = None;
        inner.engine = None;
        Ok(())
    }

    pub async fn is_bound(&self) -> bool {
        self.shared.inner.lock().await.socket.is_some()
    }

    pub async fn local_port(&self) -> Option<u16> {
        let inner = self.shared.inner.lock().await;
        let socket = inner.socket.as_ref()?;
        socket.local_addr().ok().map(|a| a.port())
    }

    // --- session inspection ---

    pub async fn is_connected(&self) -> bool {
        self.shared.inner.lock().await.state == SessionState::Connected
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().await.peer
    }

    // --- blocking mode & cancellation ---

    pub fn set_blocking(&self, blocking: bool) {
        self.shared.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn blocking(&self) -> bool {
        self.shared.blocking.load(Ordering::SeqCst)
    }

    /// Abort every facade call that is blocked right now. Calls issued after this
    ///  returns are unaffected.
    ///
    /// Works by advancing the cancel counter that blocked calls compare their ticket
    ///  against, then waking them: parked receivers through the notifier, and anything
    ///  suspended in a socket wait through a loopback datagram carrying the CANCEL flag.
    pub async fn cancel(&self) {
        self.shared.cancel_counter.fetch_add(1, Ordering::SeqCst);
        self.shared.recv_notify.notify_waiters();

        let pulse_target = {
            let inner = self.shared.inner.lock().await;
            inner.socket.as_ref().and_then(|s| s.local_addr().ok()).map(|local| {
                let ip = if local.ip().is_unspecified() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    local.ip()
                };
                (
                    inner.pipeline.clone().expect("pipeline exists while bound"),
                    SocketAddr::new(ip, local.port()),
                )
            })
        };

        if let Some((pipeline, target)) = pulse_target {
            trace!("sending cancel pulse to {:?}", target);
            let header = FrameHeader::new(0, 0, FrameFlags::CANCEL);
            if let Err(e) = pipeline.send_frame(target, header, &[]).await {
                warn!("failed to send cancel pulse: {}", e);
            }
        }
    }

    // --- connection setup & teardown ---

    /// Establish a session with a listening peer: SYN, await SYN|ACK, reply ACK.
    ///  The SYN is resent on the short cadence until the total timeout elapses.
    pub async fn connect(&self, peer: SocketAddr) -> RcpResult<()> {
        let ticket = self.shared.cancel_counter.load(Ordering::SeqCst);
        let (socket, pipeline) = self.begin_handshake().await?;

        debug!("connecting to {:?}", peer);
        let result = self.run_connect(&socket, &pipeline, peer, ticket).await;
        self.finish_handshake().await;
        result
    }

    async fn run_connect(
        &self,
        socket: &Arc<UdpSocket>,
        pipeline: &SendPipeline,
        peer: SocketAddr,
        ticket: u64,
    ) -> RcpResult<()> {
        let config = &self.shared.config;
        let deadline = Instant::now() + config.timeout_total;
        let mut buf = vec![0u8; config.max_datagram_size];

        let syn = FrameHeader::new(0, 0, FrameFlags::SYN);
        let syn_bytes = pipeline.send_frame(peer, syn, &[]).await?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("connect to {:?} timed out", peer);
                return Err(RcpError::Timeout);
            }
            let wait = config.timeout_short.min(deadline - now);

            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    if self.canceled(ticket) {
                        return Err(RcpError::Canceled);
                    }
                    let Some(header) = decode_header(&buf[..len]) else { continue };
                    if header.flags.contains(FrameFlags::CANCEL) {
                        continue;
                    }
                    if from != peer || !header.is_wire_legal() {
                        continue;
                    }
                    if header.flags == FrameFlags::SYN | FrameFlags::ACK {
                        pipeline
                            .send_frame(peer, FrameHeader::new(1, 0, FrameFlags::ACK), &[])
                            .await?;
                        self.commit_session(peer, 2, header.seq).await;
                        return Ok(());
                    }
                    trace!("ignoring {:?} during connect handshake", header.flags);
                }
                _ = sleep(wait) => {
                    if self.canceled(ticket) {
                        return Err(RcpError::Canceled);
                    }
                    trace!("resending SYN to {:?}", peer);
                    pipeline.send_encoded(peer, &syn_bytes).await?;
                }
            }
        }
    }

    /// Wait for an incoming SYN from any peer, capture its identity and complete the
    ///  mirror-image handshake: SYN|ACK, await the final ACK.
    pub async fn accept(&self) -> RcpResult<()> {
        let ticket = self.shared.cancel_counter.load(Ordering::SeqCst);
        let (socket, pipeline) = self.begin_handshake().await?;

        debug!("waiting for an incoming connection");
        let result = self.run_accept(&socket, &pipeline, ticket).await;
        self.finish_handshake().await;
        result
    }

    async fn run_accept(
        &self,
        socket: &Arc<UdpSocket>,
        pipeline: &SendPipeline,
        ticket: u64,
    ) -> RcpResult<()> {
        let config = &self.shared.config;
        let mut buf = vec![0u8; config.max_datagram_size];

        // phase 1: wait (unbounded, but cancellable) for a SYN from anyone
        let (peer, remote_seq) = loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if self.canceled(ticket) {
                return Err(RcpError::Canceled);
            }
            let Some(header) = decode_header(&buf[..len]) else { continue };
            if header.flags.contains(FrameFlags::CANCEL) {
                continue;
            }
            if header.flags == FrameFlags::SYN {
                break (from, header.seq);
            }
            trace!("ignoring {:?} while waiting for SYN", header.flags);
        };

        debug!("SYN from {:?}, replying SYN|ACK", peer);

        // phase 2: SYN|ACK with resend cadence, await the final ACK
        let syn_ack = FrameHeader::new(0, 0, FrameFlags::SYN | FrameFlags::ACK);
        let syn_ack_bytes = pipeline.send_frame(peer, syn_ack, &[]).await?;
        let deadline = Instant::now() + config.timeout_total;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("accept handshake with {:?} timed out", peer);
                return Err(RcpError::Timeout);
            }
            let wait = config.timeout_short.min(deadline - now);

            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    if self.canceled(ticket) {
                        return Err(RcpError::Canceled);
                    }
                    let Some(header) = decode_header(&buf[..len]) else { continue };
                    if header.flags.contains(FrameFlags::CANCEL) {
                        continue;
                    }
                    if from != peer || !header.is_wire_legal() {
                        continue;
                    }
                    if header.flags == FrameFlags::ACK {
                        self.commit_session(peer, 1, remote_seq).await;
                        return Ok(());
                    }
                    if header.flags == FrameFlags::SYN {
                        // our SYN|ACK got lost
                        pipeline.send_encoded(peer, &syn_ack_bytes).await?;
                        continue;
                    }
                    trace!("ignoring {:?} during accept handshake", header.flags);
                }
                _ = sleep(wait) => {
                    if self.canceled(ticket) {
                        return Err(RcpError::Canceled);
                    }
                    trace!("resending SYN|ACK to {:?}", peer);
                    pipeline.send_encoded(peer, &syn_ack_bytes).await?;
                }
            }
        }
    }

    async fn begin_handshake(&self) -> RcpResult<(Arc<UdpSocket>, SendPipeline)> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Disconnected || inner.handshake_in_progress {
            return Err(RcpError::NotConnected);
        }
        let (Some(socket), Some(pipeline)) = (inner.socket.clone(), inner.pipeline.clone())
        else {
            return Err(RcpError::NotConnected);
        };

        // a previous session's engine has necessarily finished by now
        inner.engine = None;
        inner.handshake_in_progress = true;
        Ok((socket, pipeline))
    }

    async fn finish_handshake(&self) {
        self.shared.inner.lock().await.handshake_in_progress = false;
    }

    async fn commit_session(&self, peer: SocketAddr, used_seqs: u32, remote_seq: u32) {
        let mut inner = self.shared.inner.lock().await;
        info!("session established with {:?}", peer);
        let now = Instant::now();
        inner.state = SessionState::Connected;
        inner.peer = Some(peer);
        inner.local_seq_num = used_seqs;
        inner.local_batch_num = 0;
        inner.remote_seq_num = remote_seq;
        inner.remote_batch_reserved = 0;
        inner.time_last_send = now;
        inner.time_last_received = now;
        inner.engine = Some(engine::spawn(self.shared.clone()));
    }

    /// Tear the session down: interrupt blocked calls, exchange FINs, clear all
    ///  session-scoped structures and join the engine task. The socket stays bound.
    pub async fn disconnect(&self) {
        let handle = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SessionState::Connected {
                debug!("disconnect requested, entering close handshake");
                inner.state = SessionState::Closing;
                inner.closing_since = Some(Instant::now());
                self.shared.recv_notify.notify_waiters();
            }
            inner.engine.take()
        };

        // interrupt blocked calls and kick the engine out of its socket wait so the
        //  close drain starts promptly
        self.cancel().await;

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("engine task ended abnormally: {}", e);
            }
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Disconnected {
            inner.reset();
        }
        self.shared.recv_notify.notify_waiters();
    }

    // --- traffic ---

    /// Hand a message to the peer. Returns once the datagram reached the socket, not
    ///  once it is acknowledged; reliable messages are tracked and retransmitted by the
    ///  engine until their ACK arrives or the session fails.
    pub async fn send(&self, data: &[u8], reliable: bool) -> RcpResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(RcpError::NotConnected);
        }
        if data.len() + HEADER_LEN > self.shared.config.max_datagram_size {
            return Err(RcpError::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload does not fit into a single datagram",
            )));
        }

        if reliable {
            let batch = inner.next_batch();
            let (header, datagram) = inner.emit(FrameFlags::REL, batch, data).await?;
            let now = Instant::now();
            inner.retransmit.insert(header, datagram, now);
            trace!("sent reliable batch {}", batch);
        } else {
            inner.emit(FrameFlags::empty(), 0, data).await?;
        }
        Ok(())
    }

    pub async fn send_message(&self, message: &Message) -> RcpResult<()> {
        self.send(message.payload(), message.is_reliable()).await
    }

    /// Take the message at the front of the delivery queue.
    ///
    /// In blocking mode this waits until the front is committed, the call is canceled,
    ///  or the session fails; in non-blocking mode an uncommitted front yields
    ///  [`RcpError::WouldBlock`].
    pub async fn receive(&self) -> RcpResult<Message> {
        let ticket = self.shared.cancel_counter.load(Ordering::SeqCst);

        loop {
            // register for wakeups before checking the queue, so a commit that lands
            //  between the check and the await is not lost
            let mut notified = std::pin::pin!(self.shared.recv_notify.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.shared.inner.lock().await;
                if let Some((payload, reliable)) = inner.delivery.pop_front() {
                    return Ok(Message::new(payload, reliable));
                }
                if inner.state == SessionState::Disconnected {
                    return Err(RcpError::NotConnected);
                }
                if self.canceled(ticket) {
                    return Err(RcpError::Canceled);
                }
                if !self.blocking() {
                    return Err(RcpError::WouldBlock);
                }
            }
            notified.await;
        }
    }

    fn canceled(&self, ticket: u64) -> bool {
        self.shared.cancel_counter.load(Ordering::SeqCst) > ticket
    }
}

impl Default for RcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a datagram's header, yielding `None` for anything shorter than a header or
///  carrying unknown flag bits. Malformed datagrams are never surfaced to the user.
pub(crate) fn decode_header(datagram: &[u8]) -> Option<FrameHeader> {
    match FrameHeader::deser(&mut &datagram[..datagram.len().min(HEADER_LEN)]) {
        Ok(header) => Some(header),
        Err(e) => {
            debug!("dropping malformed datagram: {}", e);
            None
        }
    }
}
