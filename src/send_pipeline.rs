use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::frame::FrameHeader;

/// This is an abstraction for sending a datagram on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending datagram to {:?}", to);
        self.send_to(datagram, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Assembles outgoing datagrams (header followed by payload) and puts them on the wire.
///
/// All transmissions of a session funnel through here, both fresh sends and verbatim
///  resends of previously encoded datagrams.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Encode and send a frame, returning the encoded datagram so the caller can keep it
    ///  for retransmission.
    pub async fn send_frame(
        &self,
        to: SocketAddr,
        header: FrameHeader,
        payload: &[u8],
    ) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(crate::frame::HEADER_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        let datagram = buf.freeze();

        trace!("sending {:?} with {} payload bytes to {:?}", header.flags, payload.len(), to);
        self.socket.do_send_datagram(to, &datagram).await?;
        Ok(datagram)
    }

    /// Re-send a previously encoded datagram verbatim.
    pub async fn send_encoded(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        self.socket.do_send_datagram(to, datagram).await
    }
}
