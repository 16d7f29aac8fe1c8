//! A raw-frame peer for protocol-level tests, only built with the `wire-probe` feature.
//!
//! The probe speaks the wire format without any of the session machinery: it can send an
//!  arbitrary header (legal or not) and observe exactly what a real endpoint puts on the
//!  wire. Protocol tests use it to play the role of a misbehaving or hand-steered peer.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;

use crate::frame::{FrameHeader, HEADER_LEN};

pub struct WireProbe {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl WireProbe {
    pub async fn bind(port: u16) -> anyhow::Result<WireProbe> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(WireProbe {
            socket,
            buf: vec![0u8; 65536],
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send a frame exactly as given - no sequence bookkeeping, no legality checks.
    pub async fn send_frame(
        &self,
        to: SocketAddr,
        header: FrameHeader,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        self.socket.send_to(&buf, to).await?;
        Ok(())
    }

    /// Send raw bytes that need not even contain a valid header.
    pub async fn send_raw(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    /// Receive the next datagram and decode its header.
    pub async fn recv_frame(&mut self) -> anyhow::Result<(FrameHeader, Bytes, SocketAddr)> {
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        let datagram = &self.buf[..len];
        let header = FrameHeader::deser(&mut &datagram[..len.min(HEADER_LEN)])?;
        let payload = Bytes::copy_from_slice(&datagram[HEADER_LEN.min(len)..]);
        Ok((header, payload, from))
    }
}
