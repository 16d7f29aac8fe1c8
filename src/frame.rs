use bitflags::bitflags;
use bytes::{Buf, BufMut};

/// Serialized size of a frame header on the wire. Datagrams shorter than this are
///  discarded without further inspection.
pub const HEADER_LEN: usize = 12;

bitflags! {
    /// Flag bits of a frame header.
    ///
    /// `CANCEL` is internal: it is only ever carried by the loopback pulse a socket sends
    ///  to itself to interrupt a blocking wait, and is never part of a legal wire
    ///  combination.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// connection requested
        const SYN = 1;
        /// acknowledgement, correlated by batch number
        const ACK = 2;
        /// no more messages
        const FIN = 4;
        /// keepalive
        const KEP = 8;
        /// reliable payload, to be acknowledged by the receiver
        const REL = 16;
        /// local wake-up pulse, see [`crate::RcpSocket::cancel`]
        const CANCEL = 1 << 31;
    }
}

/// The fixed 12-byte header preceding every datagram's payload, all fields big-endian.
///
/// The sequence number increases for every freshly transmitted datagram regardless of
///  kind; the batch number identifies a reliable message through its retransmission /
///  acknowledgement cycle and is 0 for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq: u32,
    pub batch: u32,
    pub flags: FrameFlags,
}

impl FrameHeader {
    pub fn new(seq: u32, batch: u32, flags: FrameFlags) -> FrameHeader {
        FrameHeader { seq, batch, flags }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seq);
        buf.put_u32(self.batch);
        buf.put_u32(self.flags.bits());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let seq = buf.try_get_u32()?;
        let batch = buf.try_get_u32()?;
        let raw_flags = buf.try_get_u32()?;

        let Some(flags) = FrameFlags::from_bits(raw_flags) else {
            anyhow::bail!("unknown flag bits {:#x}", raw_flags);
        };

        Ok(FrameHeader { seq, batch, flags })
    }

    /// Whether this flag combination is allowed on the wire: one of the recognized
    ///  control combinations (SYN, SYN|ACK, ACK, FIN, FIN|ACK, KEP), reliable data (REL)
    ///  or unreliable data (no flags).
    ///
    /// NB: The CANCEL pulse is deliberately not legal here - the engine recognizes it
    ///      before this check and anything CANCEL-flagged from the network is dropped.
    pub fn is_wire_legal(&self) -> bool {
        self.flags.is_empty()
            || self.flags == FrameFlags::SYN
            || self.flags == FrameFlags::SYN | FrameFlags::ACK
            || self.flags == FrameFlags::ACK
            || self.flags == FrameFlags::FIN
            || self.flags == FrameFlags::FIN | FrameFlags::ACK
            || self.flags == FrameFlags::KEP
            || self.flags == FrameFlags::REL
    }
}
