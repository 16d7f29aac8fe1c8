use std::time::Instant;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::frame::FrameHeader;

/// A reliable datagram awaiting acknowledgement.
///
/// The encoded bytes are kept verbatim so a resend puts the exact original datagram
///  (same sequence number included) back on the wire.
pub struct InFlightFrame {
    pub header: FrameHeader,
    pub bytes: Bytes,
    pub first_sent: Instant,
    pub last_resend: Instant,
}

/// Tracks every reliable transmission from send until its ACK arrives or the session
///  gives up on it.
///
/// Lookups are by batch number only, so an unordered map suffices; the scheduler's due
///  scans iterate all entries, which is fine for the small number of packets a session
///  keeps in flight.
pub struct RetransmitBuffer {
    in_flight: FxHashMap<u32, InFlightFrame>,
}

impl RetransmitBuffer {
    pub fn new() -> RetransmitBuffer {
        RetransmitBuffer {
            in_flight: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn contains(&self, batch: u32) -> bool {
        self.in_flight.contains_key(&batch)
    }

    /// Register a freshly sent reliable datagram under its batch number.
    pub fn insert(&mut self, header: FrameHeader, bytes: Bytes, now: Instant) {
        let previous = self.in_flight.insert(
            header.batch,
            InFlightFrame {
                header,
                bytes,
                first_sent: now,
                last_resend: now,
            },
        );
        if previous.is_some() {
            // batch numbers are assigned monotonically, so a collision means the caller
            //  reused one while it was still outstanding
            warn!("batch {} was inserted while still in flight", header.batch);
        }
    }

    /// Remove the entry for an acknowledged batch. Duplicate ACKs find nothing to remove
    ///  and report false.
    pub fn acknowledge(&mut self, batch: u32) -> bool {
        self.in_flight.remove(&batch).is_some()
    }

    /// Refresh the resend timestamp for `batch` and hand out the bytes to put on the
    ///  wire again.
    pub fn mark_resent(&mut self, batch: u32, now: Instant) -> Option<Bytes> {
        let frame = self.in_flight.get_mut(&batch)?;
        frame.last_resend = now;
        Some(frame.bytes.clone())
    }

    /// The entry whose resend is due soonest: smallest `last_resend`.
    pub fn next_resend_due(&self) -> Option<(u32, Instant)> {
        self.in_flight
            .iter()
            .min_by_key(|(_, f)| f.last_resend)
            .map(|(&batch, f)| (batch, f.last_resend))
    }

    /// The entry that will hit the total timeout soonest: smallest `first_sent`.
    pub fn next_total_due(&self) -> Option<(u32, Instant)> {
        self.in_flight
            .iter()
            .min_by_key(|(_, f)| f.first_sent)
            .map(|(&batch, f)| (batch, f.first_sent))
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}
