use bytes::Bytes;

/// A discrete application message moving through a session.
///
/// The payload is opaque to the protocol. The reliable flag selects between acknowledged,
///  retransmitted, in-order delivery and fire-and-forget delivery; on the receive side it
///  reports which path the message took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    reliable: bool,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, reliable: bool) -> Message {
        Message {
            payload: payload.into(),
            reliable,
        }
    }

    pub fn reliable(payload: impl Into<Bytes>) -> Message {
        Message::new(payload, true)
    }

    pub fn unreliable(payload: impl Into<Bytes>) -> Message {
        Message::new(payload, false)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
