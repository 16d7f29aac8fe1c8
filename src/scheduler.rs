use std::time::{Duration, Instant};

use crate::config::RcpConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::retransmit::RetransmitBuffer;

/// The next piece of background work the engine owes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextEvent {
    /// Put the in-flight datagram for this batch back on the wire.
    Resend(u32),
    /// An in-flight reliable datagram exceeded the total timeout - session failure.
    AckTimeout,
    /// The peer has been silent for the total timeout - session failure.
    RecvTimeout,
    /// Nothing has been sent for a while - emit a keepalive so the peer sees us alive.
    Keepalive,
    /// This reservation has waited long enough; its packet is presumed lost forever.
    ReserveTimeout(u32),
    /// Nothing is due - re-enter the loop after the fallback interval.
    Reloop,
}

/// Compute the event that fires soonest and how long until it does. The remaining time
///  is what the engine uses as its select timeout.
///
/// Candidates are examined in severity order, so when deadlines tie the session-fatal
///  events win over housekeeping.
pub fn next_event(
    retransmit: &RetransmitBuffer,
    delivery: &DeliveryQueue,
    time_last_send: Instant,
    time_last_received: Instant,
    config: &RcpConfig,
    now: Instant,
) -> (NextEvent, Duration) {
    let mut candidates: Vec<(NextEvent, Instant)> = Vec::with_capacity(6);

    candidates.push((NextEvent::RecvTimeout, time_last_received + config.timeout_total));

    if let Some((_, first_sent)) = retransmit.next_total_due() {
        candidates.push((NextEvent::AckTimeout, first_sent + config.timeout_total));
    }

    if let Some((batch, since)) = delivery.oldest_reservation() {
        candidates.push((NextEvent::ReserveTimeout(batch), since + config.timeout_total));
    }

    if let Some((batch, last_resend)) = retransmit.next_resend_due() {
        candidates.push((NextEvent::Resend(batch), last_resend + config.timeout_short));
    }

    candidates.push((NextEvent::Keepalive, time_last_send + config.timeout_short));
    candidates.push((NextEvent::Reloop, now + config.reloop_interval));

    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.1 < best.1 {
            best = candidate;
        }
    }

    (best.0, best.1.saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFlags, FrameHeader};
    use bytes::Bytes;

    const SHORT: Duration = Duration::from_millis(200);
    const TOTAL: Duration = Duration::from_millis(5000);

    fn config() -> RcpConfig {
        RcpConfig::default()
    }

    fn rel_header(batch: u32) -> FrameHeader {
        FrameHeader::new(batch, batch, FrameFlags::REL)
    }

    #[test]
    fn test_idle_session_schedules_keepalive() {
        let now = Instant::now();
        let retransmit = RetransmitBuffer::new();
        let delivery = DeliveryQueue::new();

        let (event, remaining) = next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::Keepalive);
        assert_eq!(remaining, SHORT);
    }

    #[test]
    fn test_resend_due_before_keepalive() {
        let now = Instant::now();
        let mut retransmit = RetransmitBuffer::new();
        retransmit.insert(rel_header(3), Bytes::from_static(b"x"), now - SHORT / 2);
        let delivery = DeliveryQueue::new();

        // sent something a moment ago, so the keepalive deadline is further out
        let (event, remaining) =
            next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::Resend(3));
        assert_eq!(remaining, SHORT / 2);
    }

    #[test]
    fn test_resend_wins_tie_against_keepalive() {
        let now = Instant::now();
        let mut retransmit = RetransmitBuffer::new();
        retransmit.insert(rel_header(1), Bytes::from_static(b"x"), now);
        let delivery = DeliveryQueue::new();

        let (event, _) = next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::Resend(1));
    }

    #[test]
    fn test_unacknowledged_entry_hits_total_timeout() {
        let now = Instant::now();
        let mut retransmit = RetransmitBuffer::new();
        // sent long ago but resent just now, so the total timeout is the earliest event
        retransmit.insert(rel_header(1), Bytes::from_static(b"x"), now - TOTAL);
        retransmit.mark_resent(1, now);
        let delivery = DeliveryQueue::new();

        let (event, remaining) = next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::AckTimeout);
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn test_silent_peer_hits_receive_timeout() {
        let now = Instant::now();
        let retransmit = RetransmitBuffer::new();
        let delivery = DeliveryQueue::new();

        let (event, remaining) =
            next_event(&retransmit, &delivery, now, now - TOTAL, &config(), now);
        assert_eq!(event, NextEvent::RecvTimeout);
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn test_stale_reservation_times_out() {
        let now = Instant::now();
        let retransmit = RetransmitBuffer::new();
        let mut delivery = DeliveryQueue::new();
        delivery.reserve_back(7, now - TOTAL);

        let (event, remaining) = next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::ReserveTimeout(7));
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn test_fatal_event_wins_tie_against_resend() {
        let now = Instant::now();
        let mut retransmit = RetransmitBuffer::new();
        // due for both a resend and the total timeout at the same instant
        retransmit.insert(rel_header(1), Bytes::from_static(b"x"), now - TOTAL);
        retransmit.mark_resent(1, now - SHORT);
        let delivery = DeliveryQueue::new();

        let (event, _) = next_event(&retransmit, &delivery, now, now, &config(), now);
        assert_eq!(event, NextEvent::AckTimeout);
    }
}
