use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::RcpConfig;
use crate::frame::{FrameFlags, HEADER_LEN};
use crate::scheduler::{self, NextEvent};
use crate::session::{decode_header, SessionInner, SessionState, Shared};

/// Start the background I/O task for an established session. The task owns nothing; it
///  works through the shared state handle and winds itself down once the session state
///  returns to disconnected.
pub(crate) fn spawn(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(run(shared))
}

/// The engine loop: ask the scheduler for the next deadline, wait on the socket for at
///  most that long, then handle whichever came first - a datagram or the timer event.
async fn run(shared: Arc<Shared>) {
    let socket = {
        let inner = shared.inner.lock().await;
        match inner.socket.clone() {
            Some(socket) => socket,
            None => return,
        }
    };

    info!("starting engine loop");
    let mut buf = vec![0u8; shared.config.max_datagram_size];

    loop {
        let (event, remaining) = {
            let mut inner = shared.inner.lock().await;
            match inner.state {
                SessionState::Disconnected => break,
                SessionState::Closing => {
                    if drive_close(&mut inner, &shared.recv_notify, &shared.config).await {
                        break;
                    }
                }
                SessionState::Connected => {}
            }
            scheduler::next_event(
                &inner.retransmit,
                &inner.delivery,
                inner.time_last_send,
                inner.time_last_received,
                &shared.config,
                Instant::now(),
            )
        };

        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let mut inner = shared.inner.lock().await;
                        on_datagram(&mut inner, &shared.recv_notify, from, &buf[..len]).await;
                    }
                    Err(e) => error!("socket error: {}", e),
                }
            }
            _ = sleep(remaining) => {
                let mut inner = shared.inner.lock().await;
                on_timer(&mut inner, &shared.recv_notify, event).await;
            }
        }
    }

    debug!("engine loop stopped");
}

/// Process one incoming datagram. Flag precedence: ACK, KEP, FIN, REL, then plain data.
pub(crate) async fn on_datagram(
    inner: &mut SessionInner,
    notify: &Notify,
    from: SocketAddr,
    datagram: &[u8],
) {
    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
    handle_datagram(inner, notify, from, datagram)
        .instrument(span)
        .await
}

async fn handle_datagram(
    inner: &mut SessionInner,
    notify: &Notify,
    from: SocketAddr,
    datagram: &[u8],
) {
    let Some(header) = decode_header(datagram) else {
        return;
    };

    if header.flags.contains(FrameFlags::CANCEL) {
        trace!("cancel pulse - waking the loop");
        return;
    }
    if inner.peer != Some(from) {
        debug!("datagram from unknown sender {:?} - dropping", from);
        return;
    }
    if !header.is_wire_legal() {
        debug!("disallowed flag combination {:?} - dropping", header.flags);
        return;
    }

    trace!("received {:?} seq {} batch {}", header.flags, header.seq, header.batch);
    inner.time_last_received = Instant::now();
    if header.seq > inner.remote_seq_num {
        inner.remote_seq_num = header.seq;
    }
    let payload = &datagram[HEADER_LEN..];

    if header.flags.contains(FrameFlags::ACK) {
        if header.flags.contains(FrameFlags::SYN) {
            // the peer is still resending SYN|ACK: our final handshake ACK got lost
            send_ack(inner, 0).await;
            return;
        }
        if inner.retransmit.acknowledge(header.batch) {
            trace!("batch {} acknowledged", header.batch);
        } else {
            trace!("duplicate ACK for batch {} - ignoring", header.batch);
        }
        if !header.flags.contains(FrameFlags::FIN) {
            return;
        }
    }

    if header.flags.contains(FrameFlags::KEP) {
        // liveness was already refreshed above
        return;
    }

    if header.flags.contains(FrameFlags::FIN) {
        on_fin(inner, notify).await;
        return;
    }

    if header.flags.contains(FrameFlags::REL) {
        on_reliable(inner, notify, header.batch, payload).await;
        return;
    }

    if header.flags.is_empty() {
        inner.delivery.push_back(Bytes::copy_from_slice(payload), false);
        if inner.delivery.front_committed() {
            notify.notify_waiters();
        }
        return;
    }

    debug!("unexpected {:?} in an established session - dropping", header.flags);
}

async fn on_fin(inner: &mut SessionInner, notify: &Notify) {
    debug!("received FIN - acknowledging and entering close");
    send_ack(inner, 0).await;
    inner.fin_received = true;
    if inner.state == SessionState::Connected {
        inner.state = SessionState::Closing;
        inner.closing_since = Some(Instant::now());
        notify.notify_waiters();
    }
}

/// A reliable payload: commit it into its reserved slot, reserving space for any batches
///  between the previously highest known one and this one, and acknowledge. Anything at
///  or below the reservation high-water mark without an open reservation is a duplicate -
///  it is re-acknowledged but not delivered again.
async fn on_reliable(inner: &mut SessionInner, notify: &Notify, batch: u32, payload: &[u8]) {
    if batch <= inner.remote_batch_reserved && !inner.delivery.is_reserved(batch) {
        trace!("duplicate reliable batch {} - re-acknowledging", batch);
        send_ack(inner, batch).await;
        return;
    }

    let payload = Bytes::copy_from_slice(payload);
    if inner.delivery.is_reserved(batch) {
        trace!("committing batch {} into its reserved slot", batch);
        inner.delivery.commit(batch, payload);
    } else {
        let now = Instant::now();
        for pending in inner.remote_batch_reserved + 1..batch {
            trace!("reserving a slot for pending batch {}", pending);
            inner.delivery.reserve_back(pending, now);
        }
        inner.delivery.push_back(payload, true);
        inner.remote_batch_reserved = batch;
    }

    send_ack(inner, batch).await;
    if inner.delivery.front_committed() {
        notify.notify_waiters();
    }
}

async fn send_ack(inner: &mut SessionInner, batch: u32) {
    if let Err(e) = inner.emit(FrameFlags::ACK, batch, &[]).await {
        error!("failed to send ACK for batch {}: {}", batch, e);
    }
}

/// Dispatch a due timer event.
pub(crate) async fn on_timer(inner: &mut SessionInner, notify: &Notify, event: NextEvent) {
    match event {
        NextEvent::Resend(batch) => {
            let now = Instant::now();
            // the entry may have been acknowledged while the timer was pending
            if let Some(bytes) = inner.retransmit.mark_resent(batch, now) {
                trace!("resending batch {}", batch);
                if let (Some(peer), Some(pipeline)) = (inner.peer, inner.pipeline.clone()) {
                    if let Err(e) = pipeline.send_encoded(peer, &bytes).await {
                        error!("failed to resend batch {}: {}", batch, e);
                    }
                    inner.time_last_send = now;
                }
            }
        }
        NextEvent::AckTimeout => {
            warn!("a reliable packet stayed unacknowledged for the total timeout - session failed");
            fatal_reset(inner, notify);
        }
        NextEvent::RecvTimeout => {
            warn!("nothing received from {:?} for the total timeout - session failed", inner.peer);
            fatal_reset(inner, notify);
        }
        NextEvent::Keepalive => {
            trace!("link idle - emitting keepalive");
            if let Err(e) = inner.emit(FrameFlags::KEP, 0, &[]).await {
                error!("failed to send keepalive: {}", e);
            }
        }
        NextEvent::ReserveTimeout(batch) => {
            debug!("abandoning reservation for batch {} - its packets are presumed lost", batch);
            inner.delivery.drop_reservation(batch);
            if inner.delivery.front_committed() {
                notify.notify_waiters();
            }
        }
        NextEvent::Reloop => {
            trace!("reloop");
        }
    }
}

fn fatal_reset(inner: &mut SessionInner, notify: &Notify) {
    inner.reset();
    notify.notify_waiters();
}

/// One step of the close drain. Returns true once the session is fully torn down.
///
/// The FIN is held back until outstanding reliable packets are acknowledged, then it
///  goes through the regular ack/retransmit cycle under batch number 0. The session ends
///  when both our FIN is acknowledged and the peer's FIN was seen, or when the grace
///  interval runs out.
pub(crate) async fn drive_close(
    inner: &mut SessionInner,
    notify: &Notify,
    config: &RcpConfig,
) -> bool {
    let now = Instant::now();
    if let Some(since) = inner.closing_since {
        if now >= since + config.timeout_total {
            warn!("close handshake did not complete within the grace interval - resetting");
            fatal_reset(inner, notify);
            return true;
        }
    }

    if !inner.fin_sent && inner.retransmit.is_empty() {
        debug!("outstanding packets drained - sending FIN");
        match inner.emit(FrameFlags::FIN, 0, &[]).await {
            Ok((header, datagram)) => {
                inner.retransmit.insert(header, datagram, now);
                inner.fin_sent = true;
            }
            Err(e) => warn!("failed to send FIN: {}", e),
        }
    }

    if inner.fin_sent && !inner.retransmit.contains(0) && inner.fin_received {
        info!("close handshake complete");
        inner.reset();
        notify.notify_waiters();
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use crate::send_pipeline::{MockSendSocket, SendPipeline};
    use bytes::BytesMut;
    use mockall::Sequence;

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    fn datagram(seq: u32, batch: u32, flags: FrameFlags, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameHeader::new(seq, batch, flags).ser(&mut buf);
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    fn header_of(datagram: &[u8]) -> FrameHeader {
        FrameHeader::deser(&mut &datagram[..]).unwrap()
    }

    fn connected_inner(send_socket: MockSendSocket) -> SessionInner {
        let mut inner = SessionInner::new();
        inner.pipeline = Some(SendPipeline::new(Arc::new(send_socket)));
        inner.peer = Some(peer_addr());
        inner.state = SessionState::Connected;
        inner
    }

    fn expect_ack(send_socket: &mut MockSendSocket, batch: u32) {
        send_socket
            .expect_do_send_datagram()
            .once()
            .withf(move |to, d| {
                let header = header_of(d);
                to == &peer_addr() && header.flags == FrameFlags::ACK && header.batch == batch
            })
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn test_reliable_batch_is_delivered_and_acked() {
        let mut send_socket = MockSendSocket::new();
        expect_ack(&mut send_socket, 1);
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(5, 1, FrameFlags::REL, b"hi")).await;

        assert_eq!(inner.remote_batch_reserved, 1);
        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"hi"), true))
        );
    }

    #[tokio::test]
    async fn test_out_of_order_reliable_batches_are_reordered() {
        let mut send_socket = MockSendSocket::new();
        let mut sequence = Sequence::new();
        for expected_batch in [2u32, 1] {
            send_socket
                .expect_do_send_datagram()
                .once()
                .in_sequence(&mut sequence)
                .withf(move |_, d| {
                    let header = header_of(d);
                    header.flags == FrameFlags::ACK && header.batch == expected_batch
                })
                .returning(|_, _| Ok(()));
        }
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(6, 2, FrameFlags::REL, b"m2")).await;

        // batch 1 is pending: its slot is reserved, so nothing is deliverable yet
        assert!(inner.delivery.is_reserved(1));
        assert_eq!(inner.delivery.pop_front(), None);

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(7, 1, FrameFlags::REL, b"m1")).await;

        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"m1"), true))
        );
        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"m2"), true))
        );
    }

    #[tokio::test]
    async fn test_duplicate_reliable_batch_is_reacked_but_not_redelivered() {
        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_datagram()
            .times(2)
            .withf(|_, d| {
                let header = header_of(d);
                header.flags == FrameFlags::ACK && header.batch == 1
            })
            .returning(|_, _| Ok(()));
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        let rel = datagram(5, 1, FrameFlags::REL, b"hi");
        on_datagram(&mut inner, &notify, peer_addr(), &rel).await;
        on_datagram(&mut inner, &notify, peer_addr(), &rel).await;

        assert_eq!(inner.delivery.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_retransmit_entry_and_duplicates_are_noops() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        let header = FrameHeader::new(3, 1, FrameFlags::REL);
        inner
            .retransmit
            .insert(header, Bytes::from_static(b"x"), Instant::now());

        let ack = datagram(9, 1, FrameFlags::ACK, &[]);
        on_datagram(&mut inner, &notify, peer_addr(), &ack).await;
        assert!(inner.retransmit.is_empty());

        // a duplicate ACK finds nothing and changes nothing
        on_datagram(&mut inner, &notify, peer_addr(), &ack).await;
        assert!(inner.retransmit.is_empty());
    }

    #[tokio::test]
    async fn test_datagram_from_unknown_sender_is_dropped() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        let stranger = SocketAddr::from(([10, 0, 0, 1], 4242));
        on_datagram(&mut inner, &notify, stranger, &datagram(5, 1, FrameFlags::REL, b"hi")).await;

        assert!(inner.delivery.is_empty());
        assert_eq!(inner.remote_batch_reserved, 0);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        // too short, and an illegal flag combination
        on_datagram(&mut inner, &notify, peer_addr(), &[1, 2, 3]).await;
        let syn_fin = datagram(5, 0, FrameFlags::SYN | FrameFlags::FIN, &[]);
        on_datagram(&mut inner, &notify, peer_addr(), &syn_fin).await;

        assert!(inner.delivery.is_empty());
        assert_eq!(inner.state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_cancel_pulse_is_a_noop_wake() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();
        let before = inner.time_last_received;

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(0, 0, FrameFlags::CANCEL, &[])).await;

        // a pulse refreshes nothing - it only wakes the select
        assert_eq!(inner.time_last_received, before);
        assert!(inner.delivery.is_empty());
    }

    #[tokio::test]
    async fn test_unreliable_data_is_appended_in_arrival_order() {
        let mut send_socket = MockSendSocket::new();
        expect_ack(&mut send_socket, 1);
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(5, 1, FrameFlags::REL, b"m1")).await;
        on_datagram(&mut inner, &notify, peer_addr(), &datagram(6, 0, FrameFlags::empty(), b"u")).await;

        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"m1"), true))
        );
        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"u"), false))
        );
    }

    #[tokio::test]
    async fn test_fin_is_acknowledged_and_enters_closing() {
        let mut send_socket = MockSendSocket::new();
        expect_ack(&mut send_socket, 0);
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(5, 0, FrameFlags::FIN, &[])).await;

        assert_eq!(inner.state, SessionState::Closing);
        assert!(inner.fin_received);
    }

    #[tokio::test]
    async fn test_keepalive_refreshes_liveness_only() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();
        let before = inner.time_last_received;

        on_datagram(&mut inner, &notify, peer_addr(), &datagram(5, 0, FrameFlags::KEP, &[])).await;

        assert!(inner.time_last_received >= before);
        assert!(inner.delivery.is_empty());
    }

    #[tokio::test]
    async fn test_resend_puts_the_original_bytes_back_on_the_wire() {
        let original = datagram(3, 1, FrameFlags::REL, b"hi");
        let expected = original.clone();

        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_datagram()
            .once()
            .withf(move |to, d| to == &peer_addr() && d == expected.as_slice())
            .returning(|_, _| Ok(()));
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        inner.retransmit.insert(
            FrameHeader::new(3, 1, FrameFlags::REL),
            Bytes::from(original),
            Instant::now(),
        );

        on_timer(&mut inner, &notify, NextEvent::Resend(1)).await;
        assert!(inner.retransmit.contains(1));
    }

    #[tokio::test]
    async fn test_ack_timeout_resets_the_session() {
        let send_socket = MockSendSocket::new();
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        inner.retransmit.insert(
            FrameHeader::new(3, 1, FrameFlags::REL),
            Bytes::from_static(b"x"),
            Instant::now(),
        );

        on_timer(&mut inner, &notify, NextEvent::AckTimeout).await;

        assert_eq!(inner.state, SessionState::Disconnected);
        assert!(inner.peer.is_none());
        assert!(inner.retransmit.is_empty());
        assert!(inner.delivery.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_timeout_unblocks_later_batches() {
        let mut send_socket = MockSendSocket::new();
        expect_ack(&mut send_socket, 2);
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();

        // batch 2 arrives first, batch 1 never does
        on_datagram(&mut inner, &notify, peer_addr(), &datagram(6, 2, FrameFlags::REL, b"m2")).await;
        assert_eq!(inner.delivery.pop_front(), None);

        on_timer(&mut inner, &notify, NextEvent::ReserveTimeout(1)).await;

        assert_eq!(
            inner.delivery.pop_front(),
            Some((Bytes::from_static(b"m2"), true))
        );
    }

    #[tokio::test]
    async fn test_close_drain_completes_after_both_fins() {
        let mut send_socket = MockSendSocket::new();
        let mut sequence = Sequence::new();
        send_socket
            .expect_do_send_datagram()
            .once()
            .in_sequence(&mut sequence)
            .withf(|_, d| header_of(d).flags == FrameFlags::FIN && header_of(d).batch == 0)
            .returning(|_, _| Ok(()));
        send_socket
            .expect_do_send_datagram()
            .once()
            .in_sequence(&mut sequence)
            .withf(|_, d| header_of(d).flags == FrameFlags::ACK && header_of(d).batch == 0)
            .returning(|_, _| Ok(()));

        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();
        let config = RcpConfig::default();

        inner.state = SessionState::Closing;
        inner.closing_since = Some(Instant::now());

        // first pass sends our FIN; the handshake is not complete yet
        assert!(!drive_close(&mut inner, &notify, &config).await);
        assert!(inner.fin_sent);

        // peer acknowledges our FIN and sends its own
        on_datagram(&mut inner, &notify, peer_addr(), &datagram(8, 0, FrameFlags::ACK, &[])).await;
        on_datagram(&mut inner, &notify, peer_addr(), &datagram(9, 0, FrameFlags::FIN, &[])).await;

        assert!(drive_close(&mut inner, &notify, &config).await);
        assert_eq!(inner.state, SessionState::Disconnected);
        assert!(inner.retransmit.is_empty());
    }

    #[tokio::test]
    async fn test_close_drain_gives_up_after_the_grace_interval() {
        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_datagram()
            .returning(|_, _| Ok(()));
        let mut inner = connected_inner(send_socket);
        let notify = Notify::new();
        let config = RcpConfig::default();

        inner.state = SessionState::Closing;
        inner.closing_since = Some(Instant::now() - config.timeout_total);

        assert!(drive_close(&mut inner, &notify, &config).await);
        assert_eq!(inner.state, SessionState::Disconnected);
    }
}
