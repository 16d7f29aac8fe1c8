use std::time::Duration;
use anyhow::bail;

use crate::frame::HEADER_LEN;

pub struct RcpConfig {
    /// The session dies if an outstanding reliable packet stays unacknowledged for this
    ///  long, or if nothing at all arrives from the peer for this long. It also bounds
    ///  the patience for a reserved-but-uncommitted slot in the delivery queue.
    pub timeout_total: Duration,

    /// Cadence of retransmissions for unacknowledged reliable packets, and of keepalive
    ///  packets when the session is otherwise idle.
    ///
    /// NB: The ratio `timeout_total / timeout_short` determines how many retransmissions
    ///      a reliable packet gets before the session is declared dead.
    pub timeout_short: Duration,

    /// Upper bound for the engine loop's select timeout, so the loop re-evaluates its
    ///  schedule periodically even if no event is due.
    pub reloop_interval: Duration,

    /// This is the UDP payload size the protocol assumes, i.e. the receive buffer size
    ///  and the upper bound for `header + user payload`.
    ///
    /// With full Ethernet frames and no optional IP headers this is `1500 - 20 - 8 = 1472`
    ///  for IPV4. The protocol does not attempt MTU discovery; picking this too big causes
    ///  datagrams to be dropped by the network, picking it too small wastes bandwidth.
    pub max_datagram_size: usize,
}

impl Default for RcpConfig {
    fn default() -> RcpConfig {
        RcpConfig {
            timeout_total: Duration::from_millis(5000),
            timeout_short: Duration::from_millis(200),
            reloop_interval: Duration::from_millis(200),
            max_datagram_size: 1472,
        }
    }
}

impl RcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_short.is_zero() {
            bail!("short timeout must be positive");
        }
        if self.timeout_total <= self.timeout_short {
            bail!("total timeout must be longer than the short timeout");
        }
        if self.max_datagram_size <= HEADER_LEN {
            bail!("maximum datagram size leaves no room for a payload");
        }
        Ok(())
    }
}
