//! Protocol tunables.
//!
//! Every value has a default matching the reference behavior; the binary
//! overrides them from command-line flags.

use std::time::Duration;

/// Fixed retransmission timeout.
pub const DEFAULT_RTO: Duration = Duration::from_millis(1000);
/// How long a connection lingers in TIME_WAIT before it is torn down.
pub const DEFAULT_TIME_WAIT: Duration = Duration::from_secs(30);
/// Maximum number of unacknowledged segments in flight.
pub const DEFAULT_WINDOW: usize = 8;
/// Maximum payload bytes carried by one data segment.
pub const DEFAULT_MSS: usize = 1000;

/// Adjustable protocol parameters shared by every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Delay before an unacknowledged segment is resent.
    pub rto: Duration,
    /// TIME_WAIT linger duration.
    pub time_wait: Duration,
    /// Send window limit, in segments.
    pub window: usize,
    /// Data segment payload size, in bytes.
    pub mss: usize,
    /// Initial sequence number for active opens; random when `None`.
    pub client_isn: Option<u32>,
    /// Initial sequence number for passive opens; random when `None`.
    pub server_isn: Option<u32>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            rto: DEFAULT_RTO,
            time_wait: DEFAULT_TIME_WAIT,
            window: DEFAULT_WINDOW,
            mss: DEFAULT_MSS,
            client_isn: None,
            server_isn: None,
        }
    }
}

impl ProtocolConfig {
    /// Window value advertised in outbound segments.
    ///
    /// This is the local segment limit, not the free space left in the
    /// receive buffer.  The receive buffer is unbounded and the window is
    /// counted in segments, so the advertisement stays constant for the life
    /// of the connection.
    pub fn advertised_window(&self) -> u16 {
        u16::try_from(self.window).unwrap_or(u16::MAX)
    }

    /// Pick the ISN for an active open.
    pub fn pick_client_isn(&self) -> u32 {
        self.client_isn.unwrap_or_else(rand::random)
    }

    /// Pick the ISN for a passive open.
    pub fn pick_server_isn(&self) -> u32 {
        self.server_isn.unwrap_or_else(rand::random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ProtocolConfig::default();
        assert_eq!(c.rto, Duration::from_millis(1000));
        assert_eq!(c.window, 8);
        assert_eq!(c.mss, 1000);
        assert!(c.time_wait > c.rto);
    }

    #[test]
    fn fixed_isn_is_used_verbatim() {
        let c = ProtocolConfig {
            client_isn: Some(100),
            server_isn: Some(10_000),
            ..ProtocolConfig::default()
        };
        assert_eq!(c.pick_client_isn(), 100);
        assert_eq!(c.pick_server_isn(), 10_000);
    }

    #[test]
    fn advertised_window_saturates() {
        let c = ProtocolConfig {
            window: 1 << 20,
            ..ProtocolConfig::default()
        };
        assert_eq!(c.advertised_window(), u16::MAX);
    }
}
