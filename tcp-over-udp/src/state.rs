//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy, mirroring the TCP state diagram (RFC 793 §3.2).  The transitions
//! themselves are applied in [`crate::connection`]; the predicates here let
//! the connection and its waiters ask what a state permits.
//!
//! ```text
//!                     passive open                 active open
//!  CLOSED ─────────────▶ LISTEN        CLOSED ──SYN──▶ SYN_SENT
//!                          │ SYN / SYN+ACK               │ SYN+ACK / ACK
//!                          ▼                             ▼
//!                       SYN_RCVD ───────ACK────────▶ ESTABLISHED
//!                                                      │      │
//!                                     close / FIN      │      │ FIN / ACK
//!                    ┌─────────────────────────────────┘      ▼
//!                    ▼                                    CLOSE_WAIT
//!               FIN_WAIT_1 ──FIN / ACK──▶ CLOSING             │ close / FIN
//!                    │ ACK                   │ ACK            ▼
//!                    ▼                       ▼            LAST_ACK
//!               FIN_WAIT_2 ──FIN / ACK──▶ TIME_WAIT ◀───ACK───┘
//!                                            │ timer
//!                                            ▼
//!                                          CLOSED
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Registered as a listener; waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// ACK of local FIN received; waiting for the peer's FIN.
    FinWait2,
    /// Peer's FIN received; local close pending.
    CloseWait,
    /// Both sides sent FIN simultaneously; waiting for the ACK of ours.
    Closing,
    /// Local FIN sent after the peer's; waiting for its ACK.
    LastAck,
    /// Lingering to absorb retransmitted peer FINs before teardown.
    TimeWait,
}

impl ConnectionState {
    /// The handshake has completed at some point (sequence numbers agreed).
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Listen | Self::SynSent | Self::SynReceived
        )
    }

    /// The handshake is still in progress.
    pub fn is_opening(self) -> bool {
        matches!(self, Self::Listen | Self::SynSent | Self::SynReceived)
    }

    /// New data from the peer may still arrive (the peer has not sent FIN).
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    /// A local `close()` can send FIN right now.
    pub fn is_closable(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// The peer's FIN has been consumed.
    pub fn peer_finished(self) -> bool {
        matches!(
            self,
            Self::CloseWait | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }

    /// Our FIN is outstanding (sent and not yet acknowledged).
    pub fn awaiting_fin_ack(self) -> bool {
        matches!(self, Self::FinWait1 | Self::Closing | Self::LastAck)
    }

    /// Upper-snake name as used in RFC 793.
    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
