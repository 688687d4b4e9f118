//! Error types surfaced by connections and the demultiplexer.

use std::net::SocketAddr;

use thiserror::Error;

use crate::segment::SegmentError;
use crate::state::ConnectionState;

/// Failures reported by a [`crate::demux::Demultiplexer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("local port {0} already has a listener")]
    PortInUse(u16),
    #[error("connection {peer} <-> :{local_port} already registered")]
    ConnectionExists { peer: SocketAddr, local_port: u16 },
    #[error("nothing registered for {0}")]
    NotRegistered(String),
    #[error("no ephemeral ports left")]
    PortsExhausted,
}

/// Errors returned by connection operations.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The operation is not valid in the connection's current state.
    #[error("operation not permitted in state {0}")]
    BadState(ConnectionState),
    /// The local side has already closed the stream for writing.
    #[error("connection is closing")]
    Closed,
    /// Registration with the demultiplexer failed.
    #[error("demultiplexer: {0}")]
    Demux(#[from] DemuxError),
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment codec: {0}")]
    Segment(#[from] SegmentError),
}
