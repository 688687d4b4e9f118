//! Datagram transport: the unreliable layer segments travel over.
//!
//! [`DatagramSender`] is the fire-and-forget seam the connection state
//! machine sends through; it is called with the connection lock held, so it
//! must never block.
//!
//! [`UdpTransport`] is a thin wrapper around `tokio::net::UdpSocket` that
//! speaks [`Segment`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::ConnError;
use crate::segment::Segment;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// Best-effort delivery of one segment to a datagram address.
///
/// May drop, duplicate, delay or reorder; there is no delivery confirmation.
pub trait DatagramSender: Send + Sync {
    fn send(&self, segment: &Segment, dest: SocketAddr);
}

/// A packet-oriented UDP socket shared by every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, ConnError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
        })
    }

    /// Receive the next datagram and decode it into a [`Segment`].
    ///
    /// Returns `(segment, sender_address)`.  Datagrams that fail to decode
    /// are returned as `Err`; the caller decides whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Segment, SocketAddr), ConnError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let segment = Segment::decode(&buf[..n])?;
        Ok((segment, addr))
    }
}

impl DatagramSender for UdpTransport {
    /// Encode and hand the datagram to the OS without waiting.
    ///
    /// A full socket buffer or any send error counts as a network drop.
    fn send(&self, segment: &Segment, dest: SocketAddr) {
        let bytes = match segment.encode() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("[udp] dropping unencodable segment: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.try_send_to(&bytes, dest) {
            log::debug!("[udp] send to {dest} dropped: {e}");
        }
    }
}
