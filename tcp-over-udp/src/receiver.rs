//! Inbound sequence state and the receive buffer.
//!
//! [`Receiver`] accepts only **in-order** data: a segment whose `seq` equals
//! `expected_seq` is appended to the receive buffer; anything else (early,
//! duplicate, overlapping) is dropped without buffering.  In every case the
//! caller answers with a cumulative ACK carrying [`Receiver::ack_number`].
//!
//! The receiver does **not** send ACKs itself; it provides the values that
//! [`crate::connection::Connection`] uses when constructing them.

use crate::buffer::StreamBuffer;

#[derive(Debug, Default)]
pub struct Receiver {
    /// Next expected sequence number from the peer (cumulative ACK point).
    pub expected_seq: u32,
    /// In-order bytes waiting for the application.
    pub recv_buffer: StreamBuffer,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The peer's SYN consumed `peer_isn`; expect `peer_isn + 1` next.
    pub fn on_syn(&mut self, peer_isn: u32) {
        self.expected_seq = peer_isn.wrapping_add(1);
    }

    /// Process an inbound data segment.
    ///
    /// Returns `true` if it was the next expected one and its payload was
    /// appended.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> bool {
        if seq != self.expected_seq {
            return false;
        }
        self.recv_buffer.append(payload);
        self.expected_seq = self.expected_seq.wrapping_add(payload.len() as u32);
        true
    }

    /// Consume a FIN at `fin_seq`.  Returns `true` if it was in order and
    /// `expected_seq` advanced past it.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if fin_seq != self.expected_seq {
            return false;
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);
        true
    }

    /// Cumulative ACK number for the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.expected_seq
    }

    /// Copy up to `buf.len()` buffered bytes into `buf`, consuming them.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.recv_buffer.read_into(buf)
    }

    pub fn available(&self) -> usize {
        self.recv_buffer.len()
    }
}
