//! Outbound sequence state and the outstanding-segment table.
//!
//! [`Sender`] tracks `next_seq`, the bytes the application has written but
//! not yet segmented, and every segment that occupies sequence space and has
//! not been acknowledged.  It does **not** touch the network or arm timers;
//! [`crate::connection::Connection`] does both under its lock and hands the
//! resulting [`TimerHandle`] back via [`Sender::record_sent`].
//!
//! # Contract
//! - Every SYN, SYN+ACK, FIN and data segment is recorded on first send,
//!   keyed by its sequence number.  Pure ACKs are never recorded.
//! - At most `window` entries exist at once; callers check
//!   [`Sender::can_send`] first.
//! - A cumulative ACK `N` removes every entry with `seq < N` (wrap-aware) and
//!   cancels its timer; entries with `seq >= N` stay.
//!
//! ```text
//!   oldest unacked              next_seq
//!        │                          │
//!  ──────┼── outstanding (≤ N) ─────┼──── send_buffer (unsegmented) ───▶
//! ```

use std::collections::BTreeMap;

use crate::buffer::StreamBuffer;
use crate::segment::{seq_lt, Segment};
use crate::timer::{Expiry, TimerHandle, TimerPurpose};

/// A segment that has been sent but not yet acknowledged.
#[derive(Debug)]
pub struct RetransmitEntry {
    /// The segment exactly as first sent.
    pub segment: Segment,
    /// Timer currently armed for this segment.
    pub timer: TimerHandle,
    /// How many times this segment has been transmitted (1 = first send).
    pub tx_count: u32,
}

#[derive(Debug)]
pub struct Sender {
    /// Sequence number the next segment will use.
    pub next_seq: u32,
    /// Bytes written by the application that are not yet on the wire.
    pub send_buffer: StreamBuffer,
    /// Local window limit, in segments.
    window: usize,
    /// Last window advertised by the peer, in segments.
    peer_window: Option<u16>,
    outstanding: BTreeMap<u32, RetransmitEntry>,
}

impl Sender {
    /// `isn` is the Initial Sequence Number; the SYN itself will carry it.
    pub fn new(isn: u32, window: usize) -> Self {
        Self {
            next_seq: isn,
            send_buffer: StreamBuffer::new(),
            window: window.max(1),
            peer_window: None,
            outstanding: BTreeMap::new(),
        }
    }

    /// Effective window: the smaller of ours and the peer's, at least one.
    pub fn window_limit(&self) -> usize {
        match self.peer_window {
            Some(w) => self.window.min(usize::from(w)).max(1),
            None => self.window,
        }
    }

    /// Remember the peer's most recent advertised window.
    pub fn set_peer_window(&mut self, window: u16) {
        self.peer_window = Some(window);
    }

    /// `true` when there is room for one more outstanding segment.
    pub fn can_send(&self) -> bool {
        self.outstanding.len() < self.window_limit()
    }

    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Sequence numbers of every outstanding segment.
    pub fn outstanding_seqs(&self) -> Vec<u32> {
        self.outstanding.keys().copied().collect()
    }

    /// Claim sequence space for `segment` and advance `next_seq`.
    ///
    /// `segment.seq` must already equal `next_seq`.
    pub fn consume(&mut self, segment: &Segment) {
        debug_assert_eq!(segment.seq, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(segment.seq_len());
    }

    /// Place a just-transmitted segment into the outstanding table.
    pub fn record_sent(&mut self, segment: Segment, timer: TimerHandle) {
        let seq = segment.seq;
        if let Some(old) = self.outstanding.insert(
            seq,
            RetransmitEntry {
                segment,
                timer,
                tx_count: 1,
            },
        ) {
            old.timer.cancel();
        }
    }

    /// Process a cumulative ACK.
    ///
    /// Removes (and cancels the timer of) every entry with `seq < ack_num`.
    /// Returns the number of entries removed.
    pub fn on_ack(&mut self, ack_num: u32) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|&seq, entry| {
            if seq_lt(seq, ack_num) {
                entry.timer.cancel();
                false
            } else {
                true
            }
        });
        before - self.outstanding.len()
    }

    /// Look up the segment a retransmit timer refers to.
    ///
    /// Returns `None` when the expiry is stale: the segment was acknowledged,
    /// or the timer was superseded by a newer one.
    pub fn due_for_retransmit(&self, expiry: &Expiry) -> Option<&Segment> {
        let TimerPurpose::Retransmit(seq) = expiry.purpose else {
            return None;
        };
        self.outstanding
            .get(&seq)
            .filter(|e| e.timer.matches(expiry))
            .map(|e| &e.segment)
    }

    /// Install a fresh timer for an entry after retransmitting it.
    pub fn on_retransmit(&mut self, seq: u32, timer: TimerHandle) {
        if let Some(entry) = self.outstanding.get_mut(&seq) {
            entry.timer.cancel();
            entry.timer = timer;
            entry.tx_count += 1;
        } else {
            timer.cancel();
        }
    }

    /// The outstanding segment with this sequence number, if any.
    pub fn outstanding(&self, seq: u32) -> Option<&Segment> {
        self.outstanding.get(&seq).map(|e| &e.segment)
    }

    /// Transmission count of the entry at `seq`, `0` when absent.
    pub fn tx_count(&self, seq: u32) -> u32 {
        self.outstanding.get(&seq).map_or(0, |e| e.tx_count)
    }

    /// Cancel every timer and forget every outstanding segment.
    pub fn clear(&mut self) {
        for (_, entry) in std::mem::take(&mut self.outstanding) {
            entry.timer.cancel();
        }
    }
}
