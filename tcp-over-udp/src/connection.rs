//! Per-connection state machine.
//!
//! A [`Connection`] owns the complete state for one logical session and is
//! the only place transitions happen.  Its responsibilities are:
//! - Driving the FSM (see [`crate::state`]) from three entry paths:
//!   application calls ([`connect`](Connection::connect),
//!   [`accept`](Connection::accept), [`write`](Connection::write),
//!   [`read`](Connection::read), [`close`](Connection::close)), inbound
//!   segments ([`receive_segment`](Connection::receive_segment), called by the
//!   endpoint's dispatch loop after demultiplexing), and timer expiry
//!   ([`handle_timer`](Connection::handle_timer)).
//! - Coordinating [`crate::sender`] and [`crate::receiver`].
//! - Arming one retransmit timer per outstanding segment, keyed by sequence
//!   number, plus the TIME_WAIT timer.
//!
//! All three entry paths take the same `tokio::sync::Mutex` for their whole
//! critical section; nothing is sent and no state changes outside it.  Every
//! event ends with [`Notify::notify_waiters`], and every waiter re-checks its
//! predicate after waking.
//!
//! After each event a single post-event check segments buffered data into
//! whatever window is open.  A `close()` that cannot send FIN yet only
//! records the request, and the same check sends the deferred FIN as soon as
//! it can.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, Notify};

use crate::config::ProtocolConfig;
use crate::demux::{Demultiplexer, Quad};
use crate::error::ConnError;
use crate::receiver::Receiver;
use crate::segment::{seq_lt, Flags, Segment};
use crate::sender::Sender;
use crate::socket::DatagramSender;
use crate::state::ConnectionState;
use crate::timer::{Expiry, TimerHandle, TimerPurpose, TimerService, TimerTarget};

/// Point-in-time view of a connection, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub local_port: u16,
    pub peer: Option<SocketAddr>,
    pub peer_port: u16,
    pub isn: u32,
    pub next_seq: u32,
    pub expected_seq: u32,
    /// Sequence numbers of unacknowledged segments.
    pub outstanding: Vec<u32>,
    pub send_buffered: usize,
    pub recv_buffered: usize,
    pub close_requested: bool,
}

struct Inner {
    state: ConnectionState,
    /// Set once connect/accept has started; a fresh socket is `false`.
    opened: bool,
    local_port: u16,
    peer: Option<SocketAddr>,
    peer_port: u16,
    isn: u32,
    tx: Sender,
    rx: Receiver,
    /// Application asked to close; FIN goes out when possible.
    close_requested: bool,
    /// Sequence number of our FIN once sent.
    fin_seq: Option<u32>,
    time_wait: Option<TimerHandle>,
    /// A failure raised by the segment path for the opening caller.
    error: Option<ConnError>,
}

impl Inner {
    fn quad(&self) -> Option<Quad> {
        self.peer.map(|peer| Quad {
            peer,
            local_port: self.local_port,
            peer_port: self.peer_port,
        })
    }
}

/// One endpoint of a reliable connection.
pub struct Connection {
    demux: Arc<dyn Demultiplexer>,
    net: Arc<dyn DatagramSender>,
    timers: Arc<TimerService>,
    config: ProtocolConfig,
    inner: Mutex<Inner>,
    changed: Notify,
    this: Weak<Connection>,
}

impl Connection {
    /// Create a connection in [`ConnectionState::Closed`].
    pub fn new(
        demux: Arc<dyn Demultiplexer>,
        net: Arc<dyn DatagramSender>,
        timers: Arc<TimerService>,
        config: ProtocolConfig,
    ) -> Arc<Self> {
        let window = config.window;
        Arc::new_cyclic(|this| Self {
            demux,
            net,
            timers,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                opened: false,
                local_port: 0,
                peer: None,
                peer_port: 0,
                isn: 0,
                tx: Sender::new(0, window),
                rx: Receiver::new(),
                close_requested: false,
                fin_seq: None,
                time_wait: None,
                error: None,
            }),
            changed: Notify::new(),
            this: this.clone(),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let st = self.inner.lock().await;
        ConnectionSnapshot {
            state: st.state,
            local_port: st.local_port,
            peer: st.peer,
            peer_port: st.peer_port,
            isn: st.isn,
            next_seq: st.tx.next_seq,
            expected_seq: st.rx.expected_seq,
            outstanding: st.tx.outstanding_seqs(),
            send_buffered: st.tx.send_buffer.len(),
            recv_buffered: st.rx.available(),
            close_requested: st.close_requested,
        }
    }

    // -----------------------------------------------------------------------
    // Application entry points
    // -----------------------------------------------------------------------

    /// Active open: send SYN to `peer_port` at `peer` and wait for the
    /// handshake to complete.
    ///
    /// The SYN is retransmitted every RTO until answered.
    pub async fn connect(&self, peer: SocketAddr, peer_port: u16) -> Result<(), ConnError> {
        {
            let mut st = self.inner.lock().await;
            if st.opened {
                return Err(ConnError::BadState(st.state));
            }
            let this = self.strong()?;
            let local_port = self.demux.next_available_port()?;
            let quad = Quad {
                peer,
                local_port,
                peer_port,
            };
            self.demux.register_connection(quad, this)?;

            st.opened = true;
            st.local_port = local_port;
            st.peer = Some(peer);
            st.peer_port = peer_port;
            st.isn = self.config.pick_client_isn();
            st.tx = Sender::new(st.isn, self.config.window);

            let syn = self.segment(&st, Flags::SYN, Vec::new());
            self.transmit_tracked(&mut st, syn);
            self.transition(&mut st, ConnectionState::SynSent);
        }
        self.wait_until_synchronized().await
    }

    /// Passive open on `local_port`: register as a listener and wait for a
    /// peer to complete the handshake.
    pub async fn accept(&self, local_port: u16) -> Result<(), ConnError> {
        {
            let mut st = self.inner.lock().await;
            if st.opened {
                return Err(ConnError::BadState(st.state));
            }
            let this = self.strong()?;
            self.demux.register_listening_socket(local_port, this)?;

            st.opened = true;
            st.local_port = local_port;
            st.isn = self.config.pick_server_isn();
            st.tx = Sender::new(st.isn, self.config.window);
            self.transition(&mut st, ConnectionState::Listen);
        }
        self.wait_until_synchronized().await
    }

    /// Queue `data` for sending and push it onto the wire.
    ///
    /// Bytes are accepted into the send buffer at once and cut into MSS-sized
    /// segments as the window allows.  Returns after every buffered byte has
    /// been transmitted once.  Waits for the handshake if it is still in
    /// progress.
    ///
    /// Segmentation is driven by the connection, not by this future: if the
    /// caller stops waiting, accepted bytes still go out as ACKs open the
    /// window.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.wait_for(|st| {
            if st.close_requested || st.fin_seq.is_some() {
                return Some(Err(ConnError::Closed));
            }
            match st.state {
                ConnectionState::Established | ConnectionState::CloseWait => {
                    st.tx.send_buffer.append(data);
                    self.after_event(st);
                    Some(Ok(()))
                }
                s if s.is_opening() => None,
                s => Some(Err(ConnError::BadState(s))),
            }
        })
        .await?;

        self.wait_for(|st| {
            if st.tx.send_buffer.is_empty() {
                Some(Ok(data.len()))
            } else if !st.state.is_closable() {
                Some(Err(ConnError::BadState(st.state)))
            } else {
                None
            }
        })
        .await
    }

    /// Read up to `buf.len()` in-order bytes from the peer.
    ///
    /// Waits while nothing is buffered.  Returns `Ok(0)` only once the
    /// stream is terminating: the peer sent FIN, the local side called
    /// [`close`](Self::close), or the connection is closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait_for(|st| {
            if st.rx.available() > 0 {
                return Some(Ok(st.rx.read(buf)));
            }
            if !st.opened {
                return Some(Err(ConnError::BadState(st.state)));
            }
            if st.close_requested
                || st.state.peer_finished()
                || st.state == ConnectionState::Closed
            {
                return Some(Ok(0));
            }
            None
        })
        .await
    }

    /// Read until the stream terminates.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, ConnError> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; self.config.mss.max(1)];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Begin closing the local half of the connection.
    ///
    /// Sends FIN right away from ESTABLISHED or CLOSE_WAIT once every
    /// buffered byte is on the wire; otherwise the request is deferred and
    /// honoured by a later event.  Never waits for the peer.
    pub async fn close(&self) -> Result<(), ConnError> {
        let mut st = self.inner.lock().await;
        log::debug!("[conn :{}] close() in {}", st.local_port, st.state);
        if !st.opened {
            return Ok(());
        }
        if st.fin_seq.is_some() {
            return Ok(());
        }
        st.close_requested = true;
        if !st.state.is_closable() || !st.tx.send_buffer.is_empty() {
            log::debug!("[conn :{}] deferring close in {}", st.local_port, st.state);
        }
        self.after_event(&mut st);
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Network and timer entry points
    // -----------------------------------------------------------------------

    /// Deliver one inbound segment that arrived from datagram address `from`.
    pub async fn receive_segment(&self, segment: Segment, from: SocketAddr) {
        let mut st = self.inner.lock().await;
        log::debug!("[conn :{}] <- {} in {}", st.local_port, segment, st.state);
        if st.state != ConnectionState::Closed {
            st.tx.set_peer_window(segment.window);
        }
        self.on_segment(&mut st, segment, from);
        self.after_event(&mut st);
        drop(st);
        self.changed.notify_waiters();
    }

    /// Timer-expiry callback invoked by the [`TimerService`].
    pub async fn handle_timer(&self, expiry: Expiry) {
        let mut st = self.inner.lock().await;
        match expiry.purpose {
            TimerPurpose::Retransmit(seq) => {
                let Some(segment) = st.tx.due_for_retransmit(&expiry).cloned() else {
                    log::trace!("[conn :{}] stale retransmit timer for seq={seq}", st.local_port);
                    return;
                };
                log::debug!(
                    "[conn :{}] timeout, resending {} (attempt {})",
                    st.local_port,
                    segment,
                    st.tx.tx_count(seq) + 1
                );
                self.emit(&st, &segment);
                let timer = self.arm(TimerPurpose::Retransmit(seq), self.config.rto);
                st.tx.on_retransmit(seq, timer);
            }
            TimerPurpose::TimeWait => {
                let current = st.time_wait.as_ref().is_some_and(|h| h.matches(&expiry));
                if st.state != ConnectionState::TimeWait || !current {
                    log::trace!("[conn :{}] stale TIME_WAIT timer", st.local_port);
                    return;
                }
                st.time_wait = None;
                st.tx.clear();
                self.deregister(&st);
                self.transition(&mut st, ConnectionState::Closed);
            }
        }
        self.after_event(&mut st);
        drop(st);
        self.changed.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Segment handling
    // -----------------------------------------------------------------------

    fn on_segment(&self, st: &mut Inner, segment: Segment, from: SocketAddr) {
        match st.state {
            ConnectionState::Closed => self.ignore(st, &segment),
            ConnectionState::Listen => {
                if segment.is_bare_syn() {
                    self.on_listen_syn(st, &segment, from);
                } else {
                    self.ignore(st, &segment);
                }
            }
            ConnectionState::SynSent => {
                if segment.flags == Flags::SYN_ACK && segment.ack == st.isn.wrapping_add(1) {
                    st.tx.on_ack(segment.ack);
                    st.rx.on_syn(segment.seq);
                    self.send_ack(st);
                    self.transition(st, ConnectionState::Established);
                } else {
                    self.ignore(st, &segment);
                }
            }
            ConnectionState::SynReceived => {
                if segment.is_bare_syn() && segment.seq.wrapping_add(1) == st.rx.expected_seq {
                    // Our SYN+ACK was lost or is late; answer the retransmitted SYN.
                    if let Some(synack) = st.tx.outstanding(st.isn).cloned() {
                        log::debug!("[conn :{}] duplicate SYN, resending SYN+ACK", st.local_port);
                        self.emit(st, &synack);
                    }
                } else if segment.flags.ack
                    && !segment.flags.syn
                    && segment.ack == st.isn.wrapping_add(1)
                {
                    st.tx.on_ack(segment.ack);
                    self.transition(st, ConnectionState::Established);
                    if !segment.is_pure_ack() {
                        self.on_synchronized(st, &segment);
                    }
                } else {
                    self.ignore(st, &segment);
                }
            }
            _ => self.on_synchronized(st, &segment),
        }
    }

    fn on_listen_syn(&self, st: &mut Inner, syn: &Segment, from: SocketAddr) {
        let quad = Quad {
            peer: from,
            local_port: st.local_port,
            peer_port: syn.source_port,
        };
        let promoted = self
            .strong()
            .and_then(|this| self.demux.promote_listener(quad, &this).map_err(ConnError::from));
        if let Err(e) = promoted {
            log::warn!("[conn :{}] cannot accept SYN from {from}: {e}", st.local_port);
            if let Ok(this) = self.strong() {
                if let Err(e) = self.demux.unregister_listening_socket(st.local_port, &this) {
                    log::warn!("[conn :{}] listener deregistration failed: {e}", st.local_port);
                }
            }
            st.error = Some(e);
            self.transition(st, ConnectionState::Closed);
            return;
        }

        st.peer = Some(from);
        st.peer_port = syn.source_port;
        st.rx.on_syn(syn.seq);
        let synack = self.segment(st, Flags::SYN_ACK, Vec::new());
        self.transmit_tracked(st, synack);
        self.transition(st, ConnectionState::SynReceived);
    }

    /// Handling shared by every state after the handshake.
    fn on_synchronized(&self, st: &mut Inner, segment: &Segment) {
        if segment.flags.syn {
            if segment.flags.ack {
                // Peer still in SYN_RCVD: our handshake ACK was lost.
                log::debug!("[conn :{}] duplicate SYN+ACK, re-acknowledging", st.local_port);
                self.send_ack(st);
            } else {
                self.ignore(st, segment);
            }
            return;
        }

        if segment.flags.ack {
            self.on_ack(st, segment.ack);
        }

        if segment.flags.fin {
            self.on_fin(st, segment);
        } else if segment.is_data() {
            self.on_data(st, segment);
        } else if !segment.payload.is_empty() {
            log::warn!(
                "[conn :{}] discarding payload on {} segment",
                st.local_port,
                segment.flags
            );
        }
    }

    fn on_ack(&self, st: &mut Inner, ack: u32) {
        let removed = st.tx.on_ack(ack);
        if removed > 0 {
            log::debug!(
                "[conn :{}] ack={ack} cleared {removed} segment(s), {} in flight",
                st.local_port,
                st.tx.in_flight()
            );
        }

        let fin_acked = st.fin_seq.is_some_and(|fin| seq_lt(fin, ack));
        if !fin_acked || !st.state.awaiting_fin_ack() {
            return;
        }
        match st.state {
            ConnectionState::FinWait1 => self.transition(st, ConnectionState::FinWait2),
            ConnectionState::Closing | ConnectionState::LastAck => self.enter_time_wait(st),
            _ => {}
        }
    }

    fn on_fin(&self, st: &mut Inner, fin: &Segment) {
        if !st.rx.on_fin(fin.seq) {
            log::debug!(
                "[conn :{}] FIN seq={} but expecting {}, re-acknowledging",
                st.local_port,
                fin.seq,
                st.rx.expected_seq
            );
            self.send_ack(st);
            if st.state == ConnectionState::TimeWait {
                self.enter_time_wait(st);
            }
            return;
        }

        self.send_ack(st);
        match st.state {
            ConnectionState::Established => self.transition(st, ConnectionState::CloseWait),
            ConnectionState::FinWait1 => self.transition(st, ConnectionState::Closing),
            ConnectionState::FinWait2 => self.enter_time_wait(st),
            other => log::warn!("[conn :{}] in-order FIN in {other}", st.local_port),
        }
    }

    fn on_data(&self, st: &mut Inner, segment: &Segment) {
        if st.state.accepts_data() && st.rx.on_segment(segment.seq, &segment.payload) {
            log::debug!(
                "[conn :{}] accepted {} byte(s), expecting {}",
                st.local_port,
                segment.payload.len(),
                st.rx.expected_seq
            );
        } else {
            log::debug!(
                "[conn :{}] data seq={} not expected ({}), re-acknowledging",
                st.local_port,
                segment.seq,
                st.rx.expected_seq
            );
        }
        self.send_ack(st);
    }

    fn ignore(&self, st: &Inner, segment: &Segment) {
        log::warn!("[conn :{}] ignoring {} in {}", st.local_port, segment, st.state);
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn transition(&self, st: &mut Inner, next: ConnectionState) {
        if st.state != next {
            log::debug!("[conn :{}] {} -> {}", st.local_port, st.state, next);
            st.state = next;
        }
    }

    /// Enter (or re-enter) TIME_WAIT and (re)start its timer.
    fn enter_time_wait(&self, st: &mut Inner) {
        if let Some(old) = st.time_wait.take() {
            old.cancel();
        }
        self.transition(st, ConnectionState::TimeWait);
        st.time_wait = Some(self.arm(TimerPurpose::TimeWait, self.config.time_wait));
    }

    /// Post-event check: push buffered data into the window, then send a
    /// deferred FIN once nothing stands in its way.
    fn after_event(&self, st: &mut Inner) {
        if let Err(e) = self.flush(st) {
            log::warn!(
                "[conn :{}] {} byte(s) stranded: {e}",
                st.local_port,
                st.tx.send_buffer.len()
            );
        }
        if !st.close_requested
            || st.fin_seq.is_some()
            || !st.state.is_closable()
            || !st.tx.send_buffer.is_empty()
            || !st.tx.can_send()
        {
            return;
        }
        let fin = self.segment(st, Flags::FIN, Vec::new());
        st.fin_seq = Some(fin.seq);
        self.transmit_tracked(st, fin);
        let next = if st.state == ConnectionState::Established {
            ConnectionState::FinWait1
        } else {
            ConnectionState::LastAck
        };
        self.transition(st, next);
    }

    /// Segment as much of the send buffer as the window allows.
    fn flush(&self, st: &mut Inner) -> Result<(), ConnError> {
        while !st.tx.send_buffer.is_empty() {
            if !st.state.is_closable() {
                return Err(ConnError::BadState(st.state));
            }
            if !st.tx.can_send() {
                return Ok(());
            }
            let chunk = st.tx.send_buffer.take(self.config.mss.max(1));
            let segment = self.segment(st, Flags::NONE, chunk);
            self.transmit_tracked(st, segment);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn strong(&self) -> Result<Arc<Connection>, ConnError> {
        self.this.upgrade().ok_or(ConnError::Closed)
    }

    fn segment(&self, st: &Inner, flags: Flags, payload: Vec<u8>) -> Segment {
        Segment {
            source_port: st.local_port,
            dest_port: st.peer_port,
            seq: st.tx.next_seq,
            ack: if flags.ack { st.rx.ack_number() } else { 0 },
            flags,
            window: self.config.advertised_window(),
            payload,
        }
    }

    fn emit(&self, st: &Inner, segment: &Segment) {
        match st.peer {
            Some(peer) => {
                log::debug!("[conn :{}] -> {}", st.local_port, segment);
                self.net.send(segment, peer);
            }
            None => log::warn!("[conn :{}] no peer for {}", st.local_port, segment),
        }
    }

    fn send_ack(&self, st: &Inner) {
        let ack = self.segment(st, Flags::ACK, Vec::new());
        self.emit(st, &ack);
    }

    /// Send a segment that occupies sequence space and arm its timer.
    fn transmit_tracked(&self, st: &mut Inner, segment: Segment) {
        st.tx.consume(&segment);
        self.emit(st, &segment);
        let timer = self.arm(TimerPurpose::Retransmit(segment.seq), self.config.rto);
        st.tx.record_sent(segment, timer);
    }

    fn arm(&self, purpose: TimerPurpose, delay: std::time::Duration) -> TimerHandle {
        self.timers.schedule(delay, self.this.clone(), purpose)
    }

    fn deregister(&self, st: &Inner) {
        let (Some(quad), Ok(this)) = (st.quad(), self.strong()) else {
            return;
        };
        if let Err(e) = self.demux.unregister_connection(quad, &this) {
            log::warn!("[conn :{}] deregistration failed: {e}", st.local_port);
        }
    }

    async fn wait_until_synchronized(&self) -> Result<(), ConnError> {
        self.wait_for(|st| {
            if let Some(e) = st.error.take() {
                return Some(Err(e));
            }
            if st.state.is_synchronized() {
                return Some(Ok(()));
            }
            None
        })
        .await
    }

    /// Evaluate `check` under the lock until it yields a value, sleeping on
    /// the connection's notifier between attempts.
    async fn wait_for<T>(&self, mut check: impl FnMut(&mut Inner) -> Option<T>) -> T {
        loop {
            let mut st = self.inner.lock().await;
            if let Some(v) = check(&mut st) {
                return v;
            }
            // Registered before the lock is released so no wakeup is missed.
            let notified = self.changed.notified();
            drop(st);
            notified.await;
        }
    }
}

impl TimerTarget for Connection {
    fn on_timer(self: Arc<Self>, expiry: Expiry) -> impl Future<Output = ()> + Send {
        async move { self.handle_timer(expiry).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::PortTable;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records every segment instead of sending it.
    #[derive(Default)]
    struct Capture {
        sent: StdMutex<Vec<(Segment, SocketAddr)>>,
    }

    impl Capture {
        fn take(&self) -> Vec<Segment> {
            self.sent.lock().unwrap().drain(..).map(|(s, _)| s).collect()
        }
    }

    impl DatagramSender for Capture {
        fn send(&self, segment: &Segment, dest: SocketAddr) {
            self.sent.lock().unwrap().push((segment.clone(), dest));
        }
    }

    struct Harness {
        conn: Arc<Connection>,
        net: Arc<Capture>,
        table: Arc<PortTable>,
    }

    fn harness(config: ProtocolConfig) -> Harness {
        let table = Arc::new(PortTable::new());
        let net = Arc::new(Capture::default());
        let conn = Connection::new(
            Arc::clone(&table) as Arc<dyn Demultiplexer>,
            Arc::clone(&net) as Arc<dyn DatagramSender>,
            Arc::new(TimerService::new()),
            config,
        );
        Harness { conn, net, table }
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            client_isn: Some(100),
            server_isn: Some(10_000),
            time_wait: Duration::from_secs(5),
            ..ProtocolConfig::default()
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:7000".parse().unwrap()
    }

    const PEER_PORT: u16 = 5555;
    const LOCAL_PORT: u16 = 80;
    const PEER_ISN: u32 = 7000;

    fn from_peer(seq: u32, ack: u32, flags: Flags, payload: &[u8]) -> Segment {
        Segment {
            source_port: PEER_PORT,
            dest_port: LOCAL_PORT,
            seq,
            ack,
            flags,
            window: 8,
            payload: payload.to_vec(),
        }
    }

    /// Drive a listener on LOCAL_PORT through the handshake by hand.
    async fn established_server(h: &Harness) {
        let c = Arc::clone(&h.conn);
        let accept = tokio::spawn(async move { c.accept(LOCAL_PORT).await });
        tokio::task::yield_now().await;
        while h.conn.state().await != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_001, Flags::ACK, b""), peer())
            .await;
        accept.await.unwrap().unwrap();
        h.net.take();
    }

    #[tokio::test(start_paused = true)]
    async fn listen_syn_promotes_and_answers_synack() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let accept = tokio::spawn(async move { c.accept(LOCAL_PORT).await });
        while h.conn.state().await != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.table.listener_count(), 1);

        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        assert_eq!(h.conn.state().await, ConnectionState::SynReceived);
        assert_eq!(h.table.listener_count(), 0);
        assert_eq!(h.table.connection_count(), 1);

        let sent = h.net.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags, Flags::SYN_ACK);
        assert_eq!(sent[0].seq, 10_000);
        assert_eq!(sent[0].ack, PEER_ISN + 1);

        assert!(!accept.is_finished());
        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_001, Flags::ACK, b""), peer())
            .await;
        accept.await.unwrap().unwrap();
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.state, ConnectionState::Established);
        assert_eq!(snap.next_seq, 10_001);
        assert_eq!(snap.expected_seq, PEER_ISN + 1);
        assert!(snap.outstanding.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_syn_in_syn_rcvd_resends_synack() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let _accept = tokio::spawn(async move { c.accept(LOCAL_PORT).await });
        while h.conn.state().await != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        let first = h.net.take();

        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        let again = h.net.take();
        assert_eq!(again, first, "same SYN+ACK resent");
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.state, ConnectionState::SynReceived);
        assert_eq!(snap.outstanding, vec![10_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn syn_sent_ignores_mismatched_synack() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let connect = tokio::spawn(async move { c.connect(peer(), PEER_PORT).await });
        while h.conn.state().await != ConnectionState::SynSent {
            tokio::task::yield_now().await;
        }
        let local = h.conn.snapshot().await.local_port;
        let mut bogus = from_peer(PEER_ISN, 555, Flags::SYN_ACK, b"");
        bogus.dest_port = local;
        h.conn.receive_segment(bogus, peer()).await;
        assert_eq!(h.conn.state().await, ConnectionState::SynSent);

        let mut good = from_peer(PEER_ISN, 101, Flags::SYN_ACK, b"");
        good.dest_port = local;
        h.conn.receive_segment(good, peer()).await;
        connect.await.unwrap().unwrap();

        let sent = h.net.take();
        assert_eq!(sent[0].flags, Flags::SYN);
        assert_eq!(sent[0].seq, 100);
        let ack = sent.last().unwrap();
        assert_eq!(ack.flags, Flags::ACK);
        assert_eq!(ack.seq, 101);
        assert_eq!(ack.ack, PEER_ISN + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_syn_is_retransmitted_every_rto() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let connect = tokio::spawn(async move { c.connect(peer(), PEER_PORT).await });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let syns: Vec<_> = h.net.take();
        assert_eq!(syns.len(), 4, "first send plus three retransmissions");
        assert!(syns.iter().all(|s| s.flags == Flags::SYN && s.seq == 100));
        assert!(!connect.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn in_order_data_is_buffered_and_acked() {
        let h = harness(config());
        established_server(&h).await;

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 0, Flags::NONE, b"hello"), peer())
            .await;
        let acks = h.net.take();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack, PEER_ISN + 6);

        let mut buf = [0u8; 16];
        let n = h.conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_data_gets_duplicate_ack() {
        let h = harness(config());
        established_server(&h).await;

        h.conn
            .receive_segment(from_peer(PEER_ISN + 50, 0, Flags::NONE, b"late"), peer())
            .await;
        let acks = h.net.take();
        assert_eq!(acks[0].ack, PEER_ISN + 1, "still expecting the first byte");
        assert_eq!(h.conn.snapshot().await.recv_buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_limits_outstanding_segments() {
        let h = harness(ProtocolConfig {
            window: 2,
            mss: 10,
            ..config()
        });
        established_server(&h).await;

        let c = Arc::clone(&h.conn);
        let writer = tokio::spawn(async move { c.write(&[7u8; 35]).await });
        tokio::task::yield_now().await;
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.outstanding, vec![10_001, 10_011]);
        assert!(!writer.is_finished());

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_011, Flags::ACK, b""), peer())
            .await;
        tokio::task::yield_now().await;
        assert_eq!(h.conn.snapshot().await.outstanding, vec![10_011, 10_021]);

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_031, Flags::ACK, b""), peer())
            .await;
        assert_eq!(writer.await.unwrap().unwrap(), 35);
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.outstanding, vec![10_031]);
        assert_eq!(snap.next_seq, 10_036);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_data_drains_after_writer_is_dropped() {
        let h = harness(ProtocolConfig {
            window: 1,
            mss: 10,
            ..config()
        });
        established_server(&h).await;

        let c = Arc::clone(&h.conn);
        let writer = tokio::spawn(async move { c.write(&[1u8; 30]).await });
        while h.conn.snapshot().await.outstanding.is_empty() {
            tokio::task::yield_now().await;
        }
        writer.abort();
        assert!(writer.await.unwrap_err().is_cancelled());
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.outstanding, vec![10_001]);
        assert_eq!(snap.send_buffered, 20);

        h.conn.close().await.unwrap();
        assert_eq!(h.conn.state().await, ConnectionState::Established);

        for ack in [10_011, 10_021, 10_031] {
            h.conn
                .receive_segment(from_peer(PEER_ISN + 1, ack, Flags::ACK, b""), peer())
                .await;
        }
        let snap = h.conn.snapshot().await;
        assert_eq!(snap.send_buffered, 0);
        assert_eq!(snap.state, ConnectionState::FinWait1);
        assert_eq!(snap.outstanding, vec![10_031]);

        let sent: Vec<_> = h
            .net
            .take()
            .into_iter()
            .map(|s| (s.seq, s.flags, s.payload.len()))
            .collect();
        assert_eq!(
            sent,
            vec![
                (10_001, Flags::NONE, 10),
                (10_011, Flags::NONE, 10),
                (10_021, Flags::NONE, 10),
                (10_031, Flags::FIN, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_from_established_sends_fin() {
        let h = harness(config());
        established_server(&h).await;

        h.conn.close().await.unwrap();
        let sent = h.net.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags, Flags::FIN);
        assert_eq!(sent[0].seq, 10_001);
        assert_eq!(h.conn.state().await, ConnectionState::FinWait1);

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_002, Flags::ACK, b""), peer())
            .await;
        assert_eq!(h.conn.state().await, ConnectionState::FinWait2);

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 0, Flags::FIN, b""), peer())
            .await;
        assert_eq!(h.conn.state().await, ConnectionState::TimeWait);
        assert_eq!(h.net.take().last().unwrap().ack, PEER_ISN + 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.conn.state().await, ConnectionState::Closed);
        assert_eq!(h.table.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_fin_in_time_wait_restarts_timer() {
        let h = harness(config());
        established_server(&h).await;
        h.conn.close().await.unwrap();
        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_002, Flags::ACK, b""), peer())
            .await;
        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 0, Flags::FIN, b""), peer())
            .await;
        h.net.take();

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 0, Flags::FIN, b""), peer())
            .await;
        let reack = h.net.take();
        assert_eq!(reack.len(), 1);
        assert_eq!(reack[0].flags, Flags::ACK);
        assert_eq!(reack[0].ack, PEER_ISN + 2);

        // The original deadline (5 s after entry) passes without teardown.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.conn.state().await, ConnectionState::TimeWait);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_fin_releases_blocked_reader() {
        let h = harness(config());
        established_server(&h).await;

        let c = Arc::clone(&h.conn);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            c.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 0, Flags::FIN, b""), peer())
            .await;
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert_eq!(h.conn.state().await, ConnectionState::CloseWait);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_handshake_is_deferred() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let accept = tokio::spawn(async move { c.accept(LOCAL_PORT).await });
        while h.conn.state().await != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        h.conn.close().await.unwrap();
        assert_eq!(h.conn.state().await, ConnectionState::SynReceived);
        assert!(h.conn.snapshot().await.close_requested);
        h.net.take();

        h.conn
            .receive_segment(from_peer(PEER_ISN + 1, 10_001, Flags::ACK, b""), peer())
            .await;
        accept.await.unwrap().unwrap();
        assert_eq!(h.conn.state().await, ConnectionState::FinWait1);
        let sent = h.net.take();
        assert_eq!(sent.last().unwrap().flags, Flags::FIN);
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_close_is_rejected() {
        let h = harness(config());
        established_server(&h).await;
        h.conn.close().await.unwrap();
        assert!(matches!(h.conn.write(b"x").await, Err(ConnError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_flags_cause_no_transition() {
        let h = harness(config());
        established_server(&h).await;
        h.conn
            .receive_segment(from_peer(PEER_ISN, 0, Flags::SYN, b""), peer())
            .await;
        assert_eq!(h.conn.state().await, ConnectionState::Established);
        assert!(h.net.take().is_empty());
    }

    #[tokio::test]
    async fn second_open_is_rejected() {
        let h = harness(config());
        let c = Arc::clone(&h.conn);
        let _pending = tokio::spawn(async move { c.accept(LOCAL_PORT).await });
        while h.conn.state().await != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            h.conn.connect(peer(), PEER_PORT).await,
            Err(ConnError::BadState(ConnectionState::Listen))
        ));
    }
}
