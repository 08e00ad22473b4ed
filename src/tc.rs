//! TransmissionControl: a reliable, ordered byte stream over lossy segment
//! exchange.
//!
//! One instance per tunnelled connection. The caller side writes bytes in
//! and reads bytes out; underneath, a pump task turns the send buffer into
//! segments, retransmits what the peer has not acknowledged, coalesces
//! acknowledgements and emits keep-alives when idle. Inbound segments are
//! fed in by the transport and pass through a reorder window so the
//! delivered bytes are always a strict prefix of what the peer wrote.
//!
//! ```text
//! write() ──> send buffer ──> pump ──> outbound queue ──> transport
//! read()  <── delivered   <── reorder window <── handle_segment() <── transport
//! ```
//!
//! The pump is the only producer of outbound segments and the transport
//! task is the only caller of [`TransmissionControl::handle_segment`], so
//! neither the send nor the receive window ever has two writers.

use crate::segment::{Flags, ResetReason, Segment};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Inbound segments further than this ahead of `recv_seq` are discarded.
const RECV_WINDOW: u32 = 1 << 20;

/// Upper bound on buffered out-of-order segments.
const MAX_REORDER_SEGMENTS: usize = 1024;

/// Outbound queue depth, in segments.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcError {
    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection aborted: {0}")]
    ConnectionAborted(ResetReason),

    #[error("stream closed locally")]
    StreamClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closing,
    Terminated,
}

/// Per-connection tuning. Segment lengths are renegotiated during the
/// handshake; everything else is fixed at creation.
#[derive(Debug, Clone)]
pub struct TcConfig {
    /// Payload bytes per outbound segment.
    pub max_segment_len: usize,
    /// High-water mark for unacknowledged outbound bytes; writes block above it.
    pub send_window: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Minimum spacing between retransmission rounds.
    pub retransmission_interval: Duration,
    /// How long bytes must be outstanding before they may be retransmitted.
    pub sliding_window_wait: Duration,
    pub keep_alive_interval: Duration,
    /// Pure acknowledgements are delayed up to this long for piggybacking.
    pub ack_delay: Duration,
    /// Retransmission rounds without acknowledgement progress before reset.
    pub max_retransmissions: u32,
    pub max_lifetime: Duration,
}

impl Default for TcConfig {
    fn default() -> TcConfig {
        TcConfig {
            max_segment_len: 128,
            send_window: 8 * 1024,
            read_timeout: Duration::from_secs(25),
            write_timeout: Duration::from_secs(25),
            retransmission_interval: Duration::from_secs(1),
            sliding_window_wait: Duration::from_millis(400),
            keep_alive_interval: Duration::from_secs(5),
            ack_delay: Duration::from_millis(50),
            max_retransmissions: 12,
            max_lifetime: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    max_segment_len: usize,

    // send space: send_buf holds bytes [send_unacked, send_unacked + len)
    send_buf: VecDeque<u8>,
    send_unacked: u32,
    send_next: u32,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    unacked_since: Option<Instant>,
    next_retrans: Option<Instant>,
    retransmissions: u32,

    // handshake
    syn_payload: Vec<u8>,
    syn_ack_payload: Option<Vec<u8>>,
    pending_syn_ack: bool,
    handshake_acked: bool,

    // receive space
    recv_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    delivered: VecDeque<u8>,
    peer_fin_seq: Option<u32>,
    peer_fin: bool,

    // acknowledgement scheduling
    ack_due: Option<Instant>,
    immediate_ack: bool,
    terminate_after_ack: bool,

    pending_rst: Option<ResetReason>,
    reset_reason: ResetReason,

    last_send: Instant,
    last_recv: Instant,
    created: Instant,
    closing_since: Option<Instant>,

    keep_alives_sent: u64,
}

impl Inner {
    /// Arms the delayed-ACK timer, keeping an earlier deadline if one is set.
    fn schedule_ack(&mut self, now: Instant, delay: Duration) {
        let due = now + delay;
        match self.ack_due {
            Some(t) if t <= due => {}
            _ => self.ack_due = Some(due),
        }
    }
}

#[derive(Debug)]
pub struct TransmissionControl {
    id: u16,
    role: Role,
    cfg: TcConfig,
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
    established: Notify,
    kick: Notify,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Segment>>,
}

enum PumpStep {
    Emit(Segment),
    Wait(Duration),
    Stop,
}

impl TransmissionControl {
    /// Active open. The SYN carrying `syn_payload` is emitted and
    /// retransmitted by the pump; await [`wait_established`] before use.
    ///
    /// [`wait_established`]: TransmissionControl::wait_established
    pub fn initiate(id: u16, cfg: TcConfig, syn_payload: Vec<u8>) -> Arc<TransmissionControl> {
        let syn_len = syn_payload.len() as u32;
        let tc = Self::build(id, Role::Initiator, cfg, |inner| {
            inner.state = State::SynSent;
            inner.syn_payload = syn_payload;
            inner.send_unacked = syn_len;
            inner.send_next = syn_len;
            inner.next_retrans = Some(Instant::now());
        });
        tc
    }

    /// Passive open from a received SYN. Moves straight through SynReceived:
    /// the SYN+ACK carrying `reply_payload` is queued and the connection is
    /// considered Established once it leaves.
    pub fn accept(
        id: u16,
        cfg: TcConfig,
        syn_data_len: usize,
        reply_payload: Vec<u8>,
    ) -> Arc<TransmissionControl> {
        let reply_len = reply_payload.len() as u32;
        Self::build(id, Role::Responder, cfg, |inner| {
            inner.state = State::Established;
            inner.syn_payload = reply_payload;
            inner.pending_syn_ack = true;
            inner.recv_seq = syn_data_len as u32;
            inner.send_unacked = reply_len;
            inner.send_next = reply_len;
        })
    }

    fn build(
        id: u16,
        role: Role,
        cfg: TcConfig,
        init: impl FnOnce(&mut Inner),
    ) -> Arc<TransmissionControl> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let now = Instant::now();
        let mut inner = Inner {
            state: State::Closed,
            max_segment_len: cfg.max_segment_len,
            send_buf: VecDeque::new(),
            send_unacked: 0,
            send_next: 0,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            unacked_since: None,
            next_retrans: None,
            retransmissions: 0,
            syn_payload: Vec::new(),
            syn_ack_payload: None,
            pending_syn_ack: false,
            handshake_acked: false,
            recv_seq: 0,
            reorder: BTreeMap::new(),
            delivered: VecDeque::new(),
            peer_fin_seq: None,
            peer_fin: false,
            ack_due: None,
            immediate_ack: false,
            terminate_after_ack: false,
            pending_rst: None,
            reset_reason: ResetReason::None,
            last_send: now,
            last_recv: now,
            created: now,
            closing_since: None,
            keep_alives_sent: 0,
        };
        init(&mut inner);

        let tc = Arc::new(TransmissionControl {
            id,
            role,
            cfg,
            inner: Mutex::new(inner),
            readable: Notify::new(),
            writable: Notify::new(),
            established: Notify::new(),
            kick: Notify::new(),
            outbound_rx: tokio::sync::Mutex::new(rx),
        });
        tokio::spawn(Self::pump(Arc::clone(&tc), tx));
        tc
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == State::Terminated
    }

    pub fn reset_reason(&self) -> ResetReason {
        self.lock().reset_reason
    }

    /// SYN+ACK payload received during the handshake, if any.
    pub fn take_syn_ack_payload(&self) -> Option<Vec<u8>> {
        self.lock().syn_ack_payload.take()
    }

    /// Shrinks the per-segment payload limit after negotiation.
    pub fn set_max_segment_len(&self, len: usize) {
        let mut inner = self.lock();
        inner.max_segment_len = len.max(1);
    }

    /// Instant of the most recent inbound segment.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_recv.elapsed()
    }

    #[cfg(test)]
    pub fn keep_alives_sent(&self) -> u64 {
        self.lock().keep_alives_sent
    }

    #[cfg(test)]
    pub fn cursors(&self) -> (u32, u32, u32) {
        let inner = self.lock();
        (inner.send_unacked, inner.send_next, inner.recv_seq)
    }

    /// Empty segment acknowledging everything received so far.
    pub fn ack_segment(&self) -> Segment {
        let inner = self.lock();
        Segment::ack_only(self.id, inner.send_next, inner.recv_seq)
    }

    /// Blocks until the handshake completes or `timeout` elapses.
    pub async fn wait_established(&self, timeout: Duration) -> Result<(), TcError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let inner = self.lock();
                match inner.state {
                    State::Established | State::FinWait | State::Closing => return Ok(()),
                    State::Terminated => {
                        return Err(TcError::ConnectionAborted(inner.reset_reason))
                    }
                    _ => {}
                }
            }
            let notified = self.established.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(TcError::HandshakeTimeout),
            }
        }
    }

    /// Appends to the send stream. Blocks while the unacknowledged window is
    /// at its high-water mark and fails once no acknowledgement progress has
    /// been made for the write timeout.
    pub async fn write(&self, data: &[u8]) -> Result<usize, TcError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        let mut deadline = Instant::now() + self.cfg.write_timeout;
        while written < data.len() {
            {
                let mut inner = self.lock();
                match inner.state {
                    State::Terminated => {
                        return Err(TcError::ConnectionAborted(inner.reset_reason))
                    }
                    State::FinWait | State::Closing => return Err(TcError::StreamClosed),
                    _ => {}
                }
                if inner.fin_queued {
                    return Err(TcError::StreamClosed);
                }
                let room = self.cfg.send_window.saturating_sub(inner.send_buf.len());
                if room > 0 {
                    let n = room.min(data.len() - written);
                    inner.send_buf.extend(data[written..written + n].iter().copied());
                    written += n;
                    deadline = Instant::now() + self.cfg.write_timeout;
                    drop(inner);
                    self.kick.notify_one();
                    continue;
                }
            }
            let notified = self.writable.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(TcError::WriteTimeout),
            }
        }
        Ok(written)
    }

    /// Returns in-order bytes. `Ok(0)` signals a clean end of stream after
    /// the peer's FIN.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TcError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.cfg.read_timeout;
        loop {
            {
                let mut inner = self.lock();
                if !inner.delivered.is_empty() {
                    let n = buf.len().min(inner.delivered.len());
                    for (slot, byte) in buf.iter_mut().zip(inner.delivered.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                if inner.peer_fin {
                    return Ok(0);
                }
                if inner.state == State::Terminated {
                    return Err(TcError::ConnectionAborted(inner.reset_reason));
                }
            }
            let notified = self.readable.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(TcError::ReadTimeout),
            }
        }
    }

    /// Graceful close: queues a FIN behind any buffered data.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            match inner.state {
                State::Established => {
                    inner.state = State::FinWait;
                    inner.fin_queued = true;
                    inner.closing_since = Some(Instant::now());
                }
                State::Closed | State::SynSent | State::SynReceived => {
                    inner.reset_reason = ResetReason::Cancelled;
                    self.terminate_locked(&mut inner);
                }
                State::FinWait | State::Closing | State::Terminated => {}
            }
        }
        self.kick.notify_one();
    }

    /// Hard stop: emits a RST and tears the connection down.
    pub fn abort(&self, reason: ResetReason) {
        {
            let mut inner = self.lock();
            if inner.state == State::Terminated {
                return;
            }
            inner.reset_reason = reason;
            inner.pending_rst = Some(reason);
            self.terminate_locked(&mut inner);
        }
        self.kick.notify_one();
    }

    /// Next outbound segment, waiting at most `wait`.
    pub async fn next_outbound(&self, wait: Duration) -> Option<Segment> {
        let mut rx = self.outbound_rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(seg) => seg,
            Err(_) => None,
        }
    }

    /// Next outbound segment; `None` once the pump has shut down.
    pub async fn outbound_recv(&self) -> Option<Segment> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Feeds one verified inbound segment into the connection. Called by the
    /// transport only; segments arriving after termination are ignored.
    pub fn handle_segment(&self, seg: Segment) {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.state == State::Terminated {
            return;
        }
        inner.last_recv = now;

        if seg.flags.contains(Flags::RST) {
            inner.reset_reason = ResetReason::from_u8(seg.reason);
            self.terminate_locked(&mut inner);
            return;
        }

        if seg.flags.contains(Flags::SYN) {
            self.handle_syn_locked(&mut inner, &seg, now);
            drop(inner);
            self.kick.notify_one();
            return;
        }

        if inner.state == State::SynSent {
            // Nothing but a SYN+ACK moves the handshake forward.
            return;
        }

        if seg.flags.contains(Flags::ACK) {
            inner.handshake_acked = true;
            let buffered = inner.send_buf.len() as u32;
            let fin_extra = if inner.fin_sent { 1u32 } else { 0 };
            let advance = seg.ack.wrapping_sub(inner.send_unacked);
            if advance > 0 && advance <= buffered + fin_extra {
                let data_advance = advance.min(buffered) as usize;
                inner.send_buf.drain(..data_advance);
                inner.send_unacked = inner.send_unacked.wrapping_add(data_advance as u32);
                if advance > buffered {
                    inner.fin_acked = true;
                    inner.send_unacked = seg.ack;
                }
                let remaining = inner.send_buf.len() as u32;
                if inner.send_next.wrapping_sub(inner.send_unacked) > remaining {
                    inner.send_next = inner.send_unacked;
                }
                inner.retransmissions = 0;
                inner.next_retrans = None;
                inner.unacked_since =
                    if inner.send_buf.is_empty() && (!inner.fin_sent || inner.fin_acked) {
                        None
                    } else {
                        Some(now)
                    };
                self.writable.notify_one();
            }
        }

        if !seg.data.is_empty() {
            self.handle_data_locked(&mut inner, &seg, now);
        }

        if seg.flags.contains(Flags::FIN) {
            let fin_seq = seg.seq.wrapping_add(seg.data.len() as u32);
            inner.peer_fin_seq = Some(fin_seq);
        }
        self.consume_fin_locked(&mut inner, now);

        // Both directions shut down cleanly: flush the final ACK, then stop.
        if matches!(inner.state, State::FinWait | State::Closing)
            && inner.peer_fin
            && inner.fin_acked
        {
            inner.terminate_after_ack = true;
        }

        drop(inner);
        self.kick.notify_one();
    }

    fn handle_syn_locked(&self, inner: &mut Inner, seg: &Segment, now: Instant) {
        match inner.state {
            State::SynSent if seg.flags.contains(Flags::ACK) => {
                inner.syn_ack_payload = Some(seg.data.clone());
                inner.recv_seq = seg.seq.wrapping_add(seg.data.len() as u32);
                inner.send_unacked = seg.ack;
                inner.send_next = seg.ack;
                inner.state = State::Established;
                inner.retransmissions = 0;
                inner.next_retrans = None;
                inner.unacked_since = None;
                inner.ack_due = Some(now);
                self.established.notify_one();
            }
            State::Established | State::FinWait | State::Closing => {
                // Retransmitted SYN. Re-announce until the peer has proven it
                // heard us; afterwards it is stale and only worth an ACK.
                if self.role == Role::Responder && !inner.handshake_acked {
                    inner.pending_syn_ack = true;
                } else {
                    inner.immediate_ack = true;
                }
            }
            _ => {}
        }
    }

    fn handle_data_locked(&self, inner: &mut Inner, seg: &Segment, now: Instant) {
        let len = seg.data.len() as u32;
        let ahead = seg.seq.wrapping_sub(inner.recv_seq);

        if ahead == 0 {
            inner.delivered.extend(seg.data.iter().copied());
            inner.recv_seq = inner.recv_seq.wrapping_add(len);
            self.drain_reorder_locked(inner);
            inner.schedule_ack(now, self.cfg.ack_delay);
            self.readable.notify_one();
        } else if ahead < RECV_WINDOW {
            if inner.reorder.len() < MAX_REORDER_SEGMENTS {
                inner.reorder.insert(seg.seq, seg.data.clone());
            }
            inner.schedule_ack(now, self.cfg.ack_delay);
        } else {
            // Behind the cursor: duplicate, or a rewound segment whose tail
            // is new.
            let behind = inner.recv_seq.wrapping_sub(seg.seq);
            if behind < len {
                inner
                    .delivered
                    .extend(seg.data[behind as usize..].iter().copied());
                inner.recv_seq = inner.recv_seq.wrapping_add(len - behind);
                self.drain_reorder_locked(inner);
                inner.schedule_ack(now, self.cfg.ack_delay);
                self.readable.notify_one();
            } else {
                inner.immediate_ack = true;
            }
        }
    }

    fn drain_reorder_locked(&self, inner: &mut Inner) {
        loop {
            let (&seq, _) = match inner.reorder.iter().next() {
                Some(entry) => entry,
                None => return,
            };
            let ahead = seq.wrapping_sub(inner.recv_seq);
            if ahead == 0 {
                if let Some(data) = inner.reorder.remove(&seq) {
                    inner.recv_seq = inner.recv_seq.wrapping_add(data.len() as u32);
                    inner.delivered.extend(data);
                }
            } else if ahead >= RECV_WINDOW {
                // Fully or partially behind the cursor after earlier progress.
                if let Some(data) = inner.reorder.remove(&seq) {
                    let behind = inner.recv_seq.wrapping_sub(seq) as usize;
                    if behind < data.len() {
                        inner.recv_seq =
                            inner.recv_seq.wrapping_add((data.len() - behind) as u32);
                        inner.delivered.extend(data[behind..].iter().copied());
                    }
                }
            } else {
                return;
            }
        }
    }

    fn consume_fin_locked(&self, inner: &mut Inner, now: Instant) {
        let fin_seq = match inner.peer_fin_seq {
            Some(seq) if !inner.peer_fin => seq,
            _ => return,
        };
        if inner.recv_seq != fin_seq {
            return;
        }
        inner.peer_fin = true;
        inner.recv_seq = fin_seq.wrapping_add(1);
        inner.immediate_ack = true;
        self.readable.notify_one();
        match inner.state {
            State::Established => {
                inner.state = State::Closing;
                inner.fin_queued = true;
                inner.closing_since = Some(now);
            }
            State::FinWait => {
                inner.state = State::Closing;
                if inner.closing_since.is_none() {
                    inner.closing_since = Some(now);
                }
            }
            _ => {}
        }
    }

    fn terminate_locked(&self, inner: &mut Inner) {
        inner.state = State::Terminated;
        self.readable.notify_one();
        self.writable.notify_one();
        self.established.notify_one();
        self.kick.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pump(tc: Arc<TransmissionControl>, tx: mpsc::Sender<Segment>) {
        loop {
            let step = tc.next_step(Instant::now());
            match step {
                PumpStep::Emit(seg) => {
                    let send = tx.send(seg);
                    tokio::pin!(send);
                    loop {
                        tokio::select! {
                            res = &mut send => {
                                if res.is_err() {
                                    return;
                                }
                                break;
                            }
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                                // Queue full and nobody polling; give up once
                                // the connection is gone.
                                if tc.lock().state == State::Terminated {
                                    return;
                                }
                            }
                        }
                    }
                }
                PumpStep::Wait(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = tc.kick.notified() => {}
                    }
                }
                PumpStep::Stop => return,
            }
        }
    }

    fn next_step(&self, now: Instant) -> PumpStep {
        let mut inner = self.lock();

        if let Some(reason) = inner.pending_rst.take() {
            return PumpStep::Emit(Segment::rst(self.id, reason));
        }
        if inner.state == State::Terminated {
            return PumpStep::Stop;
        }

        if now.duration_since(inner.created) >= self.cfg.max_lifetime {
            log::debug!("tc {:04x}: lifetime expired", self.id);
            inner.reset_reason = ResetReason::LifetimeExpired;
            inner.pending_rst = Some(ResetReason::LifetimeExpired);
            self.terminate_locked(&mut inner);
            return PumpStep::Wait(Duration::ZERO);
        }

        if inner.state == State::SynSent {
            return self.next_syn_step(&mut inner, now);
        }

        let closing_grace = self.cfg.retransmission_interval * 2 + self.cfg.ack_delay;
        if let Some(since) = inner.closing_since {
            if now.duration_since(since) >= closing_grace * 4 {
                self.terminate_locked(&mut inner);
                return PumpStep::Stop;
            }
        }

        if inner.pending_syn_ack {
            inner.pending_syn_ack = false;
            inner.last_send = now;
            inner.ack_due = None;
            let seg = Segment::new(
                self.id,
                0,
                inner.recv_seq,
                Flags::SYN | Flags::ACK | Flags::CONFIG_ECHO,
                inner.syn_payload.clone(),
            );
            return PumpStep::Emit(seg);
        }

        if inner.immediate_ack {
            inner.immediate_ack = false;
            inner.ack_due = None;
            inner.last_send = now;
            return PumpStep::Emit(Segment::ack_only(self.id, inner.send_next, inner.recv_seq));
        }

        if inner.terminate_after_ack {
            self.terminate_locked(&mut inner);
            return PumpStep::Stop;
        }

        // Retransmission: rewind once bytes have been outstanding long
        // enough, at most once per interval, within the retry budget.
        let outstanding = !inner.send_buf.is_empty() || (inner.fin_sent && !inner.fin_acked);
        if outstanding {
            let aged = inner
                .unacked_since
                .map(|t| now.duration_since(t) >= self.cfg.sliding_window_wait)
                .unwrap_or(false);
            let spaced = inner.next_retrans.map(|t| now >= t).unwrap_or(true);
            if aged && spaced && inner.send_next == inner.send_unacked.wrapping_add(inner.send_buf.len() as u32) && inner.fin_sent == inner.fin_queued {
                if inner.retransmissions >= self.cfg.max_retransmissions {
                    log::debug!("tc {:04x}: retransmission budget exhausted", self.id);
                    inner.reset_reason = ResetReason::RetryExhausted;
                    inner.pending_rst = Some(ResetReason::RetryExhausted);
                    self.terminate_locked(&mut inner);
                    return PumpStep::Wait(Duration::ZERO);
                }
                inner.retransmissions += 1;
                inner.next_retrans = Some(now + self.cfg.retransmission_interval);
                inner.send_next = inner.send_unacked;
                inner.fin_sent = false;
            }
        }

        // Fresh or rewound data.
        if matches!(
            inner.state,
            State::Established | State::FinWait | State::Closing
        ) {
            let buffered = inner.send_buf.len() as u32;
            let tail = inner.send_unacked.wrapping_add(buffered);
            if inner.send_next != tail {
                let offset = inner.send_next.wrapping_sub(inner.send_unacked) as usize;
                let n = inner
                    .max_segment_len
                    .min(inner.send_buf.len() - offset);
                let data: Vec<u8> = inner
                    .send_buf
                    .iter()
                    .skip(offset)
                    .take(n)
                    .copied()
                    .collect();
                let seg = Segment::new(
                    self.id,
                    inner.send_next,
                    inner.recv_seq,
                    Flags::ACK,
                    data,
                );
                inner.send_next = inner.send_next.wrapping_add(n as u32);
                if inner.unacked_since.is_none() {
                    inner.unacked_since = Some(now);
                }
                if inner.next_retrans.is_none() {
                    inner.next_retrans = Some(now + self.cfg.retransmission_interval);
                }
                inner.last_send = now;
                inner.ack_due = None;
                return PumpStep::Emit(seg);
            }

            if inner.fin_queued && !inner.fin_sent {
                inner.fin_sent = true;
                if inner.unacked_since.is_none() {
                    inner.unacked_since = Some(now);
                }
                if inner.next_retrans.is_none() {
                    inner.next_retrans = Some(now + self.cfg.retransmission_interval);
                }
                inner.last_send = now;
                inner.ack_due = None;
                let seg = Segment::new(
                    self.id,
                    tail,
                    inner.recv_seq,
                    Flags::FIN | Flags::ACK,
                    Vec::new(),
                );
                return PumpStep::Emit(seg);
            }
        }

        if let Some(due) = inner.ack_due {
            if now >= due {
                inner.ack_due = None;
                inner.last_send = now;
                return PumpStep::Emit(Segment::ack_only(
                    self.id,
                    inner.send_next,
                    inner.recv_seq,
                ));
            }
        }

        if inner.state == State::Established
            && now.duration_since(inner.last_send) >= self.cfg.keep_alive_interval
        {
            inner.last_send = now;
            inner.keep_alives_sent += 1;
            return PumpStep::Emit(Segment::keep_alive(
                self.id,
                inner.send_next,
                inner.recv_seq,
            ));
        }

        PumpStep::Wait(self.wait_duration(&inner, now))
    }

    fn next_syn_step(&self, inner: &mut Inner, now: Instant) -> PumpStep {
        let due = inner.next_retrans.map(|t| now >= t).unwrap_or(true);
        if due {
            if inner.retransmissions >= self.cfg.max_retransmissions {
                inner.reset_reason = ResetReason::RetryExhausted;
                self.terminate_locked(inner);
                return PumpStep::Stop;
            }
            inner.retransmissions += 1;
            inner.next_retrans = Some(now + self.cfg.retransmission_interval);
            inner.last_send = now;
            return PumpStep::Emit(Segment::new(
                self.id,
                0,
                0,
                Flags::SYN,
                inner.syn_payload.clone(),
            ));
        }
        let wait = inner
            .next_retrans
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(self.cfg.retransmission_interval);
        PumpStep::Wait(wait.max(Duration::from_millis(1)))
    }

    fn wait_duration(&self, inner: &Inner, now: Instant) -> Duration {
        let mut deadline: Option<Instant> = None;
        let mut consider = |t: Instant| match deadline {
            Some(d) if d <= t => {}
            _ => deadline = Some(t),
        };

        if let Some(t) = inner.ack_due {
            consider(t);
        }
        if inner.state == State::Established {
            consider(inner.last_send + self.cfg.keep_alive_interval);
        }
        if !inner.send_buf.is_empty() || (inner.fin_sent && !inner.fin_acked) {
            if let Some(since) = inner.unacked_since {
                consider(since + self.cfg.sliding_window_wait);
            }
            if let Some(t) = inner.next_retrans {
                consider(t);
            }
        }
        if let Some(since) = inner.closing_since {
            let grace = (self.cfg.retransmission_interval * 2 + self.cfg.ack_delay) * 4;
            consider(since + grace);
        }
        consider(inner.created + self.cfg.max_lifetime);

        let wait = deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(500));
        wait.clamp(Duration::from_millis(1), Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_cfg() -> TcConfig {
        TcConfig {
            max_segment_len: 512,
            send_window: 8 * 1024,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            retransmission_interval: Duration::from_millis(30),
            sliding_window_wait: Duration::from_millis(10),
            keep_alive_interval: Duration::from_millis(500),
            ack_delay: Duration::from_millis(5),
            max_retransmissions: 200,
            max_lifetime: Duration::from_secs(60),
        }
    }

    /// Wires two connections together, dropping each segment with
    /// probability `loss`.
    fn pipe(from: Arc<TransmissionControl>, to: Arc<TransmissionControl>, loss: f64) {
        tokio::spawn(async move {
            loop {
                let seg = match from.outbound_recv().await {
                    Some(seg) => seg,
                    None => break,
                };
                if loss > 0.0 && rand::thread_rng().gen_bool(loss) {
                    continue;
                }
                to.handle_segment(seg);
            }
        });
    }

    async fn established_pair(
        cfg: TcConfig,
        loss: f64,
    ) -> (Arc<TransmissionControl>, Arc<TransmissionControl>) {
        let syn_payload = b"open-request".to_vec();
        let a = TransmissionControl::initiate(7, cfg.clone(), syn_payload.clone());
        let b = TransmissionControl::accept(7, cfg, syn_payload.len(), b"echo".to_vec());
        pipe(Arc::clone(&a), Arc::clone(&b), loss);
        pipe(Arc::clone(&b), Arc::clone(&a), loss);
        a.wait_established(Duration::from_secs(5)).await.unwrap();
        (a, b)
    }

    async fn read_exactly(tc: &TransmissionControl, want: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(want);
        let mut buf = vec![0u8; 4096];
        while out.len() < want {
            let n = tc.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides() {
        let (a, b) = established_pair(fast_cfg(), 0.0).await;
        assert_eq!(a.state(), State::Established);
        assert_eq!(b.state(), State::Established);
        assert_eq!(a.take_syn_ack_payload().unwrap(), b"echo");
    }

    #[tokio::test]
    async fn byte_stream_equivalence() {
        let (a, b) = established_pair(fast_cfg(), 0.0).await;
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();

        let writer = {
            let a = Arc::clone(&a);
            let payload = payload.clone();
            tokio::spawn(async move {
                for chunk in payload.chunks(1500) {
                    a.write(chunk).await.unwrap();
                }
            })
        };

        let got = read_exactly(&b, payload.len()).await;
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn transfer_survives_lossy_link() {
        let (a, b) = established_pair(fast_cfg(), 0.4).await;
        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();

        let writer = {
            let a = Arc::clone(&a);
            let payload = payload.clone();
            tokio::spawn(async move {
                for chunk in payload.chunks(2048) {
                    a.write(chunk).await.unwrap();
                }
            })
        };

        let got = read_exactly(&b, payload.len()).await;
        writer.await.unwrap();
        assert_eq!(got.len(), payload.len());
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn duplicate_segments_are_idempotent() {
        let cfg = fast_cfg();
        let b = TransmissionControl::accept(3, cfg, 4, b"ok".to_vec());
        // Swallow outbound traffic.
        {
            let b = Arc::clone(&b);
            tokio::spawn(async move { while b.outbound_recv().await.is_some() {} });
        }

        let seg = Segment::new(3, 4, 2, Flags::ACK, b"abcdef".to_vec());
        b.handle_segment(seg.clone());
        b.handle_segment(seg.clone());
        b.handle_segment(seg);

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcdef");
        let (_, _, recv_seq) = b.cursors();
        assert_eq!(recv_seq, 10);

        // Nothing further buffered.
        let empty = tokio::time::timeout(Duration::from_millis(100), b.read(&mut buf)).await;
        assert!(empty.is_err(), "duplicate delivered twice");
    }

    #[tokio::test]
    async fn out_of_order_segments_are_reordered() {
        let cfg = fast_cfg();
        let b = TransmissionControl::accept(5, cfg, 0, Vec::new());
        {
            let b = Arc::clone(&b);
            tokio::spawn(async move { while b.outbound_recv().await.is_some() {} });
        }

        b.handle_segment(Segment::new(5, 3, 0, Flags::ACK, b"def".to_vec()));
        b.handle_segment(Segment::new(5, 6, 0, Flags::ACK, b"ghi".to_vec()));
        b.handle_segment(Segment::new(5, 0, 0, Flags::ACK, b"abc".to_vec()));

        let got = read_exactly(&b, 9).await;
        assert_eq!(got, b"abcdefghi");
    }

    #[tokio::test]
    async fn repeated_syn_leaves_connection_undisturbed() {
        let (a, b) = established_pair(fast_cfg(), 0.0).await;
        a.write(b"before").await.unwrap();
        assert_eq!(read_exactly(&b, 6).await, b"before");

        let cursors = b.cursors();
        for _ in 0..10 {
            b.handle_segment(Segment::new(7, 0, 0, Flags::SYN, b"open-request".to_vec()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state(), State::Established);
        assert_eq!(b.cursors(), cursors);

        a.write(b" after").await.unwrap();
        assert_eq!(read_exactly(&b, 6).await, b" after");
    }

    #[tokio::test]
    async fn pure_acks_are_coalesced() {
        let cfg = TcConfig {
            ack_delay: Duration::from_millis(40),
            ..fast_cfg()
        };
        let b = TransmissionControl::accept(8, cfg, 0, Vec::new());
        let acks = Arc::new(AtomicUsize::new(0));
        {
            let b = Arc::clone(&b);
            let acks = Arc::clone(&acks);
            tokio::spawn(async move {
                while let Some(seg) = b.outbound_recv().await {
                    let pure_ack = seg.flags.contains(Flags::ACK)
                        && !seg.flags.contains(Flags::SYN)
                        && !seg.flags.contains(Flags::KEEP_ALIVE)
                        && seg.data.is_empty();
                    if pure_ack {
                        acks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        // Several in-order segments in one ack-delay window.
        for i in 0..5u32 {
            b.handle_segment(Segment::new(8, i * 4, 0, Flags::ACK, vec![0; 4]));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(acks.load(Ordering::SeqCst), 1, "acks were not coalesced");
    }

    #[tokio::test]
    async fn keep_alives_flow_when_idle() {
        let cfg = TcConfig {
            keep_alive_interval: Duration::from_millis(50),
            ..fast_cfg()
        };
        let (a, b) = established_pair(cfg, 0.0).await;
        tokio::time::sleep(Duration::from_millis(170)).await;
        assert_eq!(a.state(), State::Established);
        assert_eq!(b.state(), State::Established);
        assert!(
            a.keep_alives_sent() >= 2,
            "only {} keep-alives",
            a.keep_alives_sent()
        );
    }

    #[tokio::test]
    async fn clean_close_delivers_everything_then_eof() {
        let (a, b) = established_pair(fast_cfg(), 0.0).await;
        a.write(b"last words").await.unwrap();
        a.close();

        let got = read_exactly(&b, 10).await;
        assert_eq!(got, b"last words");
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0, "expected EOF");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(a.state(), State::Terminated);
        assert_eq!(b.state(), State::Terminated);
        assert_eq!(a.reset_reason(), ResetReason::None);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_aborts() {
        let cfg = TcConfig {
            max_retransmissions: 3,
            retransmission_interval: Duration::from_millis(20),
            sliding_window_wait: Duration::from_millis(5),
            write_timeout: Duration::from_secs(5),
            ..fast_cfg()
        };
        // Peer never answers: all outbound segments vanish.
        let a = TransmissionControl::initiate(2, cfg.clone(), b"syn".to_vec());
        {
            let a = Arc::clone(&a);
            tokio::spawn(async move { while a.outbound_recv().await.is_some() {} });
        }
        let err = a.wait_established(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            TcError::ConnectionAborted(ResetReason::RetryExhausted)
        );
    }

    #[tokio::test]
    async fn peer_rst_aborts_reads_and_writes() {
        let (a, b) = established_pair(fast_cfg(), 0.0).await;
        b.handle_segment(Segment::rst(7, ResetReason::ConnectFailed));
        assert!(b.is_terminated());

        let mut buf = [0u8; 8];
        assert_eq!(
            b.read(&mut buf).await,
            Err(TcError::ConnectionAborted(ResetReason::ConnectFailed))
        );
        assert!(matches!(
            b.write(b"x").await,
            Err(TcError::ConnectionAborted(_))
        ));
        drop(a);
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let cfg = TcConfig {
            read_timeout: Duration::from_millis(80),
            ..fast_cfg()
        };
        let (_a, b) = established_pair(cfg, 0.0).await;
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await, Err(TcError::ReadTimeout));
    }

    #[tokio::test]
    async fn write_times_out_when_window_never_opens() {
        let cfg = TcConfig {
            send_window: 16,
            write_timeout: Duration::from_millis(100),
            max_retransmissions: 10_000,
            ..fast_cfg()
        };
        let a = TransmissionControl::initiate(4, cfg.clone(), b"syn".to_vec());
        let b = TransmissionControl::accept(4, cfg, 3, Vec::new());
        // Forward only b's answers so the handshake completes; a's data
        // segments go nowhere and are never acknowledged.
        pipe(Arc::clone(&b), Arc::clone(&a), 0.0);
        {
            let a = Arc::clone(&a);
            tokio::spawn(async move { while a.outbound_recv().await.is_some() {} });
        }
        a.wait_established(Duration::from_secs(5)).await.unwrap();

        let err = a.write(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err, TcError::WriteTimeout);
    }

    #[tokio::test]
    async fn abort_emits_rst() {
        let cfg = fast_cfg();
        let a = TransmissionControl::initiate(6, cfg.clone(), b"syn".to_vec());
        let b = TransmissionControl::accept(6, cfg, 3, Vec::new());
        pipe(Arc::clone(&a), Arc::clone(&b), 0.0);
        pipe(Arc::clone(&b), Arc::clone(&a), 0.0);
        a.wait_established(Duration::from_secs(5)).await.unwrap();

        a.abort(ResetReason::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_terminated());
        assert_eq!(b.reset_reason(), ResetReason::Cancelled);
    }
}
