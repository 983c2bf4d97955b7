//! Exchange protocol state machine.
//!
//! One task owns every piece of session state and performs every wire
//! write, so wire writes never interleave and decoded frames are
//! handled in strict wire order. The task selects over three inputs:
//! decoded frames from the reader, requests from client API calls, and
//! a jittered timer that paces primary handshakes.
//!
//! Protocol rules enforced here:
//!  - Symmetric handshake: a primary (`HANDSHAKE_1`) carries a session
//!    ID; the peer echoes it in a secondary (`HANDSHAKE_2`). Each end
//!    draws IDs from its own half of the ID space so simultaneous
//!    primaries are detected as a collision and retried after a random
//!    3–10 ms backoff.
//!  - One-credit flow control: a `FLOW_CONTROL` credit authorizes
//!    exactly one inbound packet; a duplicate credit is a protocol
//!    violation.
//!  - Any frame not legal in the current state resets the link to
//!    CONNECTING; blocked client calls ride the reset out and resume
//!    once the link resynchronizes.

use crate::link::codec::Encoder;
use crate::link::protocol::{CtrlSymbol, LinkFrame};
use crate::link::transport::LinkTransport;
use crate::link::types::{ExchangeState, HandshakeIdSpace, LinkError, LinkStats};
use fakewire_core::clock;
use fakewire_core::ratelimit::WarnFlag;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

/// Bounds of the randomized primary-handshake interval.
pub(crate) const HANDSHAKE_PERIOD_MIN_NS: u64 = 3_000_000;
pub(crate) const HANDSHAKE_PERIOD_MAX_NS: u64 = 10_000_000;

/// Random interval in the range [3 ms, 10 ms).
pub(crate) fn handshake_period() -> Duration {
    let ns = rand::thread_rng().gen_range(HANDSHAKE_PERIOD_MIN_NS..HANDSHAKE_PERIOD_MAX_NS);
    Duration::from_nanos(ns)
}

// ── Requests and replies ────────────────────────────────────────────────

/// A completed inbound packet. `length` is the logical packet length;
/// `data` holds at most the requested capacity, so `length >
/// data.len()` means the packet was truncated.
#[derive(Debug)]
pub(crate) struct ReceivedPacket {
    pub data: Vec<u8>,
    pub length: usize,
}

/// Requests sent from client API calls into the exchange task.
#[derive(Debug)]
pub(crate) enum ExchangeRequest {
    /// Receive one packet into a buffer of the given capacity.
    Read {
        capacity: usize,
        reply: oneshot::Sender<Result<ReceivedPacket, LinkError>>,
    },
    /// Transmit one packet.
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    /// Snapshot the session counters.
    Stats { reply: oneshot::Sender<LinkStats> },
    /// Tear the session down.
    Detach,
}

struct PendingRead {
    capacity: usize,
    reply: oneshot::Sender<Result<ReceivedPacket, LinkError>>,
}

struct PendingWrite {
    data: Vec<u8>,
    reply: oneshot::Sender<Result<(), LinkError>>,
}

/// The registered inbound buffer for the read at the head of the
/// queue. Exists from registration until END_PACKET completes the
/// read or a reset hands the request back to the queue.
struct InboundSlot {
    buf: Vec<u8>,
    capacity: usize,
    /// Logical packet length; keeps counting past `capacity`.
    length: usize,
    reply: oneshot::Sender<Result<ReceivedPacket, LinkError>>,
}

// ── Runner ──────────────────────────────────────────────────────────────

pub(crate) struct ExchangeRunner {
    label: String,
    id_space: HandshakeIdSpace,
    transport: Arc<dyn LinkTransport>,
    encoder: Encoder,
    state_tx: watch::Sender<ExchangeState>,

    state: ExchangeState,
    send_handshake_id: u32,
    /// Latched session ID from the peer's most recent primary.
    recv_handshake_id: Option<u32>,
    /// A secondary handshake is owed to the peer.
    send_secondary: bool,
    inbound: Option<InboundSlot>,
    /// A credit has been extended to the peer and not yet consumed.
    has_sent_fct: bool,
    /// One unused credit from the peer is held.
    remote_sent_fct: bool,
    /// START_PACKET received, END/ERROR not yet.
    recv_in_progress: bool,

    pending_reads: VecDeque<PendingRead>,
    pending_writes: VecDeque<PendingWrite>,

    next_handshake: Instant,
    stats: LinkStats,
    reset_flag: WarnFlag,
    detaching: bool,
}

impl ExchangeRunner {
    pub(crate) fn new(
        label: String,
        id_space: HandshakeIdSpace,
        transport: Arc<dyn LinkTransport>,
        state_tx: watch::Sender<ExchangeState>,
    ) -> Self {
        Self {
            label,
            id_space,
            transport,
            encoder: Encoder::new(),
            state_tx,
            state: ExchangeState::Connecting,
            send_handshake_id: 0,
            recv_handshake_id: None,
            send_secondary: false,
            inbound: None,
            has_sent_fct: false,
            remote_sent_fct: false,
            recv_in_progress: false,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
            next_handshake: Instant::now(),
            stats: LinkStats::default(),
            reset_flag: WarnFlag::new(),
            detaching: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<LinkFrame>,
        mut requests_rx: mpsc::Receiver<ExchangeRequest>,
    ) {
        log::info!(
            "[fakewire:{}] exchange starting on {}",
            self.label,
            self.transport.name()
        );
        self.next_handshake = Instant::now() + handshake_period();

        loop {
            if self.state == ExchangeState::Disconnected {
                break;
            }
            if let Err(err) = self.service().await {
                self.fail_session(err);
                break;
            }
            let timer_armed = matches!(
                self.state,
                ExchangeState::Connecting | ExchangeState::Handshaking
            );

            tokio::select! {
                frame = events_rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => {
                        if !self.detaching {
                            self.fail_session(LinkError::io("transport end of stream"));
                        }
                        break;
                    }
                },
                request = requests_rx.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        // Every handle is gone; end the session.
                        self.detaching = true;
                        break;
                    }
                },
                _ = sleep_until(self.next_handshake), if timer_armed => {}
            }
        }

        self.finish(events_rx).await;
    }

    // ── Outbound servicing ──────────────────────────────────────────

    /// Emit everything the current state calls for, repeating until
    /// no further action is due.
    async fn service(&mut self) -> Result<(), LinkError> {
        while self.service_pass().await? {}
        Ok(())
    }

    async fn service_pass(&mut self) -> Result<bool, LinkError> {
        match self.state {
            ExchangeState::Connecting | ExchangeState::Handshaking => {
                if self.send_secondary {
                    let id = self
                        .recv_handshake_id
                        .expect("secondary handshake owed without a latched session ID");
                    self.send_wire(|enc| enc.encode_ctrl(CtrlSymbol::Handshake2, id))
                        .await?;
                    log::debug!(
                        "[fakewire:{}] sent secondary handshake (id=0x{id:08x}); operating",
                        self.label
                    );
                    self.send_secondary = false;
                    self.set_state(ExchangeState::Operating);
                    self.reset_flag
                        .recover_info(format!("[fakewire:{}] link resynchronized", self.label));
                    self.next_handshake = Instant::now() + handshake_period();
                    Ok(true)
                } else if Instant::now() >= self.next_handshake {
                    let id = self.id_space.make_id(clock::monotonic_ns());
                    self.send_handshake_id = id;
                    self.set_state(ExchangeState::Handshaking);
                    self.send_wire(|enc| enc.encode_ctrl(CtrlSymbol::Handshake1, id))
                        .await?;
                    log::debug!(
                        "[fakewire:{}] sent primary handshake (id=0x{id:08x})",
                        self.label
                    );
                    self.next_handshake = Instant::now() + handshake_period();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            ExchangeState::Operating => {
                // The read at the head of the queue claims the inbound
                // slot.
                if self.inbound.is_none() && !self.recv_in_progress {
                    if let Some(request) = self.pending_reads.pop_front() {
                        self.inbound = Some(InboundSlot {
                            buf: Vec::new(),
                            capacity: request.capacity,
                            length: 0,
                            reply: request.reply,
                        });
                        return Ok(true);
                    }
                }
                // A registered, idle buffer earns the peer one credit.
                if self.inbound.is_some() && !self.has_sent_fct && !self.recv_in_progress {
                    self.has_sent_fct = true;
                    self.send_wire(|enc| enc.encode_ctrl(CtrlSymbol::FlowControl, 0))
                        .await?;
                    self.stats.fcts_sent += 1;
                    return Ok(true);
                }
                // One queued packet is transmitted per held credit.
                if self.remote_sent_fct {
                    if let Some(write) = self.pending_writes.pop_front() {
                        self.remote_sent_fct = false;
                        self.send_wire(|enc| {
                            enc.encode_ctrl(CtrlSymbol::StartPacket, 0);
                            enc.encode_data(&write.data);
                            enc.encode_ctrl(CtrlSymbol::EndPacket, 0);
                        })
                        .await?;
                        self.stats.pkts_sent += 1;
                        let _ = write.reply.send(Ok(()));
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ExchangeState::Disconnected => Ok(false),
        }
    }

    async fn send_wire(&mut self, build: impl FnOnce(&mut Encoder)) -> Result<(), LinkError> {
        build(&mut self.encoder);
        let bytes = self.encoder.flush();
        self.transport.write(&bytes).await?;
        self.stats.bytes_tx += bytes.len() as u64;
        Ok(())
    }

    // ── Inbound frame handling ──────────────────────────────────────

    fn on_frame(&mut self, frame: LinkFrame) {
        match frame {
            LinkFrame::Data(bytes) => self.on_data(&bytes),
            LinkFrame::Ctrl {
                symbol,
                param,
                recv_ts,
            } => self.on_ctrl(symbol, param, recv_ts),
        }
    }

    fn on_data(&mut self, bytes: &[u8]) {
        self.stats.bytes_rx += bytes.len() as u64;
        match self.state {
            ExchangeState::Disconnected => {}
            ExchangeState::Operating if self.recv_in_progress => {
                let slot = self
                    .inbound
                    .as_mut()
                    .expect("receive in progress without a registered buffer");
                let room = slot.capacity.saturating_sub(slot.buf.len());
                let take = room.min(bytes.len());
                slot.buf.extend_from_slice(&bytes[..take]);
                // The logical length keeps counting past the capacity
                // so the reader can detect truncation.
                slot.length += bytes.len();
            }
            ExchangeState::Operating => {
                self.warn_reset("data byte outside a packet");
                self.reset();
            }
            ExchangeState::Connecting | ExchangeState::Handshaking => {
                self.warn_reset("data byte during handshake");
                self.reset();
            }
        }
    }

    fn on_ctrl(&mut self, symbol: CtrlSymbol, param: u32, recv_ts: u64) {
        self.stats.last_rx_timestamp_ns = recv_ts;
        match self.state {
            ExchangeState::Disconnected => {}
            ExchangeState::Connecting => match symbol {
                CtrlSymbol::Handshake1 => {
                    log::debug!(
                        "[fakewire:{}] received primary handshake (id=0x{param:08x})",
                        self.label
                    );
                    // A newer primary supersedes any unsent secondary.
                    self.recv_handshake_id = Some(param);
                    self.send_secondary = true;
                }
                other => {
                    self.warn_reset(&format!("unexpected {other} while connecting"));
                    self.reset();
                }
            },
            ExchangeState::Handshaking => match symbol {
                CtrlSymbol::Handshake2 if param == self.send_handshake_id => {
                    log::debug!(
                        "[fakewire:{}] received matching secondary handshake (id=0x{param:08x}); operating",
                        self.label
                    );
                    self.set_state(ExchangeState::Operating);
                    self.reset_flag
                        .recover_info(format!("[fakewire:{}] link resynchronized", self.label));
                }
                CtrlSymbol::Handshake2 => {
                    self.warn_reset(&format!(
                        "mismatched secondary session ID 0x{param:08x} (expected 0x{:08x})",
                        self.send_handshake_id
                    ));
                    self.reset();
                }
                CtrlSymbol::Handshake1 => {
                    self.warn_reset("primary handshake collision");
                    self.reset();
                }
                other => {
                    self.warn_reset(&format!("unexpected {other} while handshaking"));
                    self.reset();
                }
            },
            ExchangeState::Operating => match symbol {
                CtrlSymbol::Handshake1 => {
                    self.warn_reset("primary handshake during operation");
                    self.reset();
                    self.recv_handshake_id = Some(param);
                    self.send_secondary = true;
                }
                CtrlSymbol::Handshake2 => {
                    self.warn_reset("unexpected secondary handshake during operation");
                    self.reset();
                }
                CtrlSymbol::StartPacket => {
                    if !self.has_sent_fct {
                        self.warn_reset("start-of-packet without an outstanding credit");
                        self.reset();
                    } else {
                        // The credit is consumed by the packet it
                        // authorized.
                        self.has_sent_fct = false;
                        self.recv_in_progress = true;
                    }
                }
                CtrlSymbol::EndPacket => {
                    if !self.recv_in_progress {
                        self.warn_reset("end-of-packet before start-of-packet");
                        self.reset();
                    } else {
                        self.recv_in_progress = false;
                        self.stats.pkts_rcvd += 1;
                        let slot = self
                            .inbound
                            .take()
                            .expect("receive in progress without a registered buffer");
                        let _ = slot.reply.send(Ok(ReceivedPacket {
                            data: slot.buf,
                            length: slot.length,
                        }));
                    }
                }
                CtrlSymbol::ErrorPacket => {
                    if !self.recv_in_progress {
                        self.warn_reset("error-end-of-packet before start-of-packet");
                        self.reset();
                    } else {
                        // The sender aborted; drop what accumulated
                        // and keep receiving into the same buffer.
                        let slot = self
                            .inbound
                            .as_mut()
                            .expect("receive in progress without a registered buffer");
                        slot.buf.clear();
                        slot.length = 0;
                    }
                }
                CtrlSymbol::FlowControl => {
                    if self.remote_sent_fct {
                        self.warn_reset("duplicate flow-control credit");
                        self.reset();
                    } else {
                        self.remote_sent_fct = true;
                        self.stats.fcts_rcvd += 1;
                    }
                }
                CtrlSymbol::CodecError => {
                    self.warn_reset("invalid escape sequence");
                    self.reset();
                }
            },
        }
    }

    // ── Client requests ─────────────────────────────────────────────

    fn on_request(&mut self, request: ExchangeRequest) {
        match request {
            ExchangeRequest::Read { capacity, reply } => {
                self.pending_reads.push_back(PendingRead { capacity, reply });
            }
            ExchangeRequest::Write { data, reply } => {
                self.pending_writes.push_back(PendingWrite { data, reply });
            }
            ExchangeRequest::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            ExchangeRequest::Detach => {
                log::info!("[fakewire:{}] detach requested", self.label);
                self.detaching = true;
                self.set_state(ExchangeState::Disconnected);
            }
        }
    }

    // ── State management ────────────────────────────────────────────

    /// Drop back to CONNECTING and forget all session state except
    /// `send_handshake_id`. Blocked client calls stay queued and
    /// resume after the next successful handshake.
    fn reset(&mut self) {
        self.stats.resets += 1;
        self.set_state(ExchangeState::Connecting);
        self.send_secondary = false;
        self.recv_handshake_id = None;
        self.has_sent_fct = false;
        self.remote_sent_fct = false;
        self.recv_in_progress = false;
        if let Some(slot) = self.inbound.take() {
            // The interrupted read returns to the head of the queue
            // and re-registers once the link resynchronizes.
            self.pending_reads.push_front(PendingRead {
                capacity: slot.capacity,
                reply: slot.reply,
            });
        }
    }

    fn set_state(&mut self, state: ExchangeState) {
        if self.state != state {
            log::debug!("[fakewire:{}] state {} -> {}", self.label, self.state, state);
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn warn_reset(&mut self, cause: &str) {
        self.reset_flag
            .raise_warn(format!("[fakewire:{}] {cause}; resetting link", self.label));
    }

    fn fail_session(&mut self, err: LinkError) {
        log::error!("[fakewire:{}] session failed: {err}", self.label);
        self.set_state(ExchangeState::Disconnected);
    }

    async fn finish(&mut self, mut events_rx: mpsc::Receiver<LinkFrame>) {
        self.set_state(ExchangeState::Disconnected);
        if let Some(slot) = self.inbound.take() {
            let _ = slot.reply.send(Err(LinkError::disconnected()));
        }
        for read in self.pending_reads.drain(..) {
            let _ = read.reply.send(Err(LinkError::disconnected()));
        }
        for write in self.pending_writes.drain(..) {
            let _ = write.reply.send(Err(LinkError::disconnected()));
        }

        self.transport.shutdown();
        // Wait for the reader to observe the shutdown before the
        // endpoint is released.
        while events_rx.recv().await.is_some() {}
        self.transport.close().await;
        log::info!("[fakewire:{}] exchange stopped", self.label);
    }
}
