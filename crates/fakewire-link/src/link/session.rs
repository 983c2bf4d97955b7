//! Link session lifecycle and the packet-level client API.
//!
//! [`attach`] opens the configured transport and spawns two tasks: a
//! reader that feeds the decoder, and the exchange state machine that
//! owns the session. The returned [`LinkHandle`] exposes blocking-
//! style `read_packet` / `write_packet` calls that wait for the link
//! to reach OPERATING and ride out protocol resets transparently.

use crate::link::codec::Decoder;
use crate::link::exchange::{ExchangeRequest, ExchangeRunner};
use crate::link::protocol::LinkFrame;
use crate::link::transport::{self, LinkTransport};
use crate::link::types::{ExchangeState, LinkConfig, LinkError, LinkInfo, LinkStats};
use chrono::{DateTime, Utc};
use fakewire_core::clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Open the configured transport and start the exchange.
pub async fn attach(id: impl Into<String>, config: LinkConfig) -> Result<Arc<LinkHandle>, LinkError> {
    let transport = transport::open_transport(&config).await?;
    Ok(attach_with(id, config, transport))
}

/// Start the exchange over an already-open transport.
pub fn attach_with(
    id: impl Into<String>,
    config: LinkConfig,
    transport: Arc<dyn LinkTransport>,
) -> Arc<LinkHandle> {
    let id = id.into();
    let (events_tx, events_rx) = mpsc::channel::<LinkFrame>(256);
    let (requests_tx, requests_rx) = mpsc::channel::<ExchangeRequest>(64);
    let (state_tx, state_rx) = watch::channel(ExchangeState::Connecting);

    let reader = tokio::spawn(reader_loop(
        transport.clone(),
        events_tx,
        config.label.clone(),
        config.recv_buffer_size.max(1),
    ));
    let runner = ExchangeRunner::new(
        config.label.clone(),
        config.id_space,
        transport,
        state_tx,
    );
    let exchange = tokio::spawn(runner.run(events_rx, requests_rx));

    Arc::new(LinkHandle {
        id,
        config,
        requests_tx,
        state_rx,
        attached_at: Utc::now(),
        detached: AtomicBool::new(false),
        tasks: Mutex::new(vec![reader, exchange]),
    })
}

/// Pump transport bytes through the decoder into the exchange.
/// End-of-stream or a read error ends the task; the exchange observes
/// the closed channel.
async fn reader_loop(
    transport: Arc<dyn LinkTransport>,
    events_tx: mpsc::Sender<LinkFrame>,
    label: String,
    buf_size: usize,
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; buf_size];
    loop {
        match transport.read(&mut buf).await {
            Ok(0) => {
                log::debug!("[fakewire:{label}] transport end of stream");
                break;
            }
            Ok(n) => {
                let recv_ts = clock::monotonic_ns();
                for frame in decoder.decode(&buf[..n], recv_ts) {
                    if events_tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                log::warn!("[fakewire:{label}] transport read failed: {err}");
                break;
            }
        }
    }
}

/// Handle to a running link session.
pub struct LinkHandle {
    id: String,
    config: LinkConfig,
    requests_tx: mpsc::Sender<ExchangeRequest>,
    state_rx: watch::Receiver<ExchangeState>,
    attached_at: DateTime<Utc>,
    detached: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current exchange state.
    pub fn state(&self) -> ExchangeState {
        *self.state_rx.borrow()
    }

    /// True until `detach` is called or the session fails.
    pub fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::SeqCst) && self.state() != ExchangeState::Disconnected
    }

    /// Wait until the exchange reaches the given state.
    pub async fn wait_for_state(&self, target: ExchangeState) -> Result<(), LinkError> {
        let mut rx = self.state_rx.clone();
        let result = rx.wait_for(|state| *state == target).await;
        match result {
            Ok(_) => Ok(()),
            // A closed channel means the session is gone, which is
            // exactly the DISCONNECTED condition.
            Err(_) if target == ExchangeState::Disconnected => Ok(()),
            Err(_) => Err(LinkError::disconnected()),
        }
    }

    /// Receive one packet into `buf`.
    ///
    /// Blocks until the link is OPERATING and a packet arrives.
    /// Returns the logical packet length, which may exceed `buf.len()`:
    /// in that case the first `buf.len()` bytes are valid and the rest
    /// of the packet was discarded.
    pub async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests_tx
            .send(ExchangeRequest::Read {
                capacity: buf.len(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::disconnected())?;
        let packet = reply_rx.await.map_err(|_| LinkError::disconnected())??;

        let n = packet.data.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[..n]);
        Ok(packet.length)
    }

    /// Transmit one packet.
    ///
    /// Blocks until the link is OPERATING, a flow-control credit is
    /// held, and the framed packet has been handed to the transport.
    /// Fails only if the session ends first.
    pub async fn write_packet(&self, data: &[u8]) -> Result<(), LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests_tx
            .send(ExchangeRequest::Write {
                data: data.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::disconnected())?;
        reply_rx.await.map_err(|_| LinkError::disconnected())?
    }

    /// Snapshot the session counters.
    pub async fn stats(&self) -> Result<LinkStats, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests_tx
            .send(ExchangeRequest::Stats { reply: reply_tx })
            .await
            .map_err(|_| LinkError::disconnected())?;
        reply_rx.await.map_err(|_| LinkError::disconnected())
    }

    /// Metadata snapshot for the service layer.
    pub async fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id.clone(),
            label: self.config.label.clone(),
            path: self.config.path.clone(),
            mode: self.config.mode,
            state: self.state(),
            attached_at: self.attached_at.to_rfc3339(),
            stats: self.stats().await.unwrap_or_default(),
        }
    }

    /// Tear the session down and wait for its tasks to finish.
    /// Idempotent; pending `read_packet` / `write_packet` calls fail
    /// with a `Disconnected` error.
    pub async fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.requests_tx.send(ExchangeRequest::Detach).await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::transport::SimulatedTransport;
    use crate::link::types::{HandshakeIdSpace, LinkErrorKind};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn config(label: &str, id_space: HandshakeIdSpace) -> LinkConfig {
        LinkConfig {
            label: label.to_string(),
            id_space,
            ..Default::default()
        }
    }

    /// Two links wired back-to-back, drawing session IDs from
    /// opposite halves of the ID space.
    fn attached_pair(
        name: &str,
    ) -> (
        Arc<LinkHandle>,
        Arc<LinkHandle>,
        Arc<SimulatedTransport>,
        Arc<SimulatedTransport>,
    ) {
        let (ta, tb) = SimulatedTransport::pair(format!("{name}-a"), format!("{name}-b"));
        let a = attach_with(
            format!("{name}-a"),
            config(&format!("{name}-a"), HandshakeIdSpace::High),
            ta.clone(),
        );
        let b = attach_with(
            format!("{name}-b"),
            config(&format!("{name}-b"), HandshakeIdSpace::Low),
            tb.clone(),
        );
        (a, b, ta, tb)
    }

    async fn wait_operating(link: &LinkHandle) {
        timeout(
            Duration::from_secs(2),
            link.wait_for_state(ExchangeState::Operating),
        )
        .await
        .expect("timed out waiting for OPERATING")
        .unwrap();
    }

    #[tokio::test]
    async fn pair_reaches_operating() {
        let (a, b, ..) = attached_pair("handshake");
        wait_operating(&a).await;
        wait_operating(&b).await;
        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn packet_roundtrip() {
        let (a, b, ..) = attached_pair("roundtrip");

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let n = b.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };
        // Issued before the handshake completes; both calls wait for
        // OPERATING on their own.
        a.write_packet(&[0x48, 0x69]).await.unwrap();

        let (n, buf) = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[0x48, 0x69]);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn escaped_payload_roundtrips() {
        let (a, b, ..) = attached_pair("escape");
        let payload = [0x86u8, 0x00, 0x80, 0x7F, 0x85];

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = b.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };
        a.write_packet(&payload).await.unwrap();

        let (n, buf) = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf[..n], &payload);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn truncated_packet_reports_full_length() {
        let (a, b, ..) = attached_pair("truncation");
        let payload: Vec<u8> = (0u8..10).collect();

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = b.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };
        a.write_packet(&payload).await.unwrap();

        let (n, buf) = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..], &payload[..4]);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn empty_packet_roundtrips() {
        let (a, b, ..) = attached_pair("empty");

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                b.read_packet(&mut buf).await
            })
        };
        a.write_packet(&[]).await.unwrap();

        let n = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn sequential_packets_each_consume_one_credit() {
        let (a, b, ..) = attached_pair("sequential");

        for round in 0u8..3 {
            let reader = {
                let b = b.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 16];
                    let n = b.read_packet(&mut buf).await?;
                    Ok::<_, LinkError>((n, buf))
                })
            };
            let payload = [round, round.wrapping_add(1)];
            a.write_packet(&payload).await.unwrap();
            let (n, buf) = timeout(Duration::from_secs(2), reader)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(n, 2);
            assert_eq!(&buf[..2], &payload);
        }

        let stats_a = a.stats().await.unwrap();
        let stats_b = b.stats().await.unwrap();
        assert_eq!(stats_a.pkts_sent, 3);
        assert_eq!(stats_a.fcts_rcvd, 3);
        assert_eq!(stats_b.pkts_rcvd, 3);
        assert_eq!(stats_b.fcts_sent, 3);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn full_duplex_packets_cross() {
        let (a, b, ..) = attached_pair("duplex");

        let a_reader = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = a.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };
        let b_reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = b.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };

        a.write_packet(b"from-a").await.unwrap();
        b.write_packet(b"from-b").await.unwrap();

        let (n, buf) = timeout(Duration::from_secs(2), b_reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from-a");
        let (n, buf) = timeout(Duration::from_secs(2), a_reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from-b");

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn garbage_on_the_wire_resets_and_recovers() {
        let (a, b, ta, ..) = attached_pair("recovery");
        wait_operating(&a).await;
        wait_operating(&b).await;

        // An invalid escape sequence, as if the wire corrupted a
        // frame.
        ta.inject_rx(&[0x86, 0x00]).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let stats = a.stats().await.unwrap();
            if stats.resets >= 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no reset observed");
            sleep(Duration::from_millis(5)).await;
        }

        // The peers re-handshake on their own and packets flow again.
        wait_operating(&a).await;
        wait_operating(&b).await;

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = b.read_packet(&mut buf).await?;
                Ok::<_, LinkError>((n, buf))
            })
        };
        a.write_packet(b"recovered").await.unwrap();
        let (n, buf) = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"recovered");

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn detach_fails_pending_read() {
        let (a, b, ..) = attached_pair("detach-read");
        wait_operating(&b).await;

        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                b.read_packet(&mut buf).await
            })
        };
        sleep(Duration::from_millis(20)).await;
        b.detach().await;

        let result = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::Disconnected);

        a.detach().await;
    }

    #[tokio::test]
    async fn detach_is_idempotent_and_fails_later_calls() {
        let (a, b, ..) = attached_pair("detach-twice");
        a.detach().await;
        a.detach().await;
        assert!(!a.is_attached());
        assert_eq!(a.state(), ExchangeState::Disconnected);

        let err = a.write_packet(b"late").await.unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::Disconnected);
        let err = a.stats().await.unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::Disconnected);

        b.detach().await;
    }

    #[tokio::test]
    async fn peer_close_disconnects_the_other_end() {
        let (a, b, ..) = attached_pair("peer-close");
        wait_operating(&a).await;
        wait_operating(&b).await;

        a.detach().await;
        timeout(
            Duration::from_secs(2),
            b.wait_for_state(ExchangeState::Disconnected),
        )
        .await
        .expect("peer end never disconnected")
        .unwrap();

        let mut buf = [0u8; 8];
        let err = b.read_packet(&mut buf).await.unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::Disconnected);

        b.detach().await;
    }

    #[tokio::test]
    async fn info_snapshot_reflects_session() {
        let (a, b, ..) = attached_pair("info");
        wait_operating(&a).await;

        let info = a.info().await;
        assert_eq!(info.id, "info-a");
        assert_eq!(info.label, "info-a");
        assert_eq!(info.state, ExchangeState::Operating);
        assert!(!info.attached_at.is_empty());

        a.detach().await;
        b.detach().await;
    }
}
