//! Byte transports underneath the link layer.
//!
//! The exchange only needs blocking read/write of raw byte buffers
//! plus a shutdown signal that unblocks a pending read with
//! end-of-stream. Everything device-specific lives behind the
//! [`LinkTransport`] trait: serial ports, paravirtual consoles, FIFO
//! pairs for host testing, and a fully in-memory transport for unit
//! tests.

use crate::link::types::{LinkConfig, LinkError, LinkMode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

/// Transport read chunk / poll interval used by blocking back-ends.
const READ_POLL_MS: u64 = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic byte transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks.
#[async_trait::async_trait]
pub trait LinkTransport: Send + Sync {
    /// Read up to `buf.len()` bytes into `buf`. Returns the number of
    /// bytes read; `Ok(0)` means end of stream (the peer closed, or
    /// [`shutdown`](LinkTransport::shutdown) was called).
    async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Write all bytes in `buf`.
    async fn write(&self, buf: &[u8]) -> Result<(), LinkError>;

    /// Cause a pending and all future reads to return end-of-stream.
    fn shutdown(&self);

    /// Release the underlying endpoint.
    async fn close(&self);

    /// Endpoint name for log messages.
    fn name(&self) -> &str;
}

/// Open the transport selected by `config.mode`.
pub async fn open_transport(config: &LinkConfig) -> Result<Arc<dyn LinkTransport>, LinkError> {
    match config.mode {
        LinkMode::Serial => {
            let transport = SerialPortTransport::open(&config.path, config.baud_rate)?;
            Ok(transport)
        }
        LinkMode::Virtio => {
            let transport = CharDeviceTransport::open(&config.path).await?;
            Ok(transport)
        }
        #[cfg(unix)]
        LinkMode::FifoConsumer | LinkMode::FifoProducer => {
            let transport = FifoTransport::open(&config.path, config.mode).await?;
            Ok(transport)
        }
        #[cfg(not(unix))]
        LinkMode::FifoConsumer | LinkMode::FifoProducer => Err(LinkError::invalid_config(
            "FIFO link modes require a Unix host",
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & host demos)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One direction of an in-memory wire.
#[derive(Debug, Default)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    notify: Notify,
    closed: AtomicBool,
}

/// A fully in-memory transport for unit tests.
///
/// [`pair`](SimulatedTransport::pair) returns two endpoints whose
/// transmit side feeds the peer's receive side. A standalone endpoint
/// from [`new`](SimulatedTransport::new) exposes `inject_rx` /
/// `drain_tx` so a test can play the role of the remote peer.
pub struct SimulatedTransport {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    fail_writes: AtomicBool,
}

impl SimulatedTransport {
    /// Create a standalone endpoint with detached rx/tx queues.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_pipes(
            name,
            Arc::new(Pipe::default()),
            Arc::new(Pipe::default()),
        ))
    }

    /// Create two endpoints wired back-to-back.
    pub fn pair(name_a: impl Into<String>, name_b: impl Into<String>) -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a = Arc::new(Self::with_pipes(name_a, b_to_a.clone(), a_to_b.clone()));
        let b = Arc::new(Self::with_pipes(name_b, a_to_b, b_to_a));
        (a, b)
    }

    fn with_pipes(name: impl Into<String>, rx: Arc<Pipe>, tx: Arc<Pipe>) -> Self {
        Self {
            name: name.into(),
            rx,
            tx,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `write` fail (simulate a dead wire).
    pub fn set_write_error(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Inject bytes into the receive queue (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut rx = self.rx.buf.lock().await;
        rx.extend(data);
        drop(rx);
        self.rx.notify.notify_one();
    }

    /// Drain all bytes from the transmit queue (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut tx = self.tx.buf.lock().await;
        tx.drain(..).collect()
    }

    /// Peek at the transmit queue contents without draining.
    pub async fn peek_tx(&self) -> Vec<u8> {
        let tx = self.tx.buf.lock().await;
        tx.iter().copied().collect()
    }
}

#[async_trait::async_trait]
impl LinkTransport for SimulatedTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(0);
            }
            {
                let mut rx = self.rx.buf.lock().await;
                if !rx.is_empty() {
                    let count = buf.len().min(rx.len());
                    for slot in buf.iter_mut().take(count) {
                        if let Some(byte) = rx.pop_front() {
                            *slot = byte;
                        }
                    }
                    return Ok(count);
                }
                if self.rx.closed.load(Ordering::SeqCst) {
                    return Ok(0);
                }
            }
            // The periodic wakeup covers a notification that lands
            // between the queue check and the wait.
            tokio::select! {
                _ = self.rx.notify.notified() => {}
                _ = self.shutdown_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), LinkError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(LinkError::io(format!("{}: transport is shut down", self.name)));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::io(format!("{}: injected write failure", self.name)));
        }
        if self.tx.closed.load(Ordering::SeqCst) {
            return Err(LinkError::io(format!("{}: peer endpoint closed", self.name)));
        }
        let mut tx = self.tx.buf.lock().await;
        tx.extend(buf);
        drop(tx);
        self.tx.notify.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    async fn close(&self) {
        self.shutdown();
        // The peer observes end-of-stream once its receive queue runs
        // dry.
        self.tx.closed.store(true, Ordering::SeqCst);
        self.rx.closed.store(true, Ordering::SeqCst);
        self.tx.notify.notify_one();
        self.rx.notify.notify_one();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  FIFO pair transport (host-test mode)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The two FIFO endpoint paths for a base path and role, returned as
/// `(read_path, write_path)`. The consumer reads the producer-to-
/// consumer pipe and writes the consumer-to-producer pipe; the
/// producer mirrors that.
pub fn fifo_endpoint_paths(path: &str, mode: LinkMode) -> Result<(String, String), LinkError> {
    match mode {
        LinkMode::FifoConsumer => Ok((format!("{path}-p2c.pipe"), format!("{path}-c2p.pipe"))),
        LinkMode::FifoProducer => Ok((format!("{path}-c2p.pipe"), format!("{path}-p2c.pipe"))),
        other => Err(LinkError::invalid_config(format!(
            "{other} is not a FIFO link mode"
        ))),
    }
}

/// Transport over a pair of named pipes, one per direction.
///
/// Both ends open their read pipe first and then retry the write pipe
/// until the peer's reader appears, so either side may start first.
#[cfg(unix)]
pub struct FifoTransport {
    name: String,
    receiver: Mutex<Option<tokio::net::unix::pipe::Receiver>>,
    sender: Mutex<Option<tokio::net::unix::pipe::Sender>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

#[cfg(unix)]
impl FifoTransport {
    /// How long to keep retrying the write-pipe open while waiting for
    /// the peer process.
    const OPEN_RETRY_MS: u64 = 50;
    const OPEN_RETRY_LIMIT: u32 = 600;

    /// `ENXIO`: the FIFO has no reader yet.
    const ENXIO: i32 = 6;

    pub async fn open(path: &str, mode: LinkMode) -> Result<Arc<Self>, LinkError> {
        use tokio::net::unix::pipe::OpenOptions;

        let (read_path, write_path) = fifo_endpoint_paths(path, mode)?;

        let receiver = OpenOptions::new()
            .open_receiver(&read_path)
            .map_err(|e| LinkError::io(format!("open {read_path}: {e}")))?;

        let mut attempts = 0;
        let sender = loop {
            match OpenOptions::new().open_sender(&write_path) {
                Ok(sender) => break sender,
                Err(e) if e.raw_os_error() == Some(Self::ENXIO) => {
                    attempts += 1;
                    if attempts >= Self::OPEN_RETRY_LIMIT {
                        return Err(LinkError::io(format!(
                            "open {write_path}: no reader appeared"
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(Self::OPEN_RETRY_MS)).await;
                }
                Err(e) => return Err(LinkError::io(format!("open {write_path}: {e}"))),
            }
        };

        Ok(Arc::new(Self {
            name: path.to_string(),
            receiver: Mutex::new(Some(receiver)),
            sender: Mutex::new(Some(sender)),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }
}

#[cfg(unix)]
#[async_trait::async_trait]
impl LinkTransport for FifoTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut slot = self.receiver.lock().await;
        let Some(receiver) = slot.as_mut() else {
            return Ok(0);
        };
        tokio::select! {
            result = receiver.read(buf) => {
                result.map_err(|e| LinkError::io(format!("{}: read: {e}", self.name)))
            }
            _ = self.shutdown_notify.notified() => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), LinkError> {
        let mut slot = self.sender.lock().await;
        let Some(sender) = slot.as_mut() else {
            return Err(LinkError::io(format!("{}: endpoint closed", self.name)));
        };
        sender
            .write_all(buf)
            .await
            .map_err(|e| LinkError::io(format!("{}: write: {e}", self.name)))
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    async fn close(&self) {
        self.shutdown();
        *self.receiver.lock().await = None;
        *self.sender.lock().await = None;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Serial port transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport over a raw serial device (8 data bits, no parity, one
/// stop bit, no flow control).
///
/// The `serialport` back-end is blocking, so reads poll with a short
/// timeout on the blocking pool; `shutdown` is observed at the next
/// poll boundary.
pub struct SerialPortTransport {
    name: String,
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialPortTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Arc<Self>, LinkError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(READ_POLL_MS))
            .open()
            .map_err(|e| LinkError::io(format!("open {path}: {e}")))?;

        Ok(Arc::new(Self {
            name: path.to_string(),
            port: Mutex::new(Some(port)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[async_trait::async_trait]
impl LinkTransport for SerialPortTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut slot = self.port.lock().await;
        let Some(port) = slot.take() else {
            return Ok(0);
        };
        let shutdown = self.shutdown.clone();
        let capacity = buf.len();

        let (port, result, data) = tokio::task::spawn_blocking(move || {
            use std::io::Read as _;
            let mut port = port;
            let mut data = vec![0u8; capacity];
            let result = loop {
                if shutdown.load(Ordering::SeqCst) {
                    break Ok(0);
                }
                match port.read(&mut data) {
                    Ok(n) => break Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            (port, result, data)
        })
        .await
        .map_err(|e| LinkError::internal(format!("serial read task: {e}")))?;

        *slot = Some(port);
        match result {
            Ok(n) => {
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(e) => Err(LinkError::io(format!("{}: read: {e}", self.name))),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), LinkError> {
        let mut slot = self.port.lock().await;
        let Some(port) = slot.take() else {
            return Err(LinkError::io(format!("{}: endpoint closed", self.name)));
        };
        let data = buf.to_vec();

        let (port, result) = tokio::task::spawn_blocking(move || {
            use std::io::Write as _;
            let mut port = port;
            let result = port.write_all(&data).and_then(|_| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| LinkError::internal(format!("serial write task: {e}")))?;

        *slot = Some(port);
        result.map_err(|e| LinkError::io(format!("{}: write: {e}", self.name)))
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.shutdown();
        *self.port.lock().await = None;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Character device transport (paravirtual console)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport over a character device opened read/write, e.g. a
/// paravirtual console like `/dev/hvc0`.
pub struct CharDeviceTransport {
    name: String,
    reader: Mutex<Option<tokio::fs::File>>,
    writer: Mutex<Option<tokio::fs::File>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl CharDeviceTransport {
    pub async fn open(path: &str) -> Result<Arc<Self>, LinkError> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| LinkError::io(format!("open {path}: {e}")))?;
        let writer = file
            .try_clone()
            .await
            .map_err(|e| LinkError::io(format!("clone {path}: {e}")))?;

        Ok(Arc::new(Self {
            name: path.to_string(),
            reader: Mutex::new(Some(file)),
            writer: Mutex::new(Some(writer)),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }
}

#[async_trait::async_trait]
impl LinkTransport for CharDeviceTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut slot = self.reader.lock().await;
        let Some(reader) = slot.as_mut() else {
            return Ok(0);
        };
        tokio::select! {
            result = reader.read(buf) => {
                result.map_err(|e| LinkError::io(format!("{}: read: {e}", self.name)))
            }
            _ = self.shutdown_notify.notified() => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), LinkError> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(LinkError::io(format!("{}: endpoint closed", self.name)));
        };
        writer
            .write_all(buf)
            .await
            .map_err(|e| LinkError::io(format!("{}: write: {e}", self.name)))?;
        writer
            .flush()
            .await
            .map_err(|e| LinkError::io(format!("{}: flush: {e}", self.name)))
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    async fn close(&self) {
        self.shutdown();
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
    }

    fn name(&self) -> &str {
        &self.name
    }
}
