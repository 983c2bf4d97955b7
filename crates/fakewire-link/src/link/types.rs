//! Shared types for the fakewire link crate.
//!
//! Covers link configuration, exchange state, statistics, session
//! info snapshots, and the crate error type.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Link configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Underlying byte transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkMode {
    /// A raw serial device (8 data bits, no parity, no flow control).
    Serial,
    /// A paravirtual console character device.
    Virtio,
    /// Host-test FIFO pair, consumer role: reads `{path}-p2c.pipe`,
    /// writes `{path}-c2p.pipe`.
    FifoConsumer,
    /// Host-test FIFO pair, producer role: reads `{path}-c2p.pipe`,
    /// writes `{path}-p2c.pipe`.
    FifoProducer,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serial => "serial",
            Self::Virtio => "virtio",
            Self::FifoConsumer => "fifo-consumer",
            Self::FifoProducer => "fifo-producer",
        };
        f.write_str(name)
    }
}

/// Which half of the 32-bit session-ID space this end draws from.
///
/// The two ends of a link must draw from opposite halves so that a
/// simultaneous handshake cannot produce identical session IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeIdSpace {
    /// Session IDs with the most significant bit set.
    High,
    /// Session IDs with the most significant bit clear.
    Low,
}

impl HandshakeIdSpace {
    /// Build a session ID from the low 31 bits of a nanosecond
    /// timestamp, namespaced into this half of the ID space.
    pub fn make_id(&self, ns: u64) -> u32 {
        let low = (ns as u32) & 0x7FFF_FFFF;
        match self {
            Self::High => 0x8000_0000 | low,
            Self::Low => low,
        }
    }

    /// The half the peer is expected to use.
    pub fn opposite(&self) -> Self {
        match self {
            Self::High => Self::Low,
            Self::Low => Self::High,
        }
    }
}

/// Link session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkConfig {
    /// Device path, or the FIFO base path in the FIFO modes.
    pub path: String,
    pub mode: LinkMode,
    /// Human-readable label used in log messages.
    pub label: String,
    /// Baud rate for `LinkMode::Serial`.
    pub baud_rate: u32,
    /// Transport read chunk size.
    pub recv_buffer_size: usize,
    pub id_space: HandshakeIdSpace,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyAMA1".to_string(),
            mode: LinkMode::Serial,
            label: "fw".to_string(),
            baud_rate: 9600,
            recv_buffer_size: 1024,
            id_space: HandshakeIdSpace::High,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Exchange state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State of the exchange protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeState {
    /// No transport attached, or the session has ended.
    Disconnected,
    /// Waiting for a primary handshake; will send one when the timer
    /// expires.
    Connecting,
    /// Sent a primary handshake, waiting for the matching secondary.
    Handshaking,
    /// Handshake complete; packets and credits flow.
    Operating,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Operating => "OPERATING",
        };
        f.write_str(name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics & info snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters for one link session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    /// Decoded payload bytes received.
    pub bytes_rx: u64,
    /// Wire bytes transmitted.
    pub bytes_tx: u64,
    pub fcts_sent: u64,
    pub fcts_rcvd: u64,
    pub pkts_sent: u64,
    pub pkts_rcvd: u64,
    /// Protocol resets since attach.
    pub resets: u64,
    /// Monotonic timestamp of the last received control symbol.
    pub last_rx_timestamp_ns: u64,
}

/// Metadata snapshot for one link, as reported by the service layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub id: String,
    pub label: String,
    pub path: String,
    pub mode: LinkMode,
    pub state: ExchangeState,
    /// RFC 3339 attach time.
    pub attached_at: String,
    pub stats: LinkStats,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Link crate error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// The session ended (detach, transport end-of-stream, or write
    /// failure) before the call could complete.
    Disconnected,
    /// Transport open / read / write failure.
    Io,
    /// Configuration rejected before any I/O was attempted.
    InvalidConfig,
    /// No link registered under the given ID.
    LinkNotFound,
    /// Internal runtime failure.
    Internal,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for LinkError {}

impl LinkError {
    pub fn new(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn disconnected() -> Self {
        Self::new(LinkErrorKind::Disconnected, "link disconnected")
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Io, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::InvalidConfig, message)
    }

    pub fn link_not_found(id: &str) -> Self {
        Self::new(LinkErrorKind::LinkNotFound, format!("link '{id}' not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::new(LinkErrorKind::Io, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── HandshakeIdSpace ────────────────────────────────────────────

    #[test]
    fn high_ids_have_msb_set() {
        let id = HandshakeIdSpace::High.make_id(0x0123_4567_89AB_CDEF);
        assert_eq!(id & 0x8000_0000, 0x8000_0000);
        assert_eq!(id & 0x7FFF_FFFF, 0x89AB_CDEF & 0x7FFF_FFFF);
    }

    #[test]
    fn low_ids_have_msb_clear() {
        let id = HandshakeIdSpace::Low.make_id(u64::MAX);
        assert_eq!(id & 0x8000_0000, 0);
        assert_eq!(id, 0x7FFF_FFFF);
    }

    #[test]
    fn halves_are_disjoint() {
        for ns in [0u64, 1, 0xFFFF_FFFF, u64::MAX] {
            let high = HandshakeIdSpace::High.make_id(ns);
            let low = HandshakeIdSpace::Low.make_id(ns);
            assert_ne!(high, low);
        }
        assert_eq!(HandshakeIdSpace::High.opposite(), HandshakeIdSpace::Low);
        assert_eq!(HandshakeIdSpace::Low.opposite(), HandshakeIdSpace::High);
    }

    // ── Config ──────────────────────────────────────────────────────

    #[test]
    fn config_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.mode, LinkMode::Serial);
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.id_space, HandshakeIdSpace::High);
        assert!(config.recv_buffer_size > 0);
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = LinkConfig {
            path: "/tmp/fw-test".to_string(),
            mode: LinkMode::FifoConsumer,
            label: "test-link".to_string(),
            baud_rate: 115_200,
            recv_buffer_size: 256,
            id_space: HandshakeIdSpace::Low,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: LinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, config.path);
        assert_eq!(back.mode, config.mode);
        assert_eq!(back.baud_rate, config.baud_rate);
        assert_eq!(back.id_space, config.id_space);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: LinkConfig = serde_json::from_str(r#"{"label":"x"}"#).unwrap();
        assert_eq!(config.label, "x");
        assert_eq!(config.baud_rate, 9600);
    }

    // ── State & error ───────────────────────────────────────────────

    #[test]
    fn state_display_names() {
        assert_eq!(ExchangeState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ExchangeState::Operating.to_string(), "OPERATING");
    }

    #[test]
    fn error_display_includes_kind() {
        let err = LinkError::link_not_found("fw-0");
        assert!(err.to_string().contains("LinkNotFound"));
        assert!(err.to_string().contains("fw-0"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = LinkError::from(io_err);
        assert_eq!(err.kind, LinkErrorKind::Io);
        assert!(err.message.contains("pipe gone"));
    }

    #[test]
    fn stats_serde_roundtrip() {
        let stats = LinkStats {
            pkts_sent: 3,
            fcts_rcvd: 4,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("pktsSent"));
        let back: LinkStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
