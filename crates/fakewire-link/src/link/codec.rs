//! Fakewire byte-stream codec.
//!
//! [`Decoder`] parses raw wire bytes into [`LinkFrame`]s; [`Encoder`]
//! produces wire bytes from data and control symbols, escaping data
//! bytes that collide with the special range.
//!
//! The decoder is a state machine that handles:
//!  - Plain data (bytes outside the special range)
//!  - Escape pairs (`ESCAPE`, byte XOR 0x10 → one literal data byte)
//!  - Control symbols, including the 4-byte big-endian parameter that
//!    follows `HANDSHAKE_1` / `HANDSHAKE_2`
//!  - Invalid sequences, surfaced as `CODEC_ERROR` control frames

use crate::link::protocol::{is_special, CtrlSymbol, LinkFrame, ESCAPE, ESCAPE_MASK};

/// A parametrized control symbol waiting for its 4 parameter bytes.
#[derive(Debug)]
struct PendingCtrl {
    symbol: CtrlSymbol,
    param_buf: [u8; 4],
    param_count: usize,
    /// Timestamp of the leading symbol, so the completed frame carries
    /// the time the symbol (not its last parameter byte) arrived.
    recv_ts: u64,
}

/// Stateful wire decoder.
///
/// Feed chunks via [`decode`](Decoder::decode) and collect frames.
/// Partial escape sequences and partial symbol parameters are retained
/// between calls, so the decoder tolerates arbitrary chunking of the
/// underlying byte stream.
#[derive(Debug, Default)]
pub struct Decoder {
    in_escape: bool,
    pending_ctrl: Option<PendingCtrl>,
    /// Accumulated data bytes, flushed before any control frame.
    data_buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            in_escape: false,
            pending_ctrl: None,
            data_buf: Vec::with_capacity(1024),
        }
    }

    /// Decode a chunk of wire bytes stamped with its receive time.
    /// Returns zero or more frames in wire order.
    pub fn decode(&mut self, input: &[u8], recv_ts: u64) -> Vec<LinkFrame> {
        let mut frames = Vec::new();

        for &raw in input {
            let mut byte = raw;
            let mut decoded_literal = false;

            if self.in_escape {
                self.in_escape = false;
                let decoded = byte ^ ESCAPE_MASK;
                if is_special(decoded) {
                    // Valid escape pair: one literal data byte.
                    byte = decoded;
                    decoded_literal = true;
                } else {
                    // Invalid sequence. Report it, then handle the
                    // offending byte as if it arrived outside any
                    // escape.
                    self.push_ctrl(CtrlSymbol::CodecError, recv_ts, &mut frames);
                }
            }

            if !decoded_literal && is_special(byte) {
                if byte == ESCAPE {
                    self.in_escape = true;
                } else if let Some(symbol) = CtrlSymbol::from_byte(byte) {
                    self.push_ctrl(symbol, recv_ts, &mut frames);
                }
                continue;
            }

            self.data_buf.push(byte);
        }

        self.flush_data(&mut frames);
        frames
    }

    /// Reset all decoder state (e.g. when a transport is reopened).
    pub fn reset(&mut self) {
        self.in_escape = false;
        self.pending_ctrl = None;
        self.data_buf.clear();
    }

    /// Route a received control symbol, accounting for a pending
    /// parametrized symbol. Accumulated data is flushed first so frame
    /// order matches wire order.
    fn push_ctrl(&mut self, symbol: CtrlSymbol, recv_ts: u64, frames: &mut Vec<LinkFrame>) {
        self.flush_data(frames);

        // A new symbol while a parameter is incomplete is an error;
        // the interrupted symbol is dropped.
        if let Some(pending) = self.pending_ctrl.take() {
            frames.push(LinkFrame::Ctrl {
                symbol: CtrlSymbol::CodecError,
                param: 0,
                recv_ts: pending.recv_ts,
            });
        }

        if symbol.is_parametrized() {
            self.pending_ctrl = Some(PendingCtrl {
                symbol,
                param_buf: [0; 4],
                param_count: 0,
                recv_ts,
            });
        } else {
            frames.push(LinkFrame::Ctrl {
                symbol,
                param: 0,
                recv_ts,
            });
        }
    }

    /// Emit accumulated data bytes, feeding a pending symbol parameter
    /// first and the remainder as a `Data` frame.
    fn flush_data(&mut self, frames: &mut Vec<LinkFrame>) {
        if self.data_buf.is_empty() {
            return;
        }
        let mut data = std::mem::take(&mut self.data_buf);

        if let Some(mut pending) = self.pending_ctrl.take() {
            let need = 4 - pending.param_count;
            let take = need.min(data.len());
            pending.param_buf[pending.param_count..pending.param_count + take]
                .copy_from_slice(&data[..take]);
            pending.param_count += take;
            data.drain(..take);

            if pending.param_count == 4 {
                frames.push(LinkFrame::Ctrl {
                    symbol: pending.symbol,
                    param: u32::from_be_bytes(pending.param_buf),
                    recv_ts: pending.recv_ts,
                });
            } else {
                self.pending_ctrl = Some(pending);
            }
        }

        if !data.is_empty() {
            frames.push(LinkFrame::Data(data));
        }
    }
}

// ── Encoder ─────────────────────────────────────────────────────────────

/// Escaping wire encoder.
///
/// `encode_data` / `encode_ctrl` append to an internal buffer;
/// [`flush`](Encoder::flush) takes the buffered wire bytes. Callers
/// that need the bytes on the wire (handshake and credit emission)
/// must flush and write before proceeding.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    /// Append data bytes, escaping any in the special range.
    pub fn encode_data(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if is_special(byte) {
                self.buf.push(ESCAPE);
                self.buf.push(byte ^ ESCAPE_MASK);
            } else {
                self.buf.push(byte);
            }
        }
    }

    /// Append a control symbol and, for parametrized symbols, its
    /// 32-bit parameter in big-endian order through the escape path.
    ///
    /// Panics if asked to transmit `CodecError` (the escape byte's
    /// slot, never legal on the wire as a symbol) or a parameter on a
    /// non-parametrized symbol.
    pub fn encode_ctrl(&mut self, symbol: CtrlSymbol, param: u32) {
        assert!(
            symbol != CtrlSymbol::CodecError,
            "CODEC_ERROR is not a transmittable symbol"
        );
        assert!(
            param == 0 || symbol.is_parametrized(),
            "parameter given for non-parametrized symbol {symbol}"
        );
        self.buf.push(symbol.code());
        if symbol.is_parametrized() {
            self.encode_data(&param.to_be_bytes());
        }
    }

    /// Take the buffered wire bytes, leaving the encoder empty.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Number of buffered, unflushed wire bytes.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
