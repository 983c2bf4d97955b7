//! # fakewire-link
//!
//! A point-to-point, full-duplex, byte-oriented link layer carrying
//! framed packets between two peers over an unreliable byte transport:
//!
//! - **Framing codec** – escape-based wire encoding with multi-byte
//!   parametrized control symbols
//! - **Exchange protocol** – a symmetric handshake that resolves
//!   collisions deterministically, plus strict one-credit flow control
//! - **Transports** – serial ports, paravirtual consoles, FIFO pairs
//!   for host testing, and an in-memory transport for unit tests
//! - **Session API** – blocking-style `read_packet` / `write_packet`
//!   calls that ride out link resets transparently
//! - **Service** – a registry managing several labeled links at once

pub mod link;
