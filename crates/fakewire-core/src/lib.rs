//! # fakewire-core
//!
//! Infrastructure shared by the fakewire crates:
//!
//! - **Monotonic clock** – process-wide nanosecond timestamps used for
//!   receive stamping, session-ID generation, and handshake pacing
//! - **Rate-limited warnings** – a debounced flag so recurring fault
//!   conditions produce one warning per sustain period instead of a
//!   flood

pub mod clock;
pub mod ratelimit;
