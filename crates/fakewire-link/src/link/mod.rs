//! Link crate: sub-modules.

pub mod types;
pub mod protocol;
pub mod codec;
pub mod transport;
pub mod exchange;
pub mod session;
pub mod service;

// Re-export top-level items for convenience.
pub use types::*;
pub use session::{attach, attach_with, LinkHandle};
pub use service::{LinkService, LinkServiceState};
