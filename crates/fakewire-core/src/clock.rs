//! Process-monotonic time.
//!
//! Timestamps are nanoseconds since a process-wide epoch pinned on
//! first use. They are strictly local: two processes (or two runs of
//! the same process) do not share an epoch, so these values are only
//! meaningful for intervals and ordering within one process.

use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Nanoseconds per second.
pub const NS_PER_SEC: u64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed since the process epoch. Never decreases.
pub fn monotonic_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let mut prev = monotonic_ns();
        for _ in 0..1000 {
            let now = monotonic_ns();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn monotonic_advances() {
        let before = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let after = monotonic_ns();
        assert!(after - before >= 5 * NS_PER_MS);
    }

    #[test]
    fn unit_constants() {
        assert_eq!(NS_PER_SEC, 1000 * NS_PER_MS);
    }
}
