//! Traffic accounting primitives.

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Byte counts for one direction pair.
///
/// "Sent" and "received" are relative to whoever owns the counter; the
/// session swaps the axes when reporting tunnel traffic as client usage
/// (bytes the tunnel sent are bytes the client received).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Traffic {
    /// Bytes sent
    pub sent: u64,
    /// Bytes received
    pub received: u64,
}

impl Traffic {
    /// Create a traffic value.
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    /// Total bytes in both directions.
    pub fn total(&self) -> u64 {
        self.sent + self.received
    }

    /// Swap the axes (server-side sent equals client-side received).
    pub fn swapped(&self) -> Self {
        Self {
            sent: self.received,
            received: self.sent,
        }
    }
}

impl Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent + rhs.sent,
            received: self.received + rhs.received,
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        self.sent += rhs.sent;
        self.received += rhs.received;
    }
}

impl Sub for Traffic {
    type Output = Traffic;

    fn sub(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_sub(rhs.sent),
            received: self.received.saturating_sub(rhs.received),
        }
    }
}

/// Lock-free live counter shared by channels and tunnels.
#[derive(Debug, Default)]
pub struct TrafficMeter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficMeter {
    /// Create a zeroed meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record sent bytes.
    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record received bytes.
    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> Traffic {
        Traffic {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}
