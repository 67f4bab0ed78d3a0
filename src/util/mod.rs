//! Shared utilities: traffic accounting, idle-expiring maps, burst-coalescing
//! log reporters and the named async-lock registry.

mod event_reporter;
mod named_lock;
mod timeout_map;
mod traffic;

pub use event_reporter::EventReporter;
pub use named_lock::NamedLockRegistry;
pub use timeout_map::TimeoutMap;
pub use traffic::{Traffic, TrafficMeter};
