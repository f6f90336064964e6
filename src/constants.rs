//! Convoy tuning constants and configuration defaults
//!
//! This module contains the tuning constants used throughout the crate.
//! Most of them can be overridden per-context through [`crate::ContextConfig`]
//! or per-consumer through [`crate::BatchDesc`]; the values here are the
//! defaults those builders start from.

use std::time::Duration;

/// Default number of pre-allocated batch slots per collector.
///
/// Two slots are the minimum that lets the collector fill one batch while the
/// consumer is still reading the previous one.
pub const DEFAULT_SLOT_POOL_SIZE: usize = 2;

/// Default bound of a simulator-to-collector sender channel (events).
///
/// A full channel is the backpressure point: the submitting simulator blocks
/// until the collector drains or the context is stopped.
pub const DEFAULT_SENDER_QUEUE_BOUND: usize = 64;

/// Default capacity of the per-collector reply cache.
///
/// Replies that race ahead of their simulator's next send are parked here;
/// beyond this many entries the oldest are evicted silently.
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 10_000;

/// Interval at which blocking waits re-check the shared done flag.
pub const DONE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Alignment of tensor backing storage (one cache line).
pub const TENSOR_ALIGNMENT: usize = 64;

/// History ring capacity multiplier: a ring holds `3 * T + num_extra` events
/// so a window can be extracted while the next one accumulates.
pub const HISTORY_CAPACITY_FACTOR: usize = 3;

/// Default reply horizon (time steps covered by one reply batch).
pub const DEFAULT_REPLY_T: usize = 1;

/// Highest assembly latency the summary histogram can record (one minute).
pub const MAX_TRACKED_LATENCY_US: u64 = 60_000_000;

/// Significant figures kept by the summary histogram.
pub const LATENCY_SIGFIG: u8 = 3;
