//! Local Resource Scheduler
//!
//! Mediates between concurrent clients issuing read, write and format
//! requests against a bounded pool of physical drives holding
//! removable media. The scheduler decides which medium is loaded in
//! which drive, which request is served next, and when a loaded
//! medium must be synchronised or unloaded.

use std::sync::atomic::AtomicBool;

pub mod cache;
pub mod device;
pub mod fs_adapter;
pub mod library;
pub mod request;
pub mod sched;
pub mod store;

/// Lower bound for device thread sleeps, so a busy sync queue cannot
/// spin the thread.
pub const MIN_SLEEP_MS: u64 = 10;

/// Device thread wakeup interval while the sync queue is empty.
pub const IDLE_WAKEUP_MS: u64 = 1000;

/// Scheduler thread wakeup interval while no request is pending.
pub const SCHED_IDLE_WAKEUP_MS: u64 = 100;

/// Process-wide running flag; cleared once to request shutdown.
pub static RUNNING: AtomicBool = AtomicBool::new(true);
