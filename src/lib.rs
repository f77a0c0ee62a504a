//! Persistent-memory primitives for lock-free data structures.
//!
//! Two building blocks live here:
//!
//! * `PersistentLog` + `LogHandle::persistent_cas`, a single-word compare-and-swap that survives
//!   power loss. Every CAS first writes an `{address, old, new}` intent record into a per-thread
//!   slot of a log that lives in persistent memory, then performs the hardware compare-exchange.
//!   After a restart `PersistentLog::recover` replays the recorded intents, completing any CAS
//!   that was interrupted before its result became durable.
//! * `EpochManager`, an epoch-based reclamation protocol. Readers `protect` the current global
//!   epoch before touching shared memory and `unprotect` afterwards; a reclaimer bumps the epoch
//!   and asks for the highest epoch that no reader can still observe.
//!
//! All flush/fence/non-temporal store sequences go through the `DurableMedia` trait, so the
//! ordering logic can be driven by `SimulatedMedia`, which discards unflushed writes on a
//! simulated crash.
//!

pub mod util;
pub mod error;
pub mod spin_lock;
pub mod media;
pub mod persistent_log;
pub mod epoch_table;
pub mod epoch_manager;

pub use epoch_manager::{EpochGuard, EpochManager};
pub use epoch_table::{EpochContext, EpochTable};
pub use error::Status;
pub use media::{DurableMedia, PmemMedia, SimulatedMedia};
pub use persistent_log::{LogEntry, LogHandle, PersistentLog, RecoveryReport};

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

extern crate time;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        /// Maximum thread count
        pub const MAX_THREAD_COUNT: usize = 16;
    }
}

/// Cache line size assumed by the flush granularity and entry padding.
pub const CACHE_LINE_SIZE: usize = 64;
