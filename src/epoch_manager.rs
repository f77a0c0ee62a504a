//! Definition and implementations of `EpochManager`
//!
//! Epoch-based reclamation. A reader brackets every access to shared memory with `protect` /
//! `unprotect`; the protected epoch is the global epoch it saw on entry. A reclaimer tags retired
//! memory with the epoch current at retirement and periodically:
//!
//! 1. calls `bump_current_epoch`,
//! 2. calls `compute_new_safe_to_reclaim_epoch` with the bumped value,
//! 3. frees retired memory tagged with an epoch `<= safe_to_reclaim_epoch()`,
//! 4. calls `clear_registry` for every thread that exited.
//!
//! The bump must come before the computation, otherwise a reader that joins during the scan
//! could be missed while still seeing memory retired in the epoch it joined.
//!
use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};

use epoch_table::{EpochContext, EpochTable};
use error::Status;
use util::WrappedAlign64Type;

/// Global epoch counters plus the table of protected epochs. The counters live on their own
/// cache lines, they are written by different threads.
pub struct EpochManager {
    current_epoch: WrappedAlign64Type<AtomicU64>,
    safe_to_reclaim_epoch: WrappedAlign64Type<AtomicU64>,
    epoch_table: EpochTable,
}

impl Default for EpochManager {
    fn default() -> Self {
        EpochManager::new()
    }
}

impl EpochManager {
    /// Counters start at `{current: 1, safe_to_reclaim: 0}`; the table is allocated by
    /// `initialize`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_pmtool::{EpochContext, EpochManager, Status};
    ///
    /// let mut mgr = EpochManager::new();
    /// assert_eq!(mgr.initialize(), Status::Success);
    /// let ctx = EpochContext::new();
    /// assert_eq!(mgr.protect(&ctx), Status::Success);
    /// // ... read shared structures ...
    /// assert_eq!(mgr.unprotect(&ctx), Status::Success);
    /// ```
    ///
    pub fn new() -> EpochManager {
        EpochManager {
            current_epoch: WrappedAlign64Type(AtomicU64::new(1)),
            safe_to_reclaim_epoch: WrappedAlign64Type(AtomicU64::new(0)),
            epoch_table: EpochTable::new(),
        }
    }

    /// Same as `initialize_with_capacity(EpochTable::DEFAULT_CAPACITY)`.
    pub fn initialize(&mut self) -> Status {
        self.initialize_with_capacity(EpochTable::DEFAULT_CAPACITY)
    }

    /// Allocate an epoch table with `capacity` slots (a power of two) and reset the counters.
    /// Does nothing if already initialized.
    pub fn initialize_with_capacity(&mut self, capacity: usize) -> Status {
        if self.epoch_table.is_initialized() {
            return Status::Success;
        }
        let ret = self.epoch_table.initialize(capacity);
        if ret.is_success() {
            self.reset_counters();
        }
        ret
    }

    /// Free the table and reset the counters. Idempotent.
    pub fn uninitialize(&mut self) -> Status {
        let ret = self.epoch_table.uninitialize();
        self.reset_counters();
        ret
    }

    fn reset_counters(&self) {
        self.current_epoch.store(1, Ordering::SeqCst);
        self.safe_to_reclaim_epoch.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.epoch_table.is_initialized()
    }

    pub fn epoch_table(&self) -> &EpochTable {
        &self.epoch_table
    }

    /// Enter a protected region. Once this returns, any later epoch bump finds this thread at an
    /// epoch no older than the one it actually observed.
    pub fn protect(&self, ctx: &EpochContext) -> Status {
        let epoch = self.current_epoch.load(Ordering::SeqCst);
        let ret = self.epoch_table.protect(ctx, epoch);
        if ret.is_success() {
            // a bump between the load and the store may have been missed by a concurrent scan
            let now = self.current_epoch.load(Ordering::SeqCst);
            if now != epoch {
                self.epoch_table.refresh(ctx, now);
            }
        }
        ret
    }

    /// `protect`, undone when the returned guard is dropped.
    pub fn protect_guard<'a>(&'a self, ctx: &'a EpochContext) -> Result<EpochGuard<'a>, Status> {
        match self.protect(ctx) {
            Status::Success => Ok(EpochGuard { manager: self, ctx }),
            s => Err(s),
        }
    }

    /// Leave the protected region.
    pub fn unprotect(&self, ctx: &EpochContext) -> Status {
        self.epoch_table
            .unprotect(ctx, self.current_epoch.load(Ordering::SeqCst))
    }

    pub fn is_protected(&self, ctx: &EpochContext) -> bool {
        self.epoch_table.protected_epoch(ctx) != 0
    }

    /// Advance the global epoch, returning the new value.
    pub fn bump_current_epoch(&self) -> u64 {
        let epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("current epoch bumped to {}", epoch);
        epoch
    }

    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim_epoch.load(Ordering::SeqCst)
    }

    /// Whether memory retired in `epoch` can be freed.
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch()
    }

    /// Recompute the safe-to-reclaim epoch from the protected epochs in the table and
    /// `current_epoch`, a snapshot taken after the latest bump. Never moves backwards; returns
    /// the value in effect afterwards.
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let candidate = match self.epoch_table.min_protected_epoch() {
            Some(min) => min - 1,
            None => current_epoch.saturating_sub(1),
        };
        let prev = self.safe_to_reclaim_epoch
            .fetch_max(candidate, Ordering::SeqCst);
        if candidate > prev {
            debug!("safe to reclaim epoch advanced {} -> {}", prev, candidate);
        }
        cmp::max(prev, candidate)
    }

    /// Release the table slot of a thread that is exiting, so nothing it left behind holds back
    /// reclamation or leaks into a reused identity.
    pub fn clear_registry(&self, ctx: &EpochContext) -> Status {
        self.epoch_table.release(ctx)
    }
}

/// Protection held by one thread, dropped with `unprotect`.
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
    ctx: &'a EpochContext,
}

impl<'a> EpochGuard<'a> {
    /// Epoch this guard protects.
    pub fn epoch(&self) -> u64 {
        self.manager.epoch_table.protected_epoch(self.ctx)
    }
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        self.manager.unprotect(self.ctx);
    }
}
