//! Definition and implementations of `EpochTable`
//!
//! A fixed-capacity, open-addressed map from thread identity to the epoch that thread currently
//! protects. Each entry sits on its own cache line so that threads protecting and unprotecting
//! concurrently don't false-share.
//!
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use error::Status;
use util::{self, WrappedAlign64Type};
use MAX_THREAD_COUNT;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread identity used with `EpochTable` and `EpochManager`.
///
/// Create one per thread and pass it to every call made by that thread. It remembers the slot
/// the thread was given, so after the first `protect` lookups are O(1). When the thread is done,
/// hand it to `EpochManager::clear_registry` to free the slot.
pub struct EpochContext {
    thread_id: u64,
    binding: Cell<Option<(u64, usize)>>,
}

impl EpochContext {
    pub fn new() -> EpochContext {
        EpochContext {
            thread_id: util::next_thread_id(),
            binding: Cell::new(None),
        }
    }

    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }
}

impl Default for EpochContext {
    fn default() -> Self {
        EpochContext::new()
    }
}

#[derive(Default)]
struct Entry {
    /// 0 means the slot is free.
    thread_id: AtomicU64,
    /// 0 means unprotected.
    protected_epoch: AtomicU64,
    last_unprotected_epoch: AtomicU64,
}

pub struct EpochTable {
    id: u64,
    table: Option<Box<[WrappedAlign64Type<Entry>]>>,
}

impl Default for EpochTable {
    fn default() -> Self {
        EpochTable::new()
    }
}

impl EpochTable {
    /// Default number of slots, leaves linear probing plenty of room at `MAX_THREAD_COUNT`.
    pub const DEFAULT_CAPACITY: usize = MAX_THREAD_COUNT * 8;

    /// An uninitialized table, call `initialize` before use.
    pub fn new() -> EpochTable {
        EpochTable { id: 0, table: None }
    }

    /// Allocate `capacity` zeroed slots. `capacity` must be a power of two. Calling it on an
    /// initialized table does nothing.
    pub fn initialize(&mut self, capacity: usize) -> Status {
        if self.table.is_some() {
            return Status::Success;
        }
        if !util::is_power_of_two(capacity as u64) {
            warn!("epoch table capacity must be a power of two, capacity={}", capacity);
            return Status::InvalidParam;
        }
        let entries: Vec<_> = (0..capacity)
            .map(|_| WrappedAlign64Type(Entry::default()))
            .collect();
        self.table = Some(entries.into_boxed_slice());
        self.id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        debug!("epoch table {} initialized, capacity={}", self.id, capacity);
        Status::Success
    }

    /// Free the slots. Safe to call on an uninitialized table.
    pub fn uninitialize(&mut self) -> Status {
        if self.table.take().is_some() {
            debug!("epoch table {} uninitialized", self.id);
        }
        self.id = 0;
        Status::Success
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.len())
    }

    /// Record that `ctx` protects `epoch`, claiming a slot on first use.
    ///
    /// Protecting twice without an `unprotect` in between is a caller error; it is refused with
    /// `Status::Busy` and the existing protection stays.
    pub fn protect(&self, ctx: &EpochContext, epoch: u64) -> Status {
        let entry = match self.get_entry(ctx) {
            Ok(entry) => entry,
            Err(s) => return s,
        };
        let held = entry.protected_epoch.load(Ordering::Relaxed);
        if held != 0 {
            warn!(
                "thread is already protected, thread_id={}, protected_epoch={}",
                ctx.thread_id, held
            );
            return Status::Busy;
        }
        entry.protected_epoch.store(epoch, Ordering::SeqCst);
        Status::Success
    }

    /// Move an existing protection forward to `epoch`.
    pub(crate) fn refresh(&self, ctx: &EpochContext, epoch: u64) {
        if let Some(entry) = self.find_entry(ctx) {
            if entry.protected_epoch.load(Ordering::Relaxed) != 0 {
                entry.protected_epoch.store(epoch, Ordering::SeqCst);
            }
        }
    }

    /// Drop the protection of `ctx`. `current_epoch` is recorded as the last unprotected epoch
    /// if the thread wasn't protected.
    pub fn unprotect(&self, ctx: &EpochContext, current_epoch: u64) -> Status {
        let entry = match self.find_entry(ctx) {
            Some(entry) => entry,
            None => {
                warn!("unprotect from unregistered thread, thread_id={}", ctx.thread_id);
                return Status::InvalidParam;
            }
        };
        let held = entry.protected_epoch.load(Ordering::Relaxed);
        let last = if held != 0 { held } else { current_epoch };
        entry.last_unprotected_epoch.store(last, Ordering::Relaxed);
        entry.protected_epoch.store(0, Ordering::SeqCst);
        Status::Success
    }

    /// Epoch protected by `ctx`, 0 when it isn't protected or has no slot here.
    pub fn protected_epoch(&self, ctx: &EpochContext) -> u64 {
        self.find_entry(ctx)
            .map_or(0, |e| e.protected_epoch.load(Ordering::SeqCst))
    }

    /// Epoch `ctx` held when it last unprotected.
    pub fn last_unprotected_epoch(&self, ctx: &EpochContext) -> u64 {
        self.find_entry(ctx)
            .map_or(0, |e| e.last_unprotected_epoch.load(Ordering::Relaxed))
    }

    /// Smallest epoch protected by any registered thread. Not linearizable with concurrent
    /// `protect` calls.
    pub fn min_protected_epoch(&self) -> Option<u64> {
        let table = match self.table {
            Some(ref t) => t,
            None => return None,
        };
        let mut ret = None;
        for entry in table.iter() {
            if entry.thread_id.load(Ordering::SeqCst) == 0 {
                continue;
            }
            let epoch = entry.protected_epoch.load(Ordering::SeqCst);
            if epoch != 0 && ret.map_or(true, |m| epoch < m) {
                ret = Some(epoch);
            }
        }
        ret
    }

    /// Give the slot of `ctx` back to the table and forget the cached binding.
    pub fn release(&self, ctx: &EpochContext) -> Status {
        if let Some(entry) = self.find_entry(ctx) {
            entry.protected_epoch.store(0, Ordering::SeqCst);
            entry.last_unprotected_epoch.store(0, Ordering::Relaxed);
            // only the owner ever clears its slot
            entry.thread_id.store(0, Ordering::SeqCst);
            trace!("epoch table {} released thread {}", self.id, ctx.thread_id);
            ctx.binding.set(None);
        }
        Status::Success
    }

    #[inline]
    fn probe_start(&self, ctx: &EpochContext, size: usize) -> usize {
        util::murmur3_64(ctx.thread_id) as usize & (size - 1)
    }

    /// Slot owned by `ctx`. Uses the cached binding when it belongs to this table, otherwise
    /// probes the whole table from `hash(thread_id)` and caches what it finds.
    fn find_entry(&self, ctx: &EpochContext) -> Option<&Entry> {
        let table = self.table.as_ref()?;
        if let Some((table_id, slot)) = ctx.binding.get() {
            if table_id == self.id {
                let entry = &table[slot].0;
                if entry.thread_id.load(Ordering::Relaxed) == ctx.thread_id {
                    return Some(entry);
                }
            }
        }

        // the binding may point at another table while a slot here is still ours
        let size = table.len();
        let start = self.probe_start(ctx, size);
        for i in 0..size {
            let slot = (start + i) & (size - 1);
            if table[slot].thread_id.load(Ordering::SeqCst) == ctx.thread_id {
                ctx.binding.set(Some((self.id, slot)));
                return Some(&table[slot].0);
            }
        }
        None
    }

    /// Locate or claim the slot of `ctx` by linear probing from `hash(thread_id)`.
    fn get_entry(&self, ctx: &EpochContext) -> Result<&Entry, Status> {
        if let Some(entry) = self.find_entry(ctx) {
            return Ok(entry);
        }
        let table = match self.table {
            Some(ref t) => t,
            None => {
                warn!("epoch table is not initialized");
                return Err(Status::NotInitialized);
            }
        };
        let size = table.len();
        let start = self.probe_start(ctx, size);
        for i in 0..size {
            let slot = (start + i) & (size - 1);
            if table[slot]
                .thread_id
                .compare_exchange(0, ctx.thread_id, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                trace!(
                    "epoch table {} slot {} claimed by thread {}",
                    self.id,
                    slot,
                    ctx.thread_id
                );
                ctx.binding.set(Some((self.id, slot)));
                return Ok(&table[slot].0);
            }
        }
        warn!(
            "epoch table is full, capacity={}, thread_id={}",
            size, ctx.thread_id
        );
        Err(Status::TableFull)
    }
}
