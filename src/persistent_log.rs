//! Durable intent log and the crash-consistent compare-and-swap built on it.
//!
//! The log is laid over caller-supplied persistent memory:
//!
//! ```text
//! +-------------------+------------------+-----------------+-----+
//! | LogHeader (32 B)  | LogEntry 0 (32B) | LogEntry 1      | ... |
//! +-------------------+------------------+-----------------+-----+
//! ```
//!
//! Each thread owns one entry for its lifetime. Before a CAS touches a word the thread's entry is
//! overwritten with `{addr, old, new}` by one streaming store, so after a crash `recover` knows
//! which exchanges may not have reached the media and replays them.
//!
//! The new value of a CAS is not flushed right away. It is written back lazily by the next
//! `register_item` on the same handle, or by `persist_pending`/`persist_all` at shutdown.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use error::Status;
use media::DurableMedia;
use util;

/// One in-flight CAS, padded to half a cache line so it can be streamed as one 32-byte store.
#[repr(C, align(32))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Target word, 0 when the slot was never used.
    pub addr: u64,
    pub old: u64,
    pub new: u64,
    padding: u64,
}

impl LogEntry {
    pub fn new(addr: u64, old: u64, new: u64) -> LogEntry {
        LogEntry {
            addr,
            old,
            new,
            padding: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addr == 0
    }
}

/// Administrative fields at the start of the log region.
#[repr(C, align(32))]
pub struct LogHeader {
    next_free_slot: AtomicU32,
    capacity: u32,
    padding: [u8; 24],
}

/// Outcome of replaying the log after a restart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-empty slots found.
    pub scanned: u32,
    /// Target still held `old`, the exchange was applied now.
    pub completed: u32,
    /// Target already held `new`.
    pub already_applied: u32,
    /// Target held neither value; a later CAS by another thread moved it on.
    pub superseded: u32,
    pub elapsed_us: i64,
}

/// View over a log region living in persistent memory.
///
/// The region has to stay mapped at the same virtual address for as long as this value and any
/// `LogHandle` exist, and across restarts, since entries record raw target addresses.
pub struct PersistentLog {
    header: NonNull<LogHeader>,
    entries: NonNull<LogEntry>,
}

unsafe impl Send for PersistentLog {}
unsafe impl Sync for PersistentLog {}

impl PersistentLog {
    /// Bytes needed for a log with `capacity` slots.
    pub fn region_len(capacity: u32) -> usize {
        mem::size_of::<LogHeader>() + capacity as usize * mem::size_of::<LogEntry>()
    }

    unsafe fn attach(mem: *mut u8) -> Result<PersistentLog, Status> {
        if mem.is_null() || mem as usize % mem::align_of::<LogHeader>() != 0 {
            warn!("log region must be non-null and 32-byte aligned, mem={:p}", mem);
            return Err(Status::InvalidParam);
        }
        let header = NonNull::new_unchecked(mem as *mut LogHeader);
        let entries =
            NonNull::new_unchecked(mem.add(mem::size_of::<LogHeader>()) as *mut LogEntry);
        Ok(PersistentLog { header, entries })
    }

    /// Format a fresh log at `mem`: zero the header and every slot, record the capacity, and
    /// make all of it durable.
    ///
    /// `mem` must be valid for `region_len(capacity)` bytes.
    pub unsafe fn initialize<M: DurableMedia>(
        mem: *mut u8,
        capacity: u32,
        media: &M,
    ) -> Result<PersistentLog, Status> {
        if capacity == 0 {
            warn!("log capacity must be positive");
            return Err(Status::InvalidParam);
        }
        let log = Self::attach(mem)?;
        let len = Self::region_len(capacity);
        ptr::write_bytes(mem, 0, len);
        (*log.header.as_ptr()).capacity = capacity;
        let mut offset = 0;
        while offset < len {
            media.flush(mem.add(offset));
            offset += ::CACHE_LINE_SIZE;
        }
        media.fence();
        info!("persistent log initialized, capacity={}, mem={:p}", capacity, mem);
        Ok(log)
    }

    /// Re-attach to a log formatted by an earlier run. Call `recover` before handing out handles.
    pub unsafe fn open(mem: *mut u8) -> Result<PersistentLog, Status> {
        let log = Self::attach(mem)?;
        if log.capacity() == 0 {
            warn!("no persistent log found at {:p}", mem);
            return Err(Status::NotInitialized);
        }
        info!(
            "persistent log opened, capacity={}, mem={:p}",
            log.capacity(),
            mem
        );
        Ok(log)
    }

    #[inline]
    fn header(&self) -> &LogHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Slots handed out since the log was initialized or last recovered.
    pub fn slots_in_use(&self) -> u32 {
        self.header().next_free_slot.load(Ordering::SeqCst)
    }

    #[inline]
    fn entry_ptr(&self, slot: u32) -> *mut LogEntry {
        debug_assert!(slot < self.capacity());
        unsafe { self.entries.as_ptr().add(slot as usize) }
    }

    /// Current contents of `slot`.
    pub fn entry(&self, slot: u32) -> Option<LogEntry> {
        if slot >= self.capacity() {
            return None;
        }
        Some(unsafe { ptr::read_volatile(self.entry_ptr(slot)) })
    }

    /// Claim a private slot for the calling thread.
    ///
    /// Running out of slots means the log was sized below the number of concurrent writers.
    pub fn handle<'a, M: DurableMedia>(&'a self, media: &'a M) -> Result<LogHandle<'a, M>, Status> {
        let next_free = &self.header().next_free_slot;
        let capacity = self.capacity();
        let mut slot = next_free.load(Ordering::SeqCst);
        loop {
            // the counter stops at capacity
            if slot >= capacity {
                error!(
                    "persistent log slots exhausted, capacity={}",
                    capacity
                );
                return Err(Status::LogSlotsExhausted);
            }
            match next_free.compare_exchange(slot, slot + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(cur) => slot = cur,
            }
        }
        trace!("log slot {} claimed", slot);
        Ok(LogHandle {
            log: self,
            media,
            slot,
            _not_sync: PhantomData,
        })
    }

    /// Write back the last target of every slot. Call at shutdown, with no CAS in flight.
    pub fn persist_all<M: DurableMedia>(&self, media: &M) {
        for slot in 0..self.capacity() {
            let entry = unsafe { ptr::read_volatile(self.entry_ptr(slot)) };
            if !entry.is_empty() {
                unsafe { media.flush(entry.addr as *const u8) };
            }
        }
        media.fence();
    }

    /// Replay every logged CAS against live memory. Run once after a restart, before any new
    /// operation; running it again is harmless.
    ///
    /// Every address recorded in the log must still be mapped.
    pub unsafe fn recover<M: DurableMedia>(&self, media: &M) -> RecoveryReport {
        let start = util::get_cur_microseconds_time();
        let mut report = RecoveryReport::default();
        for slot in 0..self.capacity() {
            let dst = self.entry_ptr(slot);
            let entry = ptr::read_volatile(dst);
            if entry.is_empty() {
                continue;
            }
            report.scanned += 1;
            let target = &*(entry.addr as *const AtomicU64);
            match target.compare_exchange(entry.old, entry.new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => report.completed += 1,
                Err(cur) if cur == entry.new => report.already_applied += 1,
                Err(_) => report.superseded += 1,
            }
            debug!(
                "replayed slot {}, addr={:#x}, old={}, new={}",
                slot, entry.addr, entry.old, entry.new
            );
            media.flush(entry.addr as *const u8);
            media.fence();
            media.write_durable(dst, LogEntry::default());
        }
        self.header().next_free_slot.store(0, Ordering::SeqCst);
        media.flush(self.header.as_ptr() as *const u8);
        media.fence();
        report.elapsed_us = util::get_cur_microseconds_time() - start;
        info!(
            "persistent log recovered, scanned={}, completed={}, already_applied={}, \
             superseded={}, elapsed_us={}",
            report.scanned,
            report.completed,
            report.already_applied,
            report.superseded,
            report.elapsed_us
        );
        report
    }
}

/// A thread's private slot in a `PersistentLog`. Keep one per thread and reuse it for every
/// `persistent_cas` the thread issues.
pub struct LogHandle<'a, M: DurableMedia + 'a> {
    log: &'a PersistentLog,
    media: &'a M,
    slot: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl<'a, M: DurableMedia + 'a> LogHandle<'a, M> {
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Durably record the intent to move `target` from `old` to `new`.
    pub fn register_item(&mut self, target: &AtomicU64, old: u64, new: u64) {
        let dst = self.log.entry_ptr(self.slot);
        let addr = target as *const AtomicU64 as u64;
        unsafe {
            let prev = ptr::read_volatile(dst);
            // lazy write-back of the value our previous CAS installed
            if !prev.is_empty() && prev.addr != addr {
                self.media.flush(prev.addr as *const u8);
            }
            // an earlier store to the target must be durable before we log a pair against it
            self.media.flush(addr as *const u8);
            self.media.fence();
            self.media.write_durable(dst, LogEntry::new(addr, old, new));
            self.media.fence();
        }
    }

    /// Crash-consistent compare-and-swap. Returns the value observed in `target` right before the
    /// exchange, so the CAS succeeded iff the result equals `old`.
    pub fn persistent_cas(&mut self, target: &AtomicU64, old: u64, new: u64) -> u64 {
        self.register_item(target, old, new);
        match target.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) => prev,
            Err(cur) => cur,
        }
    }

    /// Write back the value installed by this handle's last CAS.
    pub fn persist_pending(&self) {
        let entry = unsafe { ptr::read_volatile(self.log.entry_ptr(self.slot)) };
        if !entry.is_empty() {
            unsafe { self.media.flush(entry.addr as *const u8) };
            self.media.fence();
        }
    }
}
