//! Durable-write capability used by the persistent log.
//!
//! The log needs exactly three things from the hardware: a store of one `LogEntry` that can't be
//! observed torn after a crash, a cache line flush, and a store fence. `PmemMedia` issues the real
//! instructions; `SimulatedMedia` keeps a durable image per cache line so a test can "pull the
//! plug" with `crash` and see only what was flushed.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{self, AtomicU64, Ordering};

use persistent_log::LogEntry;
use spin_lock::SpinLock;
use util;
use CACHE_LINE_SIZE;

const WORDS_PER_LINE: usize = CACHE_LINE_SIZE / 8;

/// Flush/fence/streaming-store primitives for persistent memory.
///
/// A `write_durable` or `flush` is only guaranteed to have reached the media once a subsequent
/// `fence` returns.
pub trait DurableMedia: Sync {
    /// Store `entry` at `dst` bypassing the cache, as a single unit.
    ///
    /// `dst` must be valid for writes and aligned to `size_of::<LogEntry>()`.
    unsafe fn write_durable(&self, dst: *mut LogEntry, entry: LogEntry);

    /// Write back the cache line holding `addr`.
    ///
    /// `addr` must point into mapped memory.
    unsafe fn flush(&self, addr: *const u8);

    /// Order every preceding flush and streaming store before anything that follows.
    fn fence(&self);
}

/// Hardware backend.
#[derive(Debug, Clone, Copy)]
pub struct PmemMedia {
    wide_store: bool,
}

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use std::arch::x86_64::{__m256i, _mm256_set_epi64x, _mm256_stream_si256, _mm_clflush,
                                _mm_sfence};

        impl PmemMedia {
            pub fn new() -> PmemMedia {
                PmemMedia {
                    wide_store: is_x86_feature_detected!("avx"),
                }
            }
        }

        #[target_feature(enable = "avx")]
        unsafe fn stream_entry(dst: *mut LogEntry, entry: LogEntry) {
            let value = _mm256_set_epi64x(0, entry.new as i64, entry.old as i64, entry.addr as i64);
            _mm256_stream_si256(dst as *mut __m256i, value);
        }

        impl DurableMedia for PmemMedia {
            unsafe fn write_durable(&self, dst: *mut LogEntry, entry: LogEntry) {
                if self.wide_store {
                    stream_entry(dst, entry);
                } else {
                    // entry never straddles a line, so one write-back covers it
                    ptr::write_volatile(dst, entry);
                    _mm_clflush(dst as *const u8);
                }
            }

            #[inline]
            unsafe fn flush(&self, addr: *const u8) {
                _mm_clflush(addr);
            }

            #[inline]
            fn fence(&self) {
                unsafe { _mm_sfence() }
            }
        }
    } else {
        impl PmemMedia {
            pub fn new() -> PmemMedia {
                PmemMedia { wide_store: false }
            }
        }

        impl DurableMedia for PmemMedia {
            unsafe fn write_durable(&self, dst: *mut LogEntry, entry: LogEntry) {
                ptr::write_volatile(dst, entry);
            }

            #[inline]
            unsafe fn flush(&self, _addr: *const u8) {}

            #[inline]
            fn fence(&self) {
                atomic::fence(Ordering::SeqCst);
            }
        }
    }
}

impl Default for PmemMedia {
    fn default() -> Self {
        PmemMedia::new()
    }
}

/// What `SimulatedMedia` was asked to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// Cache line address written back.
    Flush(usize),
    Fence,
    /// Destination address of a streaming entry store.
    WriteDurable(usize),
}

struct SimState {
    durable_lines: HashMap<usize, [u64; WORDS_PER_LINE]>,
    events: Vec<MediaEvent>,
}

/// In-memory double that models which cache lines reached the media.
///
/// Every line registered with `track`, flushed, or hit by `write_durable` has a durable image.
/// `crash` overwrites the live contents of those lines with their images, discarding every store
/// that was never flushed. Memory must be made of 64-bit words.
pub struct SimulatedMedia {
    lock: SpinLock,
    state: UnsafeCell<SimState>,
}

unsafe impl Sync for SimulatedMedia {}

unsafe fn read_line(line: usize) -> [u64; WORDS_PER_LINE] {
    let mut out = [0u64; WORDS_PER_LINE];
    let words = line as *const AtomicU64;
    for (i, w) in out.iter_mut().enumerate() {
        *w = (*words.add(i)).load(Ordering::SeqCst);
    }
    out
}

unsafe fn write_line(line: usize, image: &[u64; WORDS_PER_LINE]) {
    let words = line as *const AtomicU64;
    for (i, w) in image.iter().enumerate() {
        (*words.add(i)).store(*w, Ordering::SeqCst);
    }
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        SimulatedMedia::new()
    }
}

impl SimulatedMedia {
    pub fn new() -> SimulatedMedia {
        SimulatedMedia {
            lock: SpinLock::default(),
            state: UnsafeCell::new(SimState {
                durable_lines: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut SimState) -> R,
    {
        let _guard = self.lock.lock_guard();
        f(unsafe { &mut *self.state.get() })
    }

    /// Treat the current contents of `[addr, addr + len)` as durable.
    ///
    /// The range must be mapped, 8-byte aligned and cache-line padded on both ends.
    pub unsafe fn track(&self, addr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        let first = util::cache_line_of(addr as usize);
        let last = util::cache_line_of(addr as usize + len - 1);
        self.with_state(|s| {
            let mut line = first;
            while line <= last {
                s.durable_lines.insert(line, read_line(line));
                line += CACHE_LINE_SIZE;
            }
        });
    }

    /// Last durable value of the word at `addr`, if its line is tracked.
    pub fn durable_word(&self, addr: *const u64) -> Option<u64> {
        let line = util::cache_line_of(addr as usize);
        let idx = (addr as usize - line) / 8;
        self.with_state(|s| s.durable_lines.get(&line).map(|image| image[idx]))
    }

    pub fn events(&self) -> Vec<MediaEvent> {
        self.with_state(|s| s.events.clone())
    }

    pub fn clear_events(&self) {
        self.with_state(|s| s.events.clear())
    }

    /// Simulate power loss: every tracked line reverts to its durable image.
    ///
    /// No other thread may touch the tracked memory while this runs.
    pub unsafe fn crash(&self) {
        self.with_state(|s| {
            for (line, image) in s.durable_lines.iter() {
                write_line(*line, image);
            }
            s.events.clear();
        });
        debug!("simulated crash, in-flight stores discarded");
    }
}

impl DurableMedia for SimulatedMedia {
    unsafe fn write_durable(&self, dst: *mut LogEntry, entry: LogEntry) {
        let addr = dst as usize;
        let line = util::cache_line_of(addr);
        let first_word = (addr - line) / 8;
        self.with_state(|s| {
            ptr::write_volatile(dst, entry);
            let image = s.durable_lines
                .entry(line)
                .or_insert_with(|| read_line(line));
            image[first_word] = entry.addr;
            image[first_word + 1] = entry.old;
            image[first_word + 2] = entry.new;
            image[first_word + 3] = 0;
            s.events.push(MediaEvent::WriteDurable(addr));
        });
    }

    unsafe fn flush(&self, addr: *const u8) {
        let line = util::cache_line_of(addr as usize);
        self.with_state(|s| {
            s.durable_lines.insert(line, read_line(line));
            s.events.push(MediaEvent::Flush(line));
        });
    }

    fn fence(&self) {
        atomic::fence(Ordering::SeqCst);
        self.with_state(|s| s.events.push(MediaEvent::Fence));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use util::AlignedRegion;

    #[test]
    fn test_crash_discards_unflushed() {
        let region = AlignedRegion::zeroed(2 * CACHE_LINE_SIZE).unwrap();
        let media = SimulatedMedia::new();
        unsafe { media.track(region.as_ptr(), region.len()) };

        let words = region.words();
        words[0].store(7, Ordering::SeqCst);
        words[8].store(9, Ordering::SeqCst);
        unsafe { media.flush(&words[0] as *const _ as *const u8) };
        media.fence();

        unsafe { media.crash() };
        assert_eq!(words[0].load(Ordering::SeqCst), 7);
        assert_eq!(words[8].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_write_durable_survives_crash() {
        let region = AlignedRegion::zeroed(CACHE_LINE_SIZE).unwrap();
        let media = SimulatedMedia::new();
        unsafe { media.track(region.as_ptr(), region.len()) };

        let dst = unsafe { (region.as_ptr() as *mut LogEntry).add(1) };
        let entry = LogEntry::new(0x1000, 5, 6);
        unsafe { media.write_durable(dst, entry) };
        media.fence();
        // an unflushed neighbour on the same line is lost
        region.words()[0].store(42, Ordering::SeqCst);

        unsafe { media.crash() };
        assert_eq!(unsafe { ptr::read_volatile(dst) }, entry);
        assert_eq!(region.words()[0].load(Ordering::SeqCst), 0);
        assert_eq!(media.durable_word(&region.words()[5] as *const _ as *const u64), Some(5));
    }

    #[test]
    fn test_event_trace() {
        let region = AlignedRegion::zeroed(CACHE_LINE_SIZE).unwrap();
        let media = SimulatedMedia::new();
        let line = region.as_ptr() as usize;
        unsafe { media.flush(region.as_ptr().add(16)) };
        media.fence();
        assert_eq!(media.events(), vec![MediaEvent::Flush(line), MediaEvent::Fence]);
        media.clear_events();
        assert!(media.events().is_empty());
    }

    #[test]
    fn test_pmem_media_on_dram() {
        let region = AlignedRegion::zeroed(CACHE_LINE_SIZE).unwrap();
        let media = PmemMedia::new();
        let dst = region.as_ptr() as *mut LogEntry;
        let entry = LogEntry::new(0x2000, 1, 2);
        unsafe {
            media.write_durable(dst, entry);
            media.fence();
            media.flush(region.as_ptr());
            media.fence();
            assert_eq!(ptr::read_volatile(dst), entry);
        }
    }
}
