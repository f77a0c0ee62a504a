extern crate core_affinity;
extern crate env_logger;
extern crate rs_pmtool;

use rs_pmtool::media::{DurableMedia, PmemMedia, SimulatedMedia};
use rs_pmtool::persistent_log::{LogEntry, PersistentLog};
use rs_pmtool::util::AlignedRegion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const ITEM_CNT: u32 = 48 * 2;

/// A log region and a block of target words, both "persistent".
struct Pool<M: DurableMedia> {
    log_region: AlignedRegion,
    words: AlignedRegion,
    log: PersistentLog,
    media: M,
}

impl<M: DurableMedia> Pool<M> {
    fn new(media: M, capacity: u32, word_count: usize) -> Pool<M> {
        let _ = env_logger::try_init();
        let log_region = AlignedRegion::zeroed(PersistentLog::region_len(capacity)).unwrap();
        let words = AlignedRegion::zeroed(word_count * 8).unwrap();
        let log = unsafe { PersistentLog::initialize(log_region.as_ptr(), capacity, &media) }
            .unwrap();
        Pool {
            log_region,
            words,
            log,
            media,
        }
    }

    fn word(&self, idx: usize) -> &AtomicU64 {
        &self.words.words()[idx]
    }

    /// Re-attach after a (simulated) restart.
    fn reopen(&mut self) {
        self.log = unsafe { PersistentLog::open(self.log_region.as_ptr()) }.unwrap();
    }
}

impl Pool<SimulatedMedia> {
    fn simulated(capacity: u32, word_count: usize) -> Pool<SimulatedMedia> {
        let pool = Pool::new(SimulatedMedia::new(), capacity, word_count);
        unsafe { pool.media.track(pool.words.as_ptr(), pool.words.len()) };
        pool
    }
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
        }
    }
}

#[test]
fn test_simple_cas() {
    let pool = Pool::new(PmemMedia::new(), ITEM_CNT, 8);
    let target = pool.word(0);
    let mut h = pool.log.handle(&pool.media).unwrap();
    for i in 1..100u64 {
        let rv = h.persistent_cas(target, i - 1, i);
        assert_eq!(rv, i - 1);
        assert_eq!(target.load(Ordering::SeqCst), i);
        assert_eq!(
            pool.log.entry(h.slot()),
            Some(LogEntry::new(target as *const _ as u64, i - 1, i))
        );
    }
}

#[test]
fn test_simple_recovery() {
    let pool = Pool::new(PmemMedia::new(), ITEM_CNT, 8);
    let target = pool.word(0);
    {
        let mut h = pool.log.handle(&pool.media).unwrap();
        for i in 1..100u64 {
            h.persistent_cas(target, i - 1, i);
        }
        h.persist_pending();
    }
    assert_eq!(target.load(Ordering::SeqCst), 99);
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.scanned, 1);
    assert_eq!(report.already_applied, 1);
    assert_eq!(target.load(Ordering::SeqCst), 99);
}

#[test]
fn test_recovery_completes_interrupted_cas() {
    let mut pool = Pool::simulated(4, 8);
    let target_addr = pool.word(0) as *const AtomicU64 as u64;
    pool.word(0).store(5, Ordering::SeqCst);
    unsafe { pool.media.flush(pool.words.as_ptr()) };
    pool.media.fence();
    {
        let mut h = pool.log.handle(&pool.media).unwrap();
        assert_eq!(h.persistent_cas(pool.word(0), 5, 6), 5);
    }
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 6);

    // the new value was never written back
    unsafe { pool.media.crash() };
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 5);

    pool.reopen();
    assert_eq!(pool.log.entry(0), Some(LogEntry::new(target_addr, 5, 6)));
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.completed, 1);
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 6);
    assert_eq!(
        pool.media.durable_word(pool.word(0) as *const _ as *const u64),
        Some(6)
    );
}

#[test]
fn test_recovery_noop_when_persisted() {
    let mut pool = Pool::simulated(4, 8);
    pool.word(0).store(5, Ordering::SeqCst);
    {
        let mut h = pool.log.handle(&pool.media).unwrap();
        h.persistent_cas(pool.word(0), 5, 6);
        h.persist_pending();
    }
    unsafe { pool.media.crash() };
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 6);

    pool.reopen();
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.completed, 0);
    assert_eq!(report.already_applied, 1);
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 6);
}

#[test]
fn test_crash_between_log_and_cas() {
    let mut pool = Pool::simulated(4, 8);
    pool.word(3).store(5, Ordering::SeqCst);
    {
        let mut h = pool.log.handle(&pool.media).unwrap();
        h.register_item(pool.word(3), 5, 6);
    }
    unsafe { pool.media.crash() };
    assert_eq!(pool.word(3).load(Ordering::SeqCst), 5);

    pool.reopen();
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.completed, 1);
    assert_eq!(pool.word(3).load(Ordering::SeqCst), 6);
}

#[test]
fn test_recovery_leaves_moved_on_word() {
    let pool = Pool::simulated(4, 8);
    pool.word(0).store(5, Ordering::SeqCst);
    {
        let mut h = pool.log.handle(&pool.media).unwrap();
        h.persistent_cas(pool.word(0), 5, 6);
    }
    pool.word(0).store(9, Ordering::SeqCst);
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.superseded, 1);
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 9);
}

#[test]
fn test_recovery_twice_and_slot_reuse() {
    let mut pool = Pool::simulated(2, 16);
    {
        let mut h0 = pool.log.handle(&pool.media).unwrap();
        let mut h1 = pool.log.handle(&pool.media).unwrap();
        h0.persistent_cas(pool.word(0), 0, 1);
        h1.persistent_cas(pool.word(8), 0, 1);
    }
    assert!(pool.log.handle(&pool.media).is_err());
    unsafe { pool.media.crash() };

    pool.reopen();
    let first = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(first.scanned, 2);
    assert_eq!(first.completed, 2);
    let second = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(second.scanned, 0);

    assert_eq!(pool.log.slots_in_use(), 0);
    assert_eq!(pool.log.entry(0), Some(LogEntry::default()));
    let h = pool.log.handle(&pool.media).unwrap();
    assert_eq!(h.slot(), 0);
    assert_eq!(pool.word(0).load(Ordering::SeqCst), 1);
    assert_eq!(pool.word(8).load(Ordering::SeqCst), 1);
}

#[test]
fn test_persist_all() {
    let pool = Pool::simulated(4, 32);
    {
        let mut handles: Vec<_> = (0..4)
            .map(|_| pool.log.handle(&pool.media).unwrap())
            .collect();
        for (i, h) in handles.iter_mut().enumerate() {
            h.persistent_cas(pool.word(i * 8), 0, 100 + i as u64);
        }
    }
    pool.log.persist_all(&pool.media);
    unsafe { pool.media.crash() };
    for i in 0..4 {
        assert_eq!(pool.word(i * 8).load(Ordering::SeqCst), 100 + i as u64);
    }
}

#[test]
fn test_multi_thread_counter() {
    let thread_count = 8usize;
    let loops = 2_000u64;
    let pool = Arc::new(Pool::new(PmemMedia::new(), ITEM_CNT, 8));

    let mut threads = vec![];
    for idx in 0..thread_count {
        let pool = pool.clone();
        threads.push(thread::spawn(move || {
            set_cpu_affinity(idx);
            let mut h = pool.log.handle(&pool.media).unwrap();
            let counter = pool.word(0);
            for _ in 0..loops {
                loop {
                    let cur = counter.load(Ordering::SeqCst);
                    if h.persistent_cas(counter, cur, cur + 1) == cur {
                        break;
                    }
                }
            }
            h.persist_pending();
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(
        pool.word(0).load(Ordering::SeqCst),
        thread_count as u64 * loops
    );
    assert_eq!(pool.log.slots_in_use(), thread_count as u32);
}

#[test]
fn test_multi_thread_crash_recovery() {
    let thread_count = 4usize;
    let loops = 500u64;
    let mut pool = Arc::new(Pool::simulated(8, thread_count * 8));

    let mut threads = vec![];
    for idx in 0..thread_count {
        let pool = pool.clone();
        threads.push(thread::spawn(move || {
            let mut h = pool.log.handle(&pool.media).unwrap();
            let word = pool.word(idx * 8);
            for i in 0..loops {
                assert_eq!(h.persistent_cas(word, i, i + 1), i);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let pool = Arc::get_mut(&mut pool).unwrap();

    unsafe { pool.media.crash() };
    for idx in 0..thread_count {
        // each word was written back right before its last CAS
        assert_eq!(pool.word(idx * 8).load(Ordering::SeqCst), loops - 1);
    }

    pool.reopen();
    let report = unsafe { pool.log.recover(&pool.media) };
    assert_eq!(report.completed, thread_count as u32);
    for idx in 0..thread_count {
        assert_eq!(pool.word(idx * 8).load(Ordering::SeqCst), loops);
    }
}
