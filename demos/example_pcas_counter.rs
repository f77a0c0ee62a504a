extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_pmtool;

use rs_pmtool::epoch_manager::EpochManager;
use rs_pmtool::epoch_table::EpochContext;
use rs_pmtool::error::Status;
use rs_pmtool::media::PmemMedia;
use rs_pmtool::persistent_log::PersistentLog;
use rs_pmtool::util::{self, AlignedRegion};
use rs_pmtool::MAX_THREAD_COUNT;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

struct Shared {
    // keep the regions alive for as long as the log points into them
    _log_region: AlignedRegion,
    counters: AlignedRegion,
    log: PersistentLog,
    media: PmemMedia,
    epochs: EpochManager,
    stop: AtomicBool,
}

fn main() {
    env_logger::init();

    let writer_count = MAX_THREAD_COUNT / 2;
    let loops = 100_000u64;

    let media = PmemMedia::new();
    let log_region = AlignedRegion::zeroed(PersistentLog::region_len(MAX_THREAD_COUNT as u32))
        .expect("log region");
    let counters = AlignedRegion::zeroed(64).expect("counter region");
    let log = unsafe { PersistentLog::initialize(log_region.as_ptr(), MAX_THREAD_COUNT as u32, &media) }
        .expect("log initialize");
    let mut epochs = EpochManager::new();
    assert_eq!(epochs.initialize(), Status::Success);

    let shared = Arc::new(Shared {
        _log_region: log_region,
        counters,
        log,
        media,
        epochs,
        stop: AtomicBool::new(false),
    });

    let reclaimer = {
        let shared = shared.clone();
        thread::spawn(move || {
            let mut rounds = 0u64;
            while !shared.stop.load(Ordering::SeqCst) {
                let epoch = shared.epochs.bump_current_epoch();
                shared.epochs.compute_new_safe_to_reclaim_epoch(epoch);
                rounds += 1;
                thread::yield_now();
            }
            rounds
        })
    };

    let start = util::get_cur_microseconds_time();
    let mut writers = vec![];
    for _ in 0..writer_count {
        let shared = shared.clone();
        writers.push(thread::spawn(move || {
            let ctx = EpochContext::new();
            let mut h = shared.log.handle(&shared.media).expect("log slot");
            let counter = &shared.counters.words()[0];
            for _ in 0..loops {
                let _guard = shared.epochs.protect_guard(&ctx).expect("epoch slot");
                loop {
                    let cur = counter.load(Ordering::SeqCst);
                    if h.persistent_cas(counter, cur, cur + 1) == cur {
                        break;
                    }
                }
            }
            h.persist_pending();
            shared.epochs.clear_registry(&ctx);
        }));
    }
    for t in writers {
        t.join().expect("writer panicked");
    }
    let elapsed_us = util::get_cur_microseconds_time() - start;
    shared.stop.store(true, Ordering::SeqCst);
    let rounds = reclaimer.join().expect("reclaimer panicked");

    let report = unsafe { shared.log.recover(&shared.media) };
    info!("recovery after clean shutdown: {:?}", report);
    println!(
        "counter={}, expected={}, elapsed_us={}, reclaim rounds={}, safe epoch={}",
        shared.counters.words()[0].load(Ordering::SeqCst),
        writer_count as u64 * loops,
        elapsed_us,
        rounds,
        shared.epochs.safe_to_reclaim_epoch()
    );
}
