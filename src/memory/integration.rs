#[cfg(all(test, not(loom)))]
mod tests {
    use std::collections::HashSet;
    use std::ptr::NonNull;
    use std::sync::mpsc;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    use crate::bufq::{BufState, ThreadQueue};
    use crate::memory::{
        AllocOptions, Allocator, BytePool, FastAllocator, FixedLenAllocator, GlobalAllocator, MAX_ALIGN,
        PoolAllocator, PoolConfig, PoolOwner, ThreadAllocator,
    };
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::thread;
    use crate::threading::{ALL_THREADS, LockObj, Thread, ThreadFunc, ThreadPool};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn seeded() -> StdRng {
        let seed: u64 = rand::thread_rng().next_u64();
        log::info!("Using seed {seed}");
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn test_pool_routes_sizes_to_classes() {
        init_logs();
        // Scenario A
        let global = Arc::new(GlobalAllocator::detached());
        let config = PoolConfig {
            smallest: 16,
            num_pools: 4,
            ..PoolConfig::default()
        };
        let pool = PoolAllocator::with_block_allocator(config, global.clone()).unwrap();

        let owners: Vec<_> = [16, 32, 48, 64, 100]
            .into_iter()
            .map(|size| {
                let p = pool.alloc(size).unwrap();
                // Safety: Test code.
                unsafe { pool.owner_of(p) }
            })
            .collect();
        assert_eq!(
            owners,
            [
                PoolOwner::Pool(0),
                PoolOwner::Pool(1),
                PoolOwner::Pool(2),
                PoolOwner::Pool(3),
                PoolOwner::BlockAllocator
            ]
        );
        // four pool blocks plus the large request
        assert_eq!(global.stats().live_allocs(), 5);
    }

    #[test]
    fn test_pool_smallest_fitting_class() {
        // P1
        let pool = PoolAllocator::new(PoolConfig::default()).unwrap();
        let mut rng = seeded();
        for _ in 0..500 {
            let size = rng.gen_range(1..=400);
            let p = pool.alloc(size).unwrap();
            // Safety: Test code.
            let owner = unsafe { pool.owner_of(p) };
            match pool.pool_for(size) {
                Some(i) => {
                    assert_eq!(owner, PoolOwner::Pool(i));
                    assert!(pool.config().class_size(i) >= size);
                    assert!(i == 0 || pool.config().class_size(i - 1) < size);
                }
                None => {
                    assert!(size > pool.max_pooled_size());
                    assert_eq!(owner, PoolOwner::BlockAllocator);
                }
            }
            // Safety: Test code.
            unsafe { pool.free(p).unwrap() };
        }
    }

    #[test]
    fn test_fixed_len_second_block_on_ninth_alloc() {
        // Scenario B
        let global = Arc::new(GlobalAllocator::detached());
        let alloc = FixedLenAllocator::with_options(64, 8, AllocOptions::empty(), Some(global.clone())).unwrap();
        for _ in 0..8 {
            alloc.alloc(64).unwrap();
        }
        assert_eq!(global.stats().num_allocs, 1);
        alloc.alloc(64).unwrap();
        assert_eq!(global.stats().num_allocs, 2);
    }

    fn round_trip(alloc: &dyn Allocator, size: usize) {
        let align = alloc.options().alignment();
        let p = alloc.alloc(size).unwrap();
        assert_eq!(p.as_ptr().addr() % align, 0, "{}", alloc.name());
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0xAB, size);
            alloc.free(p).unwrap();
        }
        let q = alloc.alloc(size).unwrap();
        assert_eq!(q.as_ptr().addr() % align, 0, "{}", alloc.name());
        if alloc.options().contains(AllocOptions::ZERO_MEM) {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == 0), "{} reused dirty memory", alloc.name());
        }
        // Safety: Test code.
        unsafe { alloc.free(q).unwrap() };
    }

    #[test]
    fn test_round_trip_every_allocator() {
        // P2
        let opts = AllocOptions::ZERO_MEM | AllocOptions::DEFAULT_ALIGN;
        let global = GlobalAllocator::detached();
        global.set_options(opts);
        round_trip(&global, 200);

        let fixed = FixedLenAllocator::with_options(96, 8, opts, None).unwrap();
        round_trip(&fixed, 96);

        let pool = PoolAllocator::new(PoolConfig {
            options: opts,
            ..PoolConfig::default()
        })
        .unwrap();
        round_trip(&pool, 40);
        round_trip(&pool, 4000);

        let fast = FastAllocator::new(1024, 512);
        fast.set_options(opts);
        let p = fast.alloc(24).unwrap();
        assert_eq!(p.as_ptr().addr() % MAX_ALIGN, 0);

        let bytes = BytePool::new(128, 4, opts).unwrap();
        round_trip(&bytes, 128);

        let local = ThreadAllocator::current().unwrap();
        round_trip(local.as_ref(), 72);
    }

    #[test]
    fn test_byte_pool_cross_thread_stress() {
        // P4
        let _guard = crate::TEST_MUTEX.read().unwrap();
        init_logs();
        let pool = Arc::new(BytePool::new(48, 16, AllocOptions::FREE_LATER | AllocOptions::LOCK).unwrap());
        let mut rng = seeded();

        let freers: Vec<_> = (0..4)
            .map(|_| {
                let (tx, rx) = mpsc::channel::<usize>();
                let pool = pool.clone();
                let h = thread::spawn(move || {
                    for addr in rx {
                        let p = NonNull::new(addr as *mut u8).unwrap();
                        // Safety: Test code; every address arrives once.
                        unsafe { pool.free(p).unwrap() };
                    }
                });
                (tx, h)
            })
            .collect();

        let mut live: Vec<usize> = Vec::new();
        let mut issued = HashSet::new();
        for _ in 0..5000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let p = pool.alloc(48).unwrap();
                let addr = p.as_ptr().addr();
                assert!(issued.insert(addr), "{addr:#x} handed out twice");
                // Safety: Test code.
                unsafe { p.as_ptr().write_bytes(0x3C, 48) };
                live.push(addr);
            } else {
                let addr = live.swap_remove(rng.gen_range(0..live.len()));
                issued.remove(&addr);
                freers[rng.gen_range(0..freers.len())].0.send(addr).unwrap();
            }
        }
        for (tx, h) in freers {
            drop(tx);
            h.join().unwrap();
        }
        pool.really_free();
        assert_eq!(pool.live_count(), live.len());
        assert_eq!(pool.pending_frees(), 0);
    }

    #[test]
    fn test_lock_obj_made_once_across_threads() {
        // P5
        let _guard = crate::TEST_MUTEX.read().unwrap();
        for _ in 0..20 {
            let obj = Arc::new(LockObj::new());
            let barrier = Arc::new(crate::sync::barrier::Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let (obj, barrier) = (obj.clone(), barrier.clone());
                    thread::spawn(move || {
                        barrier.wait();
                        let created = obj.make_lock();
                        (created, obj.get_lock().map(|l| std::ptr::from_ref(l).addr()))
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| r.0).count(), 1);
            let first = results[0].1;
            assert!(first.is_some());
            assert!(results.iter().all(|r| r.1 == first));
        }
    }

    #[test]
    fn test_thread_queue_producer_consumer() {
        // Scenario C
        let _guard = crate::TEST_MUTEX.read().unwrap();
        init_logs();
        let tq = Arc::new(ThreadQueue::new(0, 1).unwrap());
        let produced = Arc::new(AtomicUsize::new(0));

        let producer = {
            let (tq, produced) = (tq.clone(), produced.clone());
            thread::spawn(move || {
                for i in 0..100u16 {
                    let mut b = tq.new_buffer().unwrap();
                    b.data_mut()[..2].copy_from_slice(&i.to_le_bytes());
                    b.set_num_bytes(2).unwrap();
                    b.set_state(BufState::Ready);
                    tq.submit(b).unwrap();
                    produced.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let consumer = {
            let tq = tq.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 100 {
                    match tq.process(0).unwrap() {
                        Some(b) => {
                            seen.push(u16::from_le_bytes([b.data()[0], b.data()[1]]));
                            tq.free(b);
                        }
                        None => thread::yield_now(),
                    }
                }
                assert!(tq.process(0).unwrap().is_none());
                seen
            })
        };

        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        assert_eq!(produced.load(Ordering::SeqCst), 100);
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(tq.num_threads(), 1);
        assert_eq!(tq.outstanding(), 0);
        tq.empty();
        assert_eq!(tq.num_threads(), 0);
    }

    #[test]
    fn test_wait_all_waits_for_every_thread() {
        // P7
        let _guard = crate::TEST_MUTEX.read().unwrap();
        init_logs();
        let pool = Arc::new(ThreadPool::with_timeout(Duration::from_secs(10)));
        let signaled = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            pool.add(Thread::new(i, 1));
        }
        let body: ThreadFunc = {
            let signaled = signaled.clone();
            Arc::new(move |me: &Arc<Thread>| {
                if me.suspend() {
                    std::thread::sleep(Duration::from_millis(5 * (me.index() as u64 + 1)));
                    signaled.fetch_add(1, Ordering::SeqCst);
                    me.signal_done();
                }
            })
        };
        pool.run_all(Some(body)).unwrap();

        let waiter = {
            let (pool, signaled) = (pool.clone(), signaled.clone());
            thread::spawn(move || {
                let ok = pool.wait_all(ALL_THREADS);
                (ok, signaled.load(Ordering::SeqCst))
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(pool.resume_all(ALL_THREADS));

        let (ok, seen) = waiter.join().unwrap();
        assert!(ok);
        assert_eq!(seen, 4);
        for i in 0..4 {
            pool.find(i).unwrap().join();
        }
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn test_thread_allocators_are_private() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let mine = ThreadAllocator::current().unwrap();
        let p = mine.alloc(64).unwrap();
        let addr = p.as_ptr().addr();

        let handle = {
            let mine = mine.clone();
            thread::spawn(move || {
                let theirs = ThreadAllocator::current().unwrap();
                assert!(!Arc::ptr_eq(&mine, &theirs));
                let q = theirs.alloc(64).unwrap();
                let p = NonNull::new(addr as *mut u8).unwrap();
                // Safety: Test code; the call is refused before touching `p`.
                let refused = unsafe { mine.free(p) };
                // Safety: Test code.
                unsafe { theirs.free(q).unwrap() };
                refused.is_err()
            })
        };
        assert!(handle.join().unwrap());
        // Safety: Test code.
        unsafe { mine.free(p).unwrap() };
    }
}
