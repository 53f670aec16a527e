// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::{Arc, Barrier};
use std::thread;

use memfs_core::{
    FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultStrategy, FsError, MemFs, MemFsConfig,
    NodeId, ROOT_ID,
};

const THREADS: usize = 8;
const ROUNDS: usize = 50;
const CALLS: usize = 1000;

#[test]
fn parallel_creates_in_one_directory() {
    let fs = Arc::new(MemFs::new(MemFsConfig::default()));
    let dir = fs.mkdir(ROOT_ID, "shared", 0o755).unwrap().ino;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..ROUNDS {
                    let name = format!("t{t}-{i}");
                    let ino = fs.create(dir, &name, 0o644).unwrap().entry.ino;
                    fs.write(ino, 0, name.as_bytes()).unwrap();
                    if i % 3 == 0 {
                        fs.unlink(dir, &name).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let per_thread = ROUNDS - ROUNDS.div_ceil(3);
    let entries = fs.readdir(dir, 0, usize::MAX).unwrap();
    assert_eq!(entries.len(), THREADS * per_thread);
    for entry in &entries {
        assert_eq!(fs.read(entry.ino, 0, 64).unwrap(), entry.name.as_bytes());
    }
    assert!(fs.audit().is_ok());
}

#[test]
fn racing_creates_of_one_name_yield_one_node() {
    let fs = Arc::new(MemFs::new(MemFsConfig::default()));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || fs.create(ROOT_ID, "same", 0o644).unwrap().entry.ino)
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(fs.node_count(), 2);
}

#[test]
fn concurrent_extending_writes_are_never_torn() {
    let fs = Arc::new(MemFs::new(MemFsConfig::default()));
    let f = fs.create(ROOT_ID, "log", 0o644).unwrap().entry.ino;

    let writers: Vec<_> = (0..4u8)
        .map(|t| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..ROUNDS as u64 {
                    fs.write(f, (i * 4 + t as u64) * 16, &[t + 1; 16]).unwrap();
                }
            })
        })
        .collect();
    let reader = {
        let fs = Arc::clone(&fs);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let data = fs.read(f, 0, u32::MAX).unwrap();
                // Content only ever grows by whole 16-byte blocks.
                assert_eq!(data.len() % 16, 0);
                for block in data.chunks(16) {
                    assert!(block.iter().all(|b| *b == block[0]), "{block:?}");
                }
            }
        })
    };
    for handle in writers {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(fs.getattr(f).unwrap().size, ROUNDS as u64 * 4 * 16);
}

#[test]
fn cross_directory_renames_keep_the_tree_consistent() {
    let fs = Arc::new(MemFs::new(MemFsConfig::default()));
    for d in 0..THREADS {
        fs.mkdir(ROOT_ID, &format!("d{d}"), 0o755).unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..ROUNDS {
                    let from = fs.lookup(ROOT_ID, &format!("d{t}")).unwrap().ino;
                    let to = format!("d{}", (t + 1) % THREADS);
                    let name = format!("f{t}-{i}");
                    fs.create(from, &name, 0o644).unwrap();
                    match fs.lookup(ROOT_ID, &to) {
                        Ok(entry) => match fs.rename(from, &name, entry.ino, &name) {
                            Ok(()) | Err(FsError::NotFound) => {}
                            Err(err) => panic!("rename failed: {err}"),
                        },
                        Err(FsError::NotFound) => {}
                        Err(err) => panic!("lookup failed: {err}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(fs.audit().is_ok(), "{:?}", fs.audit());
    let total: usize = (0..THREADS)
        .map(|d| {
            let dir = fs.lookup(ROOT_ID, &format!("d{d}")).unwrap().ino;
            fs.readdir(dir, 0, usize::MAX).unwrap().len()
        })
        .sum();
    assert_eq!(total, THREADS * ROUNDS);
}

#[test]
fn engines_do_not_share_fault_state() {
    let faulty = MemFs::new(MemFsConfig::default().with_fault_policy(FaultPolicy::retry_drill()));
    let clean = MemFs::new(MemFsConfig::default());

    let a = faulty.mkdir(ROOT_ID, "a", 0o755).unwrap().ino;
    let b = clean.mkdir(ROOT_ID, "a", 0o755).unwrap().ino;
    assert_eq!(faulty.create(a, "f", 0o644), Err(FsError::TransientStale));
    for i in 0..4 {
        clean.create(b, &format!("f{i}"), 0o644).unwrap();
    }
    assert!(clean.faults().stats().is_empty());
}

fn count_parallel_faults(injector: &Arc<FaultInjector>, op: FaultOp, calls: usize) -> usize {
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let injector = Arc::clone(injector);
            thread::spawn(move || {
                (0..calls)
                    .filter(|_| injector.should_fault(op, NodeId(7)).is_some())
                    .count()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).sum()
}

#[test]
fn periodic_counter_counts_every_parallel_call() {
    let injector = Arc::new(FaultInjector::new(FaultPolicy::enabled(vec![
        FaultRule::periodic(&[FaultOp::Create, FaultOp::Mkdir]),
    ])));
    let faults = count_parallel_faults(&injector, FaultOp::Create, CALLS);

    assert_eq!(faults, THREADS * CALLS / 2);
    let stats = injector.stats();
    assert_eq!(stats[0].invocations, (THREADS * CALLS) as u64);
    assert_eq!(stats[0].faults, (THREADS * CALLS / 2) as u64);
}

#[test]
fn parallel_creates_fail_exactly_every_other_call() {
    let fs = Arc::new(MemFs::new(MemFsConfig::default().with_fault_policy(
        FaultPolicy::enabled(vec![FaultRule::periodic(&[FaultOp::Create])]),
    )));
    let dir = fs.mkdir(ROOT_ID, "shared", 0o755).unwrap().ino;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let mut stale = 0;
                for i in 0..ROUNDS {
                    match fs.create(dir, &format!("t{t}-{i}"), 0o644) {
                        Ok(_) => {}
                        Err(FsError::TransientStale) => stale += 1,
                        Err(err) => panic!("create failed: {err}"),
                    }
                }
                stale
            })
        })
        .collect();
    let stale: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(stale, THREADS * ROUNDS / 2);
    assert_eq!(fs.readdir(dir, 0, usize::MAX).unwrap().len(), THREADS * ROUNDS / 2);
    assert_eq!(fs.faults().stats()[0].invocations, (THREADS * ROUNDS) as u64);
    assert!(fs.audit().is_ok());
}

#[test]
fn racing_calls_trip_an_auto_clear_toggle_once_per_arm() {
    let injector = Arc::new(FaultInjector::new(FaultPolicy::enabled(vec![
        FaultRule::toggle(&[FaultOp::Lookup, FaultOp::Write], true),
    ])));

    for _ in 0..ROUNDS {
        assert_eq!(injector.arm(FaultOp::Write), 1);
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let injector = Arc::clone(&injector);
                let barrier = Arc::clone(&barrier);
                let op = if t % 2 == 0 { FaultOp::Write } else { FaultOp::Lookup };
                thread::spawn(move || {
                    barrier.wait();
                    injector.should_fault(op, NodeId(7)).is_some()
                })
            })
            .collect();
        let trips = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|tripped| *tripped)
            .count();
        assert_eq!(trips, 1);
        assert!(!injector.is_armed(FaultOp::Write));
    }
    assert_eq!(injector.stats()[0].faults, ROUNDS as u64);
}

#[test]
fn max_faults_holds_under_parallel_calls() {
    // Every call wants to trip, so all threads race for the three slots.
    let rule = FaultRule {
        strategy: FaultStrategy::Periodic { period: 1 },
        ..FaultRule::periodic(&[FaultOp::Open])
    }
    .with_max_faults(3);
    let injector = Arc::new(FaultInjector::new(FaultPolicy::enabled(vec![rule])));
    let faults = count_parallel_faults(&injector, FaultOp::Open, 200);

    assert_eq!(faults, 3);
    assert_eq!(injector.stats()[0].faults, 3);
    assert_eq!(injector.stats()[0].invocations, (THREADS * 200) as u64);
}
