#![cfg(feature = "distributed")]

//! Ordering guarantees of the signal-graph scheduler.

use meshflow::Privilege;
use meshflow::ReduceOp;
use meshflow::sched::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn fork_and_merge_algebra() {
    let s = Scheduler::new(1);
    let src = s.source();
    assert!(s.is_triggered(src));

    let forks = s.fork(src, 3);
    assert!(forks.iter().all(|f| s.is_triggered(*f)));

    let pending = s.exec(forks[0], 0, Box::new(|| {}));
    let m = s.merge(&[forks[1], pending]);
    assert!(!s.is_triggered(m));
    s.wait(m);
    assert!(s.is_triggered(m));

    s.sink(forks[2]);
}

#[test]
fn writer_before_reader_is_observed() {
    let s = Scheduler::new(1);
    let mut field = s.field_signals();
    let cell = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&cell);
    let input = s.acquire(&mut field, Privilege::ReadWrite);
    let wrote = s.exec(input, 0, Box::new(move || c.store(42, Ordering::SeqCst)));
    s.complete(&mut field, Privilege::ReadWrite, wrote);

    let c = Arc::clone(&cell);
    let seen = Arc::new(AtomicUsize::new(0));
    let s2 = Arc::clone(&seen);
    let input = s.acquire(&mut field, Privilege::ReadOnly);
    let read = s.exec(input, 0, Box::new(move || {
        s2.store(c.load(Ordering::SeqCst), Ordering::SeqCst);
    }));
    s.complete(&mut field, Privilege::ReadOnly, read);

    s.wait(read);
    assert_eq!(seen.load(Ordering::SeqCst), 42);
}

/// The full discipline property: a write-to-f then a read-from-f observe
/// program order even when a crowd of unrelated actions is interleaved
/// arbitrarily between them.
#[test]
fn unrelated_traffic_does_not_break_per_field_order() {
    let s = Scheduler::new(2);
    let mut f = s.field_signals();
    let mut g = s.field_signals();
    let cell = Arc::new(Mutex::new(0u64));

    // a pile of unrelated work on field g, submitted around the f pair
    let mut noise = Vec::new();
    for i in 0..25 {
        let input = s.acquire(&mut g, Privilege::ReadOnly);
        let d = s.exec(input, i % 2, Box::new(move || {}));
        s.complete(&mut g, Privilege::ReadOnly, d);
        noise.push(d);
    }

    let c = Arc::clone(&cell);
    let input = s.acquire(&mut f, Privilege::ReadWrite);
    let wrote = s.exec(input, 0, Box::new(move || *c.lock().unwrap() = 7));
    s.complete(&mut f, Privilege::ReadWrite, wrote);

    for i in 0..25 {
        let input = s.acquire(&mut g, Privilege::Reduce(ReduceOp::Add));
        let d = s.exec(input, i % 2, Box::new(move || {}));
        s.complete(&mut g, Privilege::Reduce(ReduceOp::Add), d);
        noise.push(d);
    }

    let c = Arc::clone(&cell);
    let observed = Arc::new(Mutex::new(0u64));
    let o = Arc::clone(&observed);
    let input = s.acquire(&mut f, Privilege::ReadOnly);
    let read = s.exec(input, 1, Box::new(move || *o.lock().unwrap() = *c.lock().unwrap()));
    s.complete(&mut f, Privilege::ReadOnly, read);

    s.wait(read);
    for d in noise {
        s.wait(d);
    }
    assert_eq!(*observed.lock().unwrap(), 7);
}

#[test]
fn concurrent_readers_share_the_same_write_frontier() {
    let s = Scheduler::new(4);
    let mut f = s.field_signals();
    let hits = Arc::new(AtomicUsize::new(0));

    let mut reads = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&hits);
        let input = s.acquire(&mut f, Privilege::ReadOnly);
        let d = s.exec(input, 0, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        s.complete(&mut f, Privilege::ReadOnly, d);
        reads.push(d);
    }
    for d in reads {
        s.wait(d);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 8);

    // a subsequent writer waits on all of them through last_read
    let h = Arc::clone(&hits);
    let input = s.acquire(&mut f, Privilege::ReadWrite);
    let d = s.exec(input, 0, Box::new(move || {
        assert_eq!(h.load(Ordering::SeqCst), 8);
    }));
    s.complete(&mut f, Privilege::ReadWrite, d);
    s.wait(d);
}

#[test]
fn task_launch_collects_all_field_inputs() {
    let s = Scheduler::new(1);
    let mut a = s.field_signals();
    let mut b = s.field_signals();
    let ran = Arc::new(AtomicUsize::new(0));

    let r = Arc::clone(&ran);
    let done = s.launch_task(
        &mut [(&mut a, Privilege::ReadOnly), (&mut b, Privilege::ReadWrite)],
        0,
        Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }),
    );
    s.wait(done);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
