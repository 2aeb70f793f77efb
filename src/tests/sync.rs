//! Mutex hand-off and condition-variable behavior.

use std::sync::Arc;
use std::time::Duration;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use super::helpers::init_logging;
use crate::{Condvar, Machine, Mutex, Thread, ThreadError};

#[test]
fn mutex_hand_off_is_fifo() {
    init_logging();
    let order = Arc::new(
        (0..4)
            .map(|_| AtomicUsize::new(usize::MAX))
            .collect::<Vec<_>>(),
    );
    let observed = Arc::clone(&order);
    // one cpu and a long quantum keep the blocking order deterministic
    Machine::new(1)
        .timer_interval(Duration::from_secs(1))
        .run(move || {
            let lock = Arc::new(Mutex::new());
            let started = Arc::new(AtomicUsize::new(0));
            let seq = Arc::new(AtomicUsize::new(0));
            lock.lock();
            let mut workers = Vec::new();
            for i in 0..4 {
                let lock = Arc::clone(&lock);
                let started = Arc::clone(&started);
                let seq = Arc::clone(&seq);
                let order = Arc::clone(&observed);
                workers.push(Thread::spawn(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    lock.lock();
                    order[i].store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    lock.unlock().unwrap();
                }));
            }
            while started.load(Ordering::SeqCst) < 4 {
                crate::yield_now();
            }
            for _ in 0..16 {
                crate::yield_now(); // all four must be queued on the lock
            }
            lock.unlock().unwrap();
            for worker in &workers {
                worker.join();
            }
        });
    for (i, slot) in order.iter().enumerate() {
        assert_eq!(slot.load(Ordering::SeqCst), i, "acquisition {i} out of order");
    }
}

#[test]
fn unlock_by_non_owner_is_rejected() {
    init_logging();
    Machine::new(2).run(|| {
        let lock = Arc::new(Mutex::new());
        // unlocking an unlocked mutex is an ownership violation too
        assert_eq!(lock.unlock(), Err(ThreadError::NotOwner));
        lock.lock();
        let intruder = {
            let lock = Arc::clone(&lock);
            Thread::spawn(move || {
                assert_eq!(lock.unlock(), Err(ThreadError::NotOwner));
            })
        };
        intruder.join();
        // the failed attempt left the mutex state untouched
        lock.unlock().unwrap();
    });
}

fn take_turns(lock: &Mutex, cond: &Condvar, count: &AtomicUsize, parity: usize, rounds: usize) {
    for _ in 0..rounds {
        lock.lock();
        while count.load(Ordering::SeqCst) % 2 != parity {
            cond.wait(lock).unwrap();
        }
        count.fetch_add(1, Ordering::SeqCst);
        cond.signal();
        lock.unlock().unwrap();
    }
}

#[test]
fn ping_pong_alternation() {
    init_logging();
    let total = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&total);
    Machine::new(2).run(move || {
        let shared = Arc::new((Mutex::new(), Condvar::new(), AtomicUsize::new(0)));
        let ping = {
            let shared = Arc::clone(&shared);
            Thread::spawn(move || {
                let (lock, cond, count) = &*shared;
                take_turns(lock, cond, count, 0, 1000);
            })
        };
        let pong = {
            let shared = Arc::clone(&shared);
            Thread::spawn(move || {
                let (lock, cond, count) = &*shared;
                take_turns(lock, cond, count, 1, 1000);
            })
        };
        ping.join();
        pong.join();
        let (_, _, count) = &*shared;
        observed.store(count.load(Ordering::SeqCst), Ordering::SeqCst);
    });
    assert_eq!(total.load(Ordering::SeqCst), 2000);
}

#[test]
fn broadcast_wakes_every_waiter() {
    init_logging();
    const WAITERS: usize = 8;
    let woken = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&woken);
    Machine::new(4).run(move || {
        let shared = Arc::new((Mutex::new(), Condvar::new(), AtomicBool::new(false)));
        let waiting = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..WAITERS {
            let shared = Arc::clone(&shared);
            let waiting = Arc::clone(&waiting);
            let woken = Arc::clone(&observed);
            workers.push(Thread::spawn(move || {
                let (lock, cond, go) = &*shared;
                lock.lock();
                waiting.fetch_add(1, Ordering::SeqCst);
                while !go.load(Ordering::SeqCst) {
                    cond.wait(lock).unwrap();
                }
                woken.fetch_add(1, Ordering::SeqCst);
                lock.unlock().unwrap();
            }));
        }
        while waiting.load(Ordering::SeqCst) < WAITERS {
            crate::yield_now();
        }
        let (lock, cond, go) = &*shared;
        lock.lock();
        go.store(true, Ordering::SeqCst);
        cond.broadcast();
        lock.unlock().unwrap();
        for worker in &workers {
            worker.join();
        }
        assert_eq!(observed.load(Ordering::SeqCst), WAITERS);
    });
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn signal_wakes_in_wait_order() {
    init_logging();
    let order = Arc::new(
        (0..3)
            .map(|_| AtomicUsize::new(usize::MAX))
            .collect::<Vec<_>>(),
    );
    let observed = Arc::clone(&order);
    Machine::new(1)
        .timer_interval(Duration::from_secs(1))
        .run(move || {
            let shared = Arc::new((Mutex::new(), Condvar::new()));
            let waiting = Arc::new(AtomicUsize::new(0));
            let seq = Arc::new(AtomicUsize::new(0));
            let mut workers = Vec::new();
            for i in 0..3 {
                let shared = Arc::clone(&shared);
                let waiting = Arc::clone(&waiting);
                let seq = Arc::clone(&seq);
                let order = Arc::clone(&observed);
                workers.push(Thread::spawn(move || {
                    let (lock, cond) = &*shared;
                    lock.lock();
                    waiting.fetch_add(1, Ordering::SeqCst);
                    cond.wait(lock).unwrap();
                    order[i].store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    lock.unlock().unwrap();
                }));
            }
            while waiting.load(Ordering::SeqCst) < 3 {
                crate::yield_now();
            }
            let (lock, cond) = &*shared;
            for _ in 0..3 {
                lock.lock();
                cond.signal();
                lock.unlock().unwrap();
            }
            for worker in &workers {
                worker.join();
            }
        });
    for (i, slot) in order.iter().enumerate() {
        assert_eq!(slot.load(Ordering::SeqCst), i, "waiter {i} woke out of order");
    }
}

#[test]
fn wait_without_ownership_is_rejected() {
    init_logging();
    Machine::new(1).run(|| {
        let lock = Mutex::new();
        let cond = Condvar::new();
        assert_eq!(cond.wait(&lock), Err(ThreadError::NotOwner));
    });
}
