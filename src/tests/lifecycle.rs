//! Thread lifecycle: spawn, join, detach, and handle movement.

use std::sync::Arc;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use super::helpers::init_logging;
use crate::{Machine, Mutex, RawEntry, Thread, ThreadError};

#[test]
fn spawn_and_join_many() {
    init_logging();
    let counter = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&counter);
    Machine::new(2).run(move || {
        let mut workers = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&observed);
            workers.push(Thread::spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for worker in &workers {
            worker.join();
        }
        assert_eq!(observed.load(Ordering::SeqCst), 8);
    });
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[test]
fn join_after_thread_exited() {
    init_logging();
    Machine::new(1).run(|| {
        let done = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&done);
        let t = Thread::spawn(move || {
            seen.store(true, Ordering::SeqCst);
        });
        while !done.load(Ordering::SeqCst) {
            crate::yield_now();
        }
        // a few more rounds so the thread finishes its exit protocol
        for _ in 0..32 {
            crate::yield_now();
        }
        t.join();
        // joining an already-exited thread is not an error
        t.join();
    });
}

#[test]
fn dropped_handle_detaches() {
    init_logging();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&ran);
    Machine::new(1).run(move || {
        let flag = Arc::clone(&observed);
        let t = Thread::spawn(move || {
            crate::yield_now();
            flag.store(true, Ordering::SeqCst);
        });
        drop(t);
        while !observed.load(Ordering::SeqCst) {
            crate::yield_now();
        }
    });
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn handle_moves_while_thread_is_blocked() {
    init_logging();
    let hits = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&hits);
    Machine::new(1).run(move || {
        let gate = Arc::new(Mutex::new());
        let started = Arc::new(AtomicBool::new(false));
        gate.lock();
        let t = {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            let hits = Arc::clone(&observed);
            Thread::spawn(move || {
                started.store(true, Ordering::SeqCst);
                gate.lock();
                hits.fetch_add(1, Ordering::SeqCst);
                gate.unlock().unwrap();
            })
        };
        while !started.load(Ordering::SeqCst) {
            crate::yield_now();
        }
        for _ in 0..16 {
            crate::yield_now(); // let the thread block on the gate
        }
        // move the handle around while its thread sits on the wait queue
        let moved = t;
        let mut parked = Vec::new();
        parked.push(moved);
        gate.unlock().unwrap();
        parked[0].join();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

static RAW_HITS: AtomicUsize = AtomicUsize::new(0);

unsafe fn raw_entry(arg: *mut libc::c_void) {
    RAW_HITS.fetch_add(arg as usize, Ordering::SeqCst);
}

#[test]
fn spawn_raw_runs_entry_with_argument() {
    init_logging();
    Machine::new(1).run(|| {
        let t = unsafe { Thread::spawn_raw(Some(raw_entry as RawEntry), 3usize as *mut libc::c_void) }
            .unwrap();
        t.join();
    });
    assert_eq!(RAW_HITS.load(Ordering::SeqCst), 3);
}

#[test]
fn spawn_raw_null_entry_is_invalid_argument() {
    init_logging();
    Machine::new(1).run(|| {
        let err = unsafe { Thread::spawn_raw(None, core::ptr::null_mut()) }.unwrap_err();
        assert_eq!(err, ThreadError::InvalidArgument);
    });
}

#[test]
#[should_panic(expected = "must be called from a thread running on a simulated cpu")]
fn spawn_outside_machine_panics() {
    let _ = Thread::spawn(|| {});
}
