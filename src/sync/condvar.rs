//! Condition variables on top of [`Mutex`].

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::collections::VecDeque;

use super::Mutex;
use crate::errors::ThreadResult;
use crate::kernel;
use crate::thread::Tcb;

/// A condition variable.
///
/// The associated mutex is supplied per `wait` call; the condition variable
/// itself only keeps the FIFO of waiting threads. Awakened waiters go to
/// the ready queue and re-contend for the mutex through the normal lock
/// path when they resume.
pub struct Condvar {
    waiters: UnsafeCell<VecDeque<NonNull<Tcb>>>,
}

// The wait queue is mutated under the machine-wide guard.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Atomically release `mutex` and block until woken; re-acquires
    /// `mutex` before returning. The release, the enqueue, and the switch
    /// away all happen under one guard section, so no signal can slip in
    /// between them.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::NotOwner`] without blocking when the calling
    /// thread does not own `mutex`.
    ///
    /// [`ThreadError::NotOwner`]: crate::ThreadError::NotOwner
    pub fn wait(&self, mutex: &Mutex) -> ThreadResult<()> {
        let kernel = kernel::expect_active("Condvar::wait");
        let _guard = kernel.enter();
        unsafe {
            mutex.unlock_with_guard(kernel)?;
            let me = kernel.current_thread();
            (*self.waiters.get()).push_back(me);
            kernel.run_next();
            mutex.lock_with_guard(kernel);
        }
        Ok(())
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self) {
        let kernel = kernel::expect_active("Condvar::signal");
        let _guard = kernel.enter();
        unsafe {
            if let Some(thread) = (*self.waiters.get()).pop_front() {
                kernel.make_ready(thread);
            }
        }
    }

    /// Wake every waiting thread, preserving their relative order on the
    /// ready queue, with one CPU wake per moved thread.
    pub fn broadcast(&self) {
        let kernel = kernel::expect_active("Condvar::broadcast");
        let _guard = kernel.enter();
        unsafe {
            while let Some(thread) = (*self.waiters.get()).pop_front() {
                kernel.make_ready(thread);
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}
