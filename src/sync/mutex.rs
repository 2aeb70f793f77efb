//! Mutual exclusion with direct ownership hand-off.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::collections::VecDeque;

use crate::errors::{ThreadError, ThreadResult};
use crate::kernel::{self, Kernel};
use crate::thread::Tcb;

/// A mutex for threads of one machine.
///
/// Contended acquisitions are granted in FIFO order: on unlock, ownership
/// transfers directly to the head waiter before it runs again, so there is
/// never a window in which the mutex is unowned while waiters exist and a
/// late arrival could barge in.
pub struct Mutex {
    state: UnsafeCell<MutexState>,
}

struct MutexState {
    /// `Some` exactly while the mutex is locked.
    owner: Option<NonNull<Tcb>>,
    /// Threads blocked in `lock`, FIFO.
    waiters: VecDeque<NonNull<Tcb>>,
}

// All state is mutated under the machine-wide guard.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            state: UnsafeCell::new(MutexState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the mutex, blocking the calling thread while another thread
    /// owns it.
    ///
    /// # Panics
    ///
    /// Panics when called from a host thread that is not a simulated CPU.
    pub fn lock(&self) {
        let kernel = kernel::expect_active("Mutex::lock");
        let _guard = kernel.enter();
        unsafe { self.lock_with_guard(kernel) };
    }

    /// Release the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::NotOwner`] when the calling thread is not
    /// the current owner; the mutex state is left untouched.
    pub fn unlock(&self) -> ThreadResult<()> {
        let kernel = kernel::expect_active("Mutex::unlock");
        let _guard = kernel.enter();
        unsafe { self.unlock_with_guard(kernel) }
    }

    /// # Safety
    ///
    /// Caller must hold the guard.
    pub(crate) unsafe fn lock_with_guard(&self, kernel: &Kernel) {
        unsafe {
            let me = kernel.current_thread();
            let state = &mut *self.state.get();
            if state.owner.is_none() {
                state.owner = Some(me);
            } else {
                state.waiters.push_back(me);
                // By the time this thread resumes, the releaser has already
                // handed it the ownership.
                kernel.run_next();
            }
        }
    }

    /// # Safety
    ///
    /// Caller must hold the guard.
    pub(crate) unsafe fn unlock_with_guard(&self, kernel: &Kernel) -> ThreadResult<()> {
        unsafe {
            let me = kernel.current_thread();
            let state = &mut *self.state.get();
            if state.owner != Some(me) {
                return Err(ThreadError::NotOwner);
            }
            state.owner = None;
            if let Some(next) = state.waiters.pop_front() {
                state.owner = Some(next);
                kernel.make_ready(next);
            }
            Ok(())
        }
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}
