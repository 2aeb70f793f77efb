//! The user-visible thread handle.

use core::cell::Cell;
use core::ptr::NonNull;

use super::{Entry, Tcb};
use crate::errors::{ThreadError, ThreadResult};
use crate::kernel::{self, Kernel};

/// Raw entry point accepted by [`Thread::spawn_raw`].
pub type RawEntry = unsafe fn(*mut libc::c_void);

/// Link between a handle and its thread.
///
/// The slot is boxed so its address survives moves of the handle itself;
/// the thread's back-link keeps pointing at it wherever the handle goes,
/// which is what makes moving a handle legal even while its thread is
/// blocked.
#[derive(Debug)]
pub(crate) struct HandleSlot {
    tcb: Cell<Option<NonNull<Tcb>>>,
}

impl HandleSlot {
    pub(crate) fn clear(&self) {
        self.tcb.set(None);
    }
}

/// Owning handle to a spawned thread.
///
/// The handle and the internal thread hold mutually consistent links: the
/// exiting thread nulls the handle side, and dropping the handle nulls the
/// thread side. A dropped handle does not stop the thread; it runs to
/// completion detached.
#[derive(Debug)]
pub struct Thread {
    slot: Box<HandleSlot>,
}

unsafe impl Send for Thread {}

impl Thread {
    /// Spawn a thread running `f`.
    ///
    /// The thread is immediately runnable; if any CPU is suspended, one is
    /// woken to pick it up.
    ///
    /// # Panics
    ///
    /// Panics when called from a host thread that is not a simulated CPU.
    pub fn spawn<F>(f: F) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = kernel::expect_active("Thread::spawn");
        Thread::spawn_entry(kernel, Entry::Closure(Box::new(f)))
    }

    /// Spawn a thread from a bare function pointer and argument.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::InvalidArgument`] when `entry` is `None`.
    ///
    /// # Safety
    ///
    /// `arg` must be valid for whatever `entry` does with it, on any CPU,
    /// for as long as the thread runs.
    pub unsafe fn spawn_raw(entry: Option<RawEntry>, arg: *mut libc::c_void) -> ThreadResult<Thread> {
        let kernel = kernel::expect_active("Thread::spawn_raw");
        let entry = entry.ok_or(ThreadError::InvalidArgument)?;
        Ok(Thread::spawn_entry(kernel, Entry::Raw { entry, arg }))
    }

    fn spawn_entry(kernel: &Kernel, entry: Entry) -> Thread {
        let slot = Box::new(HandleSlot {
            tcb: Cell::new(None),
        });
        let _guard = kernel.enter();
        unsafe {
            let tcb = kernel.create_thread(entry);
            slot.tcb.set(Some(tcb));
            (*tcb.as_ptr()).parent = Some(NonNull::from(&*slot));
        }
        Thread { slot }
    }

    /// Block until this thread's function has completed.
    ///
    /// Joining a thread that has already exited, or a handle whose thread
    /// was moved away, returns immediately; join is never an error.
    pub fn join(&self) {
        let kernel = kernel::expect_active("Thread::join");
        let _guard = kernel.enter();
        unsafe {
            if let Some(target) = self.slot.tcb.get() {
                let me = kernel.current_thread();
                (*target.as_ptr()).joiners.push_back(me);
                kernel.run_next();
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // A handle can outlive its machine (stashed by user code and
        // dropped after the run); by then every thread has exited and the
        // slot is already cleared.
        let Some(kernel) = kernel::active() else {
            return;
        };
        let _guard = kernel.enter();
        if let Some(tcb) = self.slot.tcb.get() {
            unsafe { (*tcb.as_ptr()).parent = None };
        }
    }
}
