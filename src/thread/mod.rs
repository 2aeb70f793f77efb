//! Thread objects: the internal control block and the start wrapper that
//! every thread's machine context enters through.

use core::ptr::NonNull;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::arch::{self, Context};
use crate::kernel::{self, Kernel};
use crate::mem::{Stack, STACK_SIZE};

pub(crate) mod handle;

pub use handle::{RawEntry, Thread};

pub(crate) use handle::HandleSlot;

/// What a thread runs when it is first scheduled.
pub(crate) enum Entry {
    Closure(Box<dyn FnOnce() + Send + 'static>),
    Raw {
        entry: RawEntry,
        arg: *mut libc::c_void,
    },
    Idle,
}

/// Internal thread control block.
///
/// A control block is referenced from exactly one place at a time: the
/// `current` slot of some CPU, the ready queue, the idle queue, a mutex or
/// condition-variable wait queue, another thread's joiners, or the
/// deferred-delete slot. It is heap-allocated and never moves; the machine
/// context requires a stable address.
pub(crate) struct Tcb {
    stack: Stack,
    pub(crate) context: Context,
    /// Taken by the start wrapper on first dispatch.
    entry: Option<Entry>,
    /// Back-link to the owning handle's slot. Cleared by whichever side
    /// severs first: handle drop, or thread exit.
    pub(crate) parent: Option<NonNull<HandleSlot>>,
    /// Threads blocked in `join` on this one, FIFO.
    pub(crate) joiners: VecDeque<NonNull<Tcb>>,
    /// Depth of interrupt-handler frames currently on this thread's stack.
    pub(crate) in_interrupt: u32,
}

impl Tcb {
    /// Heap-allocate a control block and initialize its machine context to
    /// enter the start wrapper.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard. Ownership of the returned pointer must
    /// immediately pass to one scheduler location.
    pub(crate) unsafe fn allocate(entry: Entry) -> NonNull<Tcb> {
        let stack = Stack::new(STACK_SIZE);
        let tcb = Box::into_raw(Box::new(Tcb {
            stack,
            context: Context::new(),
            entry: Some(entry),
            parent: None,
            joiners: VecDeque::new(),
            in_interrupt: 0,
        }));
        unsafe {
            let stack_base = (*tcb).stack.base();
            let stack_size = (*tcb).stack.size();
            arch::make_context(
                core::ptr::addr_of_mut!((*tcb).context),
                thread_start,
                tcb.cast(),
                stack_base,
                stack_size,
            );
            NonNull::new_unchecked(tcb)
        }
    }
}

/// First frame of every thread; the machine context enters here exactly
/// once, with the guard still held by the switch that scheduled it.
extern "C" fn thread_start(lo: u32, hi: u32) {
    let raw = (((hi as u64) << 32) | lo as u64) as usize as *mut Tcb;
    let kernel = kernel::expect_active("thread start");
    unsafe { run_thread(kernel, NonNull::new_unchecked(raw)) }
}

/// # Safety
///
/// Called once per thread with the guard held and `me` current on this CPU.
unsafe fn run_thread(kernel: &Kernel, me: NonNull<Tcb>) -> ! {
    unsafe {
        // Same deferred-free step as the tail of a switch: whoever ran on
        // this CPU before us may be parked for deletion.
        kernel.reap_deferred();
    }
    let entry = unsafe { (*me.as_ptr()).entry.take() }.expect("thread started twice");
    kernel.unlock();

    // A panic out of a user function must not unwind through this frame:
    // `thread_start` is an `extern "C"` boundary, and the thread still has
    // to run its exit protocol so joiners are woken.
    match entry {
        Entry::Idle => unsafe { kernel.idle_loop() },
        Entry::Closure(f) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                kernel.note_user_panic(&*payload);
            }
        }
        Entry::Raw { entry, arg } => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| unsafe { entry(arg) })) {
                kernel.note_user_panic(&*payload);
            }
        }
    }

    kernel.lock();
    unsafe { kernel.retire_current(me) }
}
