//! The scheduler and synchronization core: the guard, the global queues,
//! `run_next`, the idle loop, and the interrupt handlers.
//!
//! A single guard flag, paired with per-CPU interrupt masking, serializes
//! every mutation of scheduler state across CPUs. Interrupts are masked
//! before the guard is acquired (a preemption taken while holding it would
//! deadlock against the same CPU) and unmasked only after it is released.

use core::cell::UnsafeCell;
use core::ptr::{addr_of, addr_of_mut, NonNull};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::Duration;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::cpu::{self, Cpu, InterruptHandler, InterruptVector};
use crate::thread::{Entry, Tcb};

/// Scheduler state shared by every CPU of one machine.
///
/// Every field of [`KernelInner`] and every per-CPU `current` slot is
/// mutated only while the guard is held.
pub(crate) struct Kernel {
    guard: AtomicBool,
    inner: UnsafeCell<KernelInner>,
    pub(crate) cpus: Box<[Cpu]>,
    /// Installable interrupt vector table; slots hold an
    /// [`InterruptHandler`] written during boot.
    vectors: [AtomicUsize; 2],
    /// Interval between timer interrupts.
    pub(crate) quantum: Duration,
    pub(crate) timer_stop: AtomicBool,
    /// User threads whose function panicked; reported by the boot harness
    /// once the machine is quiescent.
    pub(crate) panicked: AtomicUsize,
    done: StdMutex<bool>,
    done_cv: Condvar,
}

unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

struct KernelInner {
    /// Runnable threads, strict FIFO. Preempted idle threads pass through
    /// here too.
    ready: VecDeque<NonNull<Tcb>>,
    /// Idle threads waiting to be a CPU's fallback; one exists per CPU.
    idle: VecDeque<NonNull<Tcb>>,
    /// CPUs that published themselves as about to suspend.
    suspended: VecDeque<usize>,
    /// Deferred delete: the most recently exited thread, reclaimed only
    /// once the next context switch has left its stack.
    last_free: Option<NonNull<Tcb>>,
    /// User threads whose entry function has not completed yet.
    live_users: usize,
}

/// Scoped guard holder; releases the guard and re-enables interrupts on
/// every exit path, including panics unwinding out of an entry point.
pub(crate) struct KernelGuard<'a> {
    kernel: &'a Kernel,
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        self.kernel.unlock();
    }
}

impl Kernel {
    pub(crate) fn new(num_cpus: usize, quantum: Duration) -> Kernel {
        let cpus = (0..num_cpus).map(Cpu::new).collect::<Vec<_>>();
        Kernel {
            guard: AtomicBool::new(false),
            inner: UnsafeCell::new(KernelInner {
                ready: VecDeque::with_capacity(num_cpus * 2 + 8),
                idle: VecDeque::with_capacity(num_cpus),
                suspended: VecDeque::with_capacity(num_cpus),
                last_free: None,
                live_users: 0,
            }),
            cpus: cpus.into_boxed_slice(),
            vectors: [AtomicUsize::new(0), AtomicUsize::new(0)],
            quantum,
            timer_stop: AtomicBool::new(false),
            panicked: AtomicUsize::new(0),
            done: StdMutex::new(false),
            done_cv: Condvar::new(),
        }
    }

    /// # Safety
    ///
    /// Caller must hold the guard.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut KernelInner {
        unsafe { &mut *self.inner.get() }
    }

    // ------------------------------------------------------------------
    // Guard acquisition and release
    // ------------------------------------------------------------------

    /// Mask interrupts on this CPU, then spin until the guard is ours.
    pub(crate) fn lock(&self) {
        cpu::interrupt_disable();
        while self.guard.swap(true, Ordering::SeqCst) {
            core::hint::spin_loop();
        }
    }

    /// Release the guard, then unmask interrupts on this CPU.
    pub(crate) fn unlock(&self) {
        self.guard.store(false, Ordering::SeqCst);
        cpu::interrupt_enable();
    }

    /// Release the guard and park this CPU in one step. Used only by the
    /// idle loop: a plain `unlock` would open a window between unmasking
    /// and parking in which a wake IPI could fire and be lost.
    fn unlock_and_suspend(&self) {
        self.guard.store(false, Ordering::SeqCst);
        cpu::interrupt_enable_suspend();
    }

    pub(crate) fn enter(&self) -> KernelGuard<'_> {
        self.lock();
        KernelGuard { kernel: self }
    }

    // ------------------------------------------------------------------
    // Per-CPU state
    // ------------------------------------------------------------------

    fn current_cpu(&self) -> &Cpu {
        let (_, id) = cpu::active().expect("not on a simulated cpu");
        &self.cpus[id]
    }

    /// Thread currently running on the calling CPU.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard and must be past the CPU's first
    /// dispatch.
    pub(crate) unsafe fn current_thread(&self) -> NonNull<Tcb> {
        unsafe { (*self.current_cpu().current.get()).expect("no thread on this cpu") }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Switch this CPU to the next runnable thread: the head of the ready
    /// queue, or an idle thread when nothing is ready.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard. For the thread that called this, the
    /// function returns when some CPU schedules it again, with the guard
    /// held by that CPU.
    pub(crate) unsafe fn run_next(&self) {
        let cpu = self.current_cpu();
        let old = unsafe { *cpu.current.get() };
        let next = {
            let inner = unsafe { self.inner() };
            match inner.ready.pop_front() {
                Some(thread) => thread,
                None => inner
                    .idle
                    .pop_front()
                    .expect("idle queue empty with nothing ready"),
            }
        };
        unsafe { *cpu.current.get() = Some(next) };
        match old {
            Some(old) => unsafe {
                arch::swap_context(
                    addr_of_mut!((*old.as_ptr()).context),
                    addr_of!((*next.as_ptr()).context),
                );
            },
            // First dispatch on this CPU: nothing to save.
            None => unsafe { arch::set_context(addr_of!((*next.as_ptr()).context)) },
        }
        // Running again, possibly on a different CPU. Whatever thread ran
        // here before us may have parked itself for deletion; its stack is
        // no longer in use, so reclaim it, unless we are resuming inside
        // an interrupt frame, where the allocator must not run.
        unsafe { self.reap_deferred_outside_interrupt() };
    }

    /// Drop the thread parked in the deferred-delete slot, if any.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard and must not be inside an interrupt
    /// handler frame.
    pub(crate) unsafe fn reap_deferred(&self) {
        if let Some(tcb) = unsafe { self.inner() }.last_free.take() {
            drop(unsafe { Box::from_raw(tcb.as_ptr()) });
        }
    }

    unsafe fn reap_deferred_outside_interrupt(&self) {
        let current = unsafe { self.current_thread() };
        if unsafe { (*current.as_ptr()).in_interrupt } == 0 {
            unsafe { self.reap_deferred() };
        }
    }

    /// Grow the ready queue's spare capacity. Called whenever a thread is
    /// created, which is the only point the queue's maximum occupancy can
    /// grow: it can never hold more than every live user thread plus one
    /// idle thread per CPU. With that headroom in place, every later push
    /// goes through [`Kernel::push_ready`] without touching the allocator,
    /// which the preemption handler's signal frame requires.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard and must not be inside an interrupt
    /// handler frame (this path may allocate).
    unsafe fn reserve_ready(&self) {
        let inner = unsafe { self.inner() };
        inner.ready.reserve(inner.live_users + self.cpus.len());
    }

    /// Append to the ready queue. Every enqueue in the crate funnels
    /// through here; the capacity maintained by [`Kernel::reserve_ready`]
    /// guarantees the push never reallocates.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard.
    unsafe fn push_ready(&self, thread: NonNull<Tcb>) {
        let inner = unsafe { self.inner() };
        debug_assert!(
            inner.ready.len() < inner.ready.capacity(),
            "ready queue has no spare capacity for this push"
        );
        inner.ready.push_back(thread);
    }

    /// Move a thread onto the ready queue and wake a CPU for it.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard; `thread` must not currently be
    /// referenced by any queue or CPU.
    pub(crate) unsafe fn make_ready(&self, thread: NonNull<Tcb>) {
        unsafe {
            self.push_ready(thread);
            self.wakeup_one_cpu();
        }
    }

    /// Wake one suspended CPU if there is work for it. This is the sole
    /// wake mechanism; every enqueue onto the ready queue is followed by a
    /// call to it.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard.
    pub(crate) unsafe fn wakeup_one_cpu(&self) {
        let inner = unsafe { self.inner() };
        if !inner.ready.is_empty() {
            if let Some(id) = inner.suspended.pop_front() {
                self.cpus[id].interrupt_send();
            }
        }
    }

    /// Give up the CPU if other work is ready; otherwise keep running.
    pub(crate) fn yield_current(&self) {
        let _guard = self.enter();
        unsafe {
            if !self.inner().ready.is_empty() {
                let me = self.current_thread();
                self.push_ready(me);
                self.run_next();
            }
        }
    }

    // ------------------------------------------------------------------
    // Thread creation and exit
    // ------------------------------------------------------------------

    /// Allocate a new thread and enqueue it: idle threads onto the idle
    /// queue, user threads onto the ready queue with a CPU wake.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard.
    pub(crate) unsafe fn create_thread(&self, entry: Entry) -> NonNull<Tcb> {
        let idle = matches!(entry, Entry::Idle);
        let tcb = unsafe { Tcb::allocate(entry) };
        unsafe {
            if idle {
                self.inner().idle.push_back(tcb);
                self.reserve_ready();
            } else {
                self.inner().live_users += 1;
                self.reserve_ready();
                self.make_ready(tcb);
            }
        }
        tcb
    }

    /// Final transition of an exiting user thread: wake its joiners, sever
    /// the handle back-link, park itself for deferred deletion, and switch
    /// away for good.
    ///
    /// # Safety
    ///
    /// Caller must hold the guard; `me` must be the thread currently
    /// running on this CPU.
    pub(crate) unsafe fn retire_current(&self, me: NonNull<Tcb>) -> ! {
        unsafe {
            while let Some(joiner) = (*me.as_ptr()).joiners.pop_front() {
                self.make_ready(joiner);
            }
            if let Some(slot) = (*me.as_ptr()).parent.take() {
                slot.as_ref().clear();
            }
            let inner = self.inner();
            inner.live_users -= 1;
            if inner.live_users == 0 {
                self.signal_all_done();
            }
            // The slot may still be occupied when an interrupt frame
            // deferred the reclaim at a switch tail; drain it before
            // parking ourselves there.
            self.reap_deferred();
            self.inner().last_free = Some(me);
            self.run_next();
        }
        unreachable!("exited thread was scheduled again")
    }

    // ------------------------------------------------------------------
    // Idle loop
    // ------------------------------------------------------------------

    /// Entry of every idle thread: fall through the scheduler while work
    /// exists, otherwise publish this CPU as suspendable and park it.
    ///
    /// # Safety
    ///
    /// Must only be called as the body of an idle thread, with the guard
    /// released (the start wrapper drops it before dispatching entries).
    pub(crate) unsafe fn idle_loop(&self) -> ! {
        self.lock();
        loop {
            unsafe {
                let me = self.current_thread();
                self.inner().idle.push_back(me);
                self.run_next();
            }
            // Nothing was ready. The publication and the park below happen
            // without releasing the guard in between, so any enqueue on
            // another CPU either sees this entry or was already visible to
            // run_next above.
            let id = self.current_cpu().id;
            unsafe { self.inner() }.suspended.push_back(id);
            self.unlock_and_suspend();
            self.lock();
            // A timer wake leaves the published entry behind; retract it
            // so a later wakeup does not target a CPU that is already
            // running.
            let id = self.current_cpu().id;
            unsafe { self.inner() }.suspended.retain(|&c| c != id);
        }
    }

    // ------------------------------------------------------------------
    // Boot and interrupts
    // ------------------------------------------------------------------

    /// Per-CPU entry into the scheduler; never returns.
    ///
    /// The CPU that supplies `main_fn` runs it as the first user thread.
    /// Every CPU creates its own idle thread and then dispatches.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per CPU, on its bound host thread, with
    /// interrupts masked.
    pub(crate) unsafe fn init(&self, main_fn: Option<Entry>) -> ! {
        self.lock();
        // Boot window: route the timer to the no-op IPI handler until this
        // CPU is about to dispatch for the first time.
        self.install_vector(InterruptVector::Timer, ipi_interrupt);
        self.install_vector(InterruptVector::Ipi, ipi_interrupt);
        self.unlock();
        if let Some(entry) = main_fn {
            let _guard = self.enter();
            unsafe { self.create_thread(entry) };
        }
        {
            let _guard = self.enter();
            unsafe { self.create_thread(Entry::Idle) };
        }
        self.lock();
        self.install_vector(InterruptVector::Timer, timer_interrupt);
        unsafe { self.run_next() };
        unreachable!("first dispatch returned");
    }

    pub(crate) fn install_vector(&self, vector: InterruptVector, handler: InterruptHandler) {
        self.vectors[vector as usize].store(handler as usize, Ordering::SeqCst);
    }

    fn vector(&self, vector: InterruptVector) -> InterruptHandler {
        let raw = self.vectors[vector as usize].load(Ordering::SeqCst);
        debug_assert_ne!(raw, 0, "interrupt vector not installed");
        unsafe { core::mem::transmute::<usize, InterruptHandler>(raw) }
    }

    /// Entered from the signal trampoline. Handler frames live on the
    /// stack of whichever thread was interrupted; the depth counter travels
    /// with that thread so the scheduler knows when a resume lands back
    /// inside an interrupt frame.
    pub(crate) fn dispatch_interrupt(&self, cpu: usize, vector: InterruptVector) {
        let current = unsafe { *self.cpus[cpu].current.get() };
        if let Some(tcb) = current {
            unsafe { (*tcb.as_ptr()).in_interrupt += 1 };
        }
        self.vector(vector)(self);
        // The handler may return on a different CPU than it was entered
        // on; the interrupted thread is the same either way.
        if let Some(tcb) = current {
            unsafe { (*tcb.as_ptr()).in_interrupt -= 1 };
        }
    }

    // ------------------------------------------------------------------
    // Completion signal for the boot harness
    // ------------------------------------------------------------------

    /// Record a panic that unwound out of a user thread's function. The
    /// thread still exits normally (joiners are woken); the harness fails
    /// the run afterwards.
    pub(crate) fn note_user_panic(&self, payload: &(dyn core::any::Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        log::error!("user thread panicked: {message}");
        self.panicked.fetch_add(1, Ordering::SeqCst);
    }

    fn signal_all_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.done_cv.notify_all();
    }

    /// Block the calling host thread until every user thread has exited.
    pub(crate) fn wait_all_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self
                .done_cv
                .wait(done)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Timer interrupt: round-robin preemption. When other work is ready, the
/// interrupted thread goes to the back of the ready queue; otherwise it
/// keeps the CPU.
pub(crate) fn timer_interrupt(kernel: &Kernel) {
    let _guard = kernel.enter();
    let cpu = kernel.current_cpu();
    // A freshly booted CPU can take a tick before its first dispatch (the
    // vector table is shared); there is nothing to preempt yet.
    let Some(current) = (unsafe { *cpu.current.get() }) else {
        return;
    };
    unsafe {
        if !kernel.inner().ready.is_empty() {
            kernel.push_ready(current);
            kernel.run_next();
        }
    }
}

/// IPI: intentionally empty. Delivery alone breaks the target CPU out of
/// its suspend; the idle loop re-checks for work from there.
pub(crate) fn ipi_interrupt(_kernel: &Kernel) {}

/// Kernel of the CPU the calling host thread is bound to.
///
/// The returned reference is `'static`: CPU host threads keep their kernel
/// alive for the life of the process.
pub(crate) fn active() -> Option<&'static Kernel> {
    cpu::active().map(|(kernel, _)| unsafe { &*kernel.as_ptr() })
}

/// As [`active`], but panics with a caller-supplied operation name when the
/// calling thread is not a virtual CPU.
pub(crate) fn expect_active(what: &str) -> &'static Kernel {
    active().unwrap_or_else(|| {
        panic!("{what} must be called from a thread running on a simulated cpu")
    })
}
