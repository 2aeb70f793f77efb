//! The virtual CPU layer.
//!
//! Each virtual CPU is backed by one host OS thread. Interrupts are POSIX
//! signals delivered with `pthread_kill`: one signal plays the role of the
//! periodic timer, another the inter-processor interrupt (IPI) used to wake
//! a suspended CPU. Masking interrupts on a CPU is blocking those signals
//! on its host thread, and `sigsuspend` provides exactly the
//! unmask-and-park-atomically primitive the suspend protocol needs.

use core::cell::{Cell, UnsafeCell};
use core::mem;
use core::ptr::NonNull;

use crate::kernel::Kernel;
use crate::thread::Tcb;

pub(crate) mod timer;

/// Signal delivered by the timer thread as the per-CPU timer interrupt.
pub(crate) const TIMER_SIGNAL: libc::c_int = libc::SIGUSR1;
/// Signal delivered to one specific CPU as an IPI.
pub(crate) const IPI_SIGNAL: libc::c_int = libc::SIGUSR2;

/// Slots of the installable interrupt vector table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum InterruptVector {
    Timer = 0,
    Ipi = 1,
}

/// Handler installed into a vector slot.
pub(crate) type InterruptHandler = fn(&Kernel);

/// One virtual CPU.
pub(crate) struct Cpu {
    pub(crate) id: usize,
    /// Host thread backing this CPU. Written once, before the boot barrier.
    pthread: UnsafeCell<libc::pthread_t>,
    /// Thread currently executing on this CPU; `None` only before the
    /// CPU's first dispatch. Mutated under the guard, and only ever by the
    /// CPU's own host thread.
    pub(crate) current: UnsafeCell<Option<NonNull<Tcb>>>,
}

unsafe impl Send for Cpu {}
unsafe impl Sync for Cpu {}

impl Cpu {
    pub(crate) fn new(id: usize) -> Cpu {
        Cpu {
            id,
            pthread: UnsafeCell::new(0),
            current: UnsafeCell::new(None),
        }
    }

    /// Record the host thread backing this CPU. Called exactly once, from
    /// that thread, before the boot barrier publishes the CPU.
    pub(crate) fn bind_host_thread(&self) {
        unsafe { *self.pthread.get() = libc::pthread_self() };
    }

    /// Deliver an IPI to this CPU. Caller must hold the guard.
    pub(crate) fn interrupt_send(&self) {
        unsafe { libc::pthread_kill(*self.pthread.get(), IPI_SIGNAL) };
    }

    /// Deliver a timer interrupt to this CPU.
    pub(crate) fn send_timer_interrupt(&self) {
        unsafe { libc::pthread_kill(*self.pthread.get(), TIMER_SIGNAL) };
    }
}

thread_local! {
    /// Kernel and CPU index the calling host thread is bound to; `None` on
    /// every thread that is not a virtual CPU.
    static ACTIVE: Cell<Option<(NonNull<Kernel>, usize)>> = const { Cell::new(None) };
}

/// Bind the calling host thread to one CPU of `kernel`.
pub(crate) fn bind(kernel: &Kernel, cpu: usize) {
    ACTIVE.with(|slot| slot.set(Some((NonNull::from(kernel), cpu))));
}

pub(crate) fn active() -> Option<(NonNull<Kernel>, usize)> {
    ACTIVE.with(|slot| slot.get())
}

/// Identity of the virtual CPU the calling thread is running on.
///
/// # Panics
///
/// Panics when called from a host thread that is not a virtual CPU.
pub fn current_id() -> usize {
    active()
        .map(|(_, id)| id)
        .expect("not running on a simulated cpu")
}

fn interrupt_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, TIMER_SIGNAL);
        libc::sigaddset(&mut set, IPI_SIGNAL);
        set
    }
}

/// Mask timer and IPI delivery on the calling CPU.
pub(crate) fn interrupt_disable() {
    let set = interrupt_sigset();
    unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, core::ptr::null_mut()) };
}

/// Unmask timer and IPI delivery on the calling CPU.
pub(crate) fn interrupt_enable() {
    let set = interrupt_sigset();
    unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, core::ptr::null_mut()) };
}

/// Atomically unmask interrupts and park the CPU until one arrives.
///
/// An interrupt sent after the caller released the guard but before the
/// park stays pending under the still-blocked mask and wakes the call the
/// moment `sigsuspend` installs the empty mask; there is no window in which
/// a wake can be lost. Returns with interrupts masked again.
pub(crate) fn interrupt_enable_suspend() {
    unsafe {
        let mut empty = mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut empty);
        libc::sigsuspend(&empty);
    }
}

static INSTALL_TRAMPOLINE: spin::Once<()> = spin::Once::new();

/// Install the process-wide signal trampoline for both interrupt signals.
/// Idempotent; machines in the same process share it and dispatch through
/// the per-thread CPU binding.
pub(crate) fn install_interrupt_trampoline() {
    INSTALL_TRAMPOLINE.call_once(|| unsafe {
        let mut sa = mem::zeroed::<libc::sigaction>();
        sa.sa_sigaction = interrupt_trampoline as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, TIMER_SIGNAL);
        libc::sigaddset(&mut sa.sa_mask, IPI_SIGNAL);
        libc::sigaction(TIMER_SIGNAL, &sa, core::ptr::null_mut());
        libc::sigaction(IPI_SIGNAL, &sa, core::ptr::null_mut());
    });
}

/// Signal handler shared by both interrupts: resolve the calling CPU from
/// TLS and dispatch through the kernel's vector table. Signals delivered to
/// non-CPU threads are ignored.
extern "C" fn interrupt_trampoline(sig: libc::c_int) {
    let Some((kernel, cpu)) = active() else {
        return;
    };
    let saved_errno = unsafe { *libc::__errno_location() };
    let vector = if sig == TIMER_SIGNAL {
        InterruptVector::Timer
    } else {
        InterruptVector::Ipi
    };
    let kernel = unsafe { kernel.as_ref() };
    kernel.dispatch_interrupt(cpu, vector);
    unsafe { *libc::__errno_location() = saved_errno };
}
