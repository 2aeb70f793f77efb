//! ucontext(3)-backed machine contexts.

use core::mem::MaybeUninit;
use core::ptr::{addr_of, addr_of_mut};

/// Saved execution state of one thread.
///
/// On glibc x86-64 the saved floating-point environment is referenced by a
/// pointer into the structure itself, so a context must not move between
/// `make_context` and its final resume. Thread control blocks are
/// heap-allocated before their context is initialized and never relocated.
pub(crate) struct Context {
    uc: MaybeUninit<libc::ucontext_t>,
}

impl Context {
    pub(crate) fn new() -> Context {
        Context {
            uc: MaybeUninit::zeroed(),
        }
    }
}

/// Entry signature for [`make_context`]. makecontext passes arguments as
/// ints, so a pointer payload travels as two 32-bit halves.
pub(crate) type ContextEntry = extern "C" fn(u32, u32);

/// Initialize `ctx` so that resuming it calls `entry` with `arg` on the
/// given stack.
///
/// # Safety
///
/// - `ctx` must stay at a stable address until its final resume.
/// - The stack region must outlive the context and be large enough for
///   `entry` plus any signal frames delivered while it runs.
/// - `entry` must never return; there is no successor context linked.
pub(crate) unsafe fn make_context(
    ctx: *mut Context,
    entry: ContextEntry,
    arg: *mut (),
    stack_base: *mut u8,
    stack_size: usize,
) {
    unsafe {
        let uc = addr_of_mut!((*ctx).uc).cast::<libc::ucontext_t>();
        if libc::getcontext(uc) != 0 {
            panic!("getcontext failed");
        }
        (*uc).uc_link = core::ptr::null_mut();
        (*uc).uc_stack.ss_sp = stack_base.cast();
        (*uc).uc_stack.ss_size = stack_size;
        (*uc).uc_stack.ss_flags = 0;

        let addr = arg as usize as u64;
        let lo = addr as u32;
        let hi = (addr >> 32) as u32;
        let entry = core::mem::transmute::<ContextEntry, extern "C" fn()>(entry);
        libc::makecontext(uc, entry, 2, lo, hi);
    }
}

/// Save the current execution state into `save` and resume `load`.
///
/// Returns when `save` is itself resumed, which may happen on a different
/// host thread (a different virtual CPU) than the one that called this.
///
/// # Safety
///
/// Both pointers must be valid, initialized contexts. They may alias: a
/// thread switching to itself saves and immediately restores its own state.
/// Must be called with interrupts masked on the calling CPU.
pub(crate) unsafe fn swap_context(save: *mut Context, load: *const Context) {
    unsafe {
        libc::swapcontext(
            addr_of_mut!((*save).uc).cast::<libc::ucontext_t>(),
            addr_of!((*load).uc).cast::<libc::ucontext_t>(),
        );
    }
}

/// Resume `load`, discarding the current execution state.
///
/// Used for the first dispatch on a CPU, where there is nothing to save.
///
/// # Safety
///
/// `load` must be a valid, initialized context. Must be called with
/// interrupts masked on the calling CPU.
pub(crate) unsafe fn set_context(load: *const Context) -> ! {
    unsafe {
        libc::setcontext(addr_of!((*load).uc).cast::<libc::ucontext_t>());
    }
    unreachable!("setcontext returned")
}
