//! Machine-context boundary: creating, saving, and resuming execution
//! contexts on private stacks.
//!
//! Nothing behind this boundary fits the language's ownership rules; the
//! scheduler upholds its invariants (a context is resumed by at most one
//! CPU, a stack is freed only after the last switch away from it) at every
//! call site.

#[cfg(target_os = "linux")]
mod ucontext;

#[cfg(target_os = "linux")]
pub(crate) use ucontext::{make_context, set_context, swap_context, Context, ContextEntry};

#[cfg(not(target_os = "linux"))]
compile_error!(
    "the simulated host is built on Linux signals and ucontext(3); \
     only Linux targets are supported"
);
