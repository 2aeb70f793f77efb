//! The timer interrupt source.
//!
//! One host thread per machine sleeps for a quantum and then interrupts
//! every CPU. A CPU with interrupts masked sees the tick as soon as it
//! unmasks; a suspended CPU is woken by it, re-checks for work, and parks
//! again if there is none.

use std::sync::Arc;

use portable_atomic::Ordering;

use crate::kernel::Kernel;

/// Body of the timer thread; runs until the machine stops it.
pub(crate) fn timer_main(kernel: Arc<Kernel>) {
    while !kernel.timer_stop.load(Ordering::Acquire) {
        std::thread::sleep(kernel.quantum);
        if kernel.timer_stop.load(Ordering::Acquire) {
            break;
        }
        for cpu in kernel.cpus.iter() {
            cpu.send_timer_interrupt();
        }
    }
    log::debug!("timer thread stopped");
}
