//! The boot harness: builds a simulated multi-CPU host and runs it.

use std::sync::{Arc, Barrier};
use std::thread as host;
use std::time::Duration;

use portable_atomic::Ordering;

use crate::cpu;
use crate::kernel::Kernel;
use crate::thread::Entry;

const DEFAULT_QUANTUM: Duration = Duration::from_millis(5);

/// A simulated multi-CPU host.
///
/// Each virtual CPU is backed by one host OS thread; a timer thread
/// interrupts every CPU once per quantum. `run` boots the machine, starts
/// the supplied function as the first user thread on CPU 0, and returns
/// once every user thread has exited.
pub struct Machine {
    num_cpus: usize,
    quantum: Duration,
}

impl Machine {
    /// # Panics
    ///
    /// Panics when `num_cpus` is zero.
    pub fn new(num_cpus: usize) -> Machine {
        assert!(num_cpus >= 1, "a machine needs at least one cpu");
        Machine {
            num_cpus,
            quantum: DEFAULT_QUANTUM,
        }
    }

    /// Interval between timer interrupts on every CPU (default 5 ms).
    pub fn timer_interval(mut self, quantum: Duration) -> Machine {
        self.quantum = quantum;
        self
    }

    /// Boot the CPUs and run `main_fn` as the first user thread.
    ///
    /// Blocks until every user thread has exited, then stops the timer and
    /// returns. The CPU host threads outlive the call parked in their idle
    /// loops (they never receive another interrupt) and are reclaimed at
    /// process exit. User code must not block them any other way.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a running machine.
    pub fn run<F>(self, main_fn: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            cpu::active().is_none(),
            "Machine::run cannot be nested inside a machine"
        );
        cpu::install_interrupt_trampoline();
        // CPU threads inherit the mask of their spawner; interrupts stay
        // masked until each CPU's scheduler entry unmasks them.
        cpu::interrupt_disable();

        let kernel = Arc::new(Kernel::new(self.num_cpus, self.quantum));
        let barrier = Arc::new(Barrier::new(self.num_cpus + 1));
        log::debug!(
            "booting machine: {} cpus, {:?} quantum",
            self.num_cpus,
            self.quantum
        );

        let mut main_fn = Some(Box::new(main_fn) as Box<dyn FnOnce() + Send + 'static>);
        for id in 0..self.num_cpus {
            let kernel = Arc::clone(&kernel);
            let barrier = Arc::clone(&barrier);
            let main_fn = main_fn.take();
            host::Builder::new()
                .name(format!("vcpu-{id}"))
                .spawn(move || cpu_main(kernel, id, barrier, main_fn))
                .expect("failed to spawn cpu host thread");
        }
        barrier.wait();

        let timer = {
            let kernel = Arc::clone(&kernel);
            host::Builder::new()
                .name("vcpu-timer".into())
                .spawn(move || cpu::timer::timer_main(kernel))
                .expect("failed to spawn timer thread")
        };

        kernel.wait_all_done();
        kernel.timer_stop.store(true, Ordering::Release);
        timer.join().expect("timer thread panicked");
        log::debug!("machine quiescent: every user thread has exited");

        let panicked = kernel.panicked.load(Ordering::SeqCst);
        if panicked > 0 {
            panic!("{panicked} user thread(s) panicked inside the machine");
        }
    }
}

/// Host-thread body of one virtual CPU; hands control to the scheduler and
/// never returns.
fn cpu_main(
    kernel: Arc<Kernel>,
    id: usize,
    barrier: Arc<Barrier>,
    main_fn: Option<Box<dyn FnOnce() + Send + 'static>>,
) {
    kernel.cpus[id].bind_host_thread();
    cpu::bind(&kernel, id);
    barrier.wait();
    let entry = main_fn.map(Entry::Closure);
    unsafe { kernel.init(entry) }
}
