//! Clock tick bookkeeping.
//!
//! The periodic timer fires 100 times a second in user mode and drives
//! preemption. The kernel itself is non-reentrant: a tick arriving while
//! kernel code runs means interrupts were left enabled on entry, which is a
//! bug, and panics.

use crate::config::MSEC_PER_TICK;
use crate::sched::Schedule;
use crate::Kernel;

impl Kernel {
    /// Deliver one timer interrupt: account the tick and preempt.
    pub fn clock_tick(&mut self) -> Schedule {
        assert!(
            !self.in_kernel,
            "timer interrupt in kernel mode (missed interrupt disable)"
        );
        self.ticks = self
            .ticks
            .checked_add(1)
            .expect("tick counter overflowed");
        self.sched_yield()
    }

    /// Milliseconds of uptime, at timer resolution.
    pub fn time_msec(&self) -> u32 {
        self.ticks * MSEC_PER_TICK
    }
}
