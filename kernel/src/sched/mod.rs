//! Scheduler - round-robin over the environment table.
//!
//! Selection starts just after the current slot and wraps, skipping slot 0
//! (the idle environment). Idle runs only when nothing else is runnable;
//! when even idle is gone the machine halts back to the harness, which is
//! this kernel's monitor.

pub mod timer;

use log::trace;

use crate::objects::env::{EnvId, EnvStatus};
use crate::Kernel;

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// The named environment is now running.
    Run(EnvId),
    /// Nothing runnable anywhere; control returns to the monitor.
    Halted,
}

impl Kernel {
    /// Deschedule the current environment (if any) and pick the next
    /// runnable one, round-robin.
    pub fn sched_yield(&mut self) -> Schedule {
        if let Some(cur) = self.curenv {
            if self.envs[cur].status == EnvStatus::Running {
                self.envs[cur].status = EnvStatus::Runnable;
            }
        }

        // Circular scan over slots 1..NENV starting after the current slot;
        // includes the current env itself as the last candidate.
        let start = self.curenv.map(|c| c + 1).unwrap_or(1).max(1);
        let n = self.envs.len();
        let candidates = (start..n).chain(1..start.min(n));
        let mut elected = None;
        for slot in candidates {
            if self.envs[slot].status == EnvStatus::Runnable {
                elected = Some(slot);
                break;
            }
        }

        let slot = match elected {
            Some(slot) => slot,
            // Run the idle environment iff nothing else can run.
            None if self.envs[0].status == EnvStatus::Runnable => 0,
            None => {
                trace!("scheduler: nothing runnable, halting");
                self.curenv = None;
                return Schedule::Halted;
            }
        };

        let id = self.envs[slot].id;
        trace!("scheduler: switch to env {}", id);
        self.run(id).expect("elected env must be runnable");
        Schedule::Run(id)
    }
}
