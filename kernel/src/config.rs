//! Fixed capacities the rest of the kernel assumes.
//!
//! The original application has no ROM-resident descriptor to parse at
//! boot (tasks are declared at runtime, via `multitask_request` and
//! `thread_define`); what replaces an application header here is just a
//! small set of compile-time constants, collected in one place instead of
//! scattered as literals through the admission and table code.

pub use abi::{MAX_LOCKS, MAX_TASKS, MAX_USER_TASKS, STACK_WINDOW_BYTES};

/// Index of the idle task's slot in the TCB table: the first slot after
/// the user task region.
pub const IDLE_SLOT: usize = MAX_USER_TASKS;

/// Index of the bootstrap task's slot: the slot after idle.
pub const BOOTSTRAP_SLOT: usize = MAX_USER_TASKS + 1;

/// `(c, t)` assigned to the idle task: it never preempts anything and is
/// never itself subject to admission control.
pub const IDLE_C: u32 = 1;
pub const IDLE_T: u32 = 1;

/// Base clock the systick reload is computed against, in Hz. 16 MHz is the
/// default core clock used by the boards this kernel targets when no
/// external oscillator configuration has run.
pub const SYSTICK_BASE_HZ: u32 = 16_000_000;

/// The systick reload register is 24 bits wide; a requested period whose
/// reload would not fit gets divided down by counting multiple hardware
/// periods per logical scheduler tick (see `sched::TickDivider`).
pub const SYSTICK_MAX_RELOAD: u32 = (1 << 24) - 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_layout_is_consistent_with_table_capacity() {
        assert_eq!(IDLE_SLOT, MAX_USER_TASKS);
        assert_eq!(BOOTSTRAP_SLOT, MAX_USER_TASKS + 1);
        assert_eq!(BOOTSTRAP_SLOT + 1, MAX_TASKS);
    }
}
