//! Task control blocks and the architecture-state trait that exposes a
//! task's saved registers to syscall dispatch.

use abi::{Priority, TaskId, TaskState};

/// Maximum number of scheduler ticks a periodic task's period or worst-case
/// execution time may be expressed in before overflowing the accounting
/// counters. Chosen generously; admission control (`bound[n]`) is the real
/// limiter on how tasks can be combined.
pub const MAX_TICKS: u32 = u32::MAX;

/// Extent of one task's stack: `base` is the highest address (stacks grow
/// down), `limit` is the lowest address still inside the band.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StackExtent {
    pub base: u32,
    pub limit: u32,
}

impl StackExtent {
    pub const EMPTY: Self = Self { base: 0, limit: 0 };

    /// Whether `sp` lies within `[limit, base]`, the legal range for a
    /// stack pointer that has not over/underflowed.
    pub fn contains(&self, sp: u32) -> bool {
        sp <= self.base && sp >= self.limit
    }
}

/// Internal representation of a task control block.
///
/// Layout mirrors the data model: one TCB per user task, plus one for idle
/// and one for the bootstrap task, all held in a single fixed-size table
/// (see `sched::Kernel::tasks`).
#[repr(C)] // location of `save` is relied on by the naked asm handlers
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the user program (callee-saved registers and
    /// both stack pointers, in the representation the arch backend uses).
    pub save: crate::arch::SavedState,
    // NOTE: must appear first; the context-switch asm addresses fields of
    // `save` relative to the start of the `Task`.
    /// Application-chosen task identifier. Meaningless to the scheduler
    /// except as a tie-break and as the value returned by `thread_id`.
    pub id: TaskId,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Dense rank by `(t, id)` ascending; lower is more important. Assigned
    /// by `order_absolute_priorities` and never chosen by the caller
    /// directly.
    pub static_priority: Priority,
    /// Current scheduling priority; equal to `static_priority` unless
    /// inflated by lock inheritance.
    pub dynamic_priority: Priority,
    /// Worst-case execution time per period, in ticks.
    pub c: u32,
    /// Period, in ticks.
    pub t: u32,
    /// Ticks remaining in the current release before the task must go
    /// `Waiting`.
    pub remaining_work: u32,
    /// Ticks until the task's next release.
    pub time_until_release: u32,
    /// Ticks this task has spent `Running`, cumulative since boot.
    pub active_time: u32,
    /// Whether the task was suspended in the middle of handling an SVC
    /// (as opposed to at the tail of a completed one). Saved and restored
    /// across a context switch so a resumed SVC can tell where it left
    /// off; see `arch::arm_m::SVCall`.
    pub svc_in_progress: bool,
    /// Unprivileged stack extent.
    pub user_stack: StackExtent,
    /// Privileged (kernel-side) stack extent for this task.
    pub kernel_stack: StackExtent,
}

impl Task {
    /// A blank, Defunct task control block, as installed by
    /// `multitask_request` before any `thread_define`.
    pub const fn defunct() -> Self {
        Self {
            save: crate::arch::SavedState::INIT,
            id: TaskId(0),
            state: TaskState::Defunct,
            static_priority: Priority(0),
            dynamic_priority: Priority(0),
            c: 0,
            t: 0,
            remaining_work: 0,
            time_until_release: 0,
            active_time: 0,
            svc_in_progress: false,
            user_stack: StackExtent::EMPTY,
            kernel_stack: StackExtent::EMPTY,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Ready
    }

    pub fn is_defunct(&self) -> bool {
        self.state == TaskState::Defunct
    }

    /// Whether `sp`, the stack pointer observed at a fault, is outside this
    /// task's unprivileged stack band (either direction).
    pub fn user_stack_faulted_by(&self, sp: u32) -> bool {
        !self.user_stack.contains(sp)
    }
}

/// Exposes a task's saved registers and the SVC-frame argument words to
/// syscall dispatch, independent of whether the backing storage is a real
/// exception frame (`arch::arm_m`) or a plain struct used in host tests
/// (`arch::sim`).
pub trait ArchState {
    /// Stack pointer the task was suspended at (the value that will be
    /// restored into PSP on resume).
    fn stack_pointer(&self) -> u32;

    /// Reads syscall argument register 0 (also the return-value slot).
    fn arg0(&self) -> u32;
    fn arg1(&self) -> u32;
    fn arg2(&self) -> u32;
    fn arg3(&self) -> u32;
    /// Fifth argument word, read from 8 words above the frame base for the
    /// few calls that need more than four register arguments.
    fn arg4(&self) -> u32;

    /// Recovers the SVC immediate the task trapped with.
    fn svc_number(&self) -> u8;

    /// Writes the return value into the slot the caller will see as its
    /// first return register.
    fn ret0(&mut self, _: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_extent_contains_is_inclusive() {
        let e = StackExtent { base: 0x2000_0400, limit: 0x2000_0000 };
        assert!(e.contains(0x2000_0400));
        assert!(e.contains(0x2000_0000));
        assert!(e.contains(0x2000_0200));
        assert!(!e.contains(0x2000_0401));
        assert!(!e.contains(0x1fff_ffff));
    }

    #[test]
    fn defunct_task_is_not_runnable() {
        let t = Task::defunct();
        assert!(!t.is_runnable());
        assert!(t.is_defunct());
    }
}
