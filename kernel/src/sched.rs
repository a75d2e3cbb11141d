//! Task table, admission control, and the rate-monotonic scheduler.
//!
//! This is the naive-algorithms heart of the kernel: the task count is
//! fixed and small (at most sixteen slots), so every operation here is a
//! linear or quadratic pass over the table rather than an indexed
//! structure. See `multitask.c`'s `schedule_rms` and
//! `order_absolute_priorities` for the reference this module is a
//! line-for-line rethink of.

use abi::{Priority, TaskId, TaskState};

use crate::config::{
    BOOTSTRAP_SLOT, IDLE_C, IDLE_SLOT, IDLE_T, MAX_LOCKS, MAX_TASKS,
    MAX_USER_TASKS, STACK_WINDOW_BYTES,
};
use abi::{Kind, MpuMode};
use crate::heap::Heap;
use crate::mutex::Mutex;
use crate::rtt::TraceChannels;
use crate::task::{StackExtent, Task};
use crate::time::Ticks;

/// Liu-Layland tight utilization bound, `n*(2^(1/n) - 1)`, indexed by task
/// count. `bound[0]` is unused (no tasks, trivially satisfiable) and is
/// defined as 0.0 only so the table can be indexed directly by count.
pub const RM_BOUND: [f32; MAX_USER_TASKS + 2] = [
    0.000_0, 1.000_0, 0.828_4, 0.779_8, 0.756_8, 0.743_5, 0.734_8, 0.728_6,
    0.724_1, 0.720_5, 0.717_7, 0.715_5, 0.713_6, 0.711_9, 0.710_6, 0.709_4,
];

/// A hint about what the caller of a kernel operation should do about
/// scheduling next. Mirrors the "pend or don't" decision that every
/// operation in `multitask.c` makes explicitly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum Reschedule {
    /// Nothing changed that the scheduler needs to reconsider.
    NotNeeded,
    /// The running task's state changed (or another task became Ready);
    /// pend a context switch.
    Needed,
}

/// All process-wide kernel state: the task table, the lock table, and the
/// bookkeeping admission control and the scheduler share.
///
/// Reachable from the architecture layer only through `&mut` borrows taken
/// at a kernel entry point (SVC, PendSV, SysTick, MemoryManagement); never
/// exposed to user code.
pub struct Kernel {
    pub tasks: [Task; MAX_TASKS],
    pub locks: [Mutex; MAX_LOCKS],
    pub num_locks: usize,
    /// Count of `locks` entries actually handed out by `lock_init` so far,
    /// checked against `num_locks` (the app's declared cap from
    /// `multitask_request`) rather than the fixed table length.
    pub num_locks_initialized: usize,
    /// Number of user task slots handed out by `thread_define` so far
    /// (filled or previously filled, now possibly Defunct).
    pub num_user_tasks: usize,
    /// Number of non-Defunct tasks, used to index `RM_BOUND`.
    pub num_active: usize,
    /// Slot index of the currently running task.
    pub active: usize,
    pub ticks: Ticks,
    pub total_utilization: f32,
    pub requested: bool,
    pub started: bool,
    pub mpu_mode: MpuMode,
    /// Global priority ceiling: the minimum priority ceiling over all
    /// currently held mutexes, or `Priority::IDLE` ("max") if none are
    /// held.
    pub global_ceiling: Priority,
    /// Index into `locks` of the mutex currently setting `global_ceiling`,
    /// if any.
    pub ceiling_lock: Option<usize>,
    /// Host-visible trace channels backing fd 0 / fd 1.
    pub trace: TraceChannels,
    /// Monotonic-bump heap allocator backing `sbrk`.
    pub heap: Heap,
    /// Reserved window for unprivileged task stacks, set by
    /// `arch`-specific startup before `multitask_request` is first
    /// called.
    pub user_stack_window: StackExtent,
    /// Reserved window for per-task privileged stacks.
    pub kernel_stack_window: StackExtent,
}

impl Kernel {
    pub const fn new(heap_base: u32, heap_limit: u32) -> Self {
        const DEFUNCT: Task = Task::defunct();
        Self {
            tasks: [DEFUNCT; MAX_TASKS],
            locks: [Mutex::UNINIT; MAX_LOCKS],
            num_locks: 0,
            num_locks_initialized: 0,
            num_user_tasks: 0,
            num_active: 0,
            active: BOOTSTRAP_SLOT,
            ticks: Ticks::ZERO,
            total_utilization: 0.0,
            requested: false,
            started: false,
            mpu_mode: MpuMode::KernelOnly,
            global_ceiling: Priority::IDLE,
            ceiling_lock: None,
            trace: TraceChannels::new(),
            heap: Heap::new(heap_base, heap_limit),
            user_stack_window: StackExtent::EMPTY,
            kernel_stack_window: StackExtent::EMPTY,
        }
    }

    /// `multitask_request`: partitions the reserved stack windows and
    /// readies the idle task.
    pub fn multitask_request(
        &mut self,
        num_threads: u32,
        stack_bytes: u32,
        mpu_mode: MpuMode,
        num_locks: u32,
        user_window: StackExtent,
        kernel_window: StackExtent,
    ) -> Result<(), Kind> {
        if self.requested {
            return Err(Kind::Repeated);
        }
        if num_threads == 0 || num_threads as usize > MAX_USER_TASKS {
            return Err(Kind::InvalidParams);
        }
        if num_locks as usize > MAX_LOCKS {
            return Err(Kind::InvalidParams);
        }
        let band_bytes = stack_bytes.next_power_of_two();
        // One extra band, beyond the user tasks, for the idle task's own
        // stacks: it is scheduled like any other thread and needs a place
        // to run, but it is never subject to admission control.
        let total = (band_bytes as usize)
            .checked_mul(num_threads as usize + 1)
            .ok_or(Kind::InvalidParams)?;
        if total > STACK_WINDOW_BYTES {
            return Err(Kind::InvalidParams);
        }

        for i in 0..num_threads as usize {
            let top = user_window.base - (i as u32) * band_bytes;
            self.tasks[i] = Task::defunct();
            self.tasks[i].user_stack =
                StackExtent { base: top, limit: top - band_bytes };
            let ktop = kernel_window.base - (i as u32) * band_bytes;
            self.tasks[i].kernel_stack =
                StackExtent { base: ktop, limit: ktop - band_bytes };
        }

        let idle_top = user_window.base - num_threads * band_bytes;
        let idle_ktop = kernel_window.base - num_threads * band_bytes;
        self.tasks[IDLE_SLOT] = Task::defunct();
        self.tasks[IDLE_SLOT].user_stack =
            StackExtent { base: idle_top, limit: idle_top - band_bytes };
        self.tasks[IDLE_SLOT].kernel_stack =
            StackExtent { base: idle_ktop, limit: idle_ktop - band_bytes };
        self.tasks[IDLE_SLOT].state = TaskState::Ready;
        self.tasks[IDLE_SLOT].c = IDLE_C;
        self.tasks[IDLE_SLOT].t = IDLE_T;
        self.tasks[IDLE_SLOT].static_priority = Priority::IDLE;
        self.tasks[IDLE_SLOT].dynamic_priority = Priority::IDLE;

        self.num_user_tasks = num_threads as usize;
        self.num_locks = num_locks as usize;
        self.mpu_mode = mpu_mode;
        self.user_stack_window = user_window;
        self.kernel_stack_window = kernel_window;
        self.requested = true;
        Ok(())
    }

    /// `thread_define`: admission control plus TCB fill-in. Returns the
    /// slot index on success so the caller can build the initial stack
    /// frame (architecture-specific, so left to the caller).
    pub fn thread_define(
        &mut self,
        id: TaskId,
        c: u32,
        t: u32,
    ) -> Result<usize, Kind> {
        if !self.requested {
            return Err(Kind::InvalidArgs);
        }
        if c == 0 || t == 0 || c > t {
            return Err(Kind::InvalidArgs);
        }
        for task in &self.tasks[..self.num_user_tasks] {
            if !task.is_defunct() && task.id == id {
                return Err(Kind::Duplicate);
            }
        }
        let slot = self.tasks[..self.num_user_tasks]
            .iter()
            .position(|t| t.is_defunct())
            .ok_or(Kind::NoTcb)?;

        let active_after = self.count_active() + 1;
        let new_util = self.total_utilization + (c as f32) / (t as f32);
        if new_util > RM_BOUND[active_after] {
            return Err(Kind::UnsafeAdmission);
        }

        self.total_utilization = new_util;
        let task = &mut self.tasks[slot];
        task.id = id;
        task.c = c;
        task.t = t;
        task.remaining_work = c;
        task.time_until_release = t - 1;
        task.active_time = 0;
        task.state = TaskState::Ready;

        self.order_absolute_priorities();
        Ok(slot)
    }

    /// Dense rank assignment by `(t, id)` ascending over every non-Defunct
    /// user task. `O(n^2)`, bounded by `MAX_USER_TASKS`.
    fn order_absolute_priorities(&mut self) {
        let n = self.num_user_tasks;
        for i in 0..n {
            if self.tasks[i].is_defunct() {
                continue;
            }
            let mut rank = 0u32;
            for j in 0..n {
                if i == j || self.tasks[j].is_defunct() {
                    continue;
                }
                let (ti, ii) = (self.tasks[i].t, self.tasks[i].id.0);
                let (tj, ij) = (self.tasks[j].t, self.tasks[j].id.0);
                if (tj, ij) < (ti, ii) {
                    rank += 1;
                }
            }
            let p = Priority(rank);
            self.tasks[i].static_priority = p;
            if !self.holds_any_lock(i) {
                self.tasks[i].dynamic_priority = p;
            }
        }
    }

    fn holds_any_lock(&self, slot: usize) -> bool {
        self.locks[..self.num_locks]
            .iter()
            .any(|m| m.holder == Some(slot))
    }

    pub fn count_active(&self) -> usize {
        self.tasks[..self.num_user_tasks]
            .iter()
            .filter(|t| !t.is_defunct())
            .count()
    }

    /// `multitask_start`: validates every mutex's highest-locker id and
    /// resolves it to a static priority, then arms the scheduler.
    pub fn multitask_start(&mut self, freq: u32, max_freq: u32) -> Result<(), Kind> {
        if self.num_user_tasks == 0 || self.count_active() == 0 {
            return Err(Kind::WithoutThread);
        }
        if freq > max_freq {
            return Err(Kind::InvalidFreq);
        }
        for i in 0..self.num_locks {
            let highest = self.locks[i].highest_locker_id;
            let prio = self.tasks[..self.num_user_tasks]
                .iter()
                .find(|t| !t.is_defunct() && t.id == highest)
                .map(|t| t.static_priority);
            match prio {
                Some(p) => self.locks[i].priority_ceiling = p,
                None => return Err(Kind::LockNonexistentHighestLocker),
            }
        }
        self.ticks = Ticks::ZERO;
        self.started = true;
        Ok(())
    }

    /// All user tasks have become Defunct; `multitask_start` should return
    /// to the bootstrap task.
    pub fn all_user_tasks_defunct(&self) -> bool {
        self.tasks[..self.num_user_tasks].iter().all(Task::is_defunct)
    }

    /// Common end-of-task cleanup, shared by `thread_end`, a
    /// ceiling-violation rejection in `lock`, and a single-task fault:
    /// release every mutex `slot` holds, remove its contribution to
    /// `total_utilization`, and mark it Defunct.
    pub fn end_task(&mut self, slot: usize) {
        for idx in 0..self.num_locks {
            if self.locks[idx].holder == Some(slot) {
                let _ = self.unlock(idx as u32, slot);
            }
        }
        self.total_utilization -=
            (self.tasks[slot].c as f32) / (self.tasks[slot].t as f32);
        self.tasks[slot].state = TaskState::Defunct;
    }

    /// Accounts one tick: running task bookkeeping, then release handling
    /// for every non-Defunct task. Returns whether a reschedule is needed
    /// (always true for a periodic tick driven from SysTick, but exposed
    /// separately so tests can call it directly per §4.10).
    pub fn account_tick(&mut self) -> Reschedule {
        self.ticks = self.ticks.increment();

        let running = self.active;
        self.tasks[running].active_time =
            self.tasks[running].active_time.wrapping_add(1);
        if running != IDLE_SLOT {
            let remaining = &mut self.tasks[running].remaining_work;
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.tasks[running].state = TaskState::Waiting;
            } else if self.tasks[running].state == TaskState::Running {
                self.tasks[running].state = TaskState::Ready;
            }
        }

        for i in 0..self.num_user_tasks {
            if self.tasks[i].is_defunct() {
                continue;
            }
            self.tasks[i].time_until_release =
                self.tasks[i].time_until_release.wrapping_sub(1);
            if self.tasks[i].time_until_release == 0 {
                self.tasks[i].time_until_release = self.tasks[i].t;
                self.tasks[i].remaining_work = self.tasks[i].c;
                self.tasks[i].state = TaskState::Ready;
            }
        }

        Reschedule::Needed
    }

    /// Selects the next task to run: the Ready task with the smallest
    /// `dynamic_priority`, idle if none, the bootstrap task if every user
    /// task has gone Defunct. Always sets the chosen slot to `Running`
    /// before returning, per the resolved Open Question in DESIGN.md.
    pub fn select_next(&mut self) -> usize {
        if self.all_user_tasks_defunct() {
            self.active = BOOTSTRAP_SLOT;
            self.tasks[BOOTSTRAP_SLOT].state = TaskState::Running;
            return BOOTSTRAP_SLOT;
        }

        let mut best: Option<(usize, Priority)> = None;
        for i in 0..=IDLE_SLOT {
            if !self.tasks[i].is_runnable() {
                continue;
            }
            let p = self.tasks[i].dynamic_priority;
            match best {
                Some((_, bp)) if !p.is_more_important_than(bp) => {}
                _ => best = Some((i, p)),
            }
        }

        let next = best.map(|(i, _)| i).unwrap_or(IDLE_SLOT);
        if self.tasks[self.active].state == TaskState::Running
            && self.active != next
        {
            self.tasks[self.active].state = TaskState::Ready;
        }
        self.active = next;
        self.tasks[next].state = TaskState::Running;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(base: u32, len: u32) -> StackExtent {
        StackExtent { base, limit: base - len }
    }

    fn fresh() -> Kernel {
        let mut k = Kernel::new(0x2000_0000, 0x2001_0000);
        k.multitask_request(
            4,
            1024,
            MpuMode::KernelOnly,
            4,
            window(0x2001_0000, STACK_WINDOW_BYTES as u32),
            window(0x0001_0000, STACK_WINDOW_BYTES as u32),
        )
        .unwrap();
        k
    }

    #[test]
    fn admission_rejects_unsafe_utilization() {
        let mut k = fresh();
        // Three tasks already consuming 0.72 of the bound, as in S2.
        k.total_utilization = 0.72;
        k.tasks[0].state = TaskState::Ready;
        k.tasks[1].state = TaskState::Ready;
        k.tasks[2].state = TaskState::Ready;
        k.tasks[0].id = TaskId(100);
        k.tasks[1].id = TaskId(101);
        k.tasks[2].id = TaskId(102);
        k.num_user_tasks = 4;
        let err = k.thread_define(TaskId(1), 1, 2).unwrap_err();
        assert_eq!(err, Kind::UnsafeAdmission);
    }

    #[test]
    fn rm_preference_scenario_s1() {
        // S1: A(c=1,t=3,id=7) is shorter-period than B(c=1,t=5,id=2), so A
        // must win every tie for the processor and B only runs once A has
        // no work left for its current period.
        let mut k = fresh();
        k.thread_define(TaskId(7), 1, 3).unwrap();
        k.thread_define(TaskId(2), 1, 5).unwrap();
        k.multitask_start(1, 1_000_000).unwrap();

        // Both just admitted, both Ready: A's shorter period makes it more
        // important, so it wins the very first decision.
        let next = k.select_next();
        assert_eq!(k.tasks[next].id, TaskId(7));

        // A burns its one tick of work and goes Waiting; B is the only
        // other Ready task (ignoring idle), so it runs next.
        k.account_tick();
        let next = k.select_next();
        assert_eq!(k.tasks[next].id, TaskId(2));

        // A is released again before B exhausts its own budget, and
        // immediately preempts it back.
        k.account_tick();
        let next = k.select_next();
        assert_eq!(k.tasks[next].id, TaskId(7));
    }
}
