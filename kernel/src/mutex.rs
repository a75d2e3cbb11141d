//! Priority-ceiling-protocol mutexes with dynamic priority inheritance.
//!
//! Grounded on the original's `mutex_t`/`syscall_lock`/`syscall_unlock`
//! pair, with one deliberate change: `current_locker` and `blocked_threads`
//! are held as task-table indices (`Option<usize>`) rather than raw `tcb_t*`
//! pointers, matching the table-index idiom used throughout the rest of
//! this kernel instead of reintroducing pointers the original needed only
//! because its TCBs were not contiguous.

use abi::{Priority, TaskId};

use crate::config::MAX_TASKS;
use crate::sched::Kernel;

/// One priority-ceiling mutex.
#[derive(Copy, Clone, Debug)]
pub struct Mutex {
    pub initialized: bool,
    /// Slot index of the task currently holding this lock, if any.
    pub holder: Option<usize>,
    /// Slot indices of tasks blocked waiting for this lock, in no
    /// particular order; the scheduler's priority scan decides who runs
    /// next among them once it is released.
    pub blocked: [Option<usize>; MAX_TASKS],
    pub num_blocked: usize,
    /// Ceiling priority: the static priority of the highest-priority task
    /// named in `highest_locker_id`. Resolved once, at `multitask_start`.
    pub priority_ceiling: Priority,
    /// Declared at `lock_init` time: the id of the highest-priority task
    /// expected ever to take this lock.
    pub highest_locker_id: TaskId,
}

impl Mutex {
    pub const UNINIT: Self = Self {
        initialized: false,
        holder: None,
        blocked: [None; MAX_TASKS],
        num_blocked: 0,
        priority_ceiling: Priority::IDLE,
        highest_locker_id: TaskId(0),
    };

    fn block(&mut self, slot: usize) {
        if self.num_blocked < self.blocked.len() {
            self.blocked[self.num_blocked] = Some(slot);
            self.num_blocked += 1;
        }
    }

    fn pop_highest_priority_waiter(&mut self, tasks: &[crate::task::Task]) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None; // (array index, slot)
        for (i, slot) in self.blocked[..self.num_blocked].iter().enumerate() {
            let slot = (*slot)?;
            let p = tasks[slot].dynamic_priority;
            match best {
                Some((_, bslot)) if !p.is_more_important_than(tasks[bslot].dynamic_priority) => {}
                _ => best = Some((i, slot)),
            }
        }
        let (idx, slot) = best?;
        self.num_blocked -= 1;
        self.blocked[idx] = self.blocked[self.num_blocked];
        self.blocked[self.num_blocked] = None;
        Some(slot)
    }
}

use abi::{Kind, TaskState};

/// What `Kernel::lock` did with the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockOutcome {
    /// The lock is now held by the caller.
    Acquired,
    /// The caller is now `Blocked`; a reschedule is mandatory.
    Blocked,
    /// The caller violated the priority-ceiling protocol and has been
    /// ended; a reschedule is mandatory.
    CallerEnded,
}

impl Kernel {
    pub fn lock_init(&mut self, highest_locker: TaskId) -> Result<u32, Kind> {
        if self.num_locks_initialized >= self.num_locks {
            return Err(Kind::NoLockCapacity);
        }
        let idx = self
            .locks
            .iter()
            .position(|m| !m.initialized)
            .ok_or(Kind::NoLockCapacity)?;
        self.locks[idx] = Mutex {
            initialized: true,
            highest_locker_id: highest_locker,
            ..Mutex::UNINIT
        };
        self.num_locks_initialized += 1;
        Ok(idx as u32)
    }

    /// `lock`: three gates, in order.
    ///
    /// 1. If the caller's *static* priority is more important than this
    ///    mutex's declared ceiling, the caller was never a legitimate
    ///    locker of it (the ceiling is supposed to be the static priority
    ///    of the most important task that will ever lock it) and is ended
    ///    outright, matching the original's ceiling-violation
    ///    `syscall_thread_end()` call.
    /// 2. A caller that already holds `lock_id` is a no-op diagnostic
    ///    rather than a block: blocking on a lock you already hold can
    ///    never be woken, since the holder the waiter is waiting on is
    ///    itself.
    /// 3. Otherwise the caller is admitted immediately if its *dynamic*
    ///    priority is strictly more important than `global_ceiling`, or it
    ///    already holds the mutex currently setting that ceiling, and this
    ///    mutex is free; otherwise it blocks, on this mutex if it is the
    ///    one actually held or on the ceiling-owning mutex if this one is
    ///    free but the ceiling forbade the grant, donating priority to
    ///    whichever holder it joins the blocked list of.
    pub fn lock(&mut self, lock_id: u32, caller: usize) -> Result<LockOutcome, Kind> {
        let idx = lock_id as usize;
        if idx >= self.num_locks || !self.locks[idx].initialized {
            return Err(Kind::InvalidParams);
        }

        if self.tasks[caller]
            .static_priority
            .is_more_important_than(self.locks[idx].priority_ceiling)
        {
            self.end_task(caller);
            return Ok(LockOutcome::CallerEnded);
        }

        if self.locks[idx].holder == Some(caller) {
            return Ok(LockOutcome::Acquired);
        }

        let holds_ceiling_lock = self
            .ceiling_lock
            .map_or(false, |ci| self.locks[ci].holder == Some(caller));
        let admissible = holds_ceiling_lock
            || self.tasks[caller]
                .dynamic_priority
                .is_more_important_than(self.global_ceiling);

        if admissible && self.locks[idx].holder.is_none() {
            self.locks[idx].holder = Some(caller);
            let ceiling = self.locks[idx].priority_ceiling;
            if ceiling.is_more_important_than(self.tasks[caller].dynamic_priority) {
                self.tasks[caller].dynamic_priority = ceiling;
            }
            self.recompute_global_ceiling();
            return Ok(LockOutcome::Acquired);
        }

        self.tasks[caller].state = TaskState::Blocked;
        if self.locks[idx].holder.is_some() {
            self.locks[idx].block(caller);
            self.inherit_from_waiters(idx);
        } else if let Some(ci) = self.ceiling_lock {
            self.locks[ci].block(caller);
            self.inherit_from_waiters(ci);
        }
        Ok(LockOutcome::Blocked)
    }

    /// Rescans every held lock for the most restrictive (numerically
    /// smallest) ceiling in effect, setting `global_ceiling`/`ceiling_lock`
    /// to match. Called after any change to which locks are held.
    fn recompute_global_ceiling(&mut self) {
        let mut best: Option<(usize, Priority)> = None;
        for (i, lock) in self.locks[..self.num_locks].iter().enumerate() {
            if lock.holder.is_none() {
                continue;
            }
            match best {
                Some((_, bp)) if !lock.priority_ceiling.is_more_important_than(bp) => {}
                _ => best = Some((i, lock.priority_ceiling)),
            }
        }
        match best {
            Some((i, p)) => {
                self.global_ceiling = p;
                self.ceiling_lock = Some(i);
            }
            None => {
                self.global_ceiling = Priority::IDLE;
                self.ceiling_lock = None;
            }
        }
    }

    /// Raises the current holder's dynamic priority if a newly-blocked
    /// waiter is more important than it, implementing dynamic priority
    /// inheritance (not just the static ceiling).
    fn inherit_from_waiters(&mut self, idx: usize) {
        let Some(holder) = self.locks[idx].holder else { return };
        let mut most_important = self.tasks[holder].dynamic_priority;
        for slot in self.locks[idx].blocked[..self.locks[idx].num_blocked]
            .iter()
            .flatten()
        {
            let p = self.tasks[*slot].dynamic_priority;
            if p.is_more_important_than(most_important) {
                most_important = p;
            }
        }
        self.tasks[holder].dynamic_priority = most_important;
    }

    /// `unlock`: restores the releasing task's priority to its static
    /// value (unless it still holds another lock), wakes the
    /// highest-priority waiter if any, and hands the lock to them.
    pub fn unlock(&mut self, lock_id: u32, caller: usize) -> Result<(), Kind> {
        let idx = lock_id as usize;
        if idx >= self.num_locks || !self.locks[idx].initialized {
            return Err(Kind::InvalidParams);
        }
        if self.locks[idx].holder != Some(caller) {
            return Err(Kind::InvalidParams);
        }

        self.locks[idx].holder = None;
        self.restore_priority_after_release(caller);

        if let Some(next) = self.locks[idx].pop_highest_priority_waiter(&self.tasks) {
            self.locks[idx].holder = Some(next);
            self.tasks[next].state = TaskState::Ready;
            let ceiling = self.locks[idx].priority_ceiling;
            if ceiling.is_more_important_than(self.tasks[next].dynamic_priority) {
                self.tasks[next].dynamic_priority = ceiling;
            }
        }
        self.recompute_global_ceiling();
        Ok(())
    }

    /// A task's dynamic priority, once it holds no more locks, falls back
    /// to its static priority; if it still holds other locks, it keeps
    /// whichever of those ceilings (or inherited priorities) is most
    /// important.
    fn restore_priority_after_release(&mut self, slot: usize) {
        let mut floor = self.tasks[slot].static_priority;
        for lock in &self.locks[..self.num_locks] {
            if lock.holder == Some(slot) && lock.priority_ceiling.is_more_important_than(floor) {
                floor = lock.priority_ceiling;
            }
        }
        self.tasks[slot].dynamic_priority = floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::MpuMode;
    use crate::task::StackExtent;

    fn window(base: u32, len: u32) -> StackExtent {
        StackExtent { base, limit: base - len }
    }

    fn fresh_with(n: u32) -> Kernel {
        let mut k = Kernel::new(0x2000_0000, 0x2001_0000);
        k.multitask_request(
            n,
            1024,
            MpuMode::KernelOnly,
            4,
            window(0x2001_0000, crate::config::STACK_WINDOW_BYTES as u32),
            window(0x0001_0000, crate::config::STACK_WINDOW_BYTES as u32),
        )
        .unwrap();
        k
    }

    #[test]
    fn lock_round_trips_and_restores_priority() {
        let mut k = fresh_with(2);
        k.thread_define(TaskId(1), 1, 10).unwrap();
        k.thread_define(TaskId(2), 1, 20).unwrap();
        let lid = k.lock_init(TaskId(1)).unwrap();
        k.multitask_start(1, 1_000_000).unwrap();

        let outcome = k.lock(lid, 0).unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);
        assert_eq!(k.tasks[0].dynamic_priority, k.locks[lid as usize].priority_ceiling);
        assert_eq!(k.global_ceiling, k.locks[lid as usize].priority_ceiling);

        k.unlock(lid, 0).unwrap();
        assert_eq!(k.tasks[0].dynamic_priority, k.tasks[0].static_priority);
        assert_eq!(k.global_ceiling, Priority::IDLE);
    }

    #[test]
    fn second_locker_blocks_and_inherits_applied_to_holder() {
        let mut k = fresh_with(2);
        k.thread_define(TaskId(7), 1, 5).unwrap(); // higher priority (shorter period)
        k.thread_define(TaskId(2), 1, 50).unwrap(); // lower priority
        let lid = k.lock_init(TaskId(7)).unwrap();
        k.multitask_start(1, 1_000_000).unwrap();

        // Lower-priority task (slot 1) takes the lock first; granting
        // already boosts it to the lock's ceiling, which is slot 0's own
        // static priority (the declared highest locker).
        let outcome = k.lock(lid, 1).unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);
        let ceiling = k.locks[lid as usize].priority_ceiling;
        assert_eq!(k.tasks[1].dynamic_priority, ceiling);

        // Higher-priority task (slot 0) blocks on it; the holder's
        // priority cannot rise any further, since it is already at the
        // mutex's ceiling.
        let outcome = k.lock(lid, 0).unwrap();
        assert_eq!(outcome, LockOutcome::Blocked);
        assert_eq!(k.tasks[0].state, TaskState::Blocked);
        assert_eq!(k.tasks[1].dynamic_priority, ceiling);

        k.unlock(lid, 1).unwrap();
        assert_eq!(k.locks[lid as usize].holder, Some(0));
        assert_eq!(k.tasks[0].state, TaskState::Ready);
    }

    #[test]
    fn relocking_a_held_mutex_is_a_diagnostic_no_op() {
        let mut k = fresh_with(2);
        k.thread_define(TaskId(1), 1, 10).unwrap();
        k.thread_define(TaskId(2), 1, 20).unwrap();
        let lid = k.lock_init(TaskId(1)).unwrap();
        k.multitask_start(1, 1_000_000).unwrap();

        assert_eq!(k.lock(lid, 0).unwrap(), LockOutcome::Acquired);
        // Locking it again from the same holder must not block: the
        // would-be waiter and the holder are the same task, which can
        // never be woken.
        assert_eq!(k.lock(lid, 0).unwrap(), LockOutcome::Acquired);
        assert_eq!(k.tasks[0].state, TaskState::Ready);
        assert_eq!(k.locks[lid as usize].num_blocked, 0);
    }

    #[test]
    fn locking_below_declared_ceiling_ends_the_caller() {
        let mut k = fresh_with(2);
        // Slot 0 (id 9) is declared as the lock's highest locker, but
        // slot 1 (id 3) ends up with a *more* important static priority
        // by having a shorter period, violating the ceiling's own
        // invariant that no legitimate locker can outrank it.
        k.thread_define(TaskId(9), 1, 50).unwrap();
        k.thread_define(TaskId(3), 1, 5).unwrap();
        let lid = k.lock_init(TaskId(9)).unwrap();
        k.multitask_start(1, 1_000_000).unwrap();

        assert!(k.tasks[1]
            .static_priority
            .is_more_important_than(k.locks[lid as usize].priority_ceiling));

        let util_before = k.total_utilization;
        let outcome = k.lock(lid, 1).unwrap();
        assert_eq!(outcome, LockOutcome::CallerEnded);
        assert_eq!(k.tasks[1].state, TaskState::Defunct);
        assert!(k.total_utilization < util_before);
    }

    #[test]
    fn lock_init_respects_the_declared_cap_not_the_table_size() {
        let mut k = Kernel::new(0x2000_0000, 0x2001_0000);
        k.multitask_request(
            2,
            1024,
            MpuMode::KernelOnly,
            1, // app declared exactly one lock
            window(0x2001_0000, crate::config::STACK_WINDOW_BYTES as u32),
            window(0x0001_0000, crate::config::STACK_WINDOW_BYTES as u32),
        )
        .unwrap();

        k.lock_init(TaskId(1)).unwrap();
        // The 32-slot table still has room, but the app only declared one
        // lock, so a second `lock_init` must be refused.
        assert_eq!(k.lock_init(TaskId(2)).unwrap_err(), Kind::NoLockCapacity);
    }
}
