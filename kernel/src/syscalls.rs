//! Architecture-independent syscall dispatch.
//!
//! This builds on the architecture-specific entry sequence defined in
//! `arch::*`: by the time `syscall_entry` runs, the caller's SVC number
//! and up to five argument words have already been recovered from the
//! trapping instruction and the hardware exception frame.

use core::convert::TryFrom;

use abi::{Kind, Sysnum, TaskId, TaskState};

use crate::config::{BOOTSTRAP_SLOT, IDLE_SLOT, SYSTICK_BASE_HZ};
use crate::sched::{Kernel, Reschedule};
use crate::stack::UserBuffer;
use crate::task::ArchState;

/// Entry point called by the arch-specific SVC handler once the caller's
/// saved state has been located in the task table.
///
/// `current` must be a valid index into `kernel.tasks`.
pub fn syscall_entry(kernel: &mut Kernel, current: usize) -> Reschedule {
    let nr = kernel.tasks[current].save.svc_number() as u32;
    let result = match Sysnum::try_from(nr) {
        Ok(sysnum) => dispatch(kernel, current, sysnum),
        Err(()) => Err(Kind::InvalidArgs),
    };

    let (code, resched) = match result {
        Ok((ret, resched)) => (ret as i32 as u32, resched),
        Err(kind) => (kind.code() as u32, Reschedule::NotNeeded),
    };
    kernel.tasks[current].save.ret0(code);
    resched
}

fn dispatch(
    kernel: &mut Kernel,
    current: usize,
    sysnum: Sysnum,
) -> Result<(u32, Reschedule), Kind> {
    match sysnum {
        Sysnum::Sbrk => sbrk(kernel, current),
        Sysnum::Write => write(kernel, current),
        Sysnum::Read => read(kernel, current),
        Sysnum::Exit => exit(kernel, current),
        Sysnum::MultitaskRequest => multitask_request(kernel, current),
        Sysnum::ThreadDefine => thread_define(kernel, current),
        Sysnum::MultitaskStart => multitask_start(kernel, current),
        Sysnum::ThreadId => Ok((kernel.tasks[current].id.0, Reschedule::NotNeeded)),
        Sysnum::ThreadYield => thread_yield(kernel, current),
        Sysnum::ThreadEnd => thread_end(kernel, current),
        Sysnum::GetTime => Ok((kernel.ticks.0, Reschedule::NotNeeded)),
        Sysnum::ThreadTime => Ok((kernel.tasks[current].active_time, Reschedule::NotNeeded)),
        Sysnum::ThreadPriority => {
            Ok((kernel.tasks[current].dynamic_priority.0, Reschedule::NotNeeded))
        }
        Sysnum::LockInit => lock_init(kernel, current),
        Sysnum::Lock => lock(kernel, current),
        Sysnum::Unlock => unlock(kernel, current),
    }
}

fn sbrk(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let incr = kernel.tasks[current].save.arg0() as i32;
    Ok((kernel.heap.sbrk(incr), Reschedule::NotNeeded))
}

fn write(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let save = &kernel.tasks[current].save;
    let (fd, ptr, len) = (save.arg0() as i32, save.arg1(), save.arg2());
    if fd != 1 {
        return Ok((u32::MAX, Reschedule::NotNeeded));
    }
    let buf = UserBuffer::from_raw(ptr, len);
    if !buf.owned_by(&kernel.tasks[current]) {
        return Ok((u32::MAX, Reschedule::NotNeeded));
    }
    // SAFETY: `owned_by` established the buffer lies within the caller's
    // own stack memory.
    let bytes = unsafe { buf.as_slice() };
    let n = kernel.trace.up.write(bytes);
    Ok((n as u32, Reschedule::NotNeeded))
}

fn read(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let save = &kernel.tasks[current].save;
    let (fd, ptr, len) = (save.arg0() as i32, save.arg1(), save.arg2());
    if fd != 0 {
        return Ok((u32::MAX, Reschedule::NotNeeded));
    }
    let mut buf = UserBuffer::from_raw(ptr, len);
    if !buf.owned_by(&kernel.tasks[current]) {
        return Ok((u32::MAX, Reschedule::NotNeeded));
    }
    // SAFETY: `owned_by` established the buffer lies within the caller's
    // own stack memory.
    let bytes = unsafe { buf.as_slice_mut() };
    let n = kernel.trace.down.read(bytes);
    Ok((n as u32, Reschedule::NotNeeded))
}

/// Never returns a code: a task that issues `exit` does not get control
/// back. The architecture layer halts after this returns, matching
/// `syscall_exit`'s busy-wait-for-interrupt failsafe.
fn exit(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let status = kernel.tasks[current].save.arg0();
    crate::fail::die(ExitStatus(status));
}

struct ExitStatus(u32);
impl core::fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task exited with status {}", self.0)
    }
}

fn multitask_request(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current != BOOTSTRAP_SLOT {
        return Err(Kind::NotBootstrap);
    }
    let save = &kernel.tasks[current].save;
    let num_threads = save.arg0();
    let stack_bytes = save.arg1();
    let idle_fn = save.arg2();
    let mpu_mode = abi::MpuMode::try_from(save.arg3()).map_err(|_| Kind::InvalidParams)?;
    let num_locks = save.arg4();

    let user_window = kernel.user_stack_window;
    let kernel_window = kernel.kernel_stack_window;
    kernel.multitask_request(num_threads, stack_bytes, mpu_mode, num_locks, user_window, kernel_window)?;

    let idle = &mut kernel.tasks[crate::config::IDLE_SLOT];
    idle.save = crate::arch::SavedState::bootstrap(idle_fn, 0, idle.user_stack.base, idle.kernel_stack.base);
    Ok((0, Reschedule::NotNeeded))
}

fn thread_define(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current != BOOTSTRAP_SLOT {
        return Err(Kind::NotBootstrap);
    }
    let save = &kernel.tasks[current].save;
    let id = TaskId(save.arg0());
    let entry = save.arg1();
    let arg = save.arg2();
    let c = save.arg3();
    let t = save.arg4();

    let slot = kernel.thread_define(id, c, t)?;
    let task = &mut kernel.tasks[slot];
    task.save = crate::arch::SavedState::bootstrap(entry, arg, task.user_stack.base, task.kernel_stack.base);
    Ok((0, Reschedule::NotNeeded))
}

fn multitask_start(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current != BOOTSTRAP_SLOT {
        return Err(Kind::NotBootstrap);
    }
    let freq = kernel.tasks[current].save.arg0();
    kernel.multitask_start(freq, SYSTICK_BASE_HZ)?;
    if freq != 0 {
        crate::arch::configure_systick(freq, SYSTICK_BASE_HZ);
    }
    kernel.tasks[BOOTSTRAP_SLOT].state = TaskState::Waiting;
    Ok((0, Reschedule::Needed))
}

fn thread_yield(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current != IDLE_SLOT {
        kernel.tasks[current].state = TaskState::Waiting;
    }
    Ok((0, Reschedule::Needed))
}

fn thread_end(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current == IDLE_SLOT {
        return Ok((0, Reschedule::NotNeeded));
    }
    kernel.end_task(current);
    Ok((0, Reschedule::Needed))
}

fn lock_init(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    if current != BOOTSTRAP_SLOT {
        return Err(Kind::NotBootstrap);
    }
    let highest = TaskId(kernel.tasks[current].save.arg0());
    let id = kernel.lock_init(highest)?;
    Ok((id, Reschedule::NotNeeded))
}

fn lock(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let lock_id = kernel.tasks[current].save.arg0();
    let resched = match kernel.lock(lock_id, current)? {
        crate::mutex::LockOutcome::Acquired => Reschedule::NotNeeded,
        crate::mutex::LockOutcome::Blocked | crate::mutex::LockOutcome::CallerEnded => {
            Reschedule::Needed
        }
    };
    Ok((0, resched))
}

fn unlock(kernel: &mut Kernel, current: usize) -> Result<(u32, Reschedule), Kind> {
    let lock_id = kernel.tasks[current].save.arg0();
    kernel.unlock(lock_id, current)?;
    Ok((0, Reschedule::Needed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SavedState;
    use crate::task::StackExtent;
    use abi::MpuMode;

    fn window(base: u32, len: u32) -> StackExtent {
        StackExtent { base, limit: base - len }
    }

    fn fresh() -> Kernel {
        Kernel::new(0x2000_0000, 0x2001_0000)
    }

    fn trap(kernel: &mut Kernel, who: usize, svc: u8, args: [u32; 5]) -> u32 {
        kernel.tasks[who].save.simulate_trap(svc, args);
        syscall_entry(kernel, who);
        kernel.tasks[who].save.last_ret0()
    }

    #[test]
    fn sbrk_advances_the_break_by_the_requested_increment() {
        let mut k = fresh();
        let first = trap(&mut k, BOOTSTRAP_SLOT, 0, [64, 0, 0, 0, 0]);
        let second = trap(&mut k, BOOTSTRAP_SLOT, 0, [64, 0, 0, 0, 0]);
        assert_eq!(second - first, 64);
    }

    #[test]
    fn thread_id_reports_the_caller_own_id() {
        let mut k = fresh();
        k.tasks[BOOTSTRAP_SLOT].id = TaskId(9);
        let ret = trap(&mut k, BOOTSTRAP_SLOT, 34, [0, 0, 0, 0, 0]);
        assert_eq!(ret, 9);
    }

    #[test]
    fn unknown_svc_number_reports_invalid_args() {
        let mut k = fresh();
        let ret = trap(&mut k, BOOTSTRAP_SLOT, 200, [0, 0, 0, 0, 0]);
        assert_eq!(ret as i32, Kind::InvalidArgs.code() as i32);
    }

    #[test]
    fn thread_define_before_multitask_request_is_rejected() {
        let mut k = fresh();
        let ret = trap(&mut k, BOOTSTRAP_SLOT, 32, [5, 0x1000, 0, 1, 2]);
        assert_eq!(ret as i32, Kind::InvalidArgs.code() as i32);
    }

    #[test]
    fn multitask_request_from_a_user_task_is_rejected() {
        let mut k = fresh();
        let ret = trap(&mut k, 0, 31, [2, 1024, 0, MpuMode::KernelOnly as u32, 2]);
        assert_eq!(ret as i32, Kind::NotBootstrap.code() as i32);
    }

    #[test]
    fn multitask_request_then_thread_define_admits_a_task() {
        let mut k = fresh();
        k.user_stack_window = window(0x2001_0000, abi::STACK_WINDOW_BYTES as u32);
        k.kernel_stack_window = window(0x0001_0000, abi::STACK_WINDOW_BYTES as u32);
        let ret = trap(
            &mut k,
            BOOTSTRAP_SLOT,
            31,
            [2, 1024, 0, MpuMode::KernelOnly as u32, 2],
        );
        assert_eq!(ret, 0);

        let ret = trap(&mut k, BOOTSTRAP_SLOT, 32, [5, 0x1000, 0, 1, 2]);
        assert_eq!(ret, 0);
        assert_eq!(k.tasks[0].id, TaskId(5));
        assert_eq!(k.tasks[0].save.arg0(), 0x1000);
    }
}
