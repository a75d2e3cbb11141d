//! Syscall stubs and shared types for tasks running under this kernel.
//!
//! Each syscall has a public, checked wrapper and an internal `naked`
//! stub. The stub exists only to emit `svc #<N>` with the number baked in
//! as a literal immediate (the kernel recovers the SVC number from the
//! trapping instruction itself, not from a register), so it has to be a
//! distinct function per syscall rather than one generic trampoline.
//! Ordinary arguments ride in `r0`-`r3`, which is also where the AAPCS
//! already puts a function's first four `u32` parameters, so most stubs
//! do nothing but trap and return. The two five-argument calls
//! (`multitask_request`, `thread_define`) push their fifth word onto the
//! caller's own stack immediately before the `svc`, where the kernel's
//! `arg4` knows to find it.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(naked_functions))]
#![cfg_attr(target_os = "none", feature(llvm_asm))]

pub use abi::*;

use core::convert::TryFrom;

/// Splits a raw syscall return word into `Ok(value)` or the `Kind` it
/// encodes as a small negative number.
fn check(raw: u32) -> Result<u32, Kind> {
    let signed = raw as i32;
    if signed < 0 {
        Err(Kind::try_from(signed).unwrap_or(Kind::InvalidArgs))
    } else {
        Ok(raw)
    }
}

/// Everything below actually traps into the kernel, so it only exists for
/// the real target; host test builds get no syscall surface; there is no
/// kernel on the other end of a test binary's `svc`.
#[cfg(target_os = "none")]
mod svc {
    use super::check;
    use abi::{Kind, LockId, MpuMode, Priority, TaskId};

    macro_rules! svc_stub {
        ($name:ident, $n:expr) => {
            #[naked]
            #[no_mangle]
            unsafe extern "C" fn $name(_a0: u32, _a1: u32, _a2: u32, _a3: u32) -> u32 {
                llvm_asm!(concat!("svc #", stringify!($n), "\n", "bx lr")
                    : : : : "volatile")
            }
        };
    }

    svc_stub!(sbrk_stub, 0);
    svc_stub!(write_stub, 1);
    svc_stub!(read_stub, 2);
    svc_stub!(exit_stub, 3);
    svc_stub!(multitask_start_stub, 33);
    svc_stub!(thread_id_stub, 34);
    svc_stub!(thread_yield_stub, 35);
    svc_stub!(thread_end_stub, 36);
    svc_stub!(get_time_stub, 37);
    svc_stub!(thread_time_stub, 38);
    svc_stub!(thread_priority_stub, 39);
    svc_stub!(lock_init_stub, 41);
    svc_stub!(lock_stub, 42);
    svc_stub!(unlock_stub, 43);

    /// Stub shape for the two calls that need a fifth argument word. The
    /// spare word keeps the stack eight-byte aligned across the `svc`; the
    /// real value goes in the register pushed closest to the exception
    /// frame, which lands exactly where `ArchState::arg4` expects it.
    macro_rules! svc_stub5 {
        ($name:ident, $n:expr) => {
            #[naked]
            #[no_mangle]
            unsafe extern "C" fn $name(
                _a0: u32,
                _a1: u32,
                _a2: u32,
                _a3: u32,
                _a4: u32,
            ) -> u32 {
                llvm_asm!(concat!(
                    "push {r5}\n",
                    "push {r4}\n",
                    "svc #", stringify!($n), "\n",
                    "add sp, sp, #8\n",
                    "bx lr"
                ) : : : : "volatile")
            }
        };
    }

    svc_stub5!(multitask_request_stub, 31);
    svc_stub5!(thread_define_stub, 32);

    /// Requests `incr` additional bytes from the heap, returning the new
    /// program break. `incr` may be negative to release memory, though
    /// this kernel's allocator never reclaims it; see `sbrk` on the kernel
    /// side.
    #[inline(always)]
    pub fn sbrk(incr: i32) -> u32 {
        unsafe { sbrk_stub(incr as u32, 0, 0, 0) }
    }

    /// Writes `buf` to file descriptor `fd`. Only `fd == 1` is
    /// implemented; anything else returns `u32::MAX`, matching the
    /// kernel's `write`.
    #[inline(always)]
    pub fn write(fd: i32, buf: &[u8]) -> u32 {
        unsafe { write_stub(fd as u32, buf.as_ptr() as u32, buf.len() as u32, 0) }
    }

    /// Reads into `buf` from file descriptor `fd`. Only `fd == 0` is
    /// implemented; anything else returns `u32::MAX`.
    #[inline(always)]
    pub fn read(fd: i32, buf: &mut [u8]) -> u32 {
        unsafe { read_stub(fd as u32, buf.as_mut_ptr() as u32, buf.len() as u32, 0) }
    }

    /// Ends the calling task's execution with `status`, recorded in the
    /// kernel's epitaph. Never returns.
    pub fn exit(status: u32) -> ! {
        unsafe { exit_stub(status, 0, 0, 0) };
        loop {}
    }

    /// Declares the shape of the application: how many user tasks will be
    /// defined, how big each one's stack bands are, the idle task's entry
    /// point, whether stacks are mutually isolated, and how many mutexes
    /// will be needed. Must be called exactly once, by the bootstrap
    /// task, before any `thread_define`.
    #[inline(always)]
    pub fn multitask_request(
        num_threads: u32,
        stack_bytes: u32,
        idle_fn: extern "C" fn(u32) -> !,
        mpu_mode: MpuMode,
        num_locks: u32,
    ) -> Result<(), Kind> {
        let raw = unsafe {
            multitask_request_stub(
                num_threads,
                stack_bytes,
                idle_fn as usize as u32,
                mpu_mode as u32,
                num_locks,
            )
        };
        check(raw).map(|_| ())
    }

    /// Admits one task into the slot reserved by `multitask_request`,
    /// subject to the Liu-Layland utilization bound. `c`/`t` are the
    /// worst-case execution time and period, in scheduler ticks.
    #[inline(always)]
    pub fn thread_define(
        id: TaskId,
        entry: extern "C" fn(u32) -> !,
        arg: u32,
        c: u32,
        t: u32,
    ) -> Result<(), Kind> {
        let raw =
            unsafe { thread_define_stub(id.0, entry as usize as u32, arg, c, t) };
        check(raw).map(|_| ())
    }

    /// Arms the scheduler at `freq_hz` scheduler ticks per second and
    /// never returns to the caller as a runnable task again: the
    /// bootstrap task moves to `Waiting` for the rest of the
    /// application's life.
    #[inline(always)]
    pub fn multitask_start(freq_hz: u32) -> Result<(), Kind> {
        let raw = unsafe { multitask_start_stub(freq_hz, 0, 0, 0) };
        check(raw).map(|_| ())
    }

    /// The calling task's own id, as given to `thread_define`.
    #[inline(always)]
    pub fn thread_id() -> TaskId {
        TaskId(unsafe { thread_id_stub(0, 0, 0, 0) })
    }

    /// Voluntarily gives up the remainder of the current tick's budget.
    #[inline(always)]
    pub fn thread_yield() {
        unsafe { thread_yield_stub(0, 0, 0, 0) };
    }

    /// Marks the calling task Defunct, releasing any mutexes it still
    /// holds. Reached implicitly if a task's entry point returns.
    pub fn thread_end() -> ! {
        unsafe { thread_end_stub(0, 0, 0, 0) };
        loop {}
    }

    /// Ticks elapsed since `multitask_start`.
    #[inline(always)]
    pub fn get_time() -> u32 {
        unsafe { get_time_stub(0, 0, 0, 0) }
    }

    /// Ticks the calling task has spent `Running`, cumulative since it
    /// was defined.
    #[inline(always)]
    pub fn thread_time() -> u32 {
        unsafe { thread_time_stub(0, 0, 0, 0) }
    }

    /// The calling task's current dynamic priority (its static priority,
    /// unless it is currently holding a mutex and has inherited a
    /// waiter's higher one).
    #[inline(always)]
    pub fn thread_priority() -> Priority {
        Priority(unsafe { thread_priority_stub(0, 0, 0, 0) })
    }

    /// Registers a new mutex with ceiling `highest_locker` (the id of the
    /// highest-priority task that will ever lock it). Bootstrap-only,
    /// like `multitask_request`.
    #[inline(always)]
    pub fn lock_init(highest_locker: TaskId) -> Result<LockId, Kind> {
        let raw = unsafe { lock_init_stub(highest_locker.0, 0, 0, 0) };
        check(raw).map(LockId)
    }

    /// Acquires `id`, blocking (and donating priority to the holder) if
    /// it is already held.
    #[inline(always)]
    pub fn lock(id: LockId) -> Result<(), Kind> {
        let raw = unsafe { lock_stub(id.0, 0, 0, 0) };
        check(raw).map(|_| ())
    }

    /// Releases `id`, waking the highest-priority blocked waiter if any
    /// and restoring the caller's own priority.
    #[inline(always)]
    pub fn unlock(id: LockId) -> Result<(), Kind> {
        let raw = unsafe { unlock_stub(id.0, 0, 0, 0) };
        check(raw).map(|_| ())
    }
}

#[cfg(target_os = "none")]
pub use svc::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_splits_negative_codes_from_values() {
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(7), Ok(7));
        assert_eq!(check(Kind::Repeated.code() as u32), Err(Kind::Repeated));
        assert_eq!(
            check(Kind::UnsafeAdmission.code() as u32),
            Err(Kind::UnsafeAdmission)
        );
    }
}
