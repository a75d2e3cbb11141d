//! Kernel ABI definitions, shared between the kernel and user tasks.

#![no_std]

use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Maximum number of user tasks a single build can define, not counting the
/// idle task or the bootstrap task.
pub const MAX_USER_TASKS: usize = 14;

/// Total TCB table capacity: user tasks, plus idle, plus the bootstrap task.
pub const MAX_TASKS: usize = MAX_USER_TASKS + 2;

/// Maximum number of mutexes a single build can request.
pub const MAX_LOCKS: usize = 32;

/// Combined size, in bytes, of the reserved window for unprivileged task
/// stacks (the privileged window is the same size, reserved separately).
pub const STACK_WINDOW_BYTES: usize = 32 * 1024;

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u32);

impl Priority {
    /// The priority assigned to the idle task: never more important than any
    /// user task.
    pub const IDLE: Self = Self(u32::MAX);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Opaque task identifier, chosen by the application and unique among
/// non-defunct tasks. The kernel never interprets its value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(transparent)]
pub struct TaskId(pub u32);

/// Opaque handle to a mutex, returned by `lock_init`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(transparent)]
pub struct LockId(pub u32);

/// Policy controlling whether the two dynamic MPU regions are rebound on
/// every context switch, or programmed once to cover the whole stack window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MpuMode {
    /// A single pair of dynamic regions covers the entire stack window;
    /// tasks are not isolated from each other's stacks, only from the
    /// kernel.
    KernelOnly = 0,
    /// The dynamic regions are reprogrammed at every context switch to cover
    /// only the running task's stack band.
    PerThread = 1,
}

impl core::convert::TryFrom<u32> for MpuMode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::KernelOnly),
            1 => Ok(Self::PerThread),
            _ => Err(()),
        }
    }
}

/// Description of one memory region, used by the MPU manager to program a
/// hardware region.
///
/// Note that regions can overlap; the kernel exploits this deliberately for
/// the dynamic stack regions, which are disabled and reprogrammed rather
/// than shared.
#[derive(Clone, Copy, Debug, FromBytes)]
#[repr(C)]
pub struct RegionDesc {
    /// Address of start of region. Must be naturally aligned for `size`.
    pub base: u32,
    /// Size of region, in bytes. Must be a power of two of at least 32.
    pub size: u32,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// Returns whether `addr` lies within `[base, base+size)`.
    pub fn covers(&self, addr: u32) -> bool {
        let end = self.base.wrapping_add(self.size);
        addr >= self.base && addr < end
    }
}

bitflags::bitflags! {
    #[derive(FromBytes)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by tasks that include it.
        const READ = 1 << 0;
        /// Region can be written by tasks that include it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for tasks that include it.
        const EXECUTE = 1 << 2;
        /// Region contains memory-mapped registers.
        const DEVICE = 1 << 3;

        const RESERVED = !((1 << 4) - 1);
    }
}

/// Every distinct negative code the supervisor-call surface can return.
///
/// Encoded as a small negative integer at the SVC ABI boundary; kernel code
/// above that boundary works with `Result<T, Kind>` instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Kind {
    /// `multitask_request` was called a second time.
    Repeated = -1,
    /// `multitask_request` was given invalid parameters (zero or
    /// over-capacity thread count, oversized stack request, or too many
    /// locks requested).
    InvalidParams = -2,
    /// `thread_define` found no Defunct slot available.
    NoTcb = -3,
    /// `thread_define` named an id already used by a non-Defunct task.
    Duplicate = -4,
    /// `thread_define` was given a null entry point, or `c`/`t` that do not
    /// satisfy `0 < c <= t`.
    InvalidArgs = -5,
    /// Admitting this task would exceed the RM utilization bound.
    UnsafeAdmission = -6,
    /// `multitask_start` was given a frequency exceeding the systick base
    /// frequency.
    InvalidFreq = -7,
    /// `multitask_start` was called before any task was defined.
    WithoutThread = -8,
    /// A mutex's declared highest-locker id does not name a defined task.
    LockNonexistentHighestLocker = -9,
    /// `lock_init` was called after the lock table capacity was exhausted.
    NoLockCapacity = -10,
    /// A call reserved for the bootstrap task was made by another task.
    NotBootstrap = -11,
}

impl Kind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl core::convert::TryFrom<i32> for Kind {
    type Error = ();

    fn try_from(code: i32) -> Result<Self, ()> {
        Ok(match code {
            -1 => Kind::Repeated,
            -2 => Kind::InvalidParams,
            -3 => Kind::NoTcb,
            -4 => Kind::Duplicate,
            -5 => Kind::InvalidArgs,
            -6 => Kind::UnsafeAdmission,
            -7 => Kind::InvalidFreq,
            -8 => Kind::WithoutThread,
            -9 => Kind::LockNonexistentHighestLocker,
            -10 => Kind::NoLockCapacity,
            -11 => Kind::NotBootstrap,
            _ => return Err(()),
        })
    }
}

/// Unrecoverable conditions classified by the fault handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// A user task's unprivileged stack underflowed (stack pointer at or
    /// above the stack's base).
    UserStackUnderflow { task: TaskId },
    /// A user task's unprivileged stack overflowed (stack pointer below the
    /// stack's limit).
    UserStackOverflow { task: TaskId },
    /// The bootstrap task's stack underflowed. Fatal to the whole
    /// application.
    MainStackUnderflow,
    /// The bootstrap task's stack overflowed. Fatal to the whole
    /// application.
    MainStackOverflow,
    /// A data access violation was reported by the MPU with no identifiable
    /// stack-bounds cause.
    DataAccessViolation { address: Option<u32> },
    /// An instruction access violation was reported by the MPU.
    InstructionAccessViolation { address: Option<u32> },
    /// A stacking or unstacking error occurred on exception entry/exit.
    StackingError,
}

/// Enumeration of supervisor-call numbers.
///
/// This is the contractual supervisor-number immediate and must be preserved
/// bit-exactly for compatibility with compiled user code; values skip
/// deliberately to leave room for the peripheral syscalls this crate does
/// not implement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Sbrk = 0,
    Write = 1,
    Read = 2,
    Exit = 3,
    MultitaskRequest = 31,
    ThreadDefine = 32,
    MultitaskStart = 33,
    ThreadId = 34,
    ThreadYield = 35,
    ThreadEnd = 36,
    GetTime = 37,
    ThreadTime = 38,
    ThreadPriority = 39,
    LockInit = 41,
    Lock = 42,
    Unlock = 43,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and
/// this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Sbrk),
            1 => Ok(Self::Write),
            2 => Ok(Self::Read),
            3 => Ok(Self::Exit),
            31 => Ok(Self::MultitaskRequest),
            32 => Ok(Self::ThreadDefine),
            33 => Ok(Self::MultitaskStart),
            34 => Ok(Self::ThreadId),
            35 => Ok(Self::ThreadYield),
            36 => Ok(Self::ThreadEnd),
            37 => Ok(Self::GetTime),
            38 => Ok(Self::ThreadTime),
            39 => Ok(Self::ThreadPriority),
            41 => Ok(Self::LockInit),
            42 => Ok(Self::Lock),
            43 => Ok(Self::Unlock),
            _ => Err(()),
        }
    }
}

/// Lifecycle state of a task control block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Running,
    Ready,
    Waiting,
    Blocked,
    Defunct,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_numeric() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(0)));
        assert!(!Priority(0).is_more_important_than(Priority(0)));
    }

    #[test]
    fn sysnum_table_is_bit_exact() {
        use core::convert::TryFrom;
        let table: &[(u32, Sysnum)] = &[
            (0, Sysnum::Sbrk),
            (1, Sysnum::Write),
            (2, Sysnum::Read),
            (3, Sysnum::Exit),
            (31, Sysnum::MultitaskRequest),
            (32, Sysnum::ThreadDefine),
            (33, Sysnum::MultitaskStart),
            (34, Sysnum::ThreadId),
            (35, Sysnum::ThreadYield),
            (36, Sysnum::ThreadEnd),
            (37, Sysnum::GetTime),
            (38, Sysnum::ThreadTime),
            (39, Sysnum::ThreadPriority),
            (41, Sysnum::LockInit),
            (42, Sysnum::Lock),
            (43, Sysnum::Unlock),
        ];
        for (num, expect) in table {
            let got = Sysnum::try_from(*num).unwrap();
            assert_eq!(got as u32, *expect as u32);
        }
        assert!(Sysnum::try_from(40).is_err());
        assert!(Sysnum::try_from(4).is_err());
    }

    #[test]
    fn kind_round_trips_through_its_error_code() {
        use core::convert::TryFrom;
        let kinds = [
            Kind::Repeated,
            Kind::InvalidParams,
            Kind::NoTcb,
            Kind::Duplicate,
            Kind::InvalidArgs,
            Kind::UnsafeAdmission,
            Kind::InvalidFreq,
            Kind::WithoutThread,
            Kind::LockNonexistentHighestLocker,
            Kind::NoLockCapacity,
            Kind::NotBootstrap,
        ];
        for k in kinds {
            assert_eq!(Kind::try_from(k.code()), Ok(k));
        }
        assert_eq!(Kind::try_from(0), Err(()));
    }

    #[test]
    fn region_covers_is_half_open() {
        let r = RegionDesc {
            base: 0x2000_0000,
            size: 0x100,
            attributes: RegionAttributes::READ,
        };
        assert!(r.covers(0x2000_0000));
        assert!(r.covers(0x2000_00ff));
        assert!(!r.covers(0x2000_0100));
        assert!(!r.covers(0x1fff_ffff));
    }
}
