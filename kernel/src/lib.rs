//! A small preemptive rate-monotonic kernel for a single ARM Cortex-M
//! application image.
//!
//! There is one fixed TCB table (`sched::Kernel::tasks`): up to fourteen
//! user tasks admitted by `thread_define` under a Liu-Layland utilization
//! bound, plus the idle task, plus the bootstrap/main task that performs
//! setup and then waits for the application to finish. Mutual exclusion is
//! the priority-ceiling protocol with dynamic priority inheritance
//! (`mutex`). Every task gets two MPU-backed stacks, unprivileged and
//! privileged, carved out of two reserved windows (`mpu`, `stack`). The
//! supervisor-call boundary (`syscalls`) is a flat, bit-exact numbering
//! shared with user code through the `abi` crate.
//!
//! This is portable to both real ARM targets and a host-resident
//! simulation backend (`arch::sim`) used by this crate's own test suite;
//! see `arch` for how that selection works.
//!
//! # Algorithm naivety
//!
//! Task counts are small (at most sixteen slots) and fixed per build, so
//! admission control and scheduling are straightforward linear or
//! quadratic passes over the TCB table rather than anything indexed. This
//! is deliberate: easy to audit beats fast, at this scale.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(naked_functions))]
#![cfg_attr(target_os = "none", feature(llvm_asm))]

#[macro_use]
pub mod arch;

pub mod config;
pub mod err;
pub mod fail;
pub mod heap;
pub mod mpu;
pub mod mutex;
pub mod rtt;
pub mod sched;
pub mod stack;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;

