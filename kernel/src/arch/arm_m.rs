//! Architecture support for ARMv7-M.
//!
//! # Three entry points, three different costs
//!
//! - `SVCall` services the `svc` instruction user code issues for every
//!   syscall. It never switches which task is current by itself (the
//!   chosen task only changes inside `PendSV`), so it doesn't need to save
//!   or restore the callee-saved registers: it reads the caller's process
//!   stack pointer, hands it to `syscall_entry`, and returns.
//! - `SysTick` advances the tick counter and, if accounting the elapsed
//!   tick changed anything a reschedule should consider, pends `PendSV`.
//!   It never touches user registers directly.
//! - `PendSV` is where an actual context switch happens: it saves the
//!   outgoing task's callee-saved registers and process stack pointer into
//!   its TCB, asks the scheduler to pick a task, then restores the
//!   incoming task's registers. Because every task runs kernel code on its
//!   own privileged stack band rather than a single shared kernel stack,
//!   the very last thing this handler does is swap `MSP` itself to the
//!   incoming task's band -- anything after that point would be running on
//!   a stack with no knowledge of how it got there, so nothing is.
//!
//! This split exists for the same reason it does on every Cortex-M kernel:
//! `SVCall` is the hot path and almost always wants a switch, but deferring
//! the expensive save/restore dance to `PendSV` means a tick that doesn't
//! change who should run next costs almost nothing.

use core::ptr::NonNull;

use abi::{MpuMode, RegionAttributes, TaskState};

use crate::sched::{self, Reschedule};
use crate::task::{self, ArchState};

/// Log from kernel context. Backed by the Instrumentation Trace Macrocell
/// or semihosting depending on which `klog-*` feature is enabled; compiled
/// out entirely otherwise.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed");
        }
    };
}

macro_rules! uassert_eq {
    ($a:expr, $b:expr) => {
        if !($a == $b) {
            panic!("assertion failed");
        }
    };
}

/// The system-wide kernel. There is exactly one, created by `startup::boot`
/// before the first task runs, and every entry point in this file reaches
/// it through `with_kernel`.
static mut KERNEL_PTR: Option<NonNull<sched::Kernel>> = None;

/// Address of the currently-running task's `Task` (and, since `save` is
/// the first field, equivalently of its `SavedState`). Exists because the
/// naked handlers below need an address they can `stm`/`ldm` through
/// directly, which a `&mut Kernel` borrow doesn't give them.
#[no_mangle]
static mut CURRENT_TASK_PTR: Option<NonNull<task::Task>> = None;

/// Records `kernel` as the system-wide kernel. Called once, from `boot`.
///
/// # Safety
///
/// Stashes a pointer that aliases `kernel`; only call this once, before
/// any entry point below can run.
pub unsafe fn set_kernel(kernel: &mut sched::Kernel) {
    let prev = core::mem::replace(&mut KERNEL_PTR, Some(NonNull::from(kernel)));
    uassert_eq!(prev, None);
}

fn with_kernel<R>(body: impl FnOnce(&mut sched::Kernel) -> R) -> R {
    // Safety: `KERNEL_PTR` is set exactly once at boot, before any
    // interrupt that could call this is unmasked.
    let kernel = unsafe { KERNEL_PTR.expect("kernel not started").as_mut() };
    body(kernel)
}

fn task_index(kernel: &sched::Kernel, task: *const task::Task) -> usize {
    let base = kernel.tasks.as_ptr() as usize;
    (task as usize - base) / core::mem::size_of::<task::Task>()
}

/// Registers saved across a context switch, in the layout the naked
/// `PendSV` handler addresses directly: `stm`/`ldm` move all nine words in
/// one instruction, so their order here must not change without updating
/// the assembly below.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
}

impl SavedState {
    pub const INIT: Self = Self { r4: 0, r5: 0, r6: 0, r7: 0, r8: 0, r9: 0, r10: 0, r11: 0, psp: 0 };

    fn frame(&self) -> &BaseExceptionFrame {
        // Safety: `psp` always points at a hardware-pushed exception frame
        // belonging to this task, established either here in `bootstrap`
        // or by the CPU itself on SVC/fault entry.
        unsafe { &*(self.psp as *const BaseExceptionFrame) }
    }

    fn frame_mut(&mut self) -> &mut BaseExceptionFrame {
        unsafe { &mut *(self.psp as *mut BaseExceptionFrame) }
    }

    /// Synthesizes the state a freshly `thread_define`d task has before it
    /// is ever switched in: a hardware exception frame on its own
    /// unprivileged stack such that "returning" from it lands the CPU at
    /// `entry(arg)`, with `lr` pointing at a trampoline that turns a
    /// normal return from `entry` into a `thread_end` syscall.
    pub fn bootstrap(entry: u32, arg: u32, user_sp: u32, _kernel_sp: u32) -> Self {
        let frame_addr = user_sp - core::mem::size_of::<BaseExceptionFrame>() as u32;
        let frame = BaseExceptionFrame {
            r0: arg,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: thread_exit_trampoline as usize as u32 | 1,
            pc: entry | 1,
            xpsr: INITIAL_PSR,
        };
        // Safety: `frame_addr` is inside the band `multitask_request`
        // reserved for this task, which nothing else is using yet.
        unsafe { core::ptr::write(frame_addr as *mut BaseExceptionFrame, frame) };
        Self { psp: frame_addr, ..Self::INIT }
    }
}

impl task::ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.psp
    }

    fn arg0(&self) -> u32 {
        self.frame().r0
    }
    fn arg1(&self) -> u32 {
        self.frame().r1
    }
    fn arg2(&self) -> u32 {
        self.frame().r2
    }
    fn arg3(&self) -> u32 {
        self.frame().r3
    }
    /// The hardware frame only carries four argument registers; the rare
    /// calls that need a fifth word read it from the caller's own stack,
    /// eight words above the frame base (i.e. just past the frame plus one
    /// spare word the caller's wrapper leaves for alignment).
    fn arg4(&self) -> u32 {
        unsafe { *((self.psp as *const u32).add(8)) }
    }

    /// The SVC immediate isn't delivered to us directly; we recover it
    /// from the trapping instruction itself, two bytes before the
    /// returned-to `pc`.
    fn svc_number(&self) -> u8 {
        let pc = self.frame().pc;
        unsafe { *((pc - 2) as *const u8) }
    }

    fn ret0(&mut self, x: u32) {
        self.frame_mut().r0 = x;
    }
}

/// What the hardware pushes on exception entry.
#[derive(Debug, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Thumb mode bit, the only bit a freshly synthesized `xpsr` needs set.
const INITIAL_PSR: u32 = 1 << 24;

/// Entered (in unprivileged mode, on the exiting task's own stack) when a
/// task's entry function returns normally instead of calling `exit`. Turns
/// that return into a well-formed `thread_end` syscall rather than letting
/// the CPU run off into whatever garbage follows in flash.
#[no_mangle]
unsafe extern "C" fn thread_exit_trampoline() -> ! {
    llvm_asm! {"
        movs r0, #0
        svc #36
    1:  b 1b
    " ::: "memory" : "volatile"}
    core::hint::unreachable_unchecked()
}

/// Programs the six regions that never change after boot, plus the two
/// dynamic stack regions (covering the whole reserved window, under the
/// `KernelOnly` policy this call always runs with at boot; `apply_memory_protection`
/// re-narrows them per task under `PerThread`).
fn configure_static_regions(layout: &crate::mpu::StaticLayout, user_window: task::StackExtent, kernel_window: task::StackExtent) {
    let mpu = unsafe { &*cortex_m::peripheral::MPU::ptr() };
    for (region, base, size, attrs) in crate::mpu::static_regions(layout) {
        let (rbar, rasr) = crate::mpu::encode_region(region, base, size, attrs);
        unsafe {
            mpu.rbar.write(rbar);
            mpu.rasr.write(rasr);
        }
    }
    let rw = RegionAttributes::READ | RegionAttributes::WRITE;
    let (rbar, rasr) = crate::mpu::encode_region(
        crate::mpu::USER_STACK_REGION,
        user_window.limit,
        user_window.base - user_window.limit,
        rw,
    );
    unsafe {
        mpu.rbar.write(rbar);
        mpu.rasr.write(rasr);
    }
    let (rbar, rasr) = crate::mpu::encode_region(
        crate::mpu::KERNEL_STACK_REGION,
        kernel_window.limit,
        kernel_window.base - kernel_window.limit,
        rw,
    );
    unsafe {
        mpu.rbar.write(rbar);
        mpu.rasr.write(rasr);
    }
}

/// Re-binds the two dynamic stack regions to `task`'s own bands. A no-op
/// under `MpuMode::KernelOnly`, where the dynamic regions were already set
/// once, at boot, to cover the entire window.
pub fn apply_memory_protection(task: &task::Task, mode: MpuMode) {
    if mode != MpuMode::PerThread {
        return;
    }
    let mpu = unsafe { &*cortex_m::peripheral::MPU::ptr() };
    let rw = RegionAttributes::READ | RegionAttributes::WRITE;
    let (rbar, rasr) = crate::mpu::encode_region(
        crate::mpu::USER_STACK_REGION,
        task.user_stack.limit,
        task.user_stack.base - task.user_stack.limit,
        rw,
    );
    unsafe {
        mpu.rbar.write(rbar);
        mpu.rasr.write(rasr);
    }
    let (rbar, rasr) = crate::mpu::encode_region(
        crate::mpu::KERNEL_STACK_REGION,
        task.kernel_stack.limit,
        task.kernel_stack.base - task.kernel_stack.limit,
        rw,
    );
    unsafe {
        mpu.rbar.write(rbar);
        mpu.rasr.write(rasr);
    }
}

/// Arms the systick timer so it fires at (approximately) `freq` Hz against
/// a `base_hz` core clock, dividing the logical tick down by an integer
/// count of hardware periods when the exact reload would not fit the
/// timer's 24-bit counter.
pub fn configure_systick(freq: u32, base_hz: u32) {
    let exact = base_hz / freq;
    let (reload, divider) = if exact <= crate::config::SYSTICK_MAX_RELOAD {
        (exact, 1)
    } else {
        let divider = (exact + crate::config::SYSTICK_MAX_RELOAD - 1) / crate::config::SYSTICK_MAX_RELOAD;
        (exact / divider, divider)
    };
    unsafe {
        TICK_DIVIDER = divider;
        TICK_DIVIDER_COUNTER = divider;
        let syst = &*cortex_m::peripheral::SYST::ptr();
        syst.rvr.write(reload.saturating_sub(1));
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111);
    }
}

/// How many hardware systick periods make up one logical scheduler tick;
/// see `configure_systick`.
static mut TICK_DIVIDER: u32 = 1;
static mut TICK_DIVIDER_COUNTER: u32 = 1;

/// Configures fault priorities, programs the static MPU regions, and
/// transfers control into the bootstrap task. Does not arm the systick: its
/// frequency isn't known until the bootstrap task calls `multitask_start`.
pub fn boot(
    kernel: &mut sched::Kernel,
    layout: &crate::mpu::StaticLayout,
    user_window: task::StackExtent,
    kernel_window: task::StackExtent,
) -> ! {
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::ptr();
        // MemManage, BusFault, UsageFault on.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Memory/bus/usage faults highest configurable priority; the rest
        // of the kernel entry points share one lower priority so none of
        // them preempt each other.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        scb.shpr[7].write(0xFF); // SVCall
        scb.shpr[10].write(0xFF); // PendSV
        scb.shpr[11].write(0xFF); // SysTick
    }

    configure_static_regions(layout, user_window, kernel_window);
    unsafe {
        const ENABLE: u32 = 0b001;
        const PRIVDEFENA: u32 = 0b100;
        let mpu = &*cortex_m::peripheral::MPU::ptr();
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }

    unsafe { set_kernel(kernel) };
    let bootstrap = with_kernel(|k| {
        let idx = crate::config::BOOTSTRAP_SLOT;
        k.tasks[idx].save = SavedState::bootstrap(
            bootstrap_entry as usize as u32,
            0,
            user_window.base,
            kernel_window.base,
        );
        k.tasks[idx].state = TaskState::Running;
        unsafe { CURRENT_TASK_PTR = Some(NonNull::from(&mut k.tasks[idx])) };
        idx
    });

    let psp = with_kernel(|k| k.tasks[bootstrap].save.psp);
    let msp = kernel_window.base;
    unsafe { start_first_task(psp, msp) }
}

extern "Rust" {
    /// Provided by the application: the bootstrap task's entry point. Runs
    /// unprivileged, on the stack `boot` carved out for it, and is expected
    /// to call `multitask_request`/`thread_define`/`multitask_start`.
    fn bootstrap_entry();
}

/// Transfers control to the first task by way of a deliberate `svc`: the
/// only legal way to shed privilege and switch to `PSP` is a `bx` with a
/// magic `EXC_RETURN` value executed from Handler mode, so we manufacture
/// a trip through `SVCall` just to get there (see its `cmp lr, #...`
/// special case below). Registers `r4`-`r11` are set here, before the
/// `svc`, rather than restored by the handler, since the hardware leaves
/// them untouched across exception entry.
unsafe fn start_first_task(psp: u32, msp: u32) -> ! {
    llvm_asm! {"
        msr MSP, $1
        msr PSP, $0
        movs r4, #0
        movs r5, #0
        movs r6, #0
        movs r7, #0
        mov r8, r4
        mov r9, r4
        mov r10, r4
        mov r11, r4
        svc #0xFF
        udf #0xad
        "
        :
        : "r"(psp), "r"(msp)
        : "memory"
        : "volatile"
    }
    core::hint::unreachable_unchecked()
}

/// Handler linked into the vector table for the `svc` instruction.
#[allow(non_snake_case)]
#[naked]
#[no_mangle]
pub unsafe extern "C" fn SVCall() {
    llvm_asm! {"
        cmp lr, #0xFFFFFFF9     @ returning from start_first_task's manufactured
        beq 1f                  @ call rather than a real task syscall?

        mrs r0, PSP
        bl svc_entry
        bx lr

    1:  movs r0, #1
        msr CONTROL, r0         @ shed privilege, switch to PSP
        mov lr, #0xFFFFFFFD     @ return to Thread mode, PSP, no FP
        bx lr
        "
        :
        :
        :
        : "volatile"
    }
}

#[no_mangle]
unsafe extern "C" fn svc_entry(psp: u32) {
    with_kernel(|kernel| {
        let current = kernel.active;
        kernel.tasks[current].save.psp = psp;
        let resched = crate::syscalls::syscall_entry(kernel, current);
        if resched == Reschedule::Needed {
            cortex_m::peripheral::SCB::set_pendsv();
        }
    });
}

/// Handler linked into the vector table for the systick timer. Only
/// advances the logical tick counter (dividing down a too-fast hardware
/// period per `configure_systick`) and pends `PendSV`; never touches user
/// registers, so it needs no save/restore of its own.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let fire = {
        TICK_DIVIDER_COUNTER -= 1;
        if TICK_DIVIDER_COUNTER == 0 {
            TICK_DIVIDER_COUNTER = TICK_DIVIDER;
            true
        } else {
            false
        }
    };
    if !fire {
        return;
    }
    with_kernel(|kernel| {
        if kernel.account_tick() == Reschedule::Needed {
            cortex_m::peripheral::SCB::set_pendsv();
        }
    });
}

/// Handler linked into the vector table for the deferred context-switch
/// interrupt. See the module doc comment for why this, and not `SVCall`,
/// does the full register save/restore and the per-task `MSP` swap.
#[allow(non_snake_case)]
#[naked]
#[no_mangle]
pub unsafe extern "C" fn PendSV() {
    llvm_asm! {"
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r1]
        mrs r12, PSP
        stm r1, {r4-r11, r12}

        bl pendsv_entry         @ returns incoming task's MSP band base in r0

        mov r2, r0
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r1]
        ldm r1, {r4-r11, r12}
        msr PSP, r12

        msr MSP, r2             @ must be last: from here on we're on the
                                 @ incoming task's own kernel stack band
        bx lr
        "
        :
        :
        :
        : "volatile"
    }
}

/// The Rust side of `PendSV`, running on the outgoing task's kernel stack
/// band (the last one active before this handler fired).
#[no_mangle]
unsafe extern "C" fn pendsv_entry() -> u32 {
    with_kernel(|kernel| {
        let next = kernel.select_next();
        apply_memory_protection(&kernel.tasks[next], kernel.mpu_mode);
        CURRENT_TASK_PTR = Some(NonNull::from(&mut kernel.tasks[next]));
        kernel.tasks[next].kernel_stack.base
    })
}

/// Entry trampoline for a memory management fault: recovers `exc_return`
/// (to tell whether the fault came from the kernel or from a task) and the
/// faulting task's address, both awkward to fetch from ordinary Rust, then
/// branches to the Rust handler.
#[allow(non_snake_case)]
#[no_mangle]
#[naked]
pub unsafe extern "C" fn MemoryManagement() {
    llvm_asm! { "
        mov r0, lr
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r1]
        b mem_manage_fault
        "
        ::::"volatile"
    }
}

bitflags::bitflags! {
    /// Bits in the Memory Management Fault Status Register.
    #[repr(transparent)]
    struct Mmfsr: u8 {
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;
    }
}

#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn mem_manage_fault(exc_return: u32, task: *mut task::Task) {
    let scb = &*cortex_m::peripheral::SCB::ptr();
    let from_thread_mode = exc_return & 0b1000 != 0;
    let mmfsr = Mmfsr::from_bits_truncate(scb.cfsr.read() as u8);
    let mmfar = scb.mmfar.read();
    let address = if mmfsr.contains(Mmfsr::MMARVALID) { Some(mmfar) } else { None };

    if !from_thread_mode {
        crate::fail::die(format_args!(
            "memory management fault in kernel mode, mmfsr={:?} mmfar=0x{:08x}",
            mmfsr, mmfar
        ));
    }

    with_kernel(|kernel| {
        let idx = task_index(kernel, task);
        let is_bootstrap = idx == crate::config::BOOTSTRAP_SLOT;
        let psp = kernel.tasks[idx].save.stack_pointer();
        let fault = crate::mpu::classify(psp, &kernel.tasks[idx], is_bootstrap, address);
        // A stack over/underflow is fatal to the whole application
        // regardless of whose stack it was: the bootstrap task's stack
        // lives under the kernel the way every task's kernel stack does,
        // so there is no "single task" to end in isolation. Only a data
        // or instruction access violation with no stack-bounds cause
        // falls through to ending just the faulting task.
        let is_stack_fault = matches!(
            fault,
            abi::Fault::UserStackUnderflow { .. }
                | abi::Fault::UserStackOverflow { .. }
                | abi::Fault::MainStackUnderflow
                | abi::Fault::MainStackOverflow
        );
        if is_bootstrap || is_stack_fault {
            crate::fail::die(fault);
        } else {
            klog!("task fault: {:?}", fault);
            kernel.end_task(idx);
            cortex_m::peripheral::SCB::set_pendsv();
        }
    });
}
