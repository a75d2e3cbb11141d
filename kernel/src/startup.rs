//! Kernel startup.
//!
//! There is no ROM-resident application descriptor to parse here (see
//! `config`): the only things startup needs are the extents of the
//! sections the linker script lays out, and the two reserved stack
//! windows the application's `memory.x` carves out for user and kernel
//! stacks. Everything else -- what tasks exist, how big their stacks are,
//! how many locks are needed -- is established at runtime by the
//! bootstrap task through ordinary syscalls.

use crate::mpu::{Extent, StaticLayout};
use crate::sched::Kernel;
use crate::task::StackExtent;

extern "C" {
    static __flash_start: u8;
    static __flash_end: u8;
    static __ram_start: u8;
    static __ram_end: u8;
    static __peripherals_start: u8;
    static __peripherals_end: u8;
    static __tcb_table_start: u8;
    static __tcb_table_end: u8;
    /// Base of the combined stack window: `STACK_WINDOW_BYTES` of
    /// unprivileged task stacks immediately followed by `STACK_WINDOW_BYTES`
    /// of privileged ones. The split is an address-space convention, not
    /// anything the linker script needs to know about beyond reserving the
    /// span.
    static __stack_window_start: u8;
    static __heap_start: u8;
    static __heap_end: u8;
}

fn extent_of(start: &u8, end: &u8) -> Extent {
    let base = start as *const u8 as u32;
    let end = end as *const u8 as u32;
    Extent { base, size: (end - base).next_power_of_two() }
}

/// Process-wide kernel state. A single static rather than something
/// allocated at boot, since this kernel never runs more than one
/// application image and the TCB table's size is already fixed at compile
/// time either way.
static mut KERNEL: Kernel = Kernel::new(0, 0);

/// Entry point for the whole kernel, called from the reset handler of
/// whatever binary links this crate in. Never returns: control passes to
/// the bootstrap task and, from then on, only back into the kernel through
/// `SVCall`, `SysTick`, `PendSV`, or a fault handler.
///
/// # Safety
///
/// Must be called exactly once, before interrupts are unmasked, with the
/// linker symbols above actually describing this image's memory layout.
pub unsafe fn boot() -> ! {
    let window_bytes = crate::config::STACK_WINDOW_BYTES as u32;
    let window_base = &__stack_window_start as *const u8 as u32;

    let user_window =
        StackExtent { base: window_base + window_bytes, limit: window_base };
    let kernel_window = StackExtent {
        base: window_base + 2 * window_bytes,
        limit: window_base + window_bytes,
    };

    let layout = StaticLayout {
        flash: extent_of(&__flash_start, &__flash_end),
        ram: extent_of(&__ram_start, &__ram_end),
        peripherals: extent_of(&__peripherals_start, &__peripherals_end),
        tcb_table: extent_of(&__tcb_table_start, &__tcb_table_end),
        stack_window: Extent { base: window_base, size: 2 * window_bytes },
    };

    let heap_base = &__heap_start as *const u8 as u32;
    let heap_limit = &__heap_end as *const u8 as u32;
    KERNEL = Kernel::new(heap_base, heap_limit);
    KERNEL.user_stack_window = user_window;
    KERNEL.kernel_stack_window = kernel_window;

    crate::arch::boot(&mut KERNEL, &layout, user_window, kernel_window)
}
