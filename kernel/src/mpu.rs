//! MPU region layout and the pure bit-math behind programming an ARMv7-M
//! MPU region, kept separate from the `arch::arm_m` register writes so it
//! can be exercised on the host.
//!
//! Grounded on `apply_memory_protection`'s RBAR/RASR encoding and on
//! `mpu_thread_region_enable`/`mpu_kernel_region_enable`'s single-region
//! enable/disable shape; generalized here from "region 6 is always the
//! user stack, region 7 is always the kernel stack" into the eight-region
//! table described by the component list (six static regions, resolved
//! once at boot, plus two dynamic regions rebound at every context
//! switch).

use abi::RegionAttributes;
use abi::{Fault, TaskId};

use crate::task::{StackExtent, Task};

pub const NUM_STATIC_REGIONS: usize = 6;
pub const USER_STACK_REGION: u32 = 6;
pub const KERNEL_STACK_REGION: u32 = 7;

/// Addresses and sizes of the regions that never change after boot:
/// kernel code (flash), kernel data (RAM), peripherals, the TCB table
/// itself, the reserved stack window (read-only, so a task whose dynamic
/// region is momentarily disabled still faults rather than executing
/// garbage), and a null guard page at address zero.
#[derive(Copy, Clone, Debug)]
pub struct StaticLayout {
    pub flash: Extent,
    pub ram: Extent,
    pub peripherals: Extent,
    pub tcb_table: Extent,
    pub stack_window: Extent,
}

#[derive(Copy, Clone, Debug)]
pub struct Extent {
    pub base: u32,
    pub size: u32,
}

/// `(rbar, rasr)` register words for one ARMv7-M MPU region, per
/// `apply_memory_protection`'s encoding.
pub fn encode_region(region_num: u32, base: u32, size: u32, attrs: RegionAttributes) -> (u32, u32) {
    let rbar = region_num | (1 << 4) | base;

    let ap: u32 = if attrs.contains(RegionAttributes::WRITE) {
        0b011
    } else if attrs.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b001
    };
    let (tex, scb): (u32, u32) = if attrs.contains(RegionAttributes::DEVICE) {
        (0b000, 0b111)
    } else {
        (0b001, 0b111)
    };
    let xn: u32 = if attrs.contains(RegionAttributes::EXECUTE) { 0 } else { 1 };
    let l2size = 30u32.saturating_sub(size.leading_zeros());
    let enable = 1u32;

    let rasr = (xn << 28) | (ap << 24) | (tex << 19) | (scb << 16) | (l2size << 1) | enable;
    (rbar, rasr)
}

pub fn static_regions(layout: &StaticLayout) -> [(u32, u32, u32, RegionAttributes); NUM_STATIC_REGIONS] {
    use RegionAttributes as A;
    [
        (0, layout.flash.base, layout.flash.size, A::READ | A::EXECUTE),
        (1, layout.ram.base, layout.ram.size, A::READ | A::WRITE),
        (2, layout.peripherals.base, layout.peripherals.size, A::READ | A::WRITE | A::DEVICE),
        (3, layout.tcb_table.base, layout.tcb_table.size, A::READ | A::WRITE),
        (4, layout.stack_window.base, layout.stack_window.size, A::READ),
        (5, 0, 32, A::empty()),
    ]
}

/// Fault classification matching `MemFault_C_Handler`'s stack-bounds
/// checks: a faulting PSP at or above the stack's base has underflowed
/// (the stack grows down from `base`); below `limit`, it has overflowed.
/// Anything else is reported as a generic data access violation.
pub fn classify(psp: u32, faulting_task: &Task, is_bootstrap: bool, fault_address: Option<u32>) -> Fault {
    if let Some(f) = classify_against(&faulting_task.user_stack, psp, faulting_task.id, is_bootstrap) {
        return f;
    }
    Fault::DataAccessViolation { address: fault_address }
}

fn classify_against(extent: &StackExtent, psp: u32, task: TaskId, is_bootstrap: bool) -> Option<Fault> {
    if psp >= extent.base {
        return Some(if is_bootstrap {
            Fault::MainStackUnderflow
        } else {
            Fault::UserStackUnderflow { task }
        });
    }
    if psp < extent.limit {
        return Some(if is_bootstrap {
            Fault::MainStackOverflow
        } else {
            Fault::UserStackOverflow { task }
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_region_sets_rw_ap_for_writable_region() {
        let (rbar, rasr) = encode_region(1, 0x2000_0000, 0x1000, RegionAttributes::READ | RegionAttributes::WRITE);
        assert_eq!(rbar & 0xf, 1);
        assert_eq!(rbar & (1 << 4), 1 << 4);
        assert_eq!((rasr >> 24) & 0b111, 0b011);
        assert_eq!(rasr & 1, 1);
    }

    #[test]
    fn encode_region_device_uses_strongly_ordered_encoding() {
        let (_, rasr) = encode_region(2, 0x4000_0000, 0x1000, RegionAttributes::READ | RegionAttributes::WRITE | RegionAttributes::DEVICE);
        assert_eq!((rasr >> 19) & 0b111, 0b000);
    }

    fn task_with(base: u32, limit: u32) -> Task {
        let mut t = Task::defunct();
        t.user_stack = StackExtent { base, limit };
        t.id = TaskId(9);
        t
    }

    #[test]
    fn psp_at_base_is_underflow() {
        let t = task_with(0x2000_0400, 0x2000_0000);
        assert_eq!(classify(0x2000_0400, &t, false, None), Fault::UserStackUnderflow { task: TaskId(9) });
    }

    #[test]
    fn psp_below_limit_is_overflow() {
        let t = task_with(0x2000_0400, 0x2000_0000);
        assert_eq!(classify(0x1fff_fffc, &t, false, None), Fault::UserStackOverflow { task: TaskId(9) });
    }

    #[test]
    fn psp_in_bounds_is_generic_violation() {
        let t = task_with(0x2000_0400, 0x2000_0000);
        assert_eq!(classify(0x2000_0200, &t, false, Some(0x5000_0000)), Fault::DataAccessViolation { address: Some(0x5000_0000) });
    }
}
