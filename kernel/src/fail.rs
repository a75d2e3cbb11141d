//! Support for recording kernel crashes such that they can be found by
//! tooling, distinct from the `rtt` trace channel used for task I/O.
//!
//! This module defines a small binary interface for debuggers:
//!
//! - `fail::KERNEL_HAS_FAILED` is a `bool`, cleared before kernel entry and
//!   set the moment the kernel reaches `die` (explicitly, or via a
//!   `panic!`). Any other value means the kernel hasn't booted yet, or
//!   corrupted memory on the way down.
//! - `fail::KERNEL_EPITAPH` holds up to `EPITAPH_LEN` bytes of UTF-8
//!   description of the failure, NUL-padded; there's no separate length
//!   field, so a reader trims trailing NULs.

use core::fmt::{Debug, Write};
use core::sync::atomic::Ordering;

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` into the epitaph buffer and halts. Called from the fault
/// handler for any `abi::Fault` that ends the whole application (a
/// bootstrap-task stack fault) rather than just the one task that caused
/// it.
#[inline(always)]
pub fn die(msg: impl Debug) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Debug) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg:?}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
