//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: a `SavedState` type implementing `task::ArchState`, plus a
//! `configure_systick` function. The real hardware backend additionally
//! exposes `boot`, the kernel's actual entry point; the host backend has no
//! equivalent since it is driven directly by `#[test]`s instead.

cfg_if::cfg_if! {
    if #[cfg(not(target_pointer_width = "32"))] {
        compile_error!("non-32-bit targets not supported (even for simulation)");
    } else if #[cfg(target_os = "none")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod sim;
        pub use sim::*;
    }
}
