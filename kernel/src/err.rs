//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`. Recoverable kernel errors (§7's "parameter
//! errors at setup" and "runtime misuse inside locking") become `abi::Kind`;
//! unrecoverable ones (§7's "stack faults" and "non-memory faults") become
//! `abi::Fault` and are handled by ending or terminating a task rather than
//! by returning a value across the SVC boundary.

use abi::{Fault, Kind};

#[derive(Copy, Clone, Debug)]
pub enum KernelError {
    /// A recoverable condition, reported to the caller as a negative code.
    Recoverable(Kind),
    /// An unrecoverable condition; the faulting task (or the whole
    /// application, for bootstrap-task faults) must be terminated.
    Unrecoverable(Fault),
}

impl From<Kind> for KernelError {
    fn from(k: Kind) -> Self {
        Self::Recoverable(k)
    }
}

impl From<Fault> for KernelError {
    fn from(f: Fault) -> Self {
        Self::Unrecoverable(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_converts_into_kernel_error() {
        let e: KernelError = Kind::Duplicate.into();
        match e {
            KernelError::Recoverable(Kind::Duplicate) => {}
            _ => panic!("wrong variant"),
        }
    }
}
