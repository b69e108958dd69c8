//! # Error Types
//!
//! Every fallible kernel call returns [`Result`]. Recoverable conditions are
//! reported through [`Error`]; conditions that leave the kernel unable to
//! continue are [`Fault`]s and go through `fault::system_fault`.

use core::fmt;

/// Recoverable error returned by kernel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// An argument is outside its documented range.
    InvalidArg,
    /// The handle does not refer to a live object.
    InvalidHandle,
    /// The timeout expired before the operation could complete.
    Timeout,
    /// A fixed table or the kernel heap is exhausted.
    NoMemory,
    /// The operation would have to wait and the caller asked not to.
    WouldBlock,
    /// The operation is not allowed from this context or in this state.
    NotPermitted,
    /// An unrecoverable condition was detected and reported.
    Fault,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArg => "invalid argument",
            Error::InvalidHandle => "invalid handle",
            Error::Timeout => "timed out",
            Error::NoMemory => "out of memory",
            Error::WouldBlock => "operation would block",
            Error::NotPermitted => "operation not permitted",
            Error::Fault => "kernel fault",
        };
        f.write_str(msg)
    }
}

/// System-fatal conditions. Reporting one halts the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The kernel gate could not be taken within `KERNEL_GATE_TIMEOUT`.
    KernelDeadlock,
    /// Shared kernel state was borrowed re-entrantly or found inconsistent.
    TableCorruption,
    /// The context switch found nothing to run.
    SwitchInconsistency,
    /// A heap block was freed twice.
    DoubleFree,
    /// A thread fault was raised with no fault hook installed.
    UnhandledThreadFault,
    /// `exit` was called from an interrupt handler.
    ExitFromInterrupt,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Fault::KernelDeadlock => "kernel gate deadlock",
            Fault::TableCorruption => "kernel table corruption",
            Fault::SwitchInconsistency => "no runnable thread at context switch",
            Fault::DoubleFree => "heap double free",
            Fault::UnhandledThreadFault => "thread fault with no hook installed",
            Fault::ExitFromInterrupt => "thread exit from interrupt context",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::WouldBlock), "operation would block");
        assert_eq!(format!("{}", Fault::KernelDeadlock), "kernel gate deadlock");
    }
}
