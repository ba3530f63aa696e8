//! # Errors and Faults
//!
//! TickOS separates two kinds of failure:
//!
//! - [`Error`]: ordinary conditions the caller is expected to branch on.
//!   Returned through `Result`.
//! - [`Fault`]: misuse of the kernel by the calling code. Continuing would
//!   corrupt scheduler invariants, so [`fault`] logs the condition and halts.
//!
//! Nothing in the kernel unwinds across the scheduler on its own; a fault is
//! the only path that stops execution.

use core::fmt;

/// Recoverable kernel conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No task slot, wait channel, or stack budget was available to create
    /// a task or synchronization primitive. The scheduler must not be
    /// started when a required object failed to create.
    ResourceExhausted,
    /// A blocking operation's deadline elapsed before its condition held.
    /// The kernel never retries on its own.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => f.write_str("kernel resources exhausted"),
            Error::Timeout => f.write_str("operation timed out"),
        }
    }
}

/// Fatal programming errors detected by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A mutex released by a task that does not own it, released while
    /// unowned, or acquired again by its owner.
    OwnershipViolation,
    /// A blocking call made from interrupt context, or from outside any task.
    ContextViolation,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::OwnershipViolation => f.write_str("ownership violation"),
            Fault::ContextViolation => f.write_str("context violation"),
        }
    }
}

/// Report a kernel fault and stop.
///
/// On the target the panic handler (`panic-halt`) parks the core; under test
/// the panic is observable with `#[should_panic]`.
#[cold]
#[track_caller]
pub fn fault(kind: Fault) -> ! {
    log::error!("kernel fault: {}", kind);
    panic!("kernel fault: {}", kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(Error::ResourceExhausted.to_string(), "kernel resources exhausted");
        assert_eq!(Fault::ContextViolation.to_string(), "context violation");
    }

    #[test]
    #[should_panic(expected = "kernel fault: ownership violation")]
    fn test_fault_panics() {
        fault(Fault::OwnershipViolation);
    }
}
