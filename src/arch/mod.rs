//! # Architecture Abstraction Layer
//!
//! The seam between the portable kernel and the CPU it runs on. The kernel
//! decides *which* task runs; a [`Port`] knows *how* to set up a task's
//! execution context and how to get from one task to another.
//!
//! - [`cortex_m4`]: PendSV/SysTick port for ARMv7E-M targets
//! - [`host`]: std-thread simulation used by the test suite
//!
//! Further architectures plug in as sibling modules.

use crate::error::Error;
use crate::task::TaskId;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(any(test, feature = "std"))]
pub mod host;

/// CPU-specific context handling used by the kernel.
pub trait Port: Sync {
    /// Prepare the execution context of a new task and return its initial
    /// saved stack pointer (null on ports that switch contexts without
    /// their own stacks).
    ///
    /// Called inside a critical section, once per task id.
    fn init_context(&self, task: TaskId, stack_size: usize) -> Result<*mut u32, Error>;

    /// Ask for a context switch.
    ///
    /// From task context the call returns once the calling task has been
    /// selected again. From interrupt context it only pends the switch,
    /// which happens after the handler returns. `dispatch` performs the
    /// scheduling decision on ports that switch synchronously.
    fn request_switch(&self, dispatch: &dyn Fn() -> Option<TaskId>);

    /// Whether the caller runs in interrupt context.
    fn in_interrupt(&self) -> bool;
}
