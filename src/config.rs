//! # TickOS Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All limits are fixed at compile time; there is no dynamic allocation.

use crate::task::Priority;

/// Maximum number of tasks the system can manage simultaneously,
/// including the idle task registered by the hardware port.
/// Each task consumes `STACK_SIZE` bytes of RAM on the target.
pub const MAX_TASKS: usize = 8;

/// Number of wait channels available to synchronization primitives.
/// A queue uses two, a mutex or semaphore one. Creating a primitive when
/// the channels are used up fails with `Error::ResourceExhausted`.
pub const MAX_WAIT_CHANNELS: usize = 16;

/// SysTick frequency in Hz. One tick is the unit of every delay and timeout.
pub const TICK_HZ: u32 = 1000;

/// Default time slice in ticks. A task runs for this many ticks before
/// an equal-priority ready task gets its turn.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Per-task stack size in bytes. Must be large enough for the
/// deepest call chain plus the hardware exception frame (32 bytes)
/// and the software-saved context (32 bytes for R4–R11).
pub const STACK_SIZE: usize = 1024;

/// Smallest stack budget a task may request: both saved frames plus margin.
pub const MIN_STACK_SIZE: usize = 128;

/// Stack budget of the idle task.
pub const IDLE_STACK_SIZE: usize = 256;

/// Priority of the idle task. Application tasks at this level share the
/// CPU with it round-robin.
pub const IDLE_PRIORITY: Priority = 0;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Convert milliseconds to scheduler ticks, rounding down.
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ((ms as u64 * TICK_HZ as u64) / 1000) as u32
}

// Deferred wake requests are kept as one bit per channel.
const _: () = assert!(MAX_WAIT_CHANNELS <= 32);
const _: () = assert!(IDLE_STACK_SIZE >= MIN_STACK_SIZE && IDLE_STACK_SIZE <= STACK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(250), 250 * TICK_HZ / 1000);
        assert_eq!(ms_to_ticks(1000), TICK_HZ);
    }
}
