//! # Critical Sections
//!
//! Interrupt-safe access to shared kernel state. All scheduler and
//! primitive state lives behind a [`Shared`] cell and is only touched
//! inside a critical section, so task code and interrupt handlers never
//! observe a half-updated structure.
//!
//! On the target the `critical-section` implementation comes from
//! `cortex-m` (interrupts masked with `cpsid i`); on the host it is the
//! `std` implementation, a global reentrant lock.

use core::cell::RefCell;

pub use critical_section::CriticalSection;

/// State shared between tasks and interrupt handlers.
pub type Shared<T> = critical_section::Mutex<RefCell<T>>;

/// Wrap `value` for shared access.
#[inline]
pub const fn shared<T>(value: T) -> Shared<T> {
    critical_section::Mutex::new(RefCell::new(value))
}

/// Execute a closure within a critical section.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let mut sched = kernel.scheduler.borrow_ref_mut(cs);
///     sched.tick();
/// });
/// ```
///
/// # Performance
/// Keep critical sections as short as possible to minimize interrupt
/// latency. Nothing inside one may block.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
