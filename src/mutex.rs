//! # Mutex
//!
//! Single-owner lock for task code. [`RawMutex`] implements the ownership
//! protocol; [`Mutex`] wraps a value and hands out an RAII [`MutexGuard`].
//!
//! ## Protocol
//!
//! - Waiters queue on a priority-ordered wait channel (ties by arrival).
//! - `release` hands ownership directly to the best waiter, so a released
//!   mutex can never be grabbed by a task that did not wait for it.
//! - While a more urgent task waits, the owner runs at that task's priority
//!   (priority inheritance) and drops back to its base priority on release.
//!   A boost stays in place until release even if the waiter gives up.
//! - Acquiring a mutex the caller already owns, and releasing one it does
//!   not own, are [`Fault::OwnershipViolation`] faults.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::arch::Port;
use crate::error::{fault, Error, Fault};
use crate::kernel::{Attempt, Kernel};
use crate::scheduler::{WaitChannel, WakeOrder};
use crate::sync::{self, Shared};
use crate::task::TaskId;
use crate::time::Timeout;

// ---------------------------------------------------------------------------
// Raw mutex
// ---------------------------------------------------------------------------

pub struct RawMutex {
    owner: Shared<Option<TaskId>>,
    channel: WaitChannel,
}

impl RawMutex {
    /// # Returns
    /// - `Err(Error::ResourceExhausted)`: no wait channel left.
    pub fn new<P: Port>(kernel: &Kernel<P>) -> Result<Self, Error> {
        Ok(Self {
            owner: sync::shared(None),
            channel: kernel.open_channel(WakeOrder::Priority)?,
        })
    }

    /// Take ownership, blocking while another task holds the mutex.
    ///
    /// Task context only.
    pub fn acquire<P: Port>(&self, kernel: &Kernel<P>, timeout: Timeout) -> Result<(), Error> {
        let mut woken = false;
        kernel.block_on(timeout, |cs, sched, me| {
            let retry = core::mem::replace(&mut woken, true);
            let mut owner = self.owner.borrow_ref_mut(cs);
            match *owner {
                None => {
                    *owner = Some(me);
                    Attempt::Done(())
                }
                // Handed over by `release` while we were blocked.
                Some(holder) if holder == me && retry => Attempt::Done(()),
                Some(holder) if holder == me => fault(Fault::OwnershipViolation),
                Some(holder) => {
                    if timeout != Timeout::Immediate {
                        sched.inherit_priority(holder, sched.priority_of(me));
                    }
                    Attempt::Wait(self.channel)
                }
            }
        })
    }

    /// Take ownership if the mutex is free. Task context only.
    pub fn try_acquire<P: Port>(&self, kernel: &Kernel<P>) -> bool {
        self.acquire(kernel, Timeout::Immediate).is_ok()
    }

    /// Give up ownership and hand it to the most urgent waiter, if any.
    ///
    /// Faults unless the calling task is the owner.
    pub fn release<P: Port>(&self, kernel: &Kernel<P>) {
        let me = kernel.task_context();
        kernel.critical(|cs, sched| {
            let mut owner = self.owner.borrow_ref_mut(cs);
            if *owner != Some(me) {
                fault(Fault::OwnershipViolation);
            }
            sched.restore_priority(me);

            let next = sched.wake_one(self.channel);
            if let (Some(next), Some(priority)) = (next, sched.top_waiter_priority(self.channel)) {
                sched.inherit_priority(next, priority);
            }
            *owner = next;
            log::trace!("mutex released by task {}, now owned by {:?}", me, next);
        });
        kernel.reschedule();
    }

    /// The task currently holding the mutex.
    pub fn owner(&self) -> Option<TaskId> {
        sync::critical_section(|cs| *self.owner.borrow_ref(cs))
    }
}

// ---------------------------------------------------------------------------
// Data-carrying mutex
// ---------------------------------------------------------------------------

/// A [`RawMutex`] protecting a value of type `T`.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reachable through a `MutexGuard`, and at most one
// guard exists at a time.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new<P: Port>(kernel: &Kernel<P>, value: T) -> Result<Self, Error> {
        Ok(Self {
            raw: RawMutex::new(kernel)?,
            data: UnsafeCell::new(value),
        })
    }

    /// Acquire the mutex; the guard releases it when dropped.
    pub fn lock<'a, P: Port>(
        &'a self,
        kernel: &'a Kernel<P>,
        timeout: Timeout,
    ) -> Result<MutexGuard<'a, T, P>, Error> {
        self.raw.acquire(kernel, timeout)?;
        Ok(MutexGuard {
            mutex: self,
            kernel,
            _not_send: PhantomData,
        })
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Proof of ownership of a [`Mutex`]. Must be dropped by the task that
/// locked it.
pub struct MutexGuard<'a, T, P: Port> {
    mutex: &'a Mutex<T>,
    kernel: &'a Kernel<P>,
    _not_send: PhantomData<*const ()>,
}

impl<T, P: Port> Deref for MutexGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, P: Port> DerefMut for MutexGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, P: Port> Drop for MutexGuard<'_, T, P> {
    fn drop(&mut self) {
        self.mutex.raw.release(self.kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{leak, leak_task, HostPort};
    use crate::task::TaskConfig;
    use crate::time::Tick;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Two tasks increment a shared counter five times each, sleeping while
    /// holding the lock to force contention.
    #[test]
    fn test_shared_counter_increments() {
        let kernel = HostPort::kernel();
        let counter = leak(Mutex::new(kernel, 0u32).unwrap());
        let holders = leak(AtomicU32::new(0));
        let max_holders = leak(AtomicU32::new(0));
        let total = leak(AtomicU32::new(0));

        for _ in 0..2 {
            kernel
                .create_task(
                    TaskConfig::new(2),
                    leak_task(move || {
                        for _ in 0..5 {
                            let mut count = counter.lock(kernel, Timeout::Forever).unwrap();
                            let inside = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            max_holders.fetch_max(inside, Ordering::SeqCst);

                            let seen = *count;
                            kernel.sleep_for(1);
                            *count = seen + 1;

                            holders.fetch_sub(1, Ordering::SeqCst);
                        }
                    }),
                )
                .unwrap();
        }

        // Reads the result once both workers are done.
        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    kernel.sleep_for(50);
                    total.store(*counter.lock(kernel, Timeout::Forever).unwrap(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        kernel.run(60, |_| true).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 10);
        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(counter.raw().owner(), None);
    }

    /// A low-priority owner blocking a high-priority waiter runs ahead of a
    /// medium-priority task until it releases.
    #[test]
    fn test_owner_inherits_waiter_priority() {
        let kernel = HostPort::kernel();
        let lock = leak(RawMutex::new(kernel).unwrap());
        let trace = leak(StdMutex::new(Vec::new()));
        let boosted = leak(AtomicU32::new(0));

        let low = kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    kernel.sleep_for(5);
                    trace.lock().unwrap().push('L');
                    let me = kernel.current_task().unwrap();
                    boosted.store(kernel.task_priority(me).unwrap() as u32, Ordering::SeqCst);
                    lock.release(kernel);
                }),
            )
            .unwrap();

        kernel
            .create_task(
                TaskConfig::new(3),
                leak_task(move || {
                    kernel.sleep_for(1);
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    trace.lock().unwrap().push('H');
                    lock.release(kernel);
                }),
            )
            .unwrap();

        kernel
            .create_task(
                TaskConfig::new(2),
                leak_task(move || {
                    kernel.sleep_for(5);
                    trace.lock().unwrap().push('M');
                }),
            )
            .unwrap();

        kernel.run(20, |_| true).unwrap();
        assert_eq!(*trace.lock().unwrap(), ['L', 'H', 'M']);
        assert_eq!(boosted.load(Ordering::SeqCst), 3);
        assert_eq!(kernel.task_priority(low), Some(1));
    }

    #[test]
    fn test_release_hands_over_to_highest_priority_waiter() {
        let kernel = HostPort::kernel();
        let lock = leak(RawMutex::new(kernel).unwrap());
        let order = leak(StdMutex::new(Vec::new()));

        kernel
            .create_task(
                TaskConfig::new(4),
                leak_task(move || {
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    // Both waiters queue up meanwhile
                    kernel.sleep_for(3);
                    lock.release(kernel);
                }),
            )
            .unwrap();

        for (name, priority, delay) in [('a', 1, 1), ('b', 2, 2)] {
            kernel
                .create_task(
                    TaskConfig::new(priority),
                    leak_task(move || {
                        kernel.sleep_for(delay);
                        lock.acquire(kernel, Timeout::Forever).unwrap();
                        order.lock().unwrap().push(name);
                        lock.release(kernel);
                    }),
                )
                .unwrap();
        }

        kernel.run(10, |_| true).unwrap();
        assert_eq!(*order.lock().unwrap(), ['b', 'a']);
    }

    #[test]
    fn test_acquire_times_out() {
        let kernel = HostPort::kernel();
        let lock = leak(RawMutex::new(kernel).unwrap());
        let outcome = leak(StdMutex::new(None));

        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    kernel.sleep_for(20);
                    lock.release(kernel);
                }),
            )
            .unwrap();

        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    let start = kernel.now();
                    let attempt = lock.acquire(kernel, Timeout::Ticks(3));
                    let immediate = lock.try_acquire(kernel);
                    *outcome.lock().unwrap() = Some((attempt, kernel.now().since(start), immediate));
                }),
            )
            .unwrap();

        kernel.run(30, |_| true).unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some((Err(Error::Timeout), 3, false)));
        assert_eq!(kernel.now(), Tick::new(30));
        assert_eq!(lock.owner(), None);
    }

    #[test]
    #[should_panic(expected = "kernel fault: ownership violation")]
    fn test_recursive_acquire_faults() {
        let kernel = HostPort::kernel();
        let lock = leak(RawMutex::new(kernel).unwrap());
        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    let _ = lock.acquire(kernel, Timeout::Forever);
                }),
            )
            .unwrap();
        let _ = kernel.run(5, |_| true);
    }

    #[test]
    #[should_panic(expected = "kernel fault: ownership violation")]
    fn test_release_by_non_owner_faults() {
        let kernel = HostPort::kernel();
        let lock = leak(RawMutex::new(kernel).unwrap());
        kernel
            .create_task(
                TaskConfig::new(2),
                leak_task(move || {
                    lock.acquire(kernel, Timeout::Forever).unwrap();
                    kernel.sleep_for(10);
                }),
            )
            .unwrap();
        kernel
            .create_task(TaskConfig::new(1), leak_task(move || lock.release(kernel)))
            .unwrap();
        let _ = kernel.run(5, |_| true);
    }

    #[test]
    #[should_panic(expected = "kernel fault: context violation")]
    fn test_release_from_interrupt_faults() {
        let kernel = HostPort::kernel();
        let lock = RawMutex::new(kernel).unwrap();
        kernel.port().interrupt(|| lock.release(kernel));
    }
}
