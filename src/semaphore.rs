//! # Binary Semaphore
//!
//! A one-bit signal for handing work from an interrupt handler to a task.
//!
//! Giving sets the flag; taking consumes it or blocks until it is set.
//! Gives that arrive while the flag is already set collapse into one, so a
//! burst of interrupts before the waiting task runs is seen as a single
//! event.
//!
//! [`Semaphore::give_from_interrupt`] never touches the ready list itself:
//! it records a deferred wake for the semaphore's channel and pends a
//! context switch. The wake is performed by the next dispatch (right after
//! the handler returns) or the next tick.

use crate::arch::Port;
use crate::error::Error;
use crate::kernel::{Attempt, Kernel};
use crate::scheduler::{WaitChannel, WakeOrder};
use crate::sync::{self, Shared};
use crate::time::Timeout;

pub struct Semaphore {
    signaled: Shared<bool>,
    channel: WaitChannel,
}

impl Semaphore {
    /// Create an unsignaled semaphore.
    ///
    /// # Returns
    /// - `Err(Error::ResourceExhausted)`: no wait channel left.
    pub fn new<P: Port>(kernel: &Kernel<P>) -> Result<Self, Error> {
        Ok(Self {
            signaled: sync::shared(false),
            channel: kernel.open_channel(WakeOrder::Priority)?,
        })
    }

    /// Signal from an interrupt handler. Never blocks.
    pub fn give_from_interrupt<P: Port>(&self, kernel: &Kernel<P>) {
        kernel.critical(|cs, sched| {
            *self.signaled.borrow_ref_mut(cs) = true;
            sched.defer_wake(self.channel);
        });
        kernel.port().request_switch(&|| kernel.dispatch());
    }

    /// Signal from task context, waking the most urgent waiter right away.
    pub fn give<P: Port>(&self, kernel: &Kernel<P>) {
        kernel.critical(|cs, sched| {
            *self.signaled.borrow_ref_mut(cs) = true;
            kernel.notify(sched, self.channel);
        });
        kernel.reschedule();
    }

    /// Consume the signal, blocking until one is given.
    ///
    /// Task context only.
    pub fn take<P: Port>(&self, kernel: &Kernel<P>, timeout: Timeout) -> Result<(), Error> {
        kernel.block_on(timeout, |cs, _, _| {
            if self.signaled.replace(cs, false) {
                Attempt::Done(())
            } else {
                Attempt::Wait(self.channel)
            }
        })
    }

    pub fn is_signaled(&self) -> bool {
        sync::critical_section(|cs| *self.signaled.borrow_ref(cs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{leak, leak_task, HostPort};
    use crate::task::{TaskConfig, TaskState};
    use crate::time::Tick;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Two interrupts before the waiter runs are one signal.
    #[test]
    fn test_interrupt_gives_coalesce() {
        let kernel = HostPort::kernel();
        let button = leak(Semaphore::new(kernel).unwrap());
        let taken = leak(AtomicU32::new(0));
        let second = leak(StdMutex::new(None));

        kernel
            .create_task(
                TaskConfig::new(2),
                leak_task(move || {
                    button.take(kernel, Timeout::Forever).unwrap();
                    taken.fetch_add(1, Ordering::SeqCst);
                    *second.lock().unwrap() = Some(button.take(kernel, Timeout::Immediate));
                }),
            )
            .unwrap();

        kernel
            .run(10, |k| {
                if k.now() == Tick::new(3) {
                    button.give_from_interrupt(k);
                    button.give_from_interrupt(k);
                    assert!(button.is_signaled());
                }
                true
            })
            .unwrap();

        assert_eq!(taken.load(Ordering::SeqCst), 1);
        assert_eq!(*second.lock().unwrap(), Some(Err(Error::Timeout)));
        assert!(!button.is_signaled());
    }

    #[test]
    fn test_signal_waits_for_taker() {
        let kernel = HostPort::kernel();
        let sem = Semaphore::new(kernel).unwrap();

        kernel.port().interrupt(|| sem.give_from_interrupt(kernel));
        kernel.port().interrupt(|| sem.give_from_interrupt(kernel));
        assert!(sem.is_signaled());

        // Drained deferred wake finds no waiter; the flag stays set
        assert_eq!(kernel.dispatch(), None);
        assert!(sem.is_signaled());
    }

    #[test]
    fn test_take_times_out() {
        let kernel = HostPort::kernel();
        let sem = leak(Semaphore::new(kernel).unwrap());
        let outcome = leak(StdMutex::new(None));

        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    let start = kernel.now();
                    let result = sem.take(kernel, Timeout::Ticks(6));
                    *outcome.lock().unwrap() = Some((result, kernel.now().since(start)));
                }),
            )
            .unwrap();

        kernel.run(12, |_| true).unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some((Err(Error::Timeout), 6)));
    }

    #[test]
    fn test_give_switches_to_more_urgent_waiter() {
        let kernel = HostPort::kernel();
        let sem = leak(Semaphore::new(kernel).unwrap());
        let trace = leak(StdMutex::new(Vec::new()));

        kernel
            .create_task(
                TaskConfig::new(3),
                leak_task(move || {
                    sem.take(kernel, Timeout::Forever).unwrap();
                    trace.lock().unwrap().push('h');
                }),
            )
            .unwrap();

        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    trace.lock().unwrap().push('g');
                    sem.give(kernel);
                    trace.lock().unwrap().push('l');
                }),
            )
            .unwrap();

        kernel.run(3, |_| true).unwrap();
        assert_eq!(*trace.lock().unwrap(), ['g', 'h', 'l']);
    }

    #[test]
    fn test_give_wakes_highest_priority_waiter_once() {
        let kernel = HostPort::kernel();
        let sem = leak(Semaphore::new(kernel).unwrap());
        let woken = leak(StdMutex::new(Vec::new()));

        let mut ids = Vec::new();
        for (name, priority) in [('l', 1), ('h', 3), ('m', 2)] {
            let id = kernel
                .create_task(
                    TaskConfig::new(priority),
                    leak_task(move || {
                        sem.take(kernel, Timeout::Forever).unwrap();
                        woken.lock().unwrap().push((name, kernel.now().raw()));
                    }),
                )
                .unwrap();
            ids.push(id);
        }

        kernel
            .run(8, |k| {
                if k.now() == Tick::new(2) || k.now() == Tick::new(5) {
                    sem.give_from_interrupt(k);
                }
                true
            })
            .unwrap();

        assert_eq!(*woken.lock().unwrap(), [('h', 2), ('m', 5)]);
        assert_eq!(kernel.task_state(ids[0]), Some(TaskState::Blocked));
        assert!(!sem.is_signaled());
    }

    #[test]
    #[should_panic(expected = "kernel fault: context violation")]
    fn test_take_from_interrupt_faults() {
        let kernel = HostPort::kernel();
        let sem = Semaphore::new(kernel).unwrap();
        let _ = kernel.port().interrupt(|| sem.take(kernel, Timeout::Immediate));
    }
}
