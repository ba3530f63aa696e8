//! # Blocking Queue
//!
//! Fixed-capacity FIFO for handing values from producer tasks (or interrupt
//! handlers) to consumer tasks. Storage is a `heapless::Deque` behind a
//! critical section; two FIFO-ordered wait channels hold the blocked
//! senders and receivers.
//!
//! ```text
//!   send ──► [ 1 | 2 | 3 ] ──► receive
//!     │        capacity N        │
//!     └─ blocks while full       └─ blocks while empty
//! ```
//!
//! Items come out in the order they went in and the queue never holds more
//! than `N` items.

use heapless::Deque;

use crate::arch::Port;
use crate::error::Error;
use crate::kernel::{Attempt, Kernel};
use crate::scheduler::{WaitChannel, WakeOrder};
use crate::sync::{self, Shared};
use crate::time::Timeout;

pub struct Queue<T, const N: usize> {
    items: Shared<Deque<T, N>>,
    not_full: WaitChannel,
    not_empty: WaitChannel,
}

impl<T, const N: usize> Queue<T, N> {
    /// Create an empty queue.
    ///
    /// # Returns
    /// - `Err(Error::ResourceExhausted)`: fewer than two wait channels left.
    pub fn new<P: Port>(kernel: &Kernel<P>) -> Result<Self, Error> {
        const { assert!(N > 0, "queue capacity must be at least 1") };

        let (not_full, not_empty) = kernel.with_scheduler(|sched| {
            if sched.channels_left() < 2 {
                return Err(Error::ResourceExhausted);
            }
            Ok((
                sched.open_channel(WakeOrder::Fifo)?,
                sched.open_channel(WakeOrder::Fifo)?,
            ))
        })?;

        Ok(Self {
            items: sync::shared(Deque::new()),
            not_full,
            not_empty,
        })
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Wakes the longest-waiting receiver. If `timeout` elapses first the
    /// item is dropped and `Error::Timeout` is returned.
    ///
    /// Task context only.
    pub fn send<P: Port>(&self, kernel: &Kernel<P>, item: T, timeout: Timeout) -> Result<(), Error> {
        let mut pending = Some(item);
        kernel.block_on(timeout, |cs, sched, _| {
            let Some(item) = pending.take() else {
                return Attempt::Done(());
            };
            match self.items.borrow_ref_mut(cs).push_back(item) {
                Ok(()) => {
                    kernel.notify(sched, self.not_empty);
                    Attempt::Done(())
                }
                Err(item) => {
                    pending = Some(item);
                    Attempt::Wait(self.not_full)
                }
            }
        })
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Wakes the longest-waiting sender. Task context only.
    pub fn receive<P: Port>(&self, kernel: &Kernel<P>, timeout: Timeout) -> Result<T, Error> {
        kernel.block_on(timeout, |cs, sched, _| {
            match self.items.borrow_ref_mut(cs).pop_front() {
                Some(item) => {
                    kernel.notify(sched, self.not_full);
                    Attempt::Done(item)
                }
                None => Attempt::Wait(self.not_empty),
            }
        })
    }

    /// Append `item` without blocking; hands it back if the queue is full.
    ///
    /// Safe to call from interrupt context.
    pub fn try_send<P: Port>(&self, kernel: &Kernel<P>, item: T) -> Result<(), T> {
        kernel.critical(|cs, sched| {
            self.items.borrow_ref_mut(cs).push_back(item)?;
            kernel.notify(sched, self.not_empty);
            Ok(())
        })?;
        kernel.reschedule();
        Ok(())
    }

    /// Remove the oldest item without blocking.
    ///
    /// Safe to call from interrupt context.
    pub fn try_receive<P: Port>(&self, kernel: &Kernel<P>) -> Option<T> {
        let item = kernel.critical(|cs, sched| {
            let item = self.items.borrow_ref_mut(cs).pop_front()?;
            kernel.notify(sched, self.not_full);
            Some(item)
        })?;
        kernel.reschedule();
        Some(item)
    }

    pub fn len(&self) -> usize {
        sync::critical_section(|cs| self.items.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        sync::critical_section(|cs| self.items.borrow_ref(cs).is_empty())
    }

    pub fn is_full(&self) -> bool {
        sync::critical_section(|cs| self.items.borrow_ref(cs).is_full())
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}
