//! # Host Simulation Port
//!
//! Runs TickOS tasks on a development machine. Each task gets a std thread,
//! but only one of them executes at any time: a *baton* names the task that
//! may run, and every context switch hands the baton to the task picked by
//! the scheduler. When no task is ready the baton returns to the driver
//! ([`Kernel::run`]), which advances the tick counter by one and calls a
//! user hook in simulated interrupt context.
//!
//! ```text
//!   driver ──dispatch──► task A ──block──► task B ──block──► driver
//!     ▲                                                        │
//!     └──────────────── tick + on_tick (interrupt) ────────────┘
//! ```
//!
//! Time is virtual: task code runs in zero ticks and time only advances
//! while every task is blocked. A host task must therefore block (delay,
//! wait, or finish) on every iteration, and the port switches tasks only
//! at kernel calls.

use core::any::Any;
use core::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::arch::Port;
use crate::error::Error;
use crate::kernel::Kernel;
use crate::task::{Runnable, TaskId};
use crate::time::Tick;

thread_local! {
    /// Task id of the calling thread; `None` on the driver thread.
    static CURRENT: Cell<Option<TaskId>> = const { Cell::new(None) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

struct Baton {
    /// Task allowed to run; `None` hands control to the driver.
    running: Option<TaskId>,
    /// Panic payload of a task body, re-raised on the driver thread.
    panic: Option<Box<dyn Any + Send>>,
}

/// std-thread port with one logical CPU.
pub struct HostPort {
    baton: Mutex<Baton>,
    turn: Condvar,
}

impl HostPort {
    pub const fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                running: None,
                panic: None,
            }),
            turn: Condvar::new(),
        }
    }

    /// A fresh kernel with a host port, leaked for the `'static` lifetime
    /// tasks and primitives need.
    pub fn kernel() -> &'static Kernel<HostPort> {
        leak(Kernel::new(HostPort::new()))
    }

    /// Run `f` as if it were an interrupt handler.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Exit(bool);
        impl Drop for Exit {
            fn drop(&mut self) {
                IN_INTERRUPT.set(self.0);
            }
        }

        let _exit = Exit(IN_INTERRUPT.replace(true));
        f()
    }

    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hand_off(&self, next: Option<TaskId>) {
        self.lock().running = next;
        self.turn.notify_all();
    }

    fn wait_turn(&self, me: TaskId) {
        let mut baton = self.lock();
        while baton.running != Some(me) {
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait until the baton is back with the driver. Re-raises a task panic.
    fn wait_idle(&self) {
        let mut baton = self.lock();
        while baton.running.is_some() && baton.panic.is_none() {
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(payload) = baton.panic.take() {
            drop(baton);
            panic::resume_unwind(payload);
        }
    }

    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        let mut baton = self.lock();
        if baton.panic.is_none() {
            baton.panic = Some(payload);
        }
        baton.running = None;
        drop(baton);
        self.turn.notify_all();
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    fn init_context(&self, _task: TaskId, _stack_size: usize) -> Result<*mut u32, Error> {
        // Threads are spawned by `Kernel::run`; there is no stack to prepare.
        Ok(core::ptr::null_mut())
    }

    fn request_switch(&self, dispatch: &dyn Fn() -> Option<TaskId>) {
        if IN_INTERRUPT.get() {
            // The driver dispatches once the handler returns.
            return;
        }
        let Some(me) = CURRENT.get() else {
            return;
        };

        let next = dispatch();
        if next == Some(me) {
            return;
        }
        self.hand_off(next);
        self.wait_turn(me);
    }

    fn in_interrupt(&self) -> bool {
        IN_INTERRUPT.get()
    }
}

impl Kernel<HostPort> {
    /// Run the registered tasks for up to `max_ticks` ticks.
    ///
    /// Spawns one thread per task registered so far, then alternates
    /// between running tasks until all are blocked and advancing time by
    /// one tick. After each tick `on_tick` runs in interrupt context; it
    /// may give semaphores or use the non-blocking queue operations, and
    /// stops the simulation by returning `false`.
    ///
    /// Call once per kernel. A panic in a task body is re-raised here.
    ///
    /// # Returns
    /// The tick counter when the simulation stopped.
    pub fn run(
        &'static self,
        max_ticks: u32,
        mut on_tick: impl FnMut(&'static Self) -> bool,
    ) -> io::Result<Tick> {
        let tasks: Vec<(TaskId, &'static dyn Runnable)> = self.with_scheduler(|sched| {
            sched.tasks[..sched.task_count]
                .iter()
                .filter_map(|tcb| tcb.body.map(|body| (tcb.id, body)))
                .collect()
        });

        for (id, body) in tasks {
            thread::Builder::new()
                .name(format!("task-{id}"))
                .spawn(move || task_main(self, id, body))?;
        }
        log::debug!("host simulation started");

        let port = self.port();
        let mut elapsed = 0;
        loop {
            port.hand_off(self.dispatch());
            port.wait_idle();

            if elapsed == max_ticks {
                break;
            }
            elapsed += 1;

            let keep_going = port.interrupt(|| {
                self.tick();
                on_tick(self)
            });
            if !keep_going {
                break;
            }
        }

        Ok(self.now())
    }
}

fn task_main(kernel: &'static Kernel<HostPort>, id: TaskId, body: &'static dyn Runnable) {
    let port = kernel.port();
    CURRENT.set(Some(id));
    port.wait_turn(id);

    match panic::catch_unwind(AssertUnwindSafe(|| body.run())) {
        Ok(()) => {
            kernel.retire_current();
            port.hand_off(kernel.dispatch());
        }
        Err(payload) => port.record_panic(payload),
    }
}

/// Give `value` a `'static` lifetime by leaking it.
pub fn leak<T: 'static>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Leak a closure as a task body.
pub fn leak_task<F>(body: F) -> &'static dyn Runnable
where
    F: Fn() + Sync + 'static,
{
    leak(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_interrupt_flag_is_scoped() {
        let port = HostPort::new();
        assert!(!port.in_interrupt());
        port.interrupt(|| {
            assert!(port.in_interrupt());
            port.interrupt(|| assert!(port.in_interrupt()));
            assert!(port.in_interrupt());
        });
        assert!(!port.in_interrupt());
    }

    #[test]
    fn test_switch_outside_task_is_ignored() {
        let port = HostPort::new();
        let called = AtomicBool::new(false);
        port.request_switch(&|| {
            called.store(true, Ordering::SeqCst);
            None
        });
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_task_panic_reaches_driver() {
        let kernel = HostPort::kernel();
        kernel
            .create_task(TaskConfig::new(1), leak_task(|| panic!("boom")))
            .unwrap();
        let _ = kernel.run(5, |_| true);
    }
}
