//! # TickOS: a small preemptive RTOS kernel
//!
//! A priority-preemptive multitask runtime for single-core ARM Cortex-M4
//! microcontrollers: tasks with timed delays, a bounded blocking queue for
//! producer/consumer hand-off, a mutex for shared state, and a binary
//! semaphore that interrupt handlers use to wake tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Queue       │  Mutex           │  Semaphore           │
//! │  queue.rs    │  mutex.rs        │  semaphore.rs        │
//! │  ─ send()    │  ─ acquire()     │  ─ give_from_        │
//! │  ─ receive() │  ─ release()     │      interrupt()     │
//! │              │                  │  ─ take()            │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │        Kernel context (kernel.rs) · block_on()         │
//! │   create_task() · sleep_for() · tick() · dispatch()    │
//! ├────────────────────────────────────────────────────────┤
//! │   Scheduler (scheduler.rs) · Task model (task.rs)      │
//! │   ready selection · wait channels · deferred wakes     │
//! ├────────────────────────────────────────────────────────┤
//! │  Port (arch/): cortex_m4 (PendSV, SysTick) │ host sim  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - The highest-priority Ready task always runs; equal priorities share
//!   the CPU round-robin on time-slice boundaries.
//! - Every blocking call takes a [`Timeout`]; on expiry it returns
//!   [`Error::Timeout`] and is not retried.
//! - Interrupt handlers never block. They signal tasks through
//!   [`Semaphore::give_from_interrupt`] (or the non-blocking queue calls);
//!   the wake itself happens at the next dispatch or tick.
//! - Misuse (blocking in an interrupt, releasing a mutex one does not own)
//!   is a [`Fault`] and stops the system.
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically sized
//! - **Fixed-size TCB array**: `[TaskControlBlock; MAX_TASKS]`
//! - **Per-task stack**: owned by the port, `STACK_SIZE` bytes per slot
//! - **Critical sections**: the `critical-section` crate guards all kernel
//!   state
//!
//! ## Example
//!
//! ```ignore
//! static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4::new());
//!
//! let button = Semaphore::new(&KERNEL)?;
//! KERNEL.create_task(TaskConfig::new(2), &LED_TASK)?;
//! KERNEL.start(core_peripherals.SYST)?;
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod mutex;
pub mod queue;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod time;

pub use error::{Error, Fault};
pub use kernel::Kernel;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use queue::Queue;
pub use semaphore::Semaphore;
pub use task::{Priority, Runnable, TaskConfig, TaskId, TaskState};
pub use time::{Tick, Timeout};
