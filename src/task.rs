//! # Task Control Block
//!
//! Defines the task model for TickOS. A task is a [`Runnable`] body plus a
//! [`TaskConfig`] capability set (priority, stack budget, time slice), stored
//! uniformly in the scheduler's registry. The TCB carries everything the
//! scheduler needs to pick, block, wake, and switch to the task.

use crate::config::{DEFAULT_TIME_SLICE, STACK_SIZE};
use crate::scheduler::WaitChannel;
use crate::time::Tick;

/// Index of a task in the scheduler's registry. Stable for the task's lifetime.
pub type TaskId = usize;

/// Task priority. Higher values are more urgent.
pub type Priority = u8;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task in the scheduler's state machine.
///
/// ```text
///   ┌──────────┐     schedule()      ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///        ▲  ▲   preempt / yield / slice   │
///        │  └─────────────────────────────┤
///        │                                │ block / sleep
///        │  condition met or deadline     ▼
///        │                          ┌──────────┐
///        └───────────────────────── │ Blocked  │
///                                   └──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is ready to run and waiting for the CPU.
    Ready,
    /// Task is currently executing on the CPU.
    Running,
    /// Task is waiting on a wait channel and/or a wake tick.
    Blocked,
    /// Task is not schedulable: an unused slot, or a task whose body returned.
    Suspended,
}

/// Why a blocked task was made ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The condition it waited for was signaled (or ownership handed over).
    Signaled,
    /// Its wake tick was reached first.
    Timeout,
}

// ---------------------------------------------------------------------------
// Task body
// ---------------------------------------------------------------------------

/// The body of a task.
///
/// Embedded tasks normally loop forever, blocking or sleeping at least once
/// per iteration. If `run` returns, the task is retired and never scheduled
/// again.
pub trait Runnable: Sync {
    fn run(&self);
}

impl<F> Runnable for F
where
    F: Fn() + Sync,
{
    fn run(&self) {
        self()
    }
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Static configuration for a task, set at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Base priority (higher = more important). Range: 0–255.
    pub priority: Priority,

    /// Stack budget in bytes. Creation fails with `ResourceExhausted` when
    /// this is outside `MIN_STACK_SIZE..=STACK_SIZE`.
    pub stack_size: usize,

    /// Time slice in ticks for this task. If 0, uses `DEFAULT_TIME_SLICE`.
    pub time_slice: u32,
}

impl TaskConfig {
    pub const fn new(priority: Priority) -> Self {
        Self {
            priority,
            stack_size: STACK_SIZE,
            time_slice: 0,
        }
    }

    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub const fn with_time_slice(mut self, time_slice: u32) -> Self {
        self.time_slice = time_slice;
        self
    }

    /// Returns the effective time slice, falling back to the system default.
    #[inline]
    pub const fn effective_time_slice(&self) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else {
            DEFAULT_TIME_SLICE
        }
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB), the central data structure for each task.
///
/// TCBs live in a fixed array inside the scheduler, with no heap allocation.
/// Ordering among equal-priority tasks comes from two sequence numbers drawn
/// from one scheduler-wide counter: `ready_seq` for the ready line,
/// `wait_seq` for arrival on a wait channel.
pub struct TaskControlBlock {
    /// Unique task identifier (index in the scheduler's task array).
    pub id: TaskId,

    /// Current execution state.
    pub state: TaskState,

    /// Static configuration (base priority, stack budget, time slice).
    pub config: TaskConfig,

    /// Effective priority. Equals `config.priority` unless raised by
    /// priority inheritance while holding a contended mutex.
    pub priority: Priority,

    /// The task body. `None` only for unused slots.
    pub body: Option<&'static dyn Runnable>,

    /// Saved stack pointer (PSP), written by the port on context switch.
    /// Null on ports that do not switch stacks themselves.
    pub stack_pointer: *mut u32,

    /// Position in the ready line among tasks of the same priority.
    pub ready_seq: u64,

    /// Wait channel this task is blocked on, if any.
    pub wait_channel: Option<WaitChannel>,

    /// Arrival order on `wait_channel`.
    pub wait_seq: u64,

    /// Tick at which a blocked task gives up waiting.
    pub wake_tick: Option<Tick>,

    /// Set when the task leaves `Blocked`; consumed by the blocking call.
    pub wake_reason: Option<WakeReason>,

    /// Remaining ticks in the current time slice.
    pub ticks_remaining: u32,

    /// Whether this task is allocated (true) or a free slot (false).
    pub active: bool,
}

// Safety: `stack_pointer` always points into the task's own stack, owned by
// the port, and is only touched inside critical sections or by the
// context-switch handler.
unsafe impl Send for TaskControlBlock {}

impl TaskControlBlock {
    /// An empty (unallocated) TCB. Used to initialize the static array.
    pub const EMPTY: Self = Self {
        id: 0,
        state: TaskState::Suspended,
        config: TaskConfig::new(0),
        priority: 0,
        body: None,
        stack_pointer: core::ptr::null_mut(),
        ready_seq: 0,
        wait_channel: None,
        wait_seq: 0,
        wake_tick: None,
        wake_reason: None,
        ticks_remaining: 0,
        active: false,
    };

    /// Initialize a TCB for a new task. The task starts out Ready.
    pub fn init(
        &mut self,
        id: TaskId,
        config: TaskConfig,
        body: &'static dyn Runnable,
        stack_pointer: *mut u32,
        ready_seq: u64,
    ) {
        *self = Self {
            id,
            state: TaskState::Ready,
            config,
            priority: config.priority,
            body: Some(body),
            stack_pointer,
            ready_seq,
            ticks_remaining: config.effective_time_slice(),
            active: true,
            ..Self::EMPTY
        };
    }

    /// Check if this task is runnable (Ready and active).
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.active && self.state == TaskState::Ready
    }

    /// Check if this task is blocked on `channel`.
    #[inline]
    pub fn is_waiting_on(&self, channel: WaitChannel) -> bool {
        self.state == TaskState::Blocked && self.wait_channel == Some(channel)
    }

    /// Move to `Blocked`, optionally on a wait channel and/or with a deadline.
    pub fn block(&mut self, channel: Option<WaitChannel>, wake_tick: Option<Tick>, wait_seq: u64) {
        self.state = TaskState::Blocked;
        self.wait_channel = channel;
        self.wait_seq = wait_seq;
        self.wake_tick = wake_tick;
        self.wake_reason = None;
    }

    /// Leave `Blocked` and join the back of the ready line.
    pub fn wake(&mut self, reason: WakeReason, ready_seq: u64) {
        self.state = TaskState::Ready;
        self.wait_channel = None;
        self.wake_tick = None;
        self.wake_reason = Some(reason);
        self.ready_seq = ready_seq;
    }

    /// Raise the effective priority to at least `priority`.
    /// Returns whether it changed.
    pub fn inherit(&mut self, priority: Priority) -> bool {
        if priority > self.priority {
            self.priority = priority;
            true
        } else {
            false
        }
    }

    /// Drop back to the configured base priority.
    pub fn restore_priority(&mut self) {
        self.priority = self.config.priority;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}
    static NOOP: fn() = noop;

    #[test]
    fn test_tcb_initialization() {
        let mut tcb = TaskControlBlock::EMPTY;
        assert!(!tcb.active);
        assert_eq!(tcb.state, TaskState::Suspended);

        let config = TaskConfig::new(5).with_time_slice(15);
        tcb.init(0, config, &NOOP, core::ptr::null_mut(), 7);

        assert!(tcb.active);
        assert!(tcb.is_runnable());
        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.priority, 5);
        assert_eq!(tcb.ready_seq, 7);
        assert_eq!(tcb.ticks_remaining, 15);
        assert!(tcb.body.is_some());
    }

    #[test]
    fn test_block_and_wake() {
        let mut tcb = TaskControlBlock::EMPTY;
        tcb.init(1, TaskConfig::new(3), &NOOP, core::ptr::null_mut(), 0);

        let channel = WaitChannel::new(2);
        tcb.block(Some(channel), Some(Tick::new(40)), 9);
        assert!(!tcb.is_runnable());
        assert!(tcb.is_waiting_on(channel));
        assert!(!tcb.is_waiting_on(WaitChannel::new(3)));
        assert_eq!(tcb.wake_tick, Some(Tick::new(40)));

        tcb.wake(WakeReason::Timeout, 10);
        assert!(tcb.is_runnable());
        assert_eq!(tcb.wait_channel, None);
        assert_eq!(tcb.wake_tick, None);
        assert_eq!(tcb.wake_reason, Some(WakeReason::Timeout));
        assert_eq!(tcb.ready_seq, 10);
    }

    #[test]
    fn test_priority_inheritance() {
        let mut tcb = TaskControlBlock::EMPTY;
        tcb.init(2, TaskConfig::new(2), &NOOP, core::ptr::null_mut(), 0);

        assert!(!tcb.inherit(1));
        assert_eq!(tcb.priority, 2);

        assert!(tcb.inherit(6));
        assert_eq!(tcb.priority, 6);
        assert_eq!(tcb.config.priority, 2);

        tcb.restore_priority();
        assert_eq!(tcb.priority, 2);
    }

    #[test]
    fn test_effective_time_slice_default() {
        let config = TaskConfig::new(1);
        assert_eq!(config.effective_time_slice(), DEFAULT_TIME_SLICE);
        assert_eq!(config.stack_size, STACK_SIZE);
        assert_eq!(config.with_time_slice(4).effective_time_slice(), 4);
    }
}
