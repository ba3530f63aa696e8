//! # Scheduler
//!
//! Core scheduling logic for TickOS: a preemptive, priority-based scheduler
//! with round-robin among tasks of equal priority. This module is pure
//! bookkeeping. It never touches hardware, so it is exercised directly by
//! the host tests. The kernel wraps it in a critical section and the port
//! layer performs the actual context switch.
//!
//! ## Scheduling Algorithm
//!
//! At each SysTick interrupt ([`Scheduler::tick`]):
//! 1. **Advance time**: increment the wrap-safe tick counter
//! 2. **Expire deadlines**: blocked tasks whose wake tick is reached become
//!    Ready with [`WakeReason::Timeout`]
//! 3. **Charge the slice**: the running task loses one tick of its slice; on
//!    expiry it moves to the back of its priority level if a peer is ready
//! 4. **Report** whether a higher-priority task is now ready
//!
//! At each dispatch ([`Scheduler::schedule`]) the highest-priority Ready
//! task runs; ties go to the task that has waited longest in the ready line.
//!
//! ## Wait Channels
//!
//! Synchronization primitives do not keep their own wait lists. Each one
//! opens one or more [`WaitChannel`]s; a task that must wait is blocked on a
//! channel and [`Scheduler::wake_one`] picks the next waiter by the
//! channel's [`WakeOrder`]. Interrupt handlers never wake tasks directly:
//! they set a deferred-wake bit with [`Scheduler::defer_wake`], drained at
//! the next dispatch or tick.

use crate::config::{MAX_TASKS, MAX_WAIT_CHANNELS};
use crate::error::Error;
use crate::task::{Priority, Runnable, TaskConfig, TaskControlBlock, TaskId, TaskState, WakeReason};
use crate::time::Tick;

// ---------------------------------------------------------------------------
// Wait channels
// ---------------------------------------------------------------------------

/// Handle of a wait channel opened by a synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitChannel(u8);

impl WaitChannel {
    pub(crate) const fn new(index: u8) -> Self {
        WaitChannel(index)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which waiter a channel releases first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOrder {
    /// Longest-waiting task first.
    Fifo,
    /// Highest priority first, ties by arrival.
    Priority,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state. Owned by the [`Kernel`](crate::kernel::Kernel).
///
/// ## Design Notes
///
/// - All tasks are stored inline in a fixed-size array (no heap)
/// - `current_task` is `None` until the first dispatch, and whenever no task
///   is ready (the hardware port always registers an idle task)
/// - A single sequence counter orders both the ready line and wait arrivals
pub struct Scheduler {
    /// Fixed-size array of TCBs.
    pub tasks: [TaskControlBlock; MAX_TASKS],

    /// Task selected by the last dispatch.
    pub current_task: Option<TaskId>,

    /// Number of allocated tasks.
    pub task_count: usize,

    /// Monotonic, wrapping tick counter.
    pub tick_count: Tick,

    /// Set when the running task yielded, blocked, or used up its slice.
    pub needs_reschedule: bool,

    /// Wake order of each opened channel.
    channels: [WakeOrder; MAX_WAIT_CHANNELS],

    /// Number of opened channels.
    channel_count: usize,

    /// One bit per channel with a wake requested from interrupt context.
    deferred_wakes: u32,

    /// Source of `ready_seq` / `wait_seq`.
    seq: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            current_task: None,
            task_count: 0,
            tick_count: Tick::ZERO,
            needs_reschedule: false,
            channels: [WakeOrder::Fifo; MAX_WAIT_CHANNELS],
            channel_count: 0,
            deferred_wakes: 0,
            seq: 0,
        }
    }

    /// Register a new task. It starts out Ready.
    ///
    /// # Returns
    /// - `Ok(task_id)`: the index of the newly created task
    /// - `Err(Error::ResourceExhausted)`: if the task array is full
    pub fn create_task(
        &mut self,
        config: TaskConfig,
        body: &'static dyn Runnable,
        stack_pointer: *mut u32,
    ) -> Result<TaskId, Error> {
        let id = self.next_task_id()?;
        let seq = self.next_seq();
        self.tasks[id].init(id, config, body, stack_pointer, seq);
        self.task_count += 1;
        Ok(id)
    }

    /// The id the next created task will get.
    pub fn next_task_id(&self) -> Result<TaskId, Error> {
        if self.task_count >= MAX_TASKS {
            return Err(Error::ResourceExhausted);
        }
        Ok(self.task_count)
    }

    /// Open a wait channel for a synchronization primitive.
    pub fn open_channel(&mut self, order: WakeOrder) -> Result<WaitChannel, Error> {
        if self.channel_count >= MAX_WAIT_CHANNELS {
            return Err(Error::ResourceExhausted);
        }
        let channel = WaitChannel::new(self.channel_count as u8);
        self.channels[channel.index()] = order;
        self.channel_count += 1;
        Ok(channel)
    }

    /// Number of wait channels still available.
    pub fn channels_left(&self) -> usize {
        MAX_WAIT_CHANNELS - self.channel_count
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.tick_count
    }

    /// Called from the SysTick handler every tick.
    ///
    /// Expires deadlines and charges the running task's time slice.
    /// Returns `true` if a context switch should occur.
    pub fn tick(&mut self) -> bool {
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = self.tick_count;

        // --- Wake tasks whose deadline is reached ---
        for i in 0..self.task_count {
            if self.tasks[i].state != TaskState::Blocked {
                continue;
            }
            if let Some(wake_tick) = self.tasks[i].wake_tick {
                if now.has_reached(wake_tick) {
                    log::trace!("task {} wait timed out at tick {}", i, now.raw());
                    self.make_ready(i, WakeReason::Timeout);
                }
            }
        }

        // --- Charge the running task ---
        if let Some(current) = self.current_task {
            if self.tasks[current].state == TaskState::Running {
                if self.tasks[current].ticks_remaining > 0 {
                    self.tasks[current].ticks_remaining -= 1;
                }

                // Time slice expired → rotate behind equal-priority peers
                if self.tasks[current].ticks_remaining == 0 {
                    self.tasks[current].ticks_remaining =
                        self.tasks[current].config.effective_time_slice();

                    let priority = self.tasks[current].priority;
                    let peer_ready = self.tasks[..self.task_count]
                        .iter()
                        .any(|t| t.is_runnable() && t.priority == priority);
                    if peer_ready {
                        self.yield_current();
                    }
                }
            }
        }

        self.preemption_pending()
    }

    /// Select the next task to run and mark it Running.
    ///
    /// The previously running task, if still Running, goes back to Ready
    /// keeping its place in line.
    ///
    /// # Returns
    /// The selected task, or `None` if no task is ready.
    pub fn schedule(&mut self) -> Option<TaskId> {
        let prev = self.current_task;
        if let Some(prev) = prev {
            if self.tasks[prev].state == TaskState::Running {
                self.tasks[prev].state = TaskState::Ready;
            }
        }

        let next = self.best_ready();
        if let Some(next) = next {
            if prev != Some(next) {
                self.tasks[next].ticks_remaining = self.tasks[next].config.effective_time_slice();
            }
            self.tasks[next].state = TaskState::Running;
        }

        self.current_task = next;
        self.needs_reschedule = false;
        next
    }

    /// Whether a dispatch would (or might) run a different task than the
    /// current one.
    pub fn preemption_pending(&self) -> bool {
        if self.needs_reschedule || self.deferred_wakes != 0 {
            return true;
        }

        let running = self
            .current_task
            .filter(|&id| self.tasks[id].state == TaskState::Running);

        match (self.best_ready(), running) {
            (Some(best), Some(current)) => self.tasks[best].priority > self.tasks[current].priority,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Move the running task to the back of its priority level.
    pub fn yield_current(&mut self) {
        if let Some(current) = self.current_task {
            if self.tasks[current].state == TaskState::Running {
                let seq = self.next_seq();
                self.tasks[current].state = TaskState::Ready;
                self.tasks[current].ready_seq = seq;
                self.needs_reschedule = true;
            }
        }
    }

    /// Block the running task, on `channel` and/or until `wake_tick`.
    pub fn block_current(&mut self, channel: Option<WaitChannel>, wake_tick: Option<Tick>) {
        if let Some(current) = self.current_task {
            let seq = self.next_seq();
            self.tasks[current].block(channel, wake_tick, seq);
            self.needs_reschedule = true;
            log::trace!("task {} blocked on {:?} until {:?}", current, channel, wake_tick);
        }
    }

    /// Retire the running task after its body returned.
    pub fn retire_current(&mut self) {
        if let Some(current) = self.current_task {
            self.tasks[current].state = TaskState::Suspended;
            self.needs_reschedule = true;
            log::debug!("task {} finished", current);
        }
    }

    /// Wake the next waiter on `channel` according to its wake order.
    ///
    /// # Returns
    /// The woken task, or `None` if nobody was waiting.
    pub fn wake_one(&mut self, channel: WaitChannel) -> Option<TaskId> {
        let order = self.channels[channel.index()];

        let mut best: Option<TaskId> = None;
        for i in 0..self.task_count {
            if !self.tasks[i].is_waiting_on(channel) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let (cand, cur) = (&self.tasks[i], &self.tasks[b]);
                    let better = match order {
                        WakeOrder::Fifo => seq_before(cand.wait_seq, cur.wait_seq),
                        WakeOrder::Priority => {
                            cand.priority > cur.priority
                                || (cand.priority == cur.priority
                                    && seq_before(cand.wait_seq, cur.wait_seq))
                        }
                    };
                    if better { Some(i) } else { Some(b) }
                }
            };
        }

        if let Some(id) = best {
            log::trace!("task {} woken on {:?}", id, channel);
            self.make_ready(id, WakeReason::Signaled);
        }
        best
    }

    /// Whether any task is blocked on `channel`.
    pub fn has_waiters(&self, channel: WaitChannel) -> bool {
        self.tasks[..self.task_count]
            .iter()
            .any(|t| t.is_waiting_on(channel))
    }

    /// Highest effective priority among the tasks blocked on `channel`.
    pub fn top_waiter_priority(&self, channel: WaitChannel) -> Option<Priority> {
        self.tasks[..self.task_count]
            .iter()
            .filter(|t| t.is_waiting_on(channel))
            .map(|t| t.priority)
            .max()
    }

    /// Request a wake on `channel` from interrupt context. Requests for the
    /// same channel coalesce until drained.
    pub fn defer_wake(&mut self, channel: WaitChannel) {
        self.deferred_wakes |= 1 << channel.index();
    }

    /// Perform the wakes requested by interrupt handlers.
    pub fn drain_deferred(&mut self) {
        let mut pending = core::mem::take(&mut self.deferred_wakes);
        while pending != 0 {
            let index = pending.trailing_zeros() as u8;
            pending &= pending - 1;
            self.wake_one(WaitChannel::new(index));
        }
    }

    /// Take the reason `task` last left `Blocked`, if not yet consumed.
    pub fn take_wake_reason(&mut self, task: TaskId) -> Option<WakeReason> {
        self.tasks[task].wake_reason.take()
    }

    /// Raise `owner` to at least `priority` while it holds a resource a
    /// more urgent task waits for.
    pub fn inherit_priority(&mut self, owner: TaskId, priority: Priority) {
        if self.tasks[owner].inherit(priority) {
            log::trace!("task {} inherits priority {}", owner, priority);
        }
    }

    /// Drop `task` back to its base priority.
    pub fn restore_priority(&mut self, task: TaskId) {
        self.tasks[task].restore_priority();
    }

    #[inline]
    pub fn priority_of(&self, task: TaskId) -> Priority {
        self.tasks[task].priority
    }

    /// Highest-priority Ready task; ties go to the earliest in line.
    fn best_ready(&self) -> Option<TaskId> {
        let mut best: Option<TaskId> = None;
        for i in 0..self.task_count {
            if !self.tasks[i].is_runnable() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let (cand, cur) = (&self.tasks[i], &self.tasks[b]);
                    if cand.priority > cur.priority
                        || (cand.priority == cur.priority && seq_before(cand.ready_seq, cur.ready_seq))
                    {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    fn make_ready(&mut self, task: TaskId, reason: WakeReason) {
        let seq = self.next_seq();
        self.tasks[task].wake(reason, seq);
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

/// Whether sequence number `a` was drawn before `b`, across counter wrap.
#[inline]
fn seq_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
