//! # Kernel
//!
//! The kernel is an explicitly owned system context: one [`Kernel`] holds the
//! scheduler behind a critical-section cell together with the [`Port`] that
//! switches contexts on the current CPU. Tasks, queues, mutexes and
//! semaphores are all created from a `&'static Kernel` and hand it back on
//! every call. There is no hidden global scheduler.
//!
//! ## Startup Sequence (Cortex-M4)
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► Kernel::new(CortexM4::new())   ← usually a `static`
//!         ├─► Queue::new / Mutex::new / ...  ← open wait channels
//!         ├─► kernel.create_task()           ← register tasks (×N)
//!         └─► kernel.start(syst)             ← no return on success
//!               ├─► Register the idle task
//!               ├─► Set interrupt priorities, configure SysTick
//!               └─► Launch the first task
//! ```
//!
//! ## Blocking
//!
//! Every blocking operation goes through [`Kernel::block_on`]: inside a
//! critical section the caller's condition is polled; if it does not hold,
//! the task is blocked on a wait channel with an optional deadline and the
//! port switches away. When the task runs again it either reports the
//! timeout or polls once more.

use crate::arch::Port;
use crate::config::{MIN_STACK_SIZE, STACK_SIZE};
use crate::error::{fault, Error, Fault};
use crate::scheduler::{Scheduler, WaitChannel, WakeOrder};
use crate::sync::{self, CriticalSection, Shared};
use crate::task::{Priority, Runnable, TaskConfig, TaskId, TaskState, WakeReason};
use crate::time::{Tick, Timeout, MAX_TIMEOUT_TICKS};

/// Result of polling a blocking operation's condition.
pub(crate) enum Attempt<R> {
    /// The condition held; the operation completed with this value.
    Done(R),
    /// The condition does not hold yet; wait on this channel.
    Wait(WaitChannel),
}

enum Step<R> {
    Done(R),
    Blocked,
    TimedOut,
}

/// The system context: scheduler state plus the CPU port.
pub struct Kernel<P: Port> {
    scheduler: Shared<Scheduler>,
    port: P,
}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P) -> Self {
        Self {
            scheduler: sync::shared(Scheduler::new()),
            port,
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run `f` on the scheduler inside a critical section.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        self.critical(|_, sched| f(sched))
    }

    /// Like [`with_scheduler`](Self::with_scheduler), also handing out the
    /// critical-section token for the caller's own shared state.
    pub(crate) fn critical<R>(
        &self,
        f: impl FnOnce(CriticalSection<'_>, &mut Scheduler) -> R,
    ) -> R {
        sync::critical_section(|cs| f(cs, &mut self.scheduler.borrow_ref_mut(cs)))
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Create a new task and register it with the scheduler.
    ///
    /// # Parameters
    /// - `config`: priority, stack budget and time slice.
    /// - `body`: the task body. Normally loops forever.
    ///
    /// # Returns
    /// - `Ok(task_id)`: The task's index in the scheduler array.
    /// - `Err(Error::ResourceExhausted)`: no free slot, or the stack budget
    ///   is outside `MIN_STACK_SIZE..=STACK_SIZE`.
    ///
    /// # Example
    /// ```ignore
    /// static BLINK: fn() = blink;
    /// kernel.create_task(TaskConfig::new(2), &BLINK)?;
    /// ```
    pub fn create_task(
        &self,
        config: TaskConfig,
        body: &'static dyn Runnable,
    ) -> Result<TaskId, Error> {
        if config.stack_size < MIN_STACK_SIZE || config.stack_size > STACK_SIZE {
            log::debug!("rejecting stack budget of {} bytes", config.stack_size);
            return Err(Error::ResourceExhausted);
        }

        let id = self.with_scheduler(|sched| {
            let id = sched.next_task_id()?;
            let stack_pointer = self.port.init_context(id, config.stack_size)?;
            sched.create_task(config, body, stack_pointer)
        })?;

        log::debug!("created task {} at priority {}", id, config.priority);
        self.reschedule();
        Ok(id)
    }

    /// Open a wait channel for a synchronization primitive.
    pub(crate) fn open_channel(&self, order: WakeOrder) -> Result<WaitChannel, Error> {
        self.with_scheduler(|sched| sched.open_channel(order))
    }

    /// The task selected by the last dispatch.
    pub fn current_task(&self) -> Option<TaskId> {
        self.with_scheduler(|sched| sched.current_task)
    }

    /// Current value of the tick counter.
    pub fn now(&self) -> Tick {
        self.with_scheduler(|sched| sched.now())
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.with_scheduler(|sched| {
            (task < sched.task_count).then(|| sched.tasks[task].state)
        })
    }

    /// Effective priority of `task`, including any inherited boost.
    pub fn task_priority(&self, task: TaskId) -> Option<Priority> {
        self.with_scheduler(|sched| {
            (task < sched.task_count).then(|| sched.priority_of(task))
        })
    }

    pub fn task_body(&self, task: TaskId) -> Option<&'static dyn Runnable> {
        self.with_scheduler(|sched| sched.tasks.get(task).and_then(|tcb| tcb.body))
    }

    /// Mark the running task as finished after its body returned.
    pub(crate) fn retire_current(&self) {
        self.with_scheduler(|sched| sched.retire_current());
    }

    // -----------------------------------------------------------------------
    // Delays and yielding (task context only)
    // -----------------------------------------------------------------------

    /// Block the calling task for `ticks` scheduler ticks.
    ///
    /// The task becomes Ready once the tick counter reaches `now + ticks`.
    /// `sleep_for(0)` is a plain yield.
    pub fn sleep_for(&self, ticks: u32) {
        if ticks == 0 {
            self.yield_now();
            return;
        }
        let me = self.task_context();
        let wake = self.now().wrapping_add(ticks.min(MAX_TIMEOUT_TICKS));
        self.sleep_until_tick(me, wake);
    }

    /// Block until `period` ticks after `*last_wake`, then advance
    /// `*last_wake` by one period.
    ///
    /// Unlike repeated `sleep_for`, the release times do not drift with the
    /// time spent working between calls. If the next release time has
    /// already passed, returns immediately.
    pub fn sleep_until(&self, last_wake: &mut Tick, period: u32) {
        let me = self.task_context();
        let wake = last_wake.wrapping_add(period);
        *last_wake = wake;
        if self.now().has_reached(wake) {
            return;
        }
        self.sleep_until_tick(me, wake);
    }

    /// Give up the CPU to the next Ready task of the same priority.
    pub fn yield_now(&self) {
        self.task_context();
        self.with_scheduler(|sched| sched.yield_current());
        self.port.request_switch(&|| self.dispatch());
    }

    fn sleep_until_tick(&self, me: TaskId, wake: Tick) {
        self.with_scheduler(|sched| sched.block_current(None, Some(wake)));
        self.port.request_switch(&|| self.dispatch());
        self.with_scheduler(|sched| sched.take_wake_reason(me));
    }

    // -----------------------------------------------------------------------
    // Port entry points
    // -----------------------------------------------------------------------

    /// Timer interrupt entry point. Advances time, expires deadlines and
    /// performs pending interrupt wakes.
    ///
    /// Returns `true` if a context switch should occur.
    pub fn tick(&self) -> bool {
        self.with_scheduler(|sched| {
            sched.drain_deferred();
            sched.tick()
        })
    }

    /// Timer interrupt handler body: [`tick`](Self::tick), then ask the
    /// port for a switch if one is due. Ports ignore the request until the
    /// first task runs.
    pub fn tick_from_interrupt(&self) {
        if self.tick() {
            self.port.request_switch(&|| self.dispatch());
        }
    }

    /// Context-switch entry point. Performs pending interrupt wakes and
    /// selects the task to run next.
    pub fn dispatch(&self) -> Option<TaskId> {
        let next = self.with_scheduler(|sched| {
            sched.drain_deferred();
            sched.schedule()
        });
        log::trace!("dispatch -> {:?}", next);
        next
    }

    /// Switch away if the last operation made a more urgent task ready.
    pub(crate) fn reschedule(&self) {
        if self.with_scheduler(|sched| sched.preemption_pending()) {
            self.port.request_switch(&|| self.dispatch());
        }
    }

    // -----------------------------------------------------------------------
    // Blocking protocol used by the primitives
    // -----------------------------------------------------------------------

    /// The calling task. Faults unless called from a task.
    pub(crate) fn task_context(&self) -> TaskId {
        if self.port.in_interrupt() {
            fault(Fault::ContextViolation);
        }
        match self.current_task() {
            Some(task) => task,
            None => fault(Fault::ContextViolation),
        }
    }

    /// Wake the next waiter on `channel`. From interrupt context the wake is
    /// deferred to the next dispatch or tick.
    pub(crate) fn notify(&self, sched: &mut Scheduler, channel: WaitChannel) {
        if self.port.in_interrupt() {
            sched.defer_wake(channel);
        } else {
            sched.wake_one(channel);
        }
    }

    /// Poll `poll` until it completes or `timeout` elapses.
    ///
    /// `poll` runs inside a critical section with the scheduler borrowed;
    /// it receives the calling task's id and either completes or names the
    /// channel to wait on. A woken task polls again, so a condition taken by
    /// another task in the meantime just means waiting some more.
    pub(crate) fn block_on<R>(
        &self,
        timeout: Timeout,
        mut poll: impl FnMut(CriticalSection<'_>, &mut Scheduler, TaskId) -> Attempt<R>,
    ) -> Result<R, Error> {
        let me = self.task_context();
        let deadline = timeout.deadline(self.now());

        loop {
            let step = self.critical(|cs, sched| {
                match poll(cs, sched, me) {
                    Attempt::Done(value) => Step::Done(value),
                    Attempt::Wait(channel) => {
                        if deadline.is_some_and(|d| sched.now().has_reached(d)) {
                            Step::TimedOut
                        } else {
                            sched.block_current(Some(channel), deadline);
                            Step::Blocked
                        }
                    }
                }
            });

            match step {
                Step::Done(value) => {
                    self.reschedule();
                    return Ok(value);
                }
                Step::TimedOut => return Err(Error::Timeout),
                Step::Blocked => {
                    self.port.request_switch(&|| self.dispatch());
                    let reason = self.with_scheduler(|sched| sched.take_wake_reason(me));
                    if reason == Some(WakeReason::Timeout) {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host simulation)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{leak, leak_task, HostPort};
    use crate::config::MAX_TASKS;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn noop() {}
    static NOOP: fn() = noop;

    /// Port that counts switch requests and never switches.
    struct CountingPort {
        switches: AtomicU32,
    }

    impl Port for CountingPort {
        fn init_context(&self, _task: TaskId, _stack_size: usize) -> Result<*mut u32, Error> {
            Ok(core::ptr::null_mut())
        }

        fn request_switch(&self, _dispatch: &dyn Fn() -> Option<TaskId>) {
            self.switches.fetch_add(1, Ordering::SeqCst);
        }

        fn in_interrupt(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_tick_before_start_leaves_switch_to_port() {
        let kernel = Kernel::new(CountingPort {
            switches: AtomicU32::new(0),
        });
        kernel.create_task(TaskConfig::new(1), &NOOP).unwrap();
        let before = kernel.port().switches.load(Ordering::SeqCst);

        // Ready task, nothing dispatched yet: the switch goes through the
        // port and the kernel does not pick a task by itself
        kernel.tick_from_interrupt();
        assert_eq!(kernel.port().switches.load(Ordering::SeqCst), before + 1);
        assert_eq!(kernel.current_task(), None);
        assert_eq!(kernel.task_state(0), Some(TaskState::Ready));

        // Once the only task runs, a quiet tick asks for nothing
        assert_eq!(kernel.dispatch(), Some(0));
        kernel.tick_from_interrupt();
        assert_eq!(kernel.port().switches.load(Ordering::SeqCst), before + 1);
        assert_eq!(kernel.now(), Tick::new(2));
    }

    #[test]
    fn test_create_task_checks_budget() {
        let kernel = HostPort::kernel();

        let too_big = TaskConfig::new(1).with_stack_size(STACK_SIZE + 4);
        assert_eq!(kernel.create_task(too_big, &NOOP), Err(Error::ResourceExhausted));
        let too_small = TaskConfig::new(1).with_stack_size(MIN_STACK_SIZE - 4);
        assert_eq!(kernel.create_task(too_small, &NOOP), Err(Error::ResourceExhausted));

        for i in 0..MAX_TASKS {
            assert_eq!(kernel.create_task(TaskConfig::new(1), &NOOP), Ok(i));
        }
        assert_eq!(
            kernel.create_task(TaskConfig::new(1), &NOOP),
            Err(Error::ResourceExhausted)
        );
        assert_eq!(kernel.task_state(0), Some(TaskState::Ready));
        assert_eq!(kernel.task_state(MAX_TASKS), None);
    }

    #[test]
    fn test_sleep_for_wakes_after_requested_ticks() {
        let kernel = HostPort::kernel();
        let slept = leak(AtomicU32::new(0));

        kernel
            .create_task(
                TaskConfig::new(2),
                leak_task(move || {
                    let start = kernel.now();
                    kernel.sleep_for(5);
                    slept.store(kernel.now().since(start), Ordering::SeqCst);
                }),
            )
            .unwrap();

        kernel.run(20, |_| true).unwrap();
        assert_eq!(slept.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_sleep_until_does_not_drift() {
        let kernel = HostPort::kernel();
        let releases = leak(StdMutex::new(Vec::new()));

        kernel
            .create_task(
                TaskConfig::new(1),
                leak_task(move || {
                    let mut last_wake = kernel.now();
                    for _ in 0..3 {
                        kernel.sleep_until(&mut last_wake, 4);
                        releases.lock().unwrap().push(kernel.now().raw());
                        // Work between releases must not shift them
                        kernel.sleep_for(1);
                    }
                }),
            )
            .unwrap();

        kernel.run(30, |_| true).unwrap();
        assert_eq!(*releases.lock().unwrap(), [4, 8, 12]);
    }

    #[test]
    fn test_yield_alternates_equal_priority() {
        let kernel = HostPort::kernel();
        let trace = leak(StdMutex::new(Vec::new()));

        for name in ['a', 'b'] {
            kernel
                .create_task(
                    TaskConfig::new(1),
                    leak_task(move || {
                        for _ in 0..3 {
                            trace.lock().unwrap().push(name);
                            kernel.yield_now();
                        }
                    }),
                )
                .unwrap();
        }

        kernel.run(2, |_| true).unwrap();
        assert_eq!(*trace.lock().unwrap(), ['a', 'b', 'a', 'b', 'a', 'b']);
        assert_eq!(kernel.task_state(0), Some(TaskState::Suspended));
    }

    #[test]
    fn test_higher_priority_task_runs_first() {
        let kernel = HostPort::kernel();
        let trace = leak(StdMutex::new(Vec::new()));

        for (name, priority) in [('l', 1), ('h', 3), ('m', 2)] {
            kernel
                .create_task(
                    TaskConfig::new(priority),
                    leak_task(move || trace.lock().unwrap().push(name)),
                )
                .unwrap();
        }

        kernel.run(1, |_| true).unwrap();
        assert_eq!(*trace.lock().unwrap(), ['h', 'm', 'l']);
    }

    #[test]
    fn test_run_stops_when_asked() {
        let kernel = HostPort::kernel();
        let end = kernel.run(100, |k| k.now().raw() < 7).unwrap();
        assert_eq!(end, Tick::new(7));
    }

    #[test]
    #[should_panic(expected = "kernel fault: context violation")]
    fn test_sleep_outside_task_faults() {
        let kernel = HostPort::kernel();
        kernel.sleep_for(1);
    }

    #[test]
    #[should_panic(expected = "kernel fault: context violation")]
    fn test_yield_from_interrupt_faults() {
        let kernel = HostPort::kernel();
        kernel.port().interrupt(|| kernel.yield_now());
    }
}
