//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and interrupt management.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler manually saves and
//! restores R4–R11, which completes the full context save/restore.
//!
//! ## Initial Stack Frame
//!
//! ```text
//!   high ┌──────────────┐
//!        │ xPSR (Thumb) │
//!        │ PC = entry   │
//!        │ LR = exit    │
//!        │ R12, R3–R1   │
//!        │ R0 = task id │  ← hardware frame
//!        ├──────────────┤
//!        │ R11 … R4     │  ← software frame
//!   low  └──────────────┘  ← saved PSP
//! ```
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest), can be preempted
//! - PendSV: Priority 0xFF (lowest), runs only when no other ISR is active
//!
//! Application interrupts that give semaphores run at higher priority and
//! only defer wakes, so the switch always happens in PendSV.

use core::arch::{asm, naked_asm};
use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::arch::Port;
use crate::config::{IDLE_PRIORITY, IDLE_STACK_SIZE, MAX_TASKS, STACK_SIZE, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::error::Error;
use crate::kernel::Kernel;
use crate::task::{TaskConfig, TaskId};

/// Words in the hardware-stacked exception frame.
const HW_FRAME_WORDS: usize = 8;
/// Words saved by PendSV (R4–R11).
const SW_FRAME_WORDS: usize = 8;
/// Thumb state bit in xPSR.
const XPSR_THUMB: u32 = 1 << 24;

/// The kernel the exception handlers operate on; set by [`Kernel::start`].
static KERNEL: AtomicPtr<Kernel<CortexM4>> = AtomicPtr::new(core::ptr::null_mut());

fn installed() -> Option<&'static Kernel<CortexM4>> {
    // Safety: only ever set from a `&'static Kernel`.
    unsafe { KERNEL.load(Ordering::Acquire).as_ref() }
}

// ---------------------------------------------------------------------------
// Task stacks
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
#[repr(C, align(8))]
struct Stack([u32; STACK_SIZE / 4]);

impl Stack {
    const EMPTY: Self = Stack([0; STACK_SIZE / 4]);
}

/// Cortex-M4 port: owns one stack per task slot.
pub struct CortexM4 {
    stacks: UnsafeCell<[Stack; MAX_TASKS]>,
    started: AtomicBool,
}

// Safety: a stack is written once by `init_context` (inside a critical
// section, before its task first runs) and afterwards only through the
// task's own PSP.
unsafe impl Sync for CortexM4 {}

impl CortexM4 {
    pub const fn new() -> Self {
        Self {
            stacks: UnsafeCell::new([Stack::EMPTY; MAX_TASKS]),
            started: AtomicBool::new(false),
        }
    }
}

impl Default for CortexM4 {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for CortexM4 {
    /// Lay out an initial exception frame at the top of the task's stack so
    /// that the first switch "returns" into [`task_entry`].
    fn init_context(&self, task: TaskId, stack_size: usize) -> Result<*mut u32, Error> {
        if task >= MAX_TASKS || stack_size > STACK_SIZE {
            return Err(Error::ResourceExhausted);
        }

        // Safety: slot `task` is not in use yet; callers hold a critical section.
        let stack = unsafe { &mut (*self.stacks.get())[task].0 };
        let top = stack.len();
        let frame = top - HW_FRAME_WORDS;

        stack[frame] = task as u32; // R0: argument to task_entry
        stack[frame + 1..frame + 5].fill(0); // R1–R3, R12
        stack[frame + 5] = task_exit as usize as u32; // LR
        stack[frame + 6] = task_entry as usize as u32; // PC
        stack[frame + 7] = XPSR_THUMB;

        let saved = frame - SW_FRAME_WORDS;
        stack[saved..frame].fill(0); // R4–R11

        Ok(stack[saved..].as_mut_ptr())
    }

    fn request_switch(&self, _dispatch: &dyn Fn() -> Option<TaskId>) {
        // Before `start` there is no task context to switch away from.
        if self.started.load(Ordering::Acquire) {
            trigger_pendsv();
        }
    }

    fn in_interrupt(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }
}

// ---------------------------------------------------------------------------
// Kernel startup
// ---------------------------------------------------------------------------

fn idle() {
    loop {
        cortex_m::asm::wfi();
    }
}

static IDLE: fn() = idle;

impl Kernel<CortexM4> {
    /// Start the scheduler. **Does not return** unless the idle task cannot
    /// be created.
    ///
    /// Registers the idle task, configures interrupt priorities and the
    /// SysTick timer, and launches the highest-priority task. After this
    /// call the system is fully preemptive.
    ///
    /// # Safety contract
    /// - Must be called from the main thread (not from an ISR), once.
    /// - Every task and primitive the application needs must have been
    ///   created successfully.
    pub fn start(&'static self, mut syst: SYST) -> Result<Infallible, Error> {
        let idle_config = TaskConfig::new(IDLE_PRIORITY).with_stack_size(IDLE_STACK_SIZE);
        self.create_task(idle_config, &IDLE)?;

        // Masked until `start_first_task` unmasks on the first task's stack.
        cortex_m::interrupt::disable();
        KERNEL.store(self as *const Self as *mut Self, Ordering::Release);
        set_interrupt_priorities();

        let first = self
            .dispatch()
            .and_then(|task| self.with_scheduler(|sched| sched.tasks.get(task).map(|t| t.stack_pointer)));
        let Some(first) = first else {
            // Safety: nothing has been handed to PendSV yet.
            unsafe { cortex_m::interrupt::enable() };
            return Err(Error::ResourceExhausted);
        };

        log::debug!("scheduler started");
        self.port().started.store(true, Ordering::Release);
        configure_systick(&mut syst);

        // Safety: `first` is a frame laid out by `init_context`.
        unsafe { start_first_task(first) }
    }
}

// ---------------------------------------------------------------------------
// Task entry and exit
// ---------------------------------------------------------------------------

/// First code run by every task: look up its body and run it.
extern "C" fn task_entry(task: TaskId) -> ! {
    if let Some(kernel) = installed() {
        if let Some(body) = kernel.task_body(task) {
            body.run();
        }
        kernel.retire_current();
    }
    trigger_pendsv();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Landing pad if a task's entry ever returns through LR.
extern "C" fn task_exit() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer for the scheduler tick.
///
/// Sets up SysTick to fire at `TICK_HZ` frequency using the processor
/// clock. Each tick runs [`SysTick`], which calls `Kernel::tick()`.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a PendSV exception to perform a context switch.
///
/// PendSV fires at the lowest priority: from Thread mode the switch happens
/// before this function returns; from a handler it happens once every
/// active handler has returned.
#[inline]
pub fn trigger_pendsv() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
///
/// Context switches (PendSV) then never preempt application-level ISRs.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch to PSP and branch into the first task.
///
/// # Safety
/// Must only be called once, with a stack pointer produced by
/// `init_context`.
unsafe fn start_first_task(psp: *mut u32) -> ! {
    asm!(
        // Skip the software-saved R4–R11
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unwind the hardware frame by hand
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR
        "mov lr, r4",

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler. Performs the actual context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Store the updated PSP into the current task's TCB
/// 3. Let the kernel select the next task
/// 4. Restore R4–R11 from the new task's stack and load its PSP
/// 5. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Called directly by the NVIC; follows the Cortex-M4 exception entry/exit
/// convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",             // r0 = next PSP
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",

        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",

        switch = sym switch_context,
    );
}

/// Save the outgoing PSP, dispatch, and return the incoming PSP.
/// Called from PendSV.
extern "C" fn switch_context(psp: *mut u32) -> *mut u32 {
    let Some(kernel) = installed() else {
        return psp;
    };

    kernel.with_scheduler(|sched| {
        if let Some(current) = sched.current_task {
            sched.tasks[current].stack_pointer = psp;
        }
    });

    let next = kernel.dispatch();
    kernel.with_scheduler(|sched| {
        next.and_then(|task| sched.tasks.get(task))
            .map_or(psp, |tcb| tcb.stack_pointer)
    })
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler, the scheduler tick entry point.
///
/// Called at `TICK_HZ` frequency. Advances the kernel's time and, once the
/// first task runs, pends PendSV if a context switch is needed.
#[no_mangle]
pub extern "C" fn SysTick() {
    if let Some(kernel) = installed() {
        kernel.tick_from_interrupt();
    }
}
