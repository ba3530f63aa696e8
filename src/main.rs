//! # TickOS Example Firmware
//!
//! The classic RTOS exercises on one board, sharing a single kernel:
//!
//! | Task | Priority | Primitive | Behavior |
//! |------|----------|-----------|----------|
//! | `blink_red` / `blink_blue` | 1 | delay | Toggle an LED every 250 ms |
//! | sensor | 1 | queue | Sample the temperature once a second |
//! | processing | 1 | queue | Average every 10 samples and log it |
//! | counter 1 / counter 2 | 1 | mutex | Bump a shared counter every 500 / 700 ms |
//! | button LED | 2 | semaphore | Light the LED for 500 ms per button press |
//!
//! The button interrupt only gives the semaphore; the LED task does the
//! work. LEDs and the temperature sensor are stand-ins that record their
//! state and log it, since the pins and ADC belong to the board support
//! code.

#![no_std]
#![no_main]

use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use cortex_m_rt::{entry, exception};
use panic_halt as _;

use tickos::arch::cortex_m4::CortexM4;
use tickos::config::ms_to_ticks;
use tickos::{Error, Kernel, Mutex, Queue, Runnable, Semaphore, TaskConfig, Timeout};

static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4::new());

/// Published once the demo objects exist, for the button interrupt.
static DEMO: AtomicPtr<Demo> = AtomicPtr::new(core::ptr::null_mut());

// ---------------------------------------------------------------------------
// Board stand-ins
// ---------------------------------------------------------------------------

struct Led {
    name: &'static str,
    on: AtomicBool,
}

impl Led {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            on: AtomicBool::new(false),
        }
    }

    fn set(&self, on: bool) {
        self.on.store(on, Ordering::Relaxed);
        log::trace!("led {} {}", self.name, if on { "on" } else { "off" });
    }
}

/// Synthetic on-chip temperature sensor: a slow ramp around 27 °C.
struct TemperatureSensor {
    step: AtomicU32,
}

impl TemperatureSensor {
    const fn new() -> Self {
        Self {
            step: AtomicU32::new(0),
        }
    }

    fn read_celsius(&self) -> f32 {
        let step = self.step.fetch_add(1, Ordering::Relaxed) % 20;
        27.0 + (step as f32 - 10.0) * 0.1
    }
}

static RED: Led = Led::new("red");
static BLUE: Led = Led::new("blue");
static BUTTON_LED: Led = Led::new("button");
static SENSOR: TemperatureSensor = TemperatureSensor::new();

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Kernel objects shared between the tasks and the button interrupt.
struct Demo {
    samples: Queue<f32, 5>,
    counter: Mutex<u32>,
    button: Semaphore,
}

struct Blink {
    led: &'static Led,
    half_period_ms: u32,
}

impl Runnable for Blink {
    fn run(&self) {
        loop {
            self.led.set(true);
            KERNEL.sleep_for(ms_to_ticks(self.half_period_ms));
            self.led.set(false);
            KERNEL.sleep_for(ms_to_ticks(self.half_period_ms));
        }
    }
}

static BLINK_RED: Blink = Blink {
    led: &RED,
    half_period_ms: 250,
};
static BLINK_BLUE: Blink = Blink {
    led: &BLUE,
    half_period_ms: 250,
};

#[derive(Clone, Copy)]
enum Job {
    Sensor,
    Processing,
    Counter { name: &'static str, period_ms: u32 },
    ButtonLed,
}

struct DemoTask {
    demo: &'static Demo,
    job: Job,
}

impl Runnable for DemoTask {
    fn run(&self) {
        let demo = self.demo;
        match self.job {
            Job::Sensor => {
                let mut last_wake = KERNEL.now();
                loop {
                    let celsius = SENSOR.read_celsius();
                    if demo.samples.send(&KERNEL, celsius, Timeout::Forever).is_err() {
                        log::warn!("sample dropped");
                    }
                    KERNEL.sleep_until(&mut last_wake, ms_to_ticks(1000));
                }
            }
            Job::Processing => {
                let mut count = 0;
                let mut sum = 0.0f32;
                loop {
                    let Ok(celsius) = demo.samples.receive(&KERNEL, Timeout::Forever) else {
                        continue;
                    };
                    count += 1;
                    sum += celsius;
                    if count == 10 {
                        log::info!("average temperature: {} C", sum / 10.0);
                        count = 0;
                        sum = 0.0;
                    }
                }
            }
            Job::Counter { name, period_ms } => loop {
                if let Ok(mut counter) = demo.counter.lock(&KERNEL, Timeout::Forever) {
                    *counter += 1;
                    log::info!("{}: counter = {}", name, *counter);
                }
                KERNEL.sleep_for(ms_to_ticks(period_ms));
            },
            Job::ButtonLed => loop {
                if demo.button.take(&KERNEL, Timeout::Forever).is_ok() {
                    BUTTON_LED.set(true);
                    KERNEL.sleep_for(ms_to_ticks(500));
                    BUTTON_LED.set(false);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Button interrupt
// ---------------------------------------------------------------------------

/// Device interrupts land here; the board support code routes the button's
/// falling edge to this vector.
#[exception]
unsafe fn DefaultHandler(_irqn: i16) {
    // Safety: only ever set from a `&'static Demo`.
    if let Some(demo) = unsafe { DEMO.load(Ordering::Acquire).as_ref() } {
        demo.button.give_from_interrupt(&KERNEL);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

fn start() -> Result<Infallible, Error> {
    let cp = cortex_m::Peripherals::take().ok_or(Error::ResourceExhausted)?;

    let demo = Demo {
        samples: Queue::new(&KERNEL)?,
        counter: Mutex::new(&KERNEL, 0)?,
        button: Semaphore::new(&KERNEL)?,
    };
    let demo: &'static Demo = cortex_m::singleton!(: Demo = demo).ok_or(Error::ResourceExhausted)?;
    DEMO.store(demo as *const Demo as *mut Demo, Ordering::Release);

    let tasks: &'static [(DemoTask, u8); 5] = cortex_m::singleton!(: [(DemoTask, u8); 5] = [
        (DemoTask { demo, job: Job::Sensor }, 1),
        (DemoTask { demo, job: Job::Processing }, 1),
        (DemoTask { demo, job: Job::Counter { name: "task 1", period_ms: 500 } }, 1),
        (DemoTask { demo, job: Job::Counter { name: "task 2", period_ms: 700 } }, 1),
        (DemoTask { demo, job: Job::ButtonLed }, 2),
    ])
    .ok_or(Error::ResourceExhausted)?;

    KERNEL.create_task(TaskConfig::new(1).with_stack_size(256), &BLINK_RED)?;
    KERNEL.create_task(TaskConfig::new(1).with_stack_size(256), &BLINK_BLUE)?;
    for (task, priority) in tasks {
        KERNEL.create_task(TaskConfig::new(*priority), task)?;
    }

    KERNEL.start(cp.SYST)
}

/// Firmware entry point. Creates the demo objects and tasks, then hands the
/// CPU to the scheduler. Does not return.
#[entry]
fn main() -> ! {
    if let Err(err) = start() {
        log::error!("startup failed: {}", err);
    }
    loop {
        cortex_m::asm::wfi();
    }
}
